use crate::infrastructure::DaemonHarness;
use anyhow::Result;
use nix::errno::Errno;
use std::time::Duration;
use svchub::protocol::CommandCode;

const LOOP_FOREVER: &str = "while :; do sleep 1; done";

/// Boot runs the startup script, then starts every service in the
/// directory.
#[tokio::test]
async fn test_boot_runs_startup_script_then_services() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let mut harness = DaemonHarness::new()?;
    let marker = harness.temp_path().join("booted");
    harness.add_boot_script("startup", &format!("touch {}", marker.display()))?;
    harness.add_service("svc-a", LOOP_FOREVER)?;
    harness.add_service("svc-b", LOOP_FOREVER)?;
    harness.start_daemon().await?;

    let mut client = harness.connect().await?;
    let both_running = harness
        .wait_until(Duration::from_secs(5), || {
            let Ok(records) = client.list_all() else {
                return false;
            };
            records.len() == 2 && records.iter().all(|r| r.pid.is_some())
        })
        .await;
    assert!(both_running, "both services should be running after boot");
    assert!(marker.exists(), "startup script should have run first");

    let status = client.status("svc-a")?;
    assert_eq!(status.code, 0);
    assert!(status.pid().is_some());
    assert!(status.exit_code().is_none());

    harness.shutdown_daemon().await?;
    Ok(())
}

/// Commands on a name the table has never seen fail ENOENT.
#[tokio::test]
async fn test_unknown_service_is_enoent() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let mut harness = DaemonHarness::new()?;
    harness.start_daemon().await?;
    let mut client = harness.connect().await?;

    assert_eq!(client.status("ghost")?.code, -(Errno::ENOENT as i32));
    // `stop` on a name with no slot replies synchronously, no pending
    // notification.
    assert_eq!(client.stop("ghost")?, -(Errno::ENOENT as i32));

    harness.shutdown_daemon().await?;
    Ok(())
}

/// A stopped service keeps an exit-code record and can be started again.
#[tokio::test]
async fn test_stop_then_restart_via_protocol() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let mut harness = DaemonHarness::new()?;
    harness.add_service("sleeper", LOOP_FOREVER)?;
    harness.start_daemon().await?;
    let mut client = harness.connect().await?;

    let running = harness
        .wait_until(Duration::from_secs(5), || {
            client.find("sleeper").ok().flatten().is_some_and(|r| r.pid.is_some())
        })
        .await;
    assert!(running);

    // The stop reply is the death notification.
    let code = client.stop("sleeper")?;
    assert!(
        crate::infrastructure::ControlClient::is_death_notification(code),
        "expected the died notification, got {code}"
    );

    let record = client.find("sleeper")?.expect("slot survives a stop");
    assert!(record.pid.is_none());
    assert!(record.exit_code.is_some(), "stopped service holds its exit status");

    // Stopping again is a synchronous EAGAIN.
    assert_eq!(client.stop("sleeper")?, -(Errno::EAGAIN as i32));

    assert_eq!(client.start("sleeper")?, 0);
    let restarted = harness
        .wait_until(Duration::from_secs(5), || {
            client.find("sleeper").ok().flatten().is_some_and(|r| r.pid.is_some())
        })
        .await;
    assert!(restarted);

    harness.shutdown_daemon().await?;
    Ok(())
}

/// Starting an already-running service is refused.
#[tokio::test]
async fn test_double_start_is_refused() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let mut harness = DaemonHarness::new()?;
    harness.add_service("sleeper", LOOP_FOREVER)?;
    harness.start_daemon().await?;
    let mut client = harness.connect().await?;

    harness
        .wait_until(Duration::from_secs(5), || {
            client.find("sleeper").ok().flatten().is_some_and(|r| r.pid.is_some())
        })
        .await;
    assert_eq!(client.start("sleeper")?, -(Errno::EAGAIN as i32));

    harness.shutdown_daemon().await?;
    Ok(())
}

/// A run-once service that exits cleanly releases its slot entirely.
#[tokio::test]
async fn test_run_once_releases_slot_after_clean_exit() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let mut harness = DaemonHarness::new()?;
    let marker = harness.temp_path().join("oneshot-done");
    // Loops until the marker appears, then exits cleanly; the marker lets
    // the same executable act long-running at boot and one-shot afterwards.
    harness.add_service(
        "oneshot",
        &format!("if [ -e {m} ]; then exit 0; fi\n{LOOP_FOREVER}", m = marker.display()),
    )?;
    harness.start_daemon().await?;
    let mut client = harness.connect().await?;

    harness
        .wait_until(Duration::from_secs(5), || {
            client.find("oneshot").ok().flatten().is_some_and(|r| r.pid.is_some())
        })
        .await;

    std::fs::write(&marker, b"")?;
    client.stop("oneshot")?;
    assert_eq!(client.command(CommandCode::Spawn, "oneshot")?, 0);

    let released = harness
        .wait_until(Duration::from_secs(5), || {
            client.find("oneshot").map(|r| r.is_none()).unwrap_or(false)
        })
        .await;
    assert!(released, "clean run-once exit should free the slot");
    assert_eq!(client.status("oneshot")?.code, -(Errno::ENOENT as i32));

    harness.shutdown_daemon().await?;
    Ok(())
}
