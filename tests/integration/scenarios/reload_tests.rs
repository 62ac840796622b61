use crate::infrastructure::DaemonHarness;
use anyhow::Result;
use std::time::Duration;

const LOOP_FOREVER: &str = "while :; do sleep 1; done";

/// Removing a service's executable stops that service and nothing else;
/// its record keeps the exit code until the next reconcile.
#[tokio::test]
async fn test_removed_service_is_stopped_others_untouched() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let mut harness = DaemonHarness::new()?;
    harness.add_service("svc-a", LOOP_FOREVER)?;
    harness.add_service("svc-b", LOOP_FOREVER)?;
    harness.start_daemon().await?;
    let mut client = harness.connect().await?;

    let booted = harness
        .wait_until(Duration::from_secs(5), || {
            client
                .list_all()
                .map(|r| r.len() == 2 && r.iter().all(|r| r.pid.is_some()))
                .unwrap_or(false)
        })
        .await;
    assert!(booted);
    let pid_b = client.find("svc-b")?.unwrap().pid.unwrap();

    harness.remove_service("svc-a")?;

    let stopped = harness
        .wait_until(Duration::from_secs(5), || {
            client
                .find("svc-a")
                .ok()
                .flatten()
                .is_some_and(|r| r.pid.is_none() && r.exit_code.is_some())
        })
        .await;
    assert!(stopped, "svc-a should be stopped with an exit-code record");

    let record_b = client.find("svc-b")?.unwrap();
    assert_eq!(record_b.pid, Some(pid_b), "svc-b must be untouched");

    harness.shutdown_daemon().await?;
    Ok(())
}

/// A new executable appearing in the directory is picked up and started.
#[tokio::test]
async fn test_added_service_is_started() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let mut harness = DaemonHarness::new()?;
    harness.add_service("svc-a", LOOP_FOREVER)?;
    harness.start_daemon().await?;
    let mut client = harness.connect().await?;

    harness
        .wait_until(Duration::from_secs(5), || {
            client.find("svc-a").ok().flatten().is_some_and(|r| r.pid.is_some())
        })
        .await;

    harness.add_service("svc-c", LOOP_FOREVER)?;
    let started = harness
        .wait_until(Duration::from_secs(5), || {
            client.find("svc-c").ok().flatten().is_some_and(|r| r.pid.is_some())
        })
        .await;
    assert!(started, "new directory entry should be started");

    harness.shutdown_daemon().await?;
    Ok(())
}

/// Non-executable files in the directory are not services.
#[tokio::test]
async fn test_non_executable_entries_are_ignored() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let mut harness = DaemonHarness::new()?;
    harness.add_service("svc-a", LOOP_FOREVER)?;
    std::fs::write(harness.init_dir.join("README"), "not a service")?;
    harness.start_daemon().await?;
    let mut client = harness.connect().await?;

    harness
        .wait_until(Duration::from_secs(5), || {
            client.find("svc-a").ok().flatten().is_some_and(|r| r.pid.is_some())
        })
        .await;
    assert!(client.find("README")?.is_none());

    harness.shutdown_daemon().await?;
    Ok(())
}
