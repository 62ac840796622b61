use crate::infrastructure::{ControlClient, DaemonHarness};
use anyhow::Result;
use nix::errno::Errno;
use std::time::Duration;
use svchub::protocol::CommandCode;

const LOOP_FOREVER: &str = "while :; do sleep 1; done";

/// A connection that issued `stop` gets exactly one death notification.
#[tokio::test]
async fn test_death_notification_exactly_once() -> Result<()> {
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

    let code = client.stop("sleeper")?;
    assert!(ControlClient::is_death_notification(code));
    client.assert_no_more_messages(Duration::from_millis(500))?;

    harness.shutdown_daemon().await?;
    Ok(())
}

/// `remove` refuses while running and succeeds once stopped.
#[tokio::test]
async fn test_remove_requires_stopped_service() -> Result<()> {
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

    assert_eq!(
        client.command(CommandCode::Remove, "sleeper")?,
        -(Errno::EBUSY as i32)
    );
    client.stop("sleeper")?;
    assert_eq!(client.command(CommandCode::Remove, "sleeper")?, 0);
    assert!(client.find("sleeper")?.is_none());

    harness.shutdown_daemon().await?;
    Ok(())
}

/// A malformed message costs the client its connection; the daemon and
/// other clients are unaffected.
#[tokio::test]
async fn test_malformed_message_closes_connection() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let mut harness = DaemonHarness::new()?;
    harness.start_daemon().await?;

    let mut bad_client = harness.connect().await?;
    // Valid frame, bogus attribute key 0x6363.
    let payload: &[u8] = &[0, 0, 0, 2, 0x63, 0x63, 0, 0];
    bad_client.send_raw(payload)?;
    assert!(
        bad_client.recv().is_err(),
        "connection should be closed after a protocol error"
    );

    let mut good_client = harness.connect().await?;
    assert!(good_client.list_all()?.is_empty());

    harness.shutdown_daemon().await?;
    Ok(())
}

/// All `list` pages together cover the table exactly once.
#[tokio::test]
async fn test_list_pagination_covers_every_service_once() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let mut harness = DaemonHarness::new()?;
    let names: Vec<String> = (0..25)
        .map(|i| format!("service-with-a-rather-long-name-{i:02}"))
        .collect();
    for name in &names {
        harness.add_service(name, "sleep 60")?;
    }
    harness.start_daemon().await?;
    let mut client = harness.connect().await?;

    let all_tracked = harness
        .wait_until(Duration::from_secs(10), || {
            client.list_all().map(|r| r.len() == names.len()).unwrap_or(false)
        })
        .await;
    assert!(all_tracked);

    let mut listed: Vec<String> = client.list_all()?.into_iter().map(|r| r.name).collect();
    let before_dedup = listed.len();
    listed.sort();
    listed.dedup();
    assert_eq!(before_dedup, listed.len(), "no service listed twice");
    let mut expected = names.clone();
    expected.sort();
    assert_eq!(listed, expected);

    harness.shutdown_daemon().await?;
    Ok(())
}
