#![cfg(unix)]

use chatline::protocol::Command;
use chatline_daemon::ShutdownReason;
use chatline_tests::harness::assert_ok;
use chatline_tests::harness::daemon::{TestDaemon, test_config};
use std::time::Duration;

#[tokio::test]
async fn daemon_exits_after_idle_window() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.idle_timeout = Duration::from_millis(300);
    let daemon = TestDaemon::start(config).await.unwrap();
    let paths = daemon.paths().clone();

    assert_eq!(
        daemon.wait(Duration::from_secs(5)).await.unwrap(),
        ShutdownReason::Idle
    );
    assert!(!paths.pid.exists());
    assert!(!paths.endpoint.socket_file().unwrap().exists());
}

#[tokio::test]
async fn commands_keep_the_daemon_alive() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.idle_timeout = Duration::from_millis(400);
    let daemon = TestDaemon::start(config).await.unwrap();
    let mut client = daemon.client().await.unwrap();

    for _ in 0..8 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_ok(&client.request(&Command::Ping).await.unwrap());
    }
    assert!(!daemon.state().shutdown.is_requested());

    // Malformed input does not count as activity.
    let started = tokio::time::Instant::now();
    client.send_raw(b"garbage\n").await.unwrap();
    assert_eq!(
        daemon.wait(Duration::from_secs(5)).await.unwrap(),
        ShutdownReason::Idle
    );
    assert!(started.elapsed() < Duration::from_secs(2));
}
