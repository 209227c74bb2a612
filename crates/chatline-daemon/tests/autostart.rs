//! The client library starts the real daemon binary on demand.
#![cfg(unix)]

use chatline::client::{ClientConfig, DaemonClient};
use chatline::liveness::Liveness;
use chatline::paths::StatePaths;
use chatline::protocol::Command;
use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

fn client_for(dir: &std::path::Path) -> DaemonClient {
    let mut config = ClientConfig::new(StatePaths::new(dir));
    config.daemon_bin = PathBuf::from(env!("CARGO_BIN_EXE_chatline-daemon"));
    // Nothing listens on port 1, so the session stays in `connecting`.
    config.daemon_args = vec![OsString::from("--bridge"), OsString::from("127.0.0.1:1")];
    config.start_timeout = Duration::from_secs(10);
    DaemonClient::new(config)
}

#[tokio::test]
async fn client_spawns_daemon_and_stops_it() {
    let dir = tempfile::tempdir().unwrap();
    let client = client_for(dir.path());
    assert_eq!(client.check().await, Liveness::Absent);

    let resp = client.execute(&Command::Ping).await.unwrap();
    assert!(resp.is_ok(), "ping failed: {resp:?}");
    assert_eq!(resp.field::<bool>("connected"), Some(false));

    let pid = match client.check().await {
        Liveness::Running { pid } => pid,
        other => panic!("daemon not running after autostart: {other:?}"),
    };
    assert_ne!(pid, std::process::id());

    // A second invocation reuses the running daemon.
    let resp = client.execute(&Command::Status).await.unwrap();
    assert_eq!(resp.field::<u32>("pid"), Some(pid));

    let resp = client
        .execute(&Command::Send {
            chat: "team".into(),
            message: "hi".into(),
            file: None,
            reply_id: None,
        })
        .await
        .unwrap();
    // Refused connects alternate between `connecting` and the backoff in `disconnected`.
    let error = resp.error_message().unwrap();
    assert!(
        error.starts_with("Not connected to messaging session (state: "),
        "unexpected error: {error}"
    );

    let resp = client.execute_if_running(&Command::Stop).await.unwrap();
    assert!(resp.is_ok());

    let paths = StatePaths::new(dir.path());
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while paths.pid.exists() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "daemon did not remove its PID marker"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(client.check().await, Liveness::Absent);
    assert!(dir.path().join("daemon.log").exists());
}
