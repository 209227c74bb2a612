#![cfg(unix)]

use chatline::protocol::{CachedMessage, Command, ConnectionState};
use chatline_daemon::connector::{DisconnectReason, SessionUser};
use chatline_tests::harness::daemon::{TestDaemon, test_config};
use chatline_tests::harness::{assert_ok, poll_until, text_message};
use std::time::Duration;

fn send(chat: &str, message: &str) -> Command {
    Command::Send {
        chat: chat.into(),
        message: message.into(),
        file: None,
        reply_id: None,
    }
}

fn read(chat: &str, limit: usize) -> Command {
    Command::Read {
        chat: chat.into(),
        limit: Some(limit),
    }
}

#[tokio::test]
async fn commands_fail_fast_while_not_open() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = TestDaemon::start(test_config(dir.path())).await.unwrap();
    assert!(daemon.remote.wait_for_connects(1, Duration::from_secs(2)).await);
    let mut client = daemon.client().await.unwrap();

    let resp = client.request(&send("team", "hello")).await.unwrap();
    assert_eq!(
        resp.error_message(),
        Some("Not connected to messaging session (state: connecting)")
    );
    assert!(daemon.remote.sent().is_empty());

    // Reads come from the cache and do not need the session.
    let resp = client.request(&read("team", 5)).await.unwrap();
    assert_ok(&resp);
    assert!(resp.get("note").is_some());
    daemon.stop().await;
}

#[tokio::test]
async fn transient_loss_reconnects_and_nothing_is_replayed() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    // Long enough to observe the outage from the client.
    config.reconnect_delay = Duration::from_millis(500);
    let daemon = TestDaemon::start_open(config, SessionUser::new("me")).await.unwrap();
    let mut client = daemon.client().await.unwrap();

    assert!(daemon.remote.close(DisconnectReason::ConnectionLost).await);
    daemon
        .wait_for_state(ConnectionState::Disconnected, Duration::from_secs(1))
        .await
        .unwrap();
    let resp = client.request(&send("team", "during outage")).await.unwrap();
    assert_eq!(
        resp.error_message(),
        Some("Not connected to messaging session (state: disconnected)")
    );
    let resp = client.request(&Command::Status).await.unwrap();
    assert_eq!(resp.field::<String>("state").as_deref(), Some("disconnected"));

    assert!(daemon.remote.wait_for_connects(2, Duration::from_secs(2)).await);
    daemon
        .wait_for_state(ConnectionState::Open, Duration::from_secs(2))
        .await
        .unwrap();
    assert_ok(&client.request(&send("team", "after")).await.unwrap());

    let sent: Vec<_> = daemon.remote.sent().into_iter().map(|m| m.text).collect();
    assert_eq!(sent, vec!["after".to_string()]);
    daemon.stop().await;
}

#[tokio::test]
async fn connection_replaced_is_terminal() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = TestDaemon::start_open(test_config(dir.path()), SessionUser::new("me"))
        .await
        .unwrap();
    let remote = daemon.remote.clone();

    assert!(remote.close(DisconnectReason::ConnectionReplaced).await);
    daemon.wait(Duration::from_secs(5)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(remote.connects(), 1);
}

#[tokio::test]
async fn unclassified_reason_retries_when_configured() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.retry_unclassified = true;
    let daemon = TestDaemon::start_open(config, SessionUser::new("me")).await.unwrap();

    assert!(daemon.remote.close(DisconnectReason::from_code(999)).await);
    assert!(daemon.remote.wait_for_connects(2, Duration::from_secs(2)).await);
    daemon
        .wait_for_state(ConnectionState::Open, Duration::from_secs(2))
        .await
        .unwrap();
    daemon.stop().await;
}

#[tokio::test]
async fn cache_keeps_the_newest_hundred_messages() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = TestDaemon::start_open(test_config(dir.path()), SessionUser::new("me"))
        .await
        .unwrap();

    for i in 0..150 {
        let msg = text_message(&format!("m{i}"), "Bob", &format!("message {i}"));
        assert!(daemon.remote.deliver("team", msg).await);
    }

    let mut client = daemon.client().await.unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    let messages = loop {
        let resp = client.request(&read("team", 500)).await.unwrap();
        let messages: Vec<CachedMessage> = resp.field("messages").unwrap_or_default();
        if messages.first().is_some_and(|m| m.id == "m149") {
            break messages;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "newest message never reached the cache"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    };
    assert_eq!(messages.len(), 100);
    assert_eq!(messages.last().unwrap().id, "m50");
    daemon.stop().await;
}

#[tokio::test]
async fn sent_and_received_messages_are_readable() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = TestDaemon::start_open(test_config(dir.path()), SessionUser::new("me"))
        .await
        .unwrap();
    let mut client = daemon.client().await.unwrap();

    assert!(daemon.remote.deliver("team", text_message("in1", "Bob", "hi")).await);
    let resp = client.request(&send("team", "hello bob")).await.unwrap();
    assert_ok(&resp);
    let sent_id: String = resp.field("id").unwrap();

    let state = daemon.state().clone();
    assert!(
        poll_until(Duration::from_secs(2), || {
            let state = state.clone();
            async move { state.cache.lock().await.read("team", 10).len() == 2 }
        })
        .await
    );
    let resp = client.request(&read("team", 10)).await.unwrap();
    let messages: Vec<CachedMessage> = resp.field("messages").unwrap();
    let ids: Vec<_> = messages.iter().map(|m| m.id.as_str()).collect();
    assert!(ids.contains(&sent_id.as_str()));
    assert!(ids.contains(&"in1"));
    assert!(messages.iter().any(|m| m.from_me && m.text == "hello bob"));

    let resp = client.request(&Command::Chats { limit: None }).await.unwrap();
    let chats: Vec<chatline::protocol::ChatSummary> = resp.field("chats").unwrap();
    assert!(chats.iter().any(|c| c.id == "team"));
    daemon.stop().await;
}
