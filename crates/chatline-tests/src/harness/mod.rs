pub mod client;
pub mod daemon;

use chatline::protocol::{CachedMessage, Response};
use std::future::Future;
use std::time::Duration;

/// Initialize tracing for tests (only once per process).
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("chatline=debug,chatline_daemon=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Poll `check` every 20 ms until it returns true or `timeout` elapses.
pub async fn poll_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Panic unless the response is a success.
pub fn assert_ok(resp: &Response) {
    assert!(resp.is_ok(), "expected ok, got {resp:?}");
}

/// An inbound text message as the remote side would deliver it.
pub fn text_message(id: &str, sender: &str, text: &str) -> CachedMessage {
    CachedMessage {
        id: id.to_string(),
        from_me: false,
        sender: Some(sender.to_string()),
        timestamp: chatline::now_ms(),
        text: text.to_string(),
        has_media: false,
    }
}
