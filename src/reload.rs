use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use tokio::sync::mpsc;

/// WebSocket sub-protocol spoken by the injected reload script. Its
/// only semantics is "close = reload".
pub const LIVE_RELOAD_PROTOCOL: &str = "livedev";

const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The `Sec-WebSocket-Accept` value for a client key, per RFC 6455.
pub fn websocket_accept_key(key: &str) -> String {
    let mut hash = Sha1::new();
    hash.update(key.as_bytes());
    hash.update(WEBSOCKET_GUID.as_bytes());
    BASE64.encode(hash.finalize())
}

/// The script injected into HTML responses: opens a reload socket
/// against the proxy and reloads the page when it closes.
pub fn reload_script(proxy_port: u16) -> String {
    format!(
        r#"
<script type="text/javascript">
!function (w, c) {{
    try {{
        (new WebSocket('ws://' + w.location.hostname + ':{proxy_port}/', '{LIVE_RELOAD_PROTOCOL}')).onclose = function () {{ w.location.reload() }}
    }} catch (err) {{ c.log('devgate: ', err) }}
}}(window, window.console || {{log: function () {{}}}})
</script>
"#
    )
}

/// Fan-out set of reload subscribers. Registration hands back a
/// receiver the live-reload socket selects on; delivery is best-effort
/// and a subscriber that cannot accept is dropped, which closes its
/// channel and therefore its socket - still a reload.
#[derive(Default)]
pub struct UpdateListeners {
    listeners: Mutex<Vec<mpsc::Sender<()>>>,
}

impl UpdateListeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self) -> mpsc::Receiver<()> {
        let (tx, rx) = mpsc::channel(1);
        self.listeners.lock().push(tx);
        rx
    }

    pub fn notify(&self) {
        self.listeners.lock().retain(|ch| ch.try_send(()).is_ok());
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_key_matches_rfc_sample() {
        assert_eq!(
            websocket_accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_reload_script_targets_proxy_port() {
        let script = reload_script(8080);
        assert!(script.contains(":8080/"));
        assert!(script.contains(LIVE_RELOAD_PROTOCOL));
        assert!(script.contains("<script"));
    }

    #[tokio::test]
    async fn test_notify_reaches_registered_listeners() {
        let listeners = UpdateListeners::new();
        let mut a = listeners.register();
        let mut b = listeners.register();
        assert_eq!(listeners.len(), 2);

        listeners.notify();
        assert!(a.recv().await.is_some());
        assert!(b.recv().await.is_some());
        assert_eq!(listeners.len(), 2);
    }

    #[tokio::test]
    async fn test_saturated_listener_is_dropped_and_closed() {
        let listeners = UpdateListeners::new();
        let mut rx = listeners.register();

        listeners.notify();
        // The buffered signal is still pending, so the second notify
        // cannot be delivered and the listener is removed.
        listeners.notify();
        assert_eq!(listeners.len(), 0);

        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none(), "channel should be closed");
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_pruned_on_notify() {
        let listeners = UpdateListeners::new();
        let rx = listeners.register();
        drop(rx);

        listeners.notify();
        assert!(listeners.is_empty());
    }
}
