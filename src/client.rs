//! `TunnelClient`: the process-lifetime handle that owns configuration,
//! connection state, and the background Session Supervisor task.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::relay::LocalRelay;
use crate::tunnel::dialer::Dialer;
use crate::tunnel::supervisor;

pub struct TunnelClient {
    pub tunnel_host: String,
    pub tunnel_url: String,
    pub local_relay: Arc<LocalRelay>,
    pub ping_timeout: Duration,
    pub dest_url: RwLock<Option<String>>,
    pub dialer: RwLock<Option<Dialer>>,
    pub connected: AtomicBool,
    pub retry_count: AtomicU32,
    exit_tx: watch::Sender<bool>,
    exit_rx: watch::Receiver<bool>,
    supervisor_handle: Mutex<Option<JoinHandle<()>>>,
}

impl TunnelClient {
    pub fn new(tunnel_host: String, local_relay_addr: String, ping_timeout: Duration) -> Arc<Self> {
        let tunnel_url = format!("wss://{}", tunnel_host.trim_end_matches('/'));
        let (exit_tx, exit_rx) = watch::channel(false);
        Arc::new(Self {
            tunnel_host,
            tunnel_url,
            local_relay: Arc::new(LocalRelay::new(local_relay_addr)),
            ping_timeout,
            dest_url: RwLock::new(None),
            dialer: RwLock::new(None),
            connected: AtomicBool::new(false),
            retry_count: AtomicU32::new(0),
            exit_tx,
            exit_rx,
            supervisor_handle: Mutex::new(None),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn exit_signal(&self) -> watch::Receiver<bool> {
        self.exit_rx.clone()
    }

    /// Starts the Session Supervisor's dial loop as a background task.
    /// `bootstrap::test_connection` must have populated `dest_url`/`dialer`
    /// before this is called.
    pub async fn start(self: &Arc<Self>) {
        let client = Arc::clone(self);
        let handle = tokio::spawn(async move {
            supervisor::run(client).await;
        });
        *self.supervisor_handle.lock().await = Some(handle);
    }

    /// Signals the Session Supervisor to stop redialing. Does not forcibly
    /// close an in-flight WebSocket; the active session tears down through
    /// its normal read-error path.
    pub fn stop(&self) {
        let _ = self.exit_tx.send(true);
    }

    /// Waits for the Session Supervisor task to exit (after `stop()` and its
    /// current session's natural teardown).
    pub async fn join(&self) {
        let handle = self.supervisor_handle.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tunnel_url_trims_trailing_slash_and_adds_scheme() {
        let client = TunnelClient::new("example.com/".to_string(), "127.0.0.1:8080".to_string(), Duration::from_secs(30));
        assert_eq!(client.tunnel_url, "wss://example.com");
    }

    #[tokio::test]
    async fn stop_is_observable_without_an_active_session() {
        let client = TunnelClient::new("example.com".to_string(), "127.0.0.1:8080".to_string(), Duration::from_secs(30));
        let mut exit_signal = client.exit_signal();
        client.stop();
        exit_signal.changed().await.unwrap();
        assert!(*exit_signal.borrow());
    }
}
