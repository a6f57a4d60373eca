//! Request Pump: the sole reader of the WebSocket. Decodes each inbound
//! binary frame, forwards non-empty payloads to the local relay, and signals
//! the Response Pump once per forwarded request.

use std::sync::Arc;

use futures_util::stream::SplitStream;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::error::TunnelError;
use crate::relay::LocalRelay;

use super::dialer::WsStream;
use super::protocol;

/// Read, forward, and signal until a fatal read error or non-binary frame.
pub async fn run(
    mut read: SplitStream<WsStream>,
    relay: Arc<LocalRelay>,
    request_sent_tx: mpsc::Sender<()>,
    pong_tx: mpsc::Sender<()>,
) -> Result<(), TunnelError> {
    loop {
        let message = match read.next().await {
            Some(Ok(message)) => message,
            Some(Err(e)) => return Err(TunnelError::WsReadFailure(e.to_string())),
            None => return Err(TunnelError::WsReadFailure("tunnel stream closed".into())),
        };

        match message {
            // A malformed id field is fatal: the session is torn down and
            // the Session Supervisor redials.
            Message::Binary(data) => {
                let (request_id, payload) = protocol::decode_request(data)?;
                handle_request_frame(request_id, payload, &relay, &request_sent_tx).await;
            }
            Message::Ping(_) => debug!("received ping, tungstenite auto-replies with pong"),
            Message::Pong(_) => {
                let _ = pong_tx.try_send(());
                debug!("received pong");
            }
            Message::Close(_) | Message::Text(_) | Message::Frame(_) => {
                return Err(TunnelError::InvalidFrameType);
            }
        }
    }
}

async fn handle_request_frame(
    request_id: u16,
    payload: bytes::Bytes,
    relay: &LocalRelay,
    request_sent_tx: &mpsc::Sender<()>,
) {
    if payload.is_empty() {
        debug!(request_id, "empty payload, nothing to forward");
        return;
    }

    match relay.forward(&payload).await {
        Ok(()) => {
            debug!(request_id, len = payload.len(), "forwarded request to local relay");
            let _ = request_sent_tx.try_send(());
        }
        Err(e) => warn!(request_id, error = %e, "local relay forward failed, dropping request"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::LocalRelay;
    use futures_util::SinkExt;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn forwards_nonempty_request_and_signals() {
        let relay_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let relay_addr = relay_listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = relay_listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = sock.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"hello");
        });
        let relay = Arc::new(LocalRelay::new(relay_addr.to_string()));
        let (tx, mut rx) = mpsc::channel(1);

        let (id, payload) = protocol::decode_request(b"0001hello".to_vec()).unwrap();
        super::handle_request_frame(id, payload, &relay, &tx).await;
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn empty_payload_does_not_signal() {
        let relay = Arc::new(LocalRelay::new("127.0.0.1:1".to_string()));
        let (tx, mut rx) = mpsc::channel(1);
        let (id, payload) = protocol::decode_request(b"0002".to_vec()).unwrap();
        super::handle_request_frame(id, payload, &relay, &tx).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn malformed_frame_id_is_fatal_to_the_pump() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(sock).await.unwrap();
            ws.send(Message::Binary(b"zzzzbadid".to_vec())).await.unwrap();
        });

        let client_sock = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (ws, _) = tokio_tungstenite::client_async(format!("ws://{addr}/"), client_sock)
            .await
            .unwrap();
        let (_sink, stream) = ws.split();

        let relay = Arc::new(LocalRelay::new("127.0.0.1:1".to_string()));
        let (tx, _rx) = mpsc::channel(1);
        let (pong_tx, _pong_rx) = mpsc::channel(1);

        let result = run(stream, relay, tx, pong_tx).await;
        assert!(matches!(result, Err(TunnelError::BadFrame(_))));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn non_binary_frame_is_fatal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(sock).await.unwrap();
            ws.send(Message::Text("not binary".into())).await.unwrap();
        });

        let client_sock = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (ws, _) = tokio_tungstenite::client_async(format!("ws://{addr}/"), client_sock)
            .await
            .unwrap();
        let (_sink, stream) = ws.split();

        let relay = Arc::new(LocalRelay::new("127.0.0.1:1".to_string()));
        let (tx, _rx) = mpsc::channel(1);
        let (pong_tx, _pong_rx) = mpsc::channel(1);

        let result = run(stream, relay, tx, pong_tx).await;
        assert!(matches!(result, Err(TunnelError::InvalidFrameType)));
        server.await.unwrap();
    }
}
