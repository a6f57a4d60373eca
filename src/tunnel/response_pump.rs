//! Response Pump: wakes on the edge-triggered "request forwarded" signal,
//! drains whatever the local relay produced, and writes it back framed with
//! a monotonic response id.

use std::sync::Arc;
use std::time::Duration;

use futures_util::SinkExt;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::relay::LocalRelay;

use super::ping::WsSink;
use super::protocol;

const WRITE_DEADLINE: Duration = Duration::from_secs(60);

/// Runs until `conn_done` flips true or the request-sent channel closes
/// (the Request Pump exited).
pub async fn run(
    write: Arc<Mutex<WsSink>>,
    relay: Arc<LocalRelay>,
    mut request_sent_rx: mpsc::Receiver<()>,
    mut conn_done: watch::Receiver<bool>,
) {
    let mut response_id: u16 = 0;

    loop {
        tokio::select! {
            changed = conn_done.changed() => {
                if changed.is_err() || *conn_done.borrow() {
                    return;
                }
            }
            signaled = request_sent_rx.recv() => {
                if signaled.is_none() {
                    return;
                }
                drain_and_respond(&write, &relay, &mut response_id).await;
            }
        }
    }
}

async fn drain_and_respond(write: &Arc<Mutex<WsSink>>, relay: &LocalRelay, response_id: &mut u16) {
    let buf = match relay.drain().await {
        Ok(buf) => buf,
        Err(e) => {
            warn!(error = %e, "local relay drain failed");
            return;
        }
    };
    if buf.is_empty() {
        return;
    }

    let frame = protocol::encode_response(*response_id, &buf);
    let send_result = {
        let mut guard = write.lock().await;
        timeout(
            WRITE_DEADLINE,
            guard.send(tokio_tungstenite::tungstenite::Message::Binary(frame.to_vec())),
        )
        .await
    };

    match send_result {
        Ok(Ok(())) => {
            debug!(response_id = *response_id, len = buf.len(), "wrote response frame");
            *response_id = response_id.wrapping_add(1);
        }
        _ => warn!(response_id = *response_id, "response write failed"),
    }
}
