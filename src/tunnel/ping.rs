//! Ping Supervisor: keeps the tunnel socket honest independent of whatever
//! the Request Pump is doing. Sends a Ping every `pingTimeout / 3` and tears
//! the socket down if a full `pingTimeout` elapses with no pong.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use super::dialer::WsStream;

pub type WsSink = SplitSink<WsStream, Message>;

const CLOSE_WRITE_DEADLINE: Duration = Duration::from_secs(1);
const HARD_CLOSE_DELAY: Duration = Duration::from_secs(15);

/// Runs until `conn_done` flips true, a ping write fails, or the pong
/// deadline expires (in which case it closes `write` itself before
/// returning).
pub async fn run(
    write: Arc<Mutex<WsSink>>,
    ping_timeout: Duration,
    mut pong_rx: mpsc::Receiver<()>,
    mut conn_done: watch::Receiver<bool>,
) {
    let tick = ping_timeout / 3;
    let mut ping_interval = tokio::time::interval(tick);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping_interval.tick().await; // first tick fires immediately, consume it

    let deadline = sleep(ping_timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            changed = conn_done.changed() => {
                if changed.is_err() || *conn_done.borrow() {
                    return;
                }
            }
            _ = ping_interval.tick() => {
                let send_result = {
                    let mut guard = write.lock().await;
                    timeout(tick, guard.send(Message::Ping(Vec::new()))).await
                };
                match send_result {
                    Ok(Ok(())) => debug!("sent ping"),
                    _ => {
                        warn!("ping write failed, aborting ping supervisor");
                        return;
                    }
                }
            }
            () = &mut deadline => {
                warn!(
                    timeout_secs = ping_timeout.as_secs(),
                    "pong deadline expired, closing tunnel"
                );
                {
                    let mut guard = write.lock().await;
                    let _ = timeout(CLOSE_WRITE_DEADLINE, guard.send(Message::Close(None))).await;
                }
                sleep(HARD_CLOSE_DELAY).await;
                let mut guard = write.lock().await;
                let _ = guard.close().await;
                return;
            }
            maybe_pong = pong_rx.recv() => {
                if maybe_pong.is_some() {
                    deadline.as_mut().reset(Instant::now() + ping_timeout);
                    debug!("pong received, deadline reset");
                } else {
                    return; // request pump gone, nothing left to reset us
                }
            }
        }
    }
}
