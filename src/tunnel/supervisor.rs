//! Session Supervisor: the dial loop. Owns the lifecycle of a single active
//! WebSocket connection and the three coroutines that run alongside it
//! (Ping Supervisor, Request Pump, Response Pump).

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{sleep, timeout, Instant};
use tracing::{error, info, warn};

use crate::client::TunnelClient;
use crate::error::TunnelError;

use super::{dialer, ping, request_pump, response_pump};

/// After this many consecutive dial failures the supervisor gives up for
/// good; only a fresh process restart resumes dialing.
pub const MAX_RETRY_ATTEMPTS: u32 = 50;

/// Minimum wall-clock spacing between dial attempts, regardless of whether
/// the previous attempt failed fast or slow.
pub const RETRY_FLOOR: Duration = Duration::from_secs(30);

const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
const DELAYED_CLOSE: Duration = Duration::from_secs(5);

/// Runs until the retry ceiling is hit or `exit_signal` is observed between
/// iterations. Each iteration is one WebSocket lifetime.
pub async fn run(client: Arc<TunnelClient>) {
    let mut exit_signal = client.exit_signal();

    loop {
        if client.retry_count.load(Ordering::SeqCst) >= MAX_RETRY_ATTEMPTS {
            error!("retry ceiling reached, giving up on tunnel");
            return;
        }

        let floor_deadline = Instant::now() + RETRY_FLOOR;

        if let Err(e) = dial_and_run(&client).await {
            let count = client.retry_count.fetch_add(1, Ordering::SeqCst) + 1;
            error!(error = %e, retry_count = count, "tunnel dial failed");
        }

        if *exit_signal.borrow() {
            info!("exit signal observed, not redialing");
            return;
        }

        sleep(floor_deadline.saturating_duration_since(Instant::now())).await;
    }
}

/// Dials once and, on success, runs the session to completion. Only a dial
/// failure is reported as `Err` here — once dialed, whatever happens to the
/// Request Pump is logged internally and this returns `Ok(())`, since only
/// the dial step counts against `retry_count`.
async fn dial_and_run(client: &Arc<TunnelClient>) -> Result<(), TunnelError> {
    let dest_url = client
        .dest_url
        .read()
        .await
        .clone()
        .ok_or_else(|| TunnelError::ConfigInvalid("dial attempted before bootstrap completed".into()))?;
    let active_dialer = client
        .dialer
        .read()
        .await
        .clone()
        .ok_or_else(|| TunnelError::ConfigInvalid("dial attempted before bootstrap completed".into()))?;

    let ws = dialer::dial(&dest_url, &active_dialer)
        .await
        .map_err(|e| TunnelError::DialFailure(e.to_string()))?;

    info!(url = %dest_url, "tunnel dialed");
    client.connected.store(true, Ordering::SeqCst);
    client.retry_count.store(0, Ordering::SeqCst);

    let (sink, stream) = ws.split();
    let write = Arc::new(Mutex::new(sink));
    let (conn_done_tx, conn_done_rx) = watch::channel(false);
    let (request_sent_tx, request_sent_rx) = mpsc::channel(1);
    let (pong_tx, pong_rx) = mpsc::channel(1);

    let ping_task = tokio::spawn(ping::run(
        Arc::clone(&write),
        client.ping_timeout,
        pong_rx,
        conn_done_rx.clone(),
    ));
    let response_task = tokio::spawn(response_pump::run(
        Arc::clone(&write),
        Arc::clone(&client.local_relay),
        request_sent_rx,
        conn_done_rx,
    ));

    let pump_result = request_pump::run(stream, Arc::clone(&client.local_relay), request_sent_tx, pong_tx).await;

    client.connected.store(false, Ordering::SeqCst);
    let _ = conn_done_tx.send(true);

    if timeout(DRAIN_TIMEOUT, ping_task).await.is_err() {
        warn!("ping supervisor did not exit within drain timeout");
    }
    if timeout(DRAIN_TIMEOUT, response_task).await.is_err() {
        warn!("response pump did not exit within drain timeout");
    }

    // Deferred close gives any write still in flight a chance to land
    // before the socket goes away.
    let delayed_write = Arc::clone(&write);
    tokio::spawn(async move {
        sleep(DELAYED_CLOSE).await;
        let mut guard = delayed_write.lock().await;
        let _ = guard.close().await;
    });

    if let Err(e) = pump_result {
        warn!(error = %e, "request pump exited, session ending");
    }
    Ok(())
}
