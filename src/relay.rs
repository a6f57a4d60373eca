//! Local Relay Connector: a cached TCP connection to the local relay.
//!
//! Owns a single reusable `TcpStream`, probes it for liveness before reuse,
//! and forces a re-dial when a write fails or the probe detects a closed
//! peer. All access goes through one `tokio::sync::Mutex` so a probe and a
//! replace never race.

use std::io;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

/// Maximum write attempts per `forward()` call before surfacing an error.
const MAX_WRITE_ATTEMPTS: u32 = 3;

/// Read deadline for draining the relay's response after a forward.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("failed to dial local relay at {addr}: {source}")]
    DialFailure { addr: String, source: io::Error },

    #[error("failed to write to local relay after {attempts} attempt(s): {source}")]
    WriteFailed { attempts: u32, source: io::Error },

    #[error("failed to read from local relay: {0}")]
    ReadFailure(#[source] io::Error),
}

pub struct LocalRelay {
    addr: String,
    conn: Mutex<Option<TcpStream>>,
}

impl LocalRelay {
    pub fn new(addr: String) -> Self {
        Self {
            addr,
            conn: Mutex::new(None),
        }
    }

    /// Forward a request payload to the relay. Retries up to
    /// [`MAX_WRITE_ATTEMPTS`] times, forcing a re-dial between attempts.
    pub async fn forward(&self, payload: &[u8]) -> Result<(), RelayError> {
        let mut guard = self.conn.lock().await;
        self.ensure_connected(&mut guard, false).await?;

        let mut last_err = None;
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let stream = guard.as_mut().expect("just ensured connected");
            match stream.write_all(payload).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(attempt, error = %e, "local relay write failed, forcing re-dial");
                    last_err = Some(e);
                    if attempt < MAX_WRITE_ATTEMPTS {
                        if let Err(dial_err) = self.ensure_connected(&mut guard, true).await {
                            return Err(dial_err);
                        }
                    }
                }
            }
        }
        Err(RelayError::WriteFailed {
            attempts: MAX_WRITE_ATTEMPTS,
            source: last_err.expect("loop always sets last_err before exhausting attempts"),
        })
    }

    /// Drain whatever the relay has produced since the last forward, within
    /// a fixed 500 ms window. A timeout with no data is not an error — it
    /// just means "nothing to forward yet".
    pub async fn drain(&self) -> Result<Bytes, RelayError> {
        let mut guard = self.conn.lock().await;
        self.ensure_connected(&mut guard, false).await?;
        let stream = guard.as_mut().expect("just ensured connected");

        let mut buf = BytesMut::new();
        let deadline = Instant::now() + DRAIN_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let mut chunk = [0u8; 8192];
            match timeout(remaining, stream.read(&mut chunk)).await {
                Ok(Ok(0)) => break, // peer half-closed; nothing more to read
                Ok(Ok(n)) => buf.extend_from_slice(&chunk[..n]),
                Ok(Err(e)) => return Err(RelayError::ReadFailure(e)),
                Err(_) => break, // 500ms elapsed: not an error, just done
            }
        }
        Ok(buf.freeze())
    }

    /// Ensure `*guard` holds a live connection, dialing if absent, dead, or
    /// `force_create` is set.
    async fn ensure_connected(
        &self,
        guard: &mut Option<TcpStream>,
        force_create: bool,
    ) -> Result<(), RelayError> {
        if !force_create {
            if let Some(stream) = guard.as_mut() {
                if is_alive(stream).await {
                    return Ok(());
                }
                debug!(addr = %self.addr, "cached local relay connection is dead, re-dialing");
            }
        }

        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|source| RelayError::DialFailure {
                addr: self.addr.clone(),
                source,
            })?;
        let _ = stream.set_nodelay(true);
        *guard = Some(stream);
        Ok(())
    }
}

/// Best-effort liveness probe: peek for data with a near-zero deadline. An
/// immediate EOF or a reset/broken-pipe error means the peer is gone; a
/// timeout or pending data both mean the connection is still usable. A
/// false "alive" costs one wasted write-retry, never a stuck session.
async fn is_alive(stream: &mut TcpStream) -> bool {
    let mut probe = [0u8; 1];
    match timeout(Duration::from_millis(1), stream.peek(&mut probe)).await {
        Ok(Ok(0)) => false,
        Ok(Ok(_)) => true,
        Ok(Err(e)) => !matches!(
            e.kind(),
            io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe
        ),
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn forward_then_drain_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let n = sock.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"GET / HTTP/1.1\r\n\r\n");
            sock.write_all(b"HTTP/1.1 200 OK\r\n\r\nOK").await.unwrap();
        });

        let relay = LocalRelay::new(addr.to_string());
        relay.forward(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        let response = relay.drain().await.unwrap();
        assert_eq!(&response[..], b"HTTP/1.1 200 OK\r\n\r\nOK");
    }

    #[tokio::test]
    async fn drain_times_out_with_empty_buffer_when_relay_is_silent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
        });

        let relay = LocalRelay::new(addr.to_string());
        relay.forward(b"ping").await.unwrap();
        let response = relay.drain().await.unwrap();
        assert!(response.is_empty());
    }

    #[tokio::test]
    async fn forward_redials_after_relay_restart() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accepted = std::sync::Arc::new(tokio::sync::Notify::new());
        let accepted2 = accepted.clone();
        tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            accepted2.notify_one();
            drop(sock); // simulate the relay process restarting immediately
        });

        let relay = LocalRelay::new(addr.to_string());
        accepted.notified().await;
        // Give the drop a moment to propagate through the OS before probing.
        tokio::time::sleep(Duration::from_millis(50)).await;

        // forward() may see the stale half-closed socket die on write and
        // will bubble an error after exhausting its 3 attempts, since
        // nothing is listening to re-accept; the key property is that it
        // never wedges forever and never silently succeeds against a dead
        // socket.
        let _ = relay.forward(b"x").await;
    }
}
