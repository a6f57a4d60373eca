//! Error type for the WebSocket session: bootstrap, dial, handshake,
//! framing, and I/O. The local relay connection has its own error type,
//! [`crate::relay::RelayError`], next to the code that produces it.

use thiserror::Error;

/// Errors surfaced by the WebSocket session: bootstrap, dial, and the
/// Request Pump's read loop.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("tunnel dial failed: {0}")]
    DialFailure(String),

    #[error("bootstrap handshake failed with status {status}: {body}")]
    HandshakeFailure { status: u16, body: String },

    #[error("WebSocket read failed: {0}")]
    WsReadFailure(String),

    #[error("unexpected non-binary WebSocket message")]
    InvalidFrameType,

    #[error("malformed request frame: {0}")]
    BadFrame(#[from] crate::tunnel::protocol::FrameError),
}
