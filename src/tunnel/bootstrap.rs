//! Connection Tester / Bootstrapper: validates configuration and performs a
//! pre-flight HTTP-over-WS handshake probe before the Session Supervisor is
//! allowed to start dialing the real tunnel endpoint.

use std::net::IpAddr;
use std::time::Duration;

use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Error as WsError;
use tracing::info;
use url::Url;

use crate::error::TunnelError;

use super::dialer::{dial_request, Dialer};

const PING_PATH: &str = "/api/v1/edgedevice/connection/ping";
const TUNNEL_PATH: &str = "/api/v1/edgedevice/connection/tunnel";

/// Maximum bytes of the bootstrap failure body logged/surfaced.
const MAX_BODY_ECHO: usize = 80;

/// Result of a successful bootstrap: the finalized tunnel endpoint and the
/// dialer the Session Supervisor should reuse for every subsequent dial.
pub struct BootstrapOutcome {
    pub dest_url: String,
    pub dialer: Dialer,
}

/// Validate `tunnel_url`/`local_relay`, then probe the tunnel server's ping
/// endpoint. On HTTP 200, returns the finalized tunnel URL and dialer; any
/// other outcome is a `TunnelError`.
pub async fn test_connection(
    tunnel_url: &str,
    local_relay: &str,
    connect_timeout: Duration,
    proxy: Option<Url>,
    local_source_ip: Option<IpAddr>,
) -> Result<BootstrapOutcome, TunnelError> {
    let tunnel_url = validate_config(tunnel_url, local_relay)?;

    let dialer = Dialer::new(connect_timeout)
        .with_local_addr(local_source_ip)
        .with_proxy(proxy);

    let ping_url = format!("{tunnel_url}{PING_PATH}");
    info!(url = %ping_url, "probing tunnel bootstrap endpoint");

    let request = ping_url
        .into_client_request()
        .map_err(|e| TunnelError::ConfigInvalid(e.to_string()))?;

    match dial_request(request, &dialer).await {
        // A 101 upgrade on the ping endpoint is not expected, but if the
        // server accepts it we still treat that as bootstrap success.
        Ok(_ws) => {
            let dest_url = format!("{tunnel_url}{TUNNEL_PATH}");
            Ok(BootstrapOutcome { dest_url, dialer })
        }
        Err(WsError::Http(response)) => {
            // A response was parsed at all, so check `err` succeeded before
            // trusting the status — never read `status_code` off a response
            // we failed to obtain.
            if response.status() == StatusCode::OK {
                let dest_url = format!("{tunnel_url}{TUNNEL_PATH}");
                Ok(BootstrapOutcome { dest_url, dialer })
            } else {
                let body = response
                    .body()
                    .as_ref()
                    .map(|b| {
                        let n = b.len().min(MAX_BODY_ECHO);
                        String::from_utf8_lossy(&b[..n]).into_owned()
                    })
                    .unwrap_or_default();
                Err(TunnelError::HandshakeFailure {
                    status: response.status().as_u16(),
                    body,
                })
            }
        }
        Err(e) => Err(TunnelError::DialFailure(e.to_string())),
    }
}

/// Non-empty tunnel URL with a `ws(s)://` scheme; non-empty local relay
/// address without a scheme prefix. Returns the tunnel URL with any
/// trailing slash trimmed.
fn validate_config<'a>(tunnel_url: &'a str, local_relay: &str) -> Result<&'a str, TunnelError> {
    if tunnel_url.is_empty() {
        return Err(TunnelError::ConfigInvalid("tunnel URL must not be empty".into()));
    }
    if !(tunnel_url.starts_with("ws://") || tunnel_url.starts_with("wss://")) {
        return Err(TunnelError::ConfigInvalid(
            "tunnel URL must start with ws:// or wss://".into(),
        ));
    }
    if local_relay.is_empty() {
        return Err(TunnelError::ConfigInvalid("local relay address must not be empty".into()));
    }
    if local_relay.starts_with("http://") || local_relay.starts_with("https://") {
        return Err(TunnelError::ConfigInvalid(
            "local relay address must be host:port, not a URL".into(),
        ));
    }
    Ok(tunnel_url.trim_end_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_tunnel_url() {
        assert!(matches!(
            validate_config("", "127.0.0.1:8080"),
            Err(TunnelError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn rejects_bad_tunnel_scheme() {
        assert!(matches!(
            validate_config("http://example.com", "127.0.0.1:8080"),
            Err(TunnelError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn rejects_local_relay_with_scheme() {
        assert!(matches!(
            validate_config("wss://example.com", "http://127.0.0.1:8080"),
            Err(TunnelError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn trims_trailing_slash() {
        assert_eq!(
            validate_config("wss://example.com/", "127.0.0.1:8080").unwrap(),
            "wss://example.com"
        );
    }

    #[test]
    fn accepts_plain_ws_scheme() {
        assert!(validate_config("ws://example.com", "127.0.0.1:8080").is_ok());
    }
}
