use std::net::IpAddr;
use std::time::Duration;

use clap::Parser;
use url::Url;

/// Persistent WebSocket reverse-tunnel client.
///
/// Exposes a local relay to a remote control-plane backend over an
/// outbound WebSocket, so the device needs no inbound reachability.
#[derive(Parser, Debug, Clone)]
#[command(version, about)]
pub struct Config {
    /// Remote tunnel server, host[:port] (no scheme)
    #[arg(long, env = "EDGE_TUNNEL_HOST")]
    pub tunnel_host: String,

    /// Local relay address, host:port (no scheme)
    #[arg(long, env = "EDGE_TUNNEL_LOCAL_RELAY")]
    pub local_relay: String,

    /// Ping/pong liveness timeout in seconds
    #[arg(long, env = "EDGE_TUNNEL_PING_TIMEOUT", default_value_t = 30)]
    pub ping_timeout_secs: u64,

    /// Outbound HTTP CONNECT proxy URL
    #[arg(long, env = "EDGE_TUNNEL_PROXY_URL")]
    pub proxy_url: Option<Url>,

    /// Local source IP to bind the outbound tunnel socket to
    #[arg(long, env = "EDGE_TUNNEL_LOCAL_SOURCE_IP")]
    pub local_source_ip: Option<IpAddr>,

    /// Timeout for each dial attempt (TCP connect + TLS + WS upgrade), in seconds
    #[arg(long, env = "EDGE_TUNNEL_CONNECT_TIMEOUT", default_value_t = 15)]
    pub connect_timeout_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "EDGE_TUNNEL_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "EDGE_TUNNEL_LOG_JSON", default_value_t = false)]
    pub log_json: bool,
}

impl Config {
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}
