//! Shared TCP/TLS/WebSocket connection-establishment routine, used by both
//! the bootstrap probe (`tunnel::bootstrap`) and the Session Supervisor's
//! dial step.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpSocket, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::Request;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tracing::warn;
use url::Url;

// 100 KiB socket buffers; 100 MiB message/frame cap.
const SOCKET_BUFFER_SIZE: usize = 100 * 1024;
const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opaque configured WebSocket dialer: TLS config, buffer sizes, optional
/// proxy, and optional bound local source IP.
#[derive(Clone)]
pub struct Dialer {
    pub tls_config: Arc<rustls::ClientConfig>,
    pub local_addr: Option<IpAddr>,
    pub proxy: Option<Url>,
    pub connect_timeout: Duration,
}

impl Dialer {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            tls_config: Arc::new(build_tls_config()),
            local_addr: None,
            proxy: None,
            connect_timeout,
        }
    }

    pub fn with_local_addr(mut self, local_addr: Option<IpAddr>) -> Self {
        self.local_addr = local_addr;
        self
    }

    pub fn with_proxy(mut self, proxy: Option<Url>) -> Self {
        self.proxy = proxy;
        self
    }
}

/// Build a `rustls::ClientConfig` trusting the system/webpki root store.
/// TLS certificate/key material beyond this default is out of scope for
/// this core (supplied externally in a fuller deployment).
pub fn build_tls_config() -> rustls::ClientConfig {
    let root_store = rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth()
}

/// Dial `url`, returning the raw `tungstenite::Error` on failure so callers
/// can distinguish a parsed-but-non-101 HTTP response (`Error::Http`) from a
/// pure transport failure.
pub async fn dial(url: &str, dialer: &Dialer) -> Result<WsStream, WsError> {
    let request = url.into_client_request()?;
    dial_request(request, dialer).await
}

/// Dial using a pre-built request (so callers can set extra headers).
pub async fn dial_request(request: Request<()>, dialer: &Dialer) -> Result<WsStream, WsError> {
    let uri = request.uri().clone();
    let host = uri
        .host()
        .ok_or_else(|| io_err("missing host in tunnel URL"))?
        .to_string();
    let is_tls = uri.scheme_str() == Some("wss");
    let port = uri.port_u16().unwrap_or(if is_tls { 443 } else { 80 });

    let tcp_stream = timeout(dialer.connect_timeout, connect_tcp(&host, port, dialer))
        .await
        .map_err(|_| io_err("tunnel TCP connect timeout"))??;

    configure_socket_buffers(&tcp_stream);

    let connector = if is_tls {
        Some(Connector::Rustls(Arc::clone(&dialer.tls_config)))
    } else {
        None
    };
    let ws_config = WebSocketConfig {
        max_frame_size: Some(MAX_MESSAGE_SIZE),
        max_message_size: Some(MAX_MESSAGE_SIZE),
        ..Default::default()
    };

    let (stream, _response) = timeout(
        dialer.connect_timeout,
        tokio_tungstenite::client_async_tls_with_config(request, tcp_stream, Some(ws_config), connector),
    )
    .await
    .map_err(|_| io_err("tunnel WebSocket handshake timeout"))??;

    Ok(stream)
}

/// Resolve, optionally bind a local source IP, optionally tunnel through an
/// HTTP CONNECT proxy, and return a connected `TcpStream`.
async fn connect_tcp(host: &str, port: u16, dialer: &Dialer) -> std::io::Result<TcpStream> {
    if let Some(proxy) = &dialer.proxy {
        return connect_via_proxy(proxy, host, port, dialer.local_addr).await;
    }
    connect_direct(host, port, dialer.local_addr).await
}

async fn connect_direct(
    host: &str,
    port: u16,
    local_addr: Option<IpAddr>,
) -> std::io::Result<TcpStream> {
    let mut addrs = tokio::net::lookup_host((host, port)).await?;
    let addr = addrs
        .next()
        .ok_or_else(|| io_err(&format!("no addresses resolved for {host}")))?;

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    if let Some(local) = local_addr {
        socket.bind(std::net::SocketAddr::new(local, 0))?;
    }
    socket.connect(addr).await
}

/// Tunnel through an HTTP/1.1 forward proxy via `CONNECT host:port`.
async fn connect_via_proxy(
    proxy: &Url,
    host: &str,
    port: u16,
    local_addr: Option<IpAddr>,
) -> std::io::Result<TcpStream> {
    let proxy_host = proxy
        .host_str()
        .ok_or_else(|| io_err("proxy URL missing host"))?;
    let proxy_port = proxy.port_or_known_default().unwrap_or(80);

    let mut stream = connect_direct(proxy_host, proxy_port, local_addr).await?;

    let connect_req = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n");
    stream.write_all(connect_req.as_bytes()).await?;

    let mut reader = BufReader::new(&mut stream);
    let mut status_line = String::new();
    reader.read_line(&mut status_line).await?;
    if !status_line.contains(" 200 ") {
        return Err(io_err(&format!(
            "proxy CONNECT to {host}:{port} failed: {}",
            status_line.trim()
        )));
    }
    // Drain the remaining response headers up to the blank line.
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 || line == "\r\n" || line == "\n" {
            break;
        }
    }

    Ok(stream)
}

fn configure_socket_buffers(stream: &TcpStream) {
    let sock_ref = socket2::SockRef::from(stream);
    if let Err(e) = sock_ref.set_recv_buffer_size(SOCKET_BUFFER_SIZE) {
        warn!(error = %e, "failed to set tunnel socket recv buffer size");
    }
    if let Err(e) = sock_ref.set_send_buffer_size(SOCKET_BUFFER_SIZE) {
        warn!(error = %e, "failed to set tunnel socket send buffer size");
    }
}

fn io_err(msg: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, msg.to_string())
}
