mod client;
mod config;
mod error;
mod relay;
mod tunnel;

use std::sync::atomic::Ordering;

use clap::Parser;
use tokio::signal;
use tracing::{error, info};

use client::TunnelClient;
use config::Config;
use tunnel::bootstrap;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    let config = Config::parse();
    init_tracing(&config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        tunnel_host = %config.tunnel_host,
        "edge tunnel client starting"
    );

    let client = TunnelClient::new(
        config.tunnel_host.clone(),
        config.local_relay.clone(),
        config.ping_timeout(),
    );

    let outcome = bootstrap::test_connection(
        &client.tunnel_url,
        &config.local_relay,
        config.connect_timeout(),
        config.proxy_url.clone(),
        config.local_source_ip,
    )
    .await?;

    *client.dest_url.write().await = Some(outcome.dest_url);
    *client.dialer.write().await = Some(outcome.dialer);

    info!("bootstrap succeeded, starting session supervisor");
    client.start().await;

    wait_for_shutdown().await;
    info!("shutdown signal received, stopping tunnel");
    client.stop();
    client.join().await;

    if client.retry_count.load(Ordering::SeqCst) >= tunnel::supervisor::MAX_RETRY_ATTEMPTS {
        error!("tunnel gave up after exhausting the retry ceiling");
    }

    Ok(())
}

fn init_tracing(config: &Config) {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
