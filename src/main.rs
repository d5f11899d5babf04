//! Forwarding HTTP proxy with an on-disk GET response cache.
//!
//! # Architecture Overview
//!
//! ```text
//!     Client ──▶ net::Listener ──▶ proxy::ConnectionHandler
//!                (bounded accept)    │ http::RequestParser
//!                                    │ http::resolve
//!                                    ▼
//!                               proxy::RelayEngine ◀──▶ cache::CacheStore
//!                                    │                  (ProxyCache/<sha256>)
//!                                    ▼
//!                                  Origin
//! ```
//!
//! Usage: `forward-proxy [PORT] [--config FILE] [--cache-dir DIR] [--no-cache]`

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

use forward_proxy::config::{load_config, ProxyConfig};
use forward_proxy::lifecycle::{signals::wait_for_signal, Shutdown};
use forward_proxy::net::Listener;
use forward_proxy::observability::{logging::init_logging, metrics::init_metrics};
use forward_proxy::ProxyServer;

#[derive(Parser)]
#[command(name = "forward-proxy")]
#[command(about = "Forwarding HTTP proxy with a GET response cache", long_about = None)]
struct Cli {
    /// Port to listen on; overrides listener.bind_address
    port: Option<u16>,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory for cached responses
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Relay every request without caching
    #[arg(long)]
    no_cache: bool,
}

impl Cli {
    fn apply(&self, config: &mut ProxyConfig) {
        if let Some(port) = self.port {
            config.listener.set_port(port);
        }
        if let Some(dir) = &self.cache_dir {
            config.cache.directory = dir.clone();
        }
        if self.no_cache {
            config.cache.enabled = false;
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ProxyConfig::default(),
    };
    cli.apply(&mut config);

    init_logging(&config.observability);

    tracing::info!("forward-proxy v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        bind_address = %config.listener.bind_address,
        max_connections = config.listener.max_connections,
        cache_enabled = config.cache.enabled,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse::<SocketAddr>() {
            Ok(addr) => init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let listener = Listener::bind(&config.listener).await?;

    let shutdown = Shutdown::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        signal_shutdown.trigger();
    });

    let server = ProxyServer::new(config);
    server.run(listener, shutdown.subscribe()).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
