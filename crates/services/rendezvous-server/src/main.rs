//! Rendezvous server binary entry point
//!
//! Starts the PeerLink rendezvous service: peer registry, signal mailbox and
//! ICE server advertisement over HTTP.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (0.0.0.0:3479)
//! cargo run -p peerlink-rendezvous-server
//!
//! # Custom port and a TURN relay
//! PORT=8080 \
//! TURN_SERVER_URL=turn:turn.example.com:3478 \
//! TURN_SERVER_USERNAME=peerlink \
//! TURN_SERVER_CREDENTIAL=secret \
//!   cargo run -p peerlink-rendezvous-server
//!
//! # With logging
//! RUST_LOG=debug cargo run -p peerlink-rendezvous-server
//! ```

use anyhow::Context;
use clap::Parser;
use peerlink_rendezvous::{IceServerConfig, RendezvousConfig, RendezvousServer, RendezvousService};
use std::sync::Arc;
use tracing::{error, info};

/// PeerLink rendezvous server
///
/// Lets peers find each other and exchange offers, answers and network
/// candidates before they connect directly.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Listen port (ignored when --bind-address is given)
    #[arg(long, default_value_t = 3479, env = "PORT")]
    port: u16,

    /// Full bind address, e.g. 127.0.0.1:3479
    #[arg(long, env = "RENDEZVOUS_BIND_ADDRESS")]
    bind_address: Option<String>,

    /// Seconds of silence after which a peer is purged
    #[arg(long, default_value_t = 120, env = "RENDEZVOUS_LIVENESS_TIMEOUT_SECS")]
    liveness_timeout_secs: u64,

    /// Seconds between registry sweeps
    #[arg(long, default_value_t = 30, env = "RENDEZVOUS_SWEEP_INTERVAL_SECS")]
    sweep_interval_secs: u64,

    /// Seconds an undelivered signal is kept
    #[arg(long, default_value_t = 120, env = "RENDEZVOUS_SIGNAL_TTL_SECS")]
    signal_ttl_secs: u64,

    /// STUN servers advertised to clients (comma-separated)
    #[arg(
        long,
        value_delimiter = ',',
        default_value = "stun:stun.l.google.com:19302",
        env = "STUN_SERVERS"
    )]
    stun_servers: Vec<String>,

    /// TURN server URL advertised to clients
    #[arg(long, env = "TURN_SERVER_URL")]
    turn_server_url: Option<String>,

    /// TURN username
    #[arg(long, env = "TURN_SERVER_USERNAME")]
    turn_server_username: Option<String>,

    /// TURN credential
    #[arg(long, env = "TURN_SERVER_CREDENTIAL", hide_env_values = true)]
    turn_server_credential: Option<String>,
}

impl Args {
    fn into_config(self) -> anyhow::Result<RendezvousConfig> {
        let config = RendezvousConfig {
            bind_address: self
                .bind_address
                .unwrap_or_else(|| format!("0.0.0.0:{}", self.port)),
            liveness_timeout_secs: self.liveness_timeout_secs,
            sweep_interval_secs: self.sweep_interval_secs,
            signal_ttl_secs: self.signal_ttl_secs,
            ice_servers: IceServerConfig::from_parts(
                self.stun_servers,
                self.turn_server_url,
                self.turn_server_username,
                self.turn_server_credential,
            ),
        };

        config.validate().context("invalid rendezvous configuration")?;
        Ok(config)
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Args::parse().into_config()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        bind_address = %config.bind_address,
        liveness_timeout_secs = config.liveness_timeout_secs,
        sweep_interval_secs = config.sweep_interval_secs,
        signal_ttl_secs = config.signal_ttl_secs,
        ice_servers = config.ice_servers.len(),
        "PeerLink rendezvous server starting"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .thread_name("peerlink-rendezvous")
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let service = Arc::new(RendezvousService::new(config));
        let server = RendezvousServer::new(service);

        server.serve(shutdown_signal()).await.map_err(|e| {
            error!("Server error: {}", e);
            e
        })
    })?;

    info!("Rendezvous server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Ctrl+C received, shutting down"),
        Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
    }
}
