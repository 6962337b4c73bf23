//! l4relay - transparent TCP relay
//!
//! Listens on a local address and forwards every inbound connection to one
//! fixed remote address, relaying bytes unmodified in both directions.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use l4relay_core::config::{
    DEFAULT_BACKLOG, DEFAULT_BLOCK_SIZE, DEFAULT_BUFFER_CAPACITY, DEFAULT_CONNECT_TIMEOUT,
};
use l4relay_core::{EndpointAddress, RelayConfig, RelayServer, TransferMode};
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// l4relay - forward every TCP connection on LOCAL to REMOTE
#[derive(Parser, Debug)]
#[command(name = "l4relay")]
#[command(about = "l4relay - forward every TCP connection on LOCAL to REMOTE")]
#[command(version)]
#[command(long_version = concat!(env!("L4RELAY_RELEASE"), "\nCommit: ", env!("L4RELAY_COMMIT"), "\nBuilt: ", env!("L4RELAY_BUILT")))]
#[command(after_help = r#"EXAMPLES:
  # Relay local port 9000 to a service on 10.0.0.5:5432
  l4relay 127.0.0.1:9000 10.0.0.5:5432

  # Listen on every interface
  l4relay :8080 192.168.1.100:80

ENVIRONMENT VARIABLES:
  L4RELAY_CONNECT_TIMEOUT_MS  Outbound connect timeout in milliseconds
  L4RELAY_TRANSFER_MODE       auto, splice or buffered
  RUST_LOG                    Log filter (overrides --verbose)"#)]
struct Cli {
    /// Local address to listen on (ip:port, ip may be empty for all interfaces)
    local: EndpointAddress,

    /// Remote address every connection is forwarded to (ip:port)
    remote: EndpointAddress,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Outbound connect timeout in milliseconds
    #[arg(long, env = "L4RELAY_CONNECT_TIMEOUT_MS", default_value_t = DEFAULT_CONNECT_TIMEOUT.as_millis() as u64)]
    connect_timeout_ms: u64,

    /// Listen backlog
    #[arg(long, env = "L4RELAY_BACKLOG", default_value_t = DEFAULT_BACKLOG)]
    backlog: u32,

    /// Maximum bytes moved per transfer call
    #[arg(long, env = "L4RELAY_BLOCK_SIZE", default_value_t = DEFAULT_BLOCK_SIZE)]
    block_size: usize,

    /// Capacity of each direction's intermediate buffer in bytes
    #[arg(long, env = "L4RELAY_BUFFER_CAPACITY", default_value_t = DEFAULT_BUFFER_CAPACITY)]
    buffer_capacity: usize,

    /// How bytes move between sockets
    #[arg(long, env = "L4RELAY_TRANSFER_MODE", value_enum, default_value_t = Mode::Auto)]
    transfer_mode: Mode,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    /// splice(2) on Linux, buffered copy elsewhere
    Auto,
    /// Zero-copy through a kernel pipe (Linux only)
    Splice,
    /// Copy through a user-space buffer
    Buffered,
}

impl From<Mode> for TransferMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Auto => TransferMode::Auto,
            Mode::Splice => TransferMode::Splice,
            Mode::Buffered => TransferMode::Buffered,
        }
    }
}

impl Cli {
    fn relay_config(&self) -> RelayConfig {
        RelayConfig::new(self.local, self.remote)
            .with_backlog(self.backlog)
            .with_connect_timeout(Duration::from_millis(self.connect_timeout_ms))
            .with_block_size(self.block_size)
            .with_buffer_capacity(self.buffer_capacity)
            .with_transfer_mode(self.transfer_mode.into())
    }
}

/// Setup logging with the specified log level
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

/// Resolve on SIGINT (Ctrl+C) or SIGTERM
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                    _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C, shutting down..."),
                }
                return;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, shutting down..."),
        Err(e) => {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

async fn run(config: RelayConfig) -> Result<()> {
    let server = RelayServer::bind(config).context("Failed to start relay")?;
    let stats = server.stats();

    server.run_until(shutdown_signal()).await;

    let snapshot = stats.snapshot();
    info!(
        accepted = snapshot.accepted,
        tunnels = snapshot.tunnels_established,
        connect_failures = snapshot.connect_failures,
        active_tunnels = snapshot.active_tunnels,
        "l4relay stopped"
    );
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let config = cli.relay_config();
    info!("Local address: {}", config.listen_addr);
    info!("Remote address: {}", config.remote_addr);

    // One thread drives every socket, pipe and timer
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to create event loop")?;

    runtime.block_on(run(config))
}
