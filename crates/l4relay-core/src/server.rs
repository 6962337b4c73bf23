//! Relay server: listener loop plus one task per connection

use crate::config::RelayConfig;
use crate::connector::Connector;
use crate::error::RelayError;
use crate::listener::{is_resource_exhaustion, AcceptOutcome, Listener};
use crate::stats::{RelayStats, TunnelIdGenerator};
use crate::tunnel::{PendingConnection, TunnelSummary};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Pause after an accept failure caused by descriptor or memory exhaustion
const EXHAUSTION_PAUSE: Duration = Duration::from_millis(100);

pub struct RelayServer {
    config: RelayConfig,
    listener: Listener,
    connector: Connector,
    stats: Arc<RelayStats>,
    tunnel_ids: TunnelIdGenerator,
}

impl RelayServer {
    /// Validate `config`, then bind and listen on its local endpoint
    ///
    /// Must be called from within a Tokio runtime. All startup-fatal errors
    /// (invalid tunables, bind or listen failure) surface here.
    pub fn bind(config: RelayConfig) -> Result<Self, RelayError> {
        config.validate()?;

        let listener = Listener::bind(config.listen_addr, config.backlog)?;
        let stats = Arc::new(RelayStats::new());
        let connector = Connector::new(&config, stats.clone());

        info!(
            "TCP relay listening on {} (forwarding to {})",
            listener.local_addr(),
            config.remote_addr
        );

        Ok(Self {
            config,
            listener,
            connector,
            stats,
            tunnel_ids: TunnelIdGenerator::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<RelayStats> {
        self.stats.clone()
    }

    /// Serve forever
    pub async fn run(self) {
        self.run_until(std::future::pending()).await
    }

    /// Serve until `shutdown` resolves
    ///
    /// Only the listener stops; tunnels already established keep relaying on
    /// the runtime until their peers close.
    pub async fn run_until<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("TCP relay on {} stopped accepting", self.local_addr());
                    return;
                }
                outcome = self.listener.accept() => self.dispatch(outcome).await,
            }
        }
    }

    async fn dispatch(&self, outcome: AcceptOutcome) {
        match outcome {
            AcceptOutcome::Accepted(client, peer) => {
                self.stats.record_accept();
                let pending = PendingConnection::new(
                    self.tunnel_ids.generate(),
                    client,
                    peer,
                    self.config.remote_addr,
                    &self.stats,
                );
                debug!(
                    tunnel_id = pending.tunnel_id(),
                    "Accepted TCP connection from {}", peer
                );

                let connector = self.connector.clone();
                tokio::spawn(async move {
                    serve_connection(pending, connector).await;
                });
            }
            AcceptOutcome::Spurious => {
                debug!("Listener woke up with no pending connection");
            }
            AcceptOutcome::Failed(e) => {
                self.stats.record_accept_error();
                if is_resource_exhaustion(&e) {
                    error!("Failed to accept TCP connection: {} (pausing accepts)", e);
                    tokio::time::sleep(EXHAUSTION_PAUSE).await;
                } else {
                    warn!("Failed to accept TCP connection: {}", e);
                }
            }
        }
    }
}

/// Drive one accepted connection to completion
///
/// Returns `None` when the outbound connect failed.
pub async fn serve_connection(
    pending: PendingConnection,
    connector: Connector,
) -> Option<TunnelSummary> {
    match connector.establish(pending).await {
        Ok(tunnel) => Some(tunnel.relay().await),
        Err(_) => None,
    }
}
