//! Outbound connect with a bounded timeout
//!
//! The outbound socket is created non-blocking and `connect` is issued once.
//! An immediate success (common on loopback) goes straight to establishment;
//! "in progress" waits for write readiness or the timeout, then checks
//! `SO_ERROR`. Every failure drops the pending connection, which closes both
//! sockets; nothing here is fatal to the process.

use crate::address::EndpointAddress;
use crate::buffer::Conduit;
use crate::config::{RelayConfig, TransferMode};
use crate::error::ConnectError;
use crate::stats::RelayStats;
use crate::tunnel::{ConnectionState, PendingConnection, Tunnel};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct Connector {
    remote: EndpointAddress,
    connect_timeout: Duration,
    transfer_mode: TransferMode,
    buffer_capacity: usize,
    block_size: usize,
    stats: Arc<RelayStats>,
}

impl Connector {
    pub fn new(config: &RelayConfig, stats: Arc<RelayStats>) -> Self {
        Self {
            remote: config.remote_addr,
            connect_timeout: config.connect_timeout,
            transfer_mode: config.transfer_mode,
            buffer_capacity: config.buffer_capacity,
            block_size: config.block_size,
            stats,
        }
    }

    pub fn remote(&self) -> EndpointAddress {
        self.remote
    }

    /// Connect `pending` to the remote endpoint and build its tunnel
    ///
    /// On failure the pending connection is dropped before returning, so the
    /// client socket is already closed when the caller sees the error.
    pub async fn establish(&self, mut pending: PendingConnection) -> Result<Tunnel, ConnectError> {
        pending.lifecycle.advance(ConnectionState::Connecting);

        let outbound = match self.connect().await {
            Ok(outbound) => outbound,
            Err(e) => return Err(self.abandon(pending, e)),
        };

        let buffers = Conduit::new(self.transfer_mode, self.buffer_capacity).and_then(|forward| {
            Conduit::new(self.transfer_mode, self.buffer_capacity).map(|reverse| (forward, reverse))
        });
        let (forward, reverse) = match buffers {
            Ok(buffers) => buffers,
            Err(e) => return Err(self.abandon(pending, ConnectError::Buffer(e))),
        };

        debug!(
            tunnel_id = pending.tunnel_id(),
            peer = %pending.peer(),
            remote = %self.remote,
            mode = ?forward.mode(),
            "Tunnel established"
        );

        Ok(Tunnel::establish(
            pending,
            outbound,
            forward,
            reverse,
            self.block_size,
            self.stats.clone(),
        ))
    }

    fn abandon(&self, mut pending: PendingConnection, error: ConnectError) -> ConnectError {
        warn!(
            tunnel_id = pending.tunnel_id(),
            peer = %pending.peer(),
            "Closing client: {}",
            error
        );
        self.stats.record_connect_failure(error.is_timeout());
        pending.lifecycle.advance(ConnectionState::Closed);
        drop(pending);
        error
    }

    async fn connect(&self) -> Result<TcpStream, ConnectError> {
        let (stream, connected) = self.start_connect()?;
        self.finish_connect(stream, connected).await
    }

    /// Wait for an in-progress connect to complete, bounded by the timeout
    async fn finish_connect(
        &self,
        stream: TcpStream,
        connected: bool,
    ) -> Result<TcpStream, ConnectError> {
        if connected {
            debug!(remote = %self.remote, "Connected immediately");
            return Ok(stream);
        }

        match tokio::time::timeout(self.connect_timeout, stream.writable()).await {
            Err(_) => {
                return Err(ConnectError::Timeout {
                    address: self.remote.to_string(),
                    timeout: self.connect_timeout,
                })
            }
            Ok(Err(e)) => return Err(self.failed(e)),
            Ok(Ok(())) => {}
        }

        match stream.take_error() {
            Ok(None) => Ok(stream),
            Ok(Some(e)) | Err(e) => Err(self.failed(e)),
        }
    }

    /// Create the outbound socket and issue a non-blocking connect
    ///
    /// Returns the socket and whether the connect already completed.
    fn start_connect(&self) -> Result<(TcpStream, bool), ConnectError> {
        let addr: SocketAddr = self.remote.into();
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(ConnectError::Socket)?;
        socket.set_nonblocking(true).map_err(ConnectError::Socket)?;

        let connected = match socket.connect(&addr.into()) {
            Ok(()) => true,
            Err(e) if connect_in_progress(&e) => false,
            Err(e) => return Err(self.failed(e)),
        };

        let stream = TcpStream::from_std(socket.into()).map_err(ConnectError::Socket)?;
        Ok((stream, connected))
    }

    fn failed(&self, source: io::Error) -> ConnectError {
        let address = self.remote.to_string();
        if source.kind() == io::ErrorKind::ConnectionRefused {
            return ConnectError::Refused { address };
        }
        ConnectError::Failed { address, source }
    }
}

fn connect_in_progress(e: &io::Error) -> bool {
    #[cfg(unix)]
    if e.raw_os_error() == Some(libc::EINPROGRESS) {
        return true;
    }
    e.kind() == io::ErrorKind::WouldBlock
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::TunnelIdGenerator;
    use tokio::net::TcpListener;

    async fn accepted_client() -> (TcpStream, TcpStream, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let (accepted, peer) = accepted.unwrap();
        (client.unwrap(), accepted, peer)
    }

    async fn closed_port() -> EndpointAddress {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = match listener.local_addr().unwrap() {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => unreachable!("bound to an IPv4 address"),
        };
        drop(listener);
        addr.into()
    }

    #[test]
    fn test_connect_in_progress_classification() {
        assert!(connect_in_progress(&io::Error::from(
            io::ErrorKind::WouldBlock
        )));
        assert!(!connect_in_progress(&io::Error::from(
            io::ErrorKind::ConnectionRefused
        )));
        #[cfg(unix)]
        assert!(connect_in_progress(&io::Error::from_raw_os_error(
            libc::EINPROGRESS
        )));
    }

    #[tokio::test]
    async fn test_establish_success() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let remote: EndpointAddress = match upstream.local_addr().unwrap() {
            SocketAddr::V4(addr) => addr.into(),
            SocketAddr::V6(_) => unreachable!(),
        };

        let stats = Arc::new(RelayStats::new());
        let config = RelayConfig::new("127.0.0.1:0".parse().unwrap(), remote);
        let connector = Connector::new(&config, stats.clone());
        let ids = TunnelIdGenerator::new();

        let (_client, accepted, peer) = accepted_client().await;
        let pending = PendingConnection::new(ids.generate(), accepted, peer, remote, &stats);
        assert_eq!(stats.snapshot().pending_connections, 1);

        let tunnel = connector.establish(pending).await.unwrap();
        assert_eq!(tunnel.state(), ConnectionState::Relaying);
        assert_eq!(tunnel.tunnel_id(), 1);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.pending_connections, 0);
        assert_eq!(snapshot.active_tunnels, 1);
        assert_eq!(snapshot.tunnels_established, 1);

        drop(tunnel);
        assert!(stats.snapshot().is_idle());
    }

    #[tokio::test]
    async fn test_finish_connect_skips_wait_when_already_connected() {
        let (client, _accepted, _) = accepted_client().await;
        let peer = client.peer_addr().unwrap();

        // A timeout far beyond the test guard proves nothing waits on it
        let config = RelayConfig::new("127.0.0.1:0".parse().unwrap(), closed_port().await)
            .with_connect_timeout(Duration::from_secs(60));
        let connector = Connector::new(&config, Arc::new(RelayStats::new()));

        let stream = tokio::time::timeout(
            Duration::from_secs(1),
            connector.finish_connect(client, true),
        )
        .await
        .expect("an immediate connect must not wait")
        .unwrap();
        assert_eq!(stream.peer_addr().unwrap(), peer);
    }

    #[tokio::test]
    async fn test_finish_connect_in_progress_checks_socket_error() {
        let (client, _accepted, _) = accepted_client().await;

        let config = RelayConfig::new("127.0.0.1:0".parse().unwrap(), closed_port().await);
        let connector = Connector::new(&config, Arc::new(RelayStats::new()));

        // Writable with no pending SO_ERROR: the connect is complete
        let stream = connector.finish_connect(client, false).await.unwrap();
        assert!(stream.peer_addr().is_ok());
    }

    #[test]
    fn test_refusal_is_classified() {
        let config = RelayConfig::new(
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:1".parse().unwrap(),
        );
        let connector = Connector::new(&config, Arc::new(RelayStats::new()));

        let refused = connector.failed(io::Error::from(io::ErrorKind::ConnectionRefused));
        assert!(matches!(
            refused,
            ConnectError::Refused { ref address } if address == "127.0.0.1:1"
        ));

        let unreachable = connector.failed(io::Error::from(io::ErrorKind::TimedOut));
        assert!(matches!(unreachable, ConnectError::Failed { .. }));
    }

    #[tokio::test]
    async fn test_establish_refused_closes_client() {
        use tokio::io::AsyncReadExt;

        let remote = closed_port().await;
        let stats = Arc::new(RelayStats::new());
        let config = RelayConfig::new("127.0.0.1:0".parse().unwrap(), remote);
        let connector = Connector::new(&config, stats.clone());

        let (mut client, accepted, peer) = accepted_client().await;
        let pending = PendingConnection::new(1, accepted, peer, remote, &stats);

        let err = connector.establish(pending).await.unwrap_err();
        assert!(err.is_refused(), "{:?}", err);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.connect_failures, 1);
        assert_eq!(snapshot.connect_timeouts, 0);
        assert!(snapshot.is_idle());

        // The accepted side was dropped, so the client sees end-of-stream
        let mut buf = [0u8; 1];
        let n = client.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);
    }
}
