//! Per-connection lifecycle
//!
//! Every accepted client walks through
//! `Accepted -> Connecting -> Relaying -> Closed`, skipping straight to
//! `Closed` when the outbound connect fails. Each stage owns the connection's
//! resources by value and hands them to the next one:
//!
//! * the listener produces a [`PendingConnection`] (`Accepted`),
//! * [`crate::Connector::establish`] consumes it and yields a [`Tunnel`]
//!   (`Connecting -> Relaying`) or drops it (`Closed`),
//! * [`Tunnel::relay`] consumes the tunnel and yields a [`TunnelSummary`]
//!   once either direction ends (`Relaying -> Closed`).

use crate::address::EndpointAddress;
use crate::buffer::Conduit;
use crate::relay::{ChannelEnd, Direction, RelayChannel};
use crate::stats::{Gauge, GaugeGuard, RelayStats};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Accepted,
    Connecting,
    Relaying,
    Closed,
}

impl ConnectionState {
    pub fn can_advance_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Accepted, Connecting)
                | (Accepted, Closed)
                | (Connecting, Relaying)
                | (Connecting, Closed)
                | (Relaying, Closed)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Accepted => "accepted",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Relaying => "relaying",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// The state of one connection, carried from stage to stage
#[derive(Debug)]
pub struct Lifecycle {
    tunnel_id: u64,
    state: ConnectionState,
}

impl Lifecycle {
    pub fn new(tunnel_id: u64) -> Self {
        Self {
            tunnel_id,
            state: ConnectionState::Accepted,
        }
    }

    pub fn tunnel_id(&self) -> u64 {
        self.tunnel_id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn advance(&mut self, next: ConnectionState) {
        if !self.state.can_advance_to(next) {
            warn!(
                tunnel_id = self.tunnel_id,
                "Ignoring invalid transition {} -> {}", self.state, next
            );
            debug_assert!(false, "invalid transition {} -> {}", self.state, next);
            return;
        }
        debug!(tunnel_id = self.tunnel_id, "{} -> {}", self.state, next);
        self.state = next;
    }
}

/// An accepted client waiting for its outbound connection
#[derive(Debug)]
pub struct PendingConnection {
    pub(crate) lifecycle: Lifecycle,
    pub(crate) client: TcpStream,
    pub(crate) peer: SocketAddr,
    pub(crate) remote: EndpointAddress,
    _gauge: GaugeGuard,
}

impl PendingConnection {
    pub fn new(
        tunnel_id: u64,
        client: TcpStream,
        peer: SocketAddr,
        remote: EndpointAddress,
        stats: &Arc<RelayStats>,
    ) -> Self {
        Self {
            lifecycle: Lifecycle::new(tunnel_id),
            client,
            peer,
            remote,
            _gauge: stats.hold(Gauge::PendingConnections),
        }
    }

    pub fn tunnel_id(&self) -> u64 {
        self.lifecycle.tunnel_id()
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn remote(&self) -> EndpointAddress {
        self.remote
    }

    pub fn state(&self) -> ConnectionState {
        self.lifecycle.state()
    }
}

/// Why a tunnel closed
#[derive(Debug)]
pub enum CloseReason {
    /// The client sent end-of-stream
    ClientClosed,
    /// The remote sent end-of-stream
    RemoteClosed,
    /// A read or write in one direction failed
    Failed { direction: Direction, error: io::Error },
}

impl CloseReason {
    fn from_channel(direction: Direction, end: ChannelEnd) -> Self {
        match (direction, end) {
            (Direction::Forward, ChannelEnd::SourceClosed) => CloseReason::ClientClosed,
            (Direction::Reverse, ChannelEnd::SourceClosed) => CloseReason::RemoteClosed,
            (direction, ChannelEnd::Failed(error)) => CloseReason::Failed { direction, error },
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::ClientClosed => write!(f, "client closed"),
            CloseReason::RemoteClosed => write!(f, "remote closed"),
            CloseReason::Failed { direction, error } => {
                write!(f, "{} failed: {}", direction, error)
            }
        }
    }
}

/// What a finished tunnel did
#[derive(Debug)]
pub struct TunnelSummary {
    pub tunnel_id: u64,
    pub peer: SocketAddr,
    pub reason: CloseReason,
    pub client_to_remote: u64,
    pub remote_to_client: u64,
    pub duration: Duration,
}

/// An established tunnel: both sockets plus one buffer per direction
#[derive(Debug)]
pub struct Tunnel {
    lifecycle: Lifecycle,
    client: TcpStream,
    outbound: TcpStream,
    peer: SocketAddr,
    forward: Conduit,
    reverse: Conduit,
    block_size: usize,
    stats: Arc<RelayStats>,
    _gauge: GaugeGuard,
}

impl Tunnel {
    /// Promote a pending connection whose outbound connect has completed
    pub(crate) fn establish(
        pending: PendingConnection,
        outbound: TcpStream,
        forward: Conduit,
        reverse: Conduit,
        block_size: usize,
        stats: Arc<RelayStats>,
    ) -> Self {
        let PendingConnection {
            mut lifecycle,
            client,
            peer,
            ..
        } = pending;
        lifecycle.advance(ConnectionState::Relaying);
        stats.record_established();
        let gauge = stats.hold(Gauge::ActiveTunnels);

        Self {
            lifecycle,
            client,
            outbound,
            peer,
            forward,
            reverse,
            block_size,
            stats,
            _gauge: gauge,
        }
    }

    pub fn tunnel_id(&self) -> u64 {
        self.lifecycle.tunnel_id()
    }

    pub fn state(&self) -> ConnectionState {
        self.lifecycle.state()
    }

    /// Relay both directions until one of them ends, then close everything
    ///
    /// The first direction to finish decides the close reason; the other
    /// direction is abandoned and both sockets and buffers are closed here,
    /// which the peers observe as end-of-stream.
    pub async fn relay(self) -> TunnelSummary {
        let Tunnel {
            mut lifecycle,
            client,
            outbound,
            peer,
            forward,
            reverse,
            block_size,
            stats,
            _gauge,
        } = self;
        let started = Instant::now();

        let (reason, client_to_remote, remote_to_client) = {
            let mut forward =
                RelayChannel::new(Direction::Forward, &client, &outbound, forward, block_size);
            let mut reverse =
                RelayChannel::new(Direction::Reverse, &outbound, &client, reverse, block_size);

            let reason = tokio::select! {
                end = forward.run() => CloseReason::from_channel(Direction::Forward, end),
                end = reverse.run() => CloseReason::from_channel(Direction::Reverse, end),
            };
            (reason, forward.transferred(), reverse.transferred())
        };

        lifecycle.advance(ConnectionState::Closed);
        drop(client);
        drop(outbound);
        stats.record_closed(client_to_remote, remote_to_client);

        let summary = TunnelSummary {
            tunnel_id: lifecycle.tunnel_id(),
            peer,
            reason,
            client_to_remote,
            remote_to_client,
            duration: started.elapsed(),
        };
        debug!(
            tunnel_id = summary.tunnel_id,
            peer = %summary.peer,
            client_to_remote = summary.client_to_remote,
            remote_to_client = summary.remote_to_client,
            "Tunnel closed: {}",
            summary.reason
        );
        summary
    }
}
