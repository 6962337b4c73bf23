//! Relay counters and live gauges
//!
//! Counters only ever grow. The two gauges (pending connections and active
//! tunnels) are held up by [`GaugeGuard`] values owned by the connection they
//! count, so each is released exactly once, when that connection is dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Tunnel id generator for log correlation
#[derive(Clone)]
pub struct TunnelIdGenerator {
    next_id: Arc<AtomicU64>,
}

impl TunnelIdGenerator {
    pub fn new() -> Self {
        Self {
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn generate(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for TunnelIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
pub struct RelayStats {
    accepted: AtomicU64,
    accept_errors: AtomicU64,
    connect_failures: AtomicU64,
    connect_timeouts: AtomicU64,
    tunnels_established: AtomicU64,
    tunnels_closed: AtomicU64,
    bytes_client_to_remote: AtomicU64,
    bytes_remote_to_client: AtomicU64,
    pending_connections: AtomicU64,
    active_tunnels: AtomicU64,
}

/// Point-in-time copy of [`RelayStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub accept_errors: u64,
    pub connect_failures: u64,
    pub connect_timeouts: u64,
    pub tunnels_established: u64,
    pub tunnels_closed: u64,
    pub bytes_client_to_remote: u64,
    pub bytes_remote_to_client: u64,
    pub pending_connections: u64,
    pub active_tunnels: u64,
}

impl StatsSnapshot {
    /// No pending connection or tunnel is holding sockets
    pub fn is_idle(&self) -> bool {
        self.pending_connections == 0 && self.active_tunnels == 0
    }
}

/// Which live gauge a [`GaugeGuard`] holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gauge {
    PendingConnections,
    ActiveTunnels,
}

impl RelayStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            accept_errors: self.accept_errors.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            connect_timeouts: self.connect_timeouts.load(Ordering::Relaxed),
            tunnels_established: self.tunnels_established.load(Ordering::Relaxed),
            tunnels_closed: self.tunnels_closed.load(Ordering::Relaxed),
            bytes_client_to_remote: self.bytes_client_to_remote.load(Ordering::Relaxed),
            bytes_remote_to_client: self.bytes_remote_to_client.load(Ordering::Relaxed),
            pending_connections: self.pending_connections.load(Ordering::Relaxed),
            active_tunnels: self.active_tunnels.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_accept(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_accept_error(&self) {
        self.accept_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_connect_failure(&self, timed_out: bool) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
        if timed_out {
            self.connect_timeouts.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_established(&self) {
        self.tunnels_established.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_closed(&self, client_to_remote: u64, remote_to_client: u64) {
        self.tunnels_closed.fetch_add(1, Ordering::Relaxed);
        self.bytes_client_to_remote
            .fetch_add(client_to_remote, Ordering::Relaxed);
        self.bytes_remote_to_client
            .fetch_add(remote_to_client, Ordering::Relaxed);
    }

    fn gauge(&self, gauge: Gauge) -> &AtomicU64 {
        match gauge {
            Gauge::PendingConnections => &self.pending_connections,
            Gauge::ActiveTunnels => &self.active_tunnels,
        }
    }

    /// Raise a gauge until the returned guard is dropped
    pub fn hold(self: &Arc<Self>, gauge: Gauge) -> GaugeGuard {
        self.gauge(gauge).fetch_add(1, Ordering::Relaxed);
        GaugeGuard {
            stats: self.clone(),
            gauge,
        }
    }
}

/// Keeps one unit of a live gauge raised for as long as it is alive
#[derive(Debug)]
pub struct GaugeGuard {
    stats: Arc<RelayStats>,
    gauge: Gauge,
}

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        self.stats.gauge(self.gauge).fetch_sub(1, Ordering::Relaxed);
    }
}
