//! Shared helpers for the relay integration tests

#![allow(dead_code)]

use l4relay_core::{EndpointAddress, RelayConfig, RelayServer, RelayStats, StatsSnapshot};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init()
        .ok();
}

pub fn v4(addr: SocketAddr) -> EndpointAddress {
    match addr {
        SocketAddr::V4(addr) => addr.into(),
        SocketAddr::V6(addr) => panic!("expected an IPv4 address, got {}", addr),
    }
}

pub fn loopback() -> EndpointAddress {
    "127.0.0.1:0".parse().unwrap()
}

/// A relay running on the current runtime
pub struct RunningRelay {
    pub addr: SocketAddr,
    pub stats: Arc<RelayStats>,
    handle: JoinHandle<()>,
}

impl RunningRelay {
    pub fn start(config: RelayConfig) -> Self {
        let server = RelayServer::bind(config).expect("relay should bind");
        let addr = server.local_addr();
        let stats = server.stats();
        let handle = tokio::spawn(server.run());
        Self {
            addr,
            stats,
            handle,
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Poll the counters until `predicate` holds or `within` elapses
    pub async fn wait_for<F>(&self, within: Duration, predicate: F) -> StatsSnapshot
    where
        F: Fn(&StatsSnapshot) -> bool,
    {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            let snapshot = self.snapshot();
            if predicate(&snapshot) {
                return snapshot;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("condition not reached within {:?}: {:?}", within, snapshot);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Drop for RunningRelay {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Upstream echo server
///
/// Every accepted connection echoes until end-of-stream, then reports its
/// peer address on `closed` and drops its socket. `live` counts connections
/// that have not finished yet.
pub struct EchoServer {
    pub addr: SocketAddr,
    pub live: Arc<AtomicUsize>,
    pub closed: mpsc::UnboundedReceiver<SocketAddr>,
    handle: JoinHandle<()>,
}

impl EchoServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let live = Arc::new(AtomicUsize::new(0));
        let (closed_tx, closed) = mpsc::unbounded_channel();

        let counter = live.clone();
        let handle = tokio::spawn(async move {
            loop {
                let Ok((mut socket, peer)) = listener.accept().await else {
                    return;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let counter = counter.clone();
                let closed_tx = closed_tx.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 8192];
                    loop {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if socket.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    drop(socket);
                    counter.fetch_sub(1, Ordering::SeqCst);
                    let _ = closed_tx.send(peer);
                });
            }
        });

        Self {
            addr,
            live,
            closed,
            handle,
        }
    }

    pub fn endpoint(&self) -> EndpointAddress {
        v4(self.addr)
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

impl Drop for EchoServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// An IPv4 port on loopback with nothing listening on it
pub async fn closed_port() -> EndpointAddress {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    v4(addr)
}

/// Read until end-of-stream, treating a reset as end-of-stream too
pub async fn read_until_closed(stream: &mut TcpStream) -> Vec<u8> {
    let mut received = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return received,
            Ok(n) => received.extend_from_slice(&buf[..n]),
        }
    }
}
