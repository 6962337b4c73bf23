//! Non-blocking listening socket
//!
//! The socket is created with `SO_REUSEADDR`, bound, and put into listen
//! state with an explicit backlog. [`Listener::accept`] waits for one
//! readiness notification and performs exactly one `accept`.

use crate::address::EndpointAddress;
use crate::error::RelayError;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use tokio::net::TcpStream;

#[cfg(unix)]
use tokio::io::unix::AsyncFd;
#[cfg(unix)]
use tokio::io::Interest;

/// Result of one readiness notification on the listening socket
#[derive(Debug)]
pub enum AcceptOutcome {
    /// A client was accepted and its socket made non-blocking
    Accepted(TcpStream, SocketAddr),
    /// Readiness was reported but no connection was pending
    Spurious,
    /// `accept` failed; only this attempt is lost
    Failed(io::Error),
}

#[derive(Debug)]
pub struct Listener {
    #[cfg(unix)]
    inner: AsyncFd<std::net::TcpListener>,
    #[cfg(not(unix))]
    inner: tokio::net::TcpListener,
    local_addr: SocketAddr,
}

impl Listener {
    /// Bind and listen on `addr`
    ///
    /// Must be called from within a Tokio runtime.
    pub fn bind(addr: EndpointAddress, backlog: u32) -> Result<Self, RelayError> {
        let socket_addr: SocketAddr = addr.into();
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;

        socket
            .bind(&socket_addr.into())
            .map_err(|e| RelayError::BindError {
                address: addr.ip().to_string(),
                port: addr.port(),
                reason: e.to_string(),
            })?;

        let backlog = i32::try_from(backlog).unwrap_or(i32::MAX);
        socket
            .listen(backlog)
            .map_err(|e| RelayError::ListenError {
                address: addr.to_string(),
                reason: e.to_string(),
            })?;

        let listener: std::net::TcpListener = socket.into();
        let local_addr = listener.local_addr()?;

        #[cfg(unix)]
        let inner = AsyncFd::with_interest(listener, Interest::READABLE)?;
        #[cfg(not(unix))]
        let inner = tokio::net::TcpListener::from_std(listener)?;

        Ok(Self { inner, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for read readiness, then accept at most one connection
    #[cfg(unix)]
    pub async fn accept(&self) -> AcceptOutcome {
        let mut guard = match self.inner.readable().await {
            Ok(guard) => guard,
            Err(e) => return AcceptOutcome::Failed(e),
        };

        match guard.try_io(|inner| inner.get_ref().accept()) {
            Ok(Ok((stream, peer))) => match into_nonblocking(stream) {
                Ok(stream) => AcceptOutcome::Accepted(stream, peer),
                Err(e) => AcceptOutcome::Failed(e),
            },
            Ok(Err(e)) => AcceptOutcome::Failed(e),
            Err(_would_block) => AcceptOutcome::Spurious,
        }
    }

    /// Accept one connection
    ///
    /// Tokio retries spurious wake-ups internally on this target.
    #[cfg(not(unix))]
    pub async fn accept(&self) -> AcceptOutcome {
        match self.inner.accept().await {
            Ok((stream, peer)) => AcceptOutcome::Accepted(stream, peer),
            Err(e) => AcceptOutcome::Failed(e),
        }
    }
}

#[cfg(unix)]
fn into_nonblocking(stream: std::net::TcpStream) -> io::Result<TcpStream> {
    stream.set_nonblocking(true)?;
    TcpStream::from_std(stream)
}

/// Accept errors that signal process-wide resource exhaustion
///
/// These leave the listener readable, so retrying immediately would spin.
#[cfg(unix)]
pub fn is_resource_exhaustion(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
    )
}

#[cfg(not(unix))]
pub fn is_resource_exhaustion(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::OutOfMemory
}
