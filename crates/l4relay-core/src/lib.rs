//! Transparent Layer-4 TCP relay
//!
//! Listens on a local endpoint and, for every inbound connection, opens a new
//! outbound connection to one fixed remote endpoint, then relays bytes in both
//! directions until either side closes or errors. Payload is never inspected.
//!
//! The relay is driven by a single-threaded Tokio runtime: every socket and
//! pipe is non-blocking and each connection is one task, so exactly one
//! readiness handler runs at a time. On Linux the bytes of each direction move
//! through a kernel pipe with `splice(2)`; elsewhere (or on request) through
//! a fixed-size user-space buffer with identical observable behaviour.
//!
//! ```ignore
//! let config = RelayConfig::new(":9000".parse()?, "127.0.0.1:9001".parse()?);
//! let server = RelayServer::bind(config)?;
//! server.run().await;
//! ```

pub mod address;
pub mod buffer;
pub mod config;
pub mod connector;
pub mod error;
pub mod listener;
pub mod relay;
pub mod server;
pub mod stats;
pub mod tunnel;

#[cfg(target_os = "linux")]
pub mod splice;

pub use address::EndpointAddress;
pub use buffer::{Conduit, Transfer};
pub use config::{RelayConfig, TransferMode};
pub use connector::Connector;
pub use error::{AddressError, ConfigError, ConnectError, RelayError};
pub use listener::{AcceptOutcome, Listener};
pub use relay::{ChannelEnd, Direction, RelayChannel};
pub use server::{serve_connection, RelayServer};
pub use stats::{RelayStats, StatsSnapshot, TunnelIdGenerator};
pub use tunnel::{CloseReason, ConnectionState, PendingConnection, Tunnel, TunnelSummary};
