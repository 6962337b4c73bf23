//! Error types for the relay

use std::time::Duration;
use thiserror::Error;

/// Errors produced while parsing a `host:port` endpoint
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("Missing ':' separator in address '{0}' (expected host:port)")]
    MissingSeparator(String),

    #[error("Missing port in address '{0}'")]
    MissingPort(String),

    #[error("Invalid port '{port}' in address '{address}'")]
    InvalidPort { address: String, port: String },

    #[error("Invalid IPv4 host '{host}' in address '{address}'")]
    InvalidHost { address: String, host: String },
}

/// Errors produced by [`crate::RelayConfig::validate`]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Block size must be greater than zero")]
    ZeroBlockSize,

    #[error("Buffer capacity ({capacity}) must be at least the block size ({block_size})")]
    CapacityTooSmall { capacity: usize, block_size: usize },

    #[error("Listen backlog must be greater than zero")]
    ZeroBacklog,

    #[error("Connect timeout must be greater than zero")]
    ZeroConnectTimeout,

    #[error("Splice transfer mode is only available on Linux")]
    SpliceUnsupported,
}

/// Startup-fatal relay errors
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid address: {0}")]
    Address(#[from] AddressError),

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("Failed to listen on {address}: {reason}")]
    ListenError { address: String, reason: String },
}

/// Per-connection connect failures
///
/// None of these are fatal for the process; the pending connection that
/// produced one is dropped and both of its sockets are closed.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("Failed to create outbound socket: {0}")]
    Socket(std::io::Error),

    #[error("Connection to {address} refused")]
    Refused { address: String },

    #[error("Connection to {address} failed: {source}")]
    Failed {
        address: String,
        source: std::io::Error,
    },

    #[error("Connection to {address} timed out after {timeout:?}")]
    Timeout { address: String, timeout: Duration },

    #[error("Failed to allocate relay buffers: {0}")]
    Buffer(std::io::Error),
}

impl ConnectError {
    /// Whether this failure was the connect timeout expiring
    pub fn is_timeout(&self) -> bool {
        matches!(self, ConnectError::Timeout { .. })
    }

    pub fn is_refused(&self) -> bool {
        matches!(self, ConnectError::Refused { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_error_mentions_port() {
        let err = RelayError::BindError {
            address: "127.0.0.1".to_string(),
            port: 9000,
            reason: "Address already in use".to_string(),
        };
        let message = err.to_string();
        assert!(message.contains("127.0.0.1"));
        assert!(message.contains("lsof -i :9000"));
    }

    #[test]
    fn test_connect_error_is_timeout() {
        let timeout = ConnectError::Timeout {
            address: "10.0.0.1:80".to_string(),
            timeout: Duration::from_secs(2),
        };
        assert!(timeout.is_timeout());

        assert!(!timeout.is_refused());

        let refused = ConnectError::Refused {
            address: "127.0.0.1:1".to_string(),
        };
        assert!(!refused.is_timeout());
        assert!(refused.is_refused());
        assert_eq!(refused.to_string(), "Connection to 127.0.0.1:1 refused");
    }
}
