//! Relay configuration

use crate::address::EndpointAddress;
use crate::error::ConfigError;
use std::time::Duration;

/// Default listen backlog
pub const DEFAULT_BACKLOG: u32 = 20;

/// Default bound on an outbound connect
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Default maximum number of bytes moved by one transfer call
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Default capacity of each intermediate buffer (the Linux pipe default)
pub const DEFAULT_BUFFER_CAPACITY: usize = 64 * 1024;

/// How bytes travel through a channel's intermediate buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferMode {
    /// Use `splice(2)` through a kernel pipe where available, otherwise copy
    #[default]
    Auto,
    /// Always use `splice(2)` (Linux only)
    Splice,
    /// Always copy through a fixed user-space buffer
    Buffered,
}

impl TransferMode {
    /// Resolve `Auto` into the concrete mode for this target
    pub fn resolve(self) -> TransferMode {
        match self {
            TransferMode::Auto if cfg!(target_os = "linux") => TransferMode::Splice,
            TransferMode::Auto => TransferMode::Buffered,
            other => other,
        }
    }
}

/// Relay configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Local endpoint to listen on
    pub listen_addr: EndpointAddress,

    /// Fixed remote endpoint every tunnel connects to
    pub remote_addr: EndpointAddress,

    /// Listen backlog
    pub backlog: u32,

    /// Bound on the outbound connect; no timeout applies once relaying starts
    pub connect_timeout: Duration,

    /// Maximum bytes moved per transfer call
    pub block_size: usize,

    /// Intermediate buffer strategy
    pub transfer_mode: TransferMode,

    /// Capacity of each direction's intermediate buffer
    pub buffer_capacity: usize,
}

impl RelayConfig {
    pub fn new(listen_addr: EndpointAddress, remote_addr: EndpointAddress) -> Self {
        Self {
            listen_addr,
            remote_addr,
            backlog: DEFAULT_BACKLOG,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            block_size: DEFAULT_BLOCK_SIZE,
            transfer_mode: TransferMode::Auto,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
        }
    }

    pub fn with_backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_transfer_mode(mut self, mode: TransferMode) -> Self {
        self.transfer_mode = mode;
        self
    }

    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    /// Check the tunables for values the relay cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.block_size == 0 {
            return Err(ConfigError::ZeroBlockSize);
        }
        if self.buffer_capacity < self.block_size {
            return Err(ConfigError::CapacityTooSmall {
                capacity: self.buffer_capacity,
                block_size: self.block_size,
            });
        }
        if self.backlog == 0 {
            return Err(ConfigError::ZeroBacklog);
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::ZeroConnectTimeout);
        }
        if self.transfer_mode == TransferMode::Splice && !cfg!(target_os = "linux") {
            return Err(ConfigError::SpliceUnsupported);
        }
        Ok(())
    }
}
