//! Intermediate buffers between a channel's source and destination sockets

use crate::config::TransferMode;
#[cfg(target_os = "linux")]
use crate::splice::SplicePipe;
use std::io;
use tokio::net::TcpStream;

/// Outcome of one non-blocking transfer attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    /// Some bytes moved
    Moved(usize),
    /// The socket is not ready
    WouldBlock,
    /// The buffer has (or, for splice, may have) no room; retry after a drain
    Full,
    /// The buffer holds nothing to write
    Empty,
    /// The source reached end-of-stream
    Closed,
}

/// A bounded buffer one channel pumps bytes through
#[derive(Debug)]
pub enum Conduit {
    #[cfg(target_os = "linux")]
    Splice(SplicePipe),
    Buffered(BlockBuffer),
}

impl Conduit {
    /// Allocate a buffer for `mode` (resolving `Auto` for this target)
    pub fn new(mode: TransferMode, capacity: usize) -> io::Result<Self> {
        match mode.resolve() {
            #[cfg(target_os = "linux")]
            TransferMode::Splice => Ok(Conduit::Splice(SplicePipe::new(capacity)?)),
            #[cfg(not(target_os = "linux"))]
            TransferMode::Splice => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "splice is only available on Linux",
            )),
            _ => Ok(Conduit::Buffered(BlockBuffer::new(capacity))),
        }
    }

    pub fn mode(&self) -> TransferMode {
        match self {
            #[cfg(target_os = "linux")]
            Conduit::Splice(_) => TransferMode::Splice,
            Conduit::Buffered(_) => TransferMode::Buffered,
        }
    }

    /// Bytes accepted from the source and not yet written out
    pub fn buffered(&self) -> usize {
        match self {
            #[cfg(target_os = "linux")]
            Conduit::Splice(pipe) => pipe.buffered(),
            Conduit::Buffered(buffer) => buffer.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        match self {
            #[cfg(target_os = "linux")]
            Conduit::Splice(pipe) => pipe.capacity(),
            Conduit::Buffered(buffer) => buffer.capacity(),
        }
    }

    /// True only when the buffer is known to have no room
    ///
    /// A pipe's free space depends on how the kernel packed its pages, so a
    /// splice conduit never reports full up front; its reads report
    /// [`Transfer::Full`] when the kernel refuses more.
    pub fn is_full(&self) -> bool {
        match self {
            #[cfg(target_os = "linux")]
            Conduit::Splice(_) => false,
            Conduit::Buffered(buffer) => buffer.is_full(),
        }
    }

    pub fn fill_from(&mut self, source: &TcpStream, max: usize) -> io::Result<Transfer> {
        match self {
            #[cfg(target_os = "linux")]
            Conduit::Splice(pipe) => pipe.fill_from(source, max),
            Conduit::Buffered(buffer) => buffer.fill_from(source, max),
        }
    }

    pub fn drain_into(&mut self, destination: &TcpStream, max: usize) -> io::Result<Transfer> {
        match self {
            #[cfg(target_os = "linux")]
            Conduit::Splice(pipe) => pipe.drain_into(destination, max),
            Conduit::Buffered(buffer) => buffer.drain_into(destination, max),
        }
    }
}

/// Fixed-capacity user-space buffer used where splice is unavailable
#[derive(Debug)]
pub struct BlockBuffer {
    data: Box<[u8]>,
    start: usize,
    end: usize,
}

impl BlockBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            start: 0,
            end: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }

    /// Free space in front of `end`, compacting first if it is exhausted
    fn tail(&mut self, max: usize) -> &mut [u8] {
        if self.end == self.data.len() && self.start > 0 {
            self.data.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }
        let room = (self.data.len() - self.end).min(max);
        &mut self.data[self.end..self.end + room]
    }

    fn consume(&mut self, n: usize) {
        self.start += n;
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        }
    }

    pub fn fill_from(&mut self, source: &TcpStream, max: usize) -> io::Result<Transfer> {
        if self.is_full() {
            return Ok(Transfer::Full);
        }

        match source.try_read(self.tail(max)) {
            Ok(0) => Ok(Transfer::Closed),
            Ok(n) => {
                self.end += n;
                Ok(Transfer::Moved(n))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Transfer::WouldBlock),
            Err(e) => Err(e),
        }
    }

    pub fn drain_into(&mut self, destination: &TcpStream, max: usize) -> io::Result<Transfer> {
        if self.is_empty() {
            return Ok(Transfer::Empty);
        }

        let len = self.len().min(max);
        match destination.try_write(&self.data[self.start..self.start + len]) {
            Ok(0) => Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "destination accepted no bytes",
            )),
            Ok(n) => {
                self.consume(n);
                Ok(Transfer::Moved(n))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Transfer::WouldBlock),
            Err(e) => Err(e),
        }
    }
}
