//! One direction of an established tunnel
//!
//! A [`RelayChannel`] reads from its source socket into a bounded
//! [`Conduit`] and writes from the conduit to its destination socket. Read
//! interest on the source is armed while the source is open and the conduit
//! has room; write interest on the destination is armed only while bytes are
//! buffered, so an idle tunnel produces no wake-ups. While reads are paused
//! the source is still watched for error conditions, so a peer reset tears
//! the channel down even when the destination never drains.

use crate::buffer::{Conduit, Transfer};
use std::fmt;
use std::io;
use tokio::io::Interest;
use tokio::net::TcpStream;
use tracing::{debug, trace};

/// Which way a channel moves bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client socket to remote socket
    Forward,
    /// Remote socket to client socket
    Reverse,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Forward => write!(f, "client->remote"),
            Direction::Reverse => write!(f, "remote->client"),
        }
    }
}

/// Why a channel stopped
#[derive(Debug)]
pub enum ChannelEnd {
    /// The source reached end-of-stream and everything it sent was flushed
    SourceClosed,
    /// Reading the source or writing the destination failed
    Failed(io::Error),
}

pub struct RelayChannel<'a> {
    direction: Direction,
    source: &'a TcpStream,
    destination: &'a TcpStream,
    conduit: Conduit,
    block_size: usize,
    write_armed: bool,
    source_closed: bool,
    read_stalled: bool,
    transferred: u64,
}

impl<'a> RelayChannel<'a> {
    pub fn new(
        direction: Direction,
        source: &'a TcpStream,
        destination: &'a TcpStream,
        conduit: Conduit,
        block_size: usize,
    ) -> Self {
        Self {
            direction,
            source,
            destination,
            conduit,
            block_size,
            write_armed: false,
            source_closed: false,
            read_stalled: false,
            transferred: 0,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Bytes written to the destination so far
    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    pub fn is_write_armed(&self) -> bool {
        self.write_armed
    }

    /// Pump bytes until the source closes or an error occurs
    pub async fn run(&mut self) -> ChannelEnd {
        match self.pump().await {
            Ok(()) => ChannelEnd::SourceClosed,
            Err(e) => ChannelEnd::Failed(e),
        }
    }

    async fn pump(&mut self) -> io::Result<()> {
        loop {
            if self.source_closed && !self.write_armed {
                return Ok(());
            }

            let read_armed = !self.source_closed && !self.read_stalled && !self.conduit.is_full();
            tokio::select! {
                biased;
                ready = self.source.ready(Interest::ERROR), if !read_armed => {
                    ready?;
                    return Err(self.source_error());
                }
                ready = self.destination.writable(), if self.write_armed => {
                    ready?;
                    self.on_write_ready()?;
                }
                ready = self.source.readable(), if read_armed => {
                    ready?;
                    self.on_read_ready()?;
                }
            }
        }
    }

    /// The pending error on a source socket that reported an error condition
    fn source_error(&self) -> io::Error {
        let error = match self.source.take_error() {
            Ok(Some(e)) | Err(e) => e,
            Ok(None) => io::Error::new(
                io::ErrorKind::ConnectionReset,
                "source socket reported an error condition",
            ),
        };
        debug!(
            direction = %self.direction,
            buffered = self.conduit.buffered(),
            "source failed while reads were paused: {}",
            error
        );
        error
    }

    /// Move bytes from the source into the conduit until it would block
    pub fn on_read_ready(&mut self) -> io::Result<()> {
        loop {
            match self.conduit.fill_from(self.source, self.block_size)? {
                Transfer::Moved(n) => {
                    trace!(direction = %self.direction, bytes = n, "buffered");
                    self.write_armed = true;
                }
                Transfer::WouldBlock => {
                    self.read_stalled = false;
                    return Ok(());
                }
                Transfer::Full => {
                    // Only a drain frees room; write interest is armed
                    self.read_stalled = true;
                    return Ok(());
                }
                Transfer::Closed => {
                    trace!(direction = %self.direction, "source reached end-of-stream");
                    self.source_closed = true;
                    return Ok(());
                }
                Transfer::Empty => return Ok(()),
            }
        }
    }

    /// Flush the conduit into the destination until it would block or drains
    pub fn on_write_ready(&mut self) -> io::Result<()> {
        let mut progressed = false;
        loop {
            match self.conduit.drain_into(self.destination, self.block_size)? {
                Transfer::Moved(n) => {
                    trace!(direction = %self.direction, bytes = n, "flushed");
                    self.transferred += n as u64;
                    progressed = true;
                }
                Transfer::Empty => {
                    self.write_armed = false;
                    break;
                }
                Transfer::WouldBlock | Transfer::Full | Transfer::Closed => break,
            }
        }

        if progressed && self.read_stalled && !self.source_closed {
            self.read_stalled = false;
            self.on_read_ready()?;
        }
        Ok(())
    }
}

impl fmt::Debug for RelayChannel<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayChannel")
            .field("direction", &self.direction)
            .field("mode", &self.conduit.mode())
            .field("buffered", &self.conduit.buffered())
            .field("write_armed", &self.write_armed)
            .field("source_closed", &self.source_closed)
            .field("transferred", &self.transferred)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransferMode;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (connected, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (connected.unwrap(), accepted.unwrap().0)
    }

    async fn forward_once(mode: TransferMode) {
        // writer -> source ... destination -> reader
        let (mut writer, source) = socket_pair().await;
        let (destination, mut reader) = socket_pair().await;

        let conduit = Conduit::new(mode, 64 * 1024).unwrap();
        let mut channel =
            RelayChannel::new(Direction::Forward, &source, &destination, conduit, 4096);
        assert!(!channel.is_write_armed());

        let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();
        let reader_task = tokio::spawn(async move {
            let mut received = Vec::new();
            reader.read_to_end(&mut received).await.unwrap();
            received
        });

        writer.write_all(&payload).await.unwrap();
        writer.shutdown().await.unwrap();

        let end = tokio::time::timeout(Duration::from_secs(5), channel.run())
            .await
            .expect("channel should finish after source EOF");
        assert!(matches!(end, ChannelEnd::SourceClosed));
        assert_eq!(channel.transferred(), expected.len() as u64);
        assert!(!channel.is_write_armed());

        drop(channel);
        drop(destination);
        let received = reader_task.await.unwrap();
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_channel_forwards_and_flushes_on_eof_buffered() {
        forward_once(TransferMode::Buffered).await;
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_channel_forwards_and_flushes_on_eof_splice() {
        forward_once(TransferMode::Splice).await;
    }

    #[tokio::test]
    async fn test_small_buffer_applies_backpressure() {
        let (mut writer, source) = socket_pair().await;
        let (destination, mut reader) = socket_pair().await;

        // Capacity of a single block: every block must be flushed before the
        // next one is read.
        let conduit = Conduit::new(TransferMode::Buffered, 4096).unwrap();
        let mut channel =
            RelayChannel::new(Direction::Reverse, &source, &destination, conduit, 4096);

        let payload = vec![7u8; 4096 * 6 + 123];
        let len = payload.len();
        let writer_task = tokio::spawn(async move {
            writer.write_all(&payload).await.unwrap();
            writer.shutdown().await.unwrap();
        });

        let end = tokio::time::timeout(Duration::from_secs(5), channel.run())
            .await
            .expect("channel should finish");
        assert!(matches!(end, ChannelEnd::SourceClosed));
        writer_task.await.unwrap();
        drop(channel);
        drop(destination);

        let mut received = Vec::new();
        reader.read_to_end(&mut received).await.unwrap();
        assert_eq!(received.len(), len);
        assert!(received.iter().all(|&b| b == 7));
    }

    #[test]
    fn test_direction_display() {
        assert_eq!(Direction::Forward.to_string(), "client->remote");
        assert_eq!(Direction::Reverse.to_string(), "remote->client");
    }
}
