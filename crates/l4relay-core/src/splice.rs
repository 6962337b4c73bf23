//! Zero-copy intermediate buffer built on a kernel pipe and `splice(2)`
//!
//! Bytes move socket -> pipe -> socket without passing through user space.
//! Both pipe ends are non-blocking; readiness is taken from the sockets only,
//! so the number of bytes sitting in the pipe is tracked here.

use crate::buffer::Transfer;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use tokio::io::Interest;
use tokio::net::TcpStream;
use tracing::debug;

#[derive(Debug)]
pub struct SplicePipe {
    read_end: OwnedFd,
    write_end: OwnedFd,
    buffered: usize,
    capacity: usize,
}

impl SplicePipe {
    /// Create a non-blocking pipe and ask the kernel for `capacity` bytes
    ///
    /// The kernel rounds the size up to a power-of-two number of pages and may
    /// refuse sizes above `/proc/sys/fs/pipe-max-size`; the pipe then keeps
    /// its default size. [`SplicePipe::capacity`] reports what was granted.
    pub fn new(capacity: usize) -> io::Result<Self> {
        let mut fds = [0 as libc::c_int; 2];
        let result = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }

        // SAFETY: pipe2 succeeded, both descriptors are fresh and owned by us
        let (read_end, write_end) =
            unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

        let requested = libc::c_int::try_from(capacity).unwrap_or(libc::c_int::MAX);
        let granted = unsafe { libc::fcntl(write_end.as_raw_fd(), libc::F_SETPIPE_SZ, requested) };
        let capacity = if granted > 0 {
            granted as usize
        } else {
            debug!(
                "F_SETPIPE_SZ({}) refused: {}",
                capacity,
                io::Error::last_os_error()
            );
            let current = unsafe { libc::fcntl(write_end.as_raw_fd(), libc::F_GETPIPE_SZ) };
            if current < 0 {
                return Err(io::Error::last_os_error());
            }
            current as usize
        };

        Ok(Self {
            read_end,
            write_end,
            buffered: 0,
            capacity,
        })
    }

    pub fn buffered(&self) -> usize {
        self.buffered
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Splice up to `max` bytes from `source` into the pipe
    ///
    /// `EAGAIN` means either an empty socket or a full pipe. With the pipe
    /// empty only the first is possible, so the call goes through
    /// [`TcpStream::try_io`] and clears the socket's read readiness. With
    /// bytes already buffered the socket's readiness is left alone and the
    /// attempt reports [`Transfer::Full`]; the caller retries after draining.
    pub fn fill_from(&mut self, source: &TcpStream, max: usize) -> io::Result<Transfer> {
        let source_fd = source.as_raw_fd();
        let pipe_fd = self.write_end.as_raw_fd();

        let result = if self.buffered == 0 {
            source.try_io(Interest::READABLE, || splice(source_fd, pipe_fd, max))
        } else {
            splice(source_fd, pipe_fd, max)
        };

        match result {
            Ok(0) => Ok(Transfer::Closed),
            Ok(n) => {
                self.buffered += n;
                Ok(Transfer::Moved(n))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock && self.buffered > 0 => {
                Ok(Transfer::Full)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Transfer::WouldBlock),
            Err(e) => Err(e),
        }
    }

    /// Splice up to `max` buffered bytes from the pipe into `destination`
    pub fn drain_into(&mut self, destination: &TcpStream, max: usize) -> io::Result<Transfer> {
        if self.buffered == 0 {
            return Ok(Transfer::Empty);
        }

        let pipe_fd = self.read_end.as_raw_fd();
        let destination_fd = destination.as_raw_fd();
        let len = max.min(self.buffered);

        match destination.try_io(Interest::WRITABLE, || splice(pipe_fd, destination_fd, len)) {
            Ok(0) => Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "splice moved no bytes out of a non-empty pipe",
            )),
            Ok(n) => {
                self.buffered -= n;
                Ok(Transfer::Moved(n))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Transfer::WouldBlock),
            Err(e) => Err(e),
        }
    }
}

fn splice(fd_in: RawFd, fd_out: RawFd, len: usize) -> io::Result<usize> {
    let result = unsafe {
        libc::splice(
            fd_in,
            ptr::null_mut(),
            fd_out,
            ptr::null_mut(),
            len,
            libc::SPLICE_F_MOVE | libc::SPLICE_F_NONBLOCK,
        )
    };
    if result < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(result as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipe_capacity_is_fixed_and_finite() {
        let pipe = SplicePipe::new(64 * 1024).unwrap();
        assert!(pipe.capacity() >= 4096);
        assert!(pipe.capacity() <= 1024 * 1024);
        assert_eq!(pipe.buffered(), 0);
    }

    #[test]
    fn test_small_request_rounds_up_to_a_page() {
        let pipe = SplicePipe::new(1).unwrap();
        assert!(pipe.capacity() >= 4096);
    }
}
