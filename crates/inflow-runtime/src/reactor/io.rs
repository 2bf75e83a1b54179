//! Non-blocking byte I/O seams used by connection handlers
//!
//! The reactor hands handlers a `ByteSource` when a socket is readable and a
//! `ByteSink` when it is writable. Both report `WouldBlock` once the socket is
//! drained, exactly like the underlying non-blocking socket calls.

use std::io;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

/// Readable half of a connection
pub trait ByteSource: Send {
    /// Read without blocking; `Ok(0)` means end of stream
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Writable half of a connection
pub trait ByteSink: Send {
    /// Write without blocking, returning how many bytes were accepted
    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize>;
}

impl ByteSource for OwnedReadHalf {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        OwnedReadHalf::try_read(self, buf)
    }
}

impl ByteSink for OwnedWriteHalf {
    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        OwnedWriteHalf::try_write(self, buf)
    }
}
