//! Per-client connection state and the table that owns it.
//!
//! A connection owns its `TcpStream`, so removing it from the table and
//! dropping it is the one and only place the socket gets closed.

use crate::runtime::multiplexer::Interest;
use bytes::{Buf, BytesMut};
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};

/// Result of a single bounded read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// `n` bytes were read and queued for echo.
    Data {
        n: usize,
        /// Write interest must be switched on (outbound was empty before).
        needs_write: bool,
    },
    /// Peer performed an orderly shutdown.
    Closed,
    /// Nothing available right now.
    WouldBlock,
}

/// Result of a flush attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Outbound buffer is empty; write interest can be dropped.
    Drained { n: usize },
    /// Socket took `n` bytes, more remain queued.
    Partial { n: usize },
    /// Socket send buffer is full.
    WouldBlock,
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    peer_addr: SocketAddr,
    /// Bytes received from the peer, already mirrored to `outbound`.
    inbound: BytesMut,
    /// Bytes waiting to be sent; consumed from the front.
    outbound: BytesMut,
    write_interest: bool,
    bytes_received: u64,
    bytes_sent: u64,
}

impl Connection {
    /// Wrap a freshly accepted, already non-blocking stream.
    pub fn new(stream: TcpStream, peer_addr: SocketAddr) -> Self {
        Self {
            stream,
            peer_addr,
            inbound: BytesMut::new(),
            outbound: BytesMut::new(),
            write_interest: false,
            bytes_received: 0,
            bytes_sent: 0,
        }
    }

    pub fn handle(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn inbound(&self) -> &[u8] {
        &self.inbound
    }

    pub fn outbound(&self) -> &[u8] {
        &self.outbound
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Interest the multiplexer should currently hold for this handle.
    pub fn interest(&self) -> Interest {
        if self.write_interest {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        }
    }

    /// Append bytes to the outbound queue.
    ///
    /// Returns `true` when this turned write interest on, i.e. the caller
    /// must update the multiplexer.
    pub fn queue(&mut self, data: &[u8]) -> bool {
        if data.is_empty() {
            return false;
        }
        let was_empty = self.outbound.is_empty();
        self.outbound.extend_from_slice(data);
        if was_empty && !self.write_interest {
            self.write_interest = true;
            return true;
        }
        false
    }

    /// Read at most one chunk (`scratch.len()` bytes) and echo it.
    pub fn read_chunk(&mut self, scratch: &mut [u8]) -> io::Result<ReadOutcome> {
        let n = match self.stream.read(scratch) {
            Ok(0) => return Ok(ReadOutcome::Closed),
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                return Ok(ReadOutcome::WouldBlock)
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                return Ok(ReadOutcome::WouldBlock)
            }
            Err(e) => return Err(e),
        };

        let data = &scratch[..n];
        self.bytes_received += n as u64;
        self.inbound.extend_from_slice(data);
        let needs_write = self.queue(data);

        Ok(ReadOutcome::Data { n, needs_write })
    }

    /// Send as much of the outbound queue as the socket accepts.
    pub fn flush(&mut self) -> io::Result<FlushOutcome> {
        if self.outbound.is_empty() {
            self.write_interest = false;
            return Ok(FlushOutcome::Drained { n: 0 });
        }

        let n = match self.stream.write(&self.outbound) {
            Ok(0) => {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
            }
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                return Ok(FlushOutcome::WouldBlock)
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                return Ok(FlushOutcome::WouldBlock)
            }
            Err(e) => return Err(e),
        };

        self.outbound.advance(n);
        self.bytes_sent += n as u64;

        if self.outbound.is_empty() {
            self.write_interest = false;
            Ok(FlushOutcome::Drained { n })
        } else {
            Ok(FlushOutcome::Partial { n })
        }
    }
}

/// Live connections keyed by socket handle.
///
/// Owned exclusively by the event loop thread.
#[derive(Debug, Default)]
pub struct ConnectionTable {
    connections: HashMap<RawFd, Connection>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a connection under its own handle.
    ///
    /// A live connection can never share a handle with another one, since
    /// the OS only reissues a number after the previous owner closed it.
    pub fn insert(&mut self, conn: Connection) -> RawFd {
        let fd = conn.handle();
        let previous = self.connections.insert(fd, conn);
        debug_assert!(previous.is_none(), "handle {fd} already in table");
        fd
    }

    pub fn get(&self, fd: RawFd) -> Option<&Connection> {
        self.connections.get(&fd)
    }

    pub fn get_mut(&mut self, fd: RawFd) -> Option<&mut Connection> {
        self.connections.get_mut(&fd)
    }

    /// Detach a connection; dropping the returned value closes its socket.
    pub fn remove(&mut self, fd: RawFd) -> Option<Connection> {
        self.connections.remove(&fd)
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.connections.contains_key(&fd)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (RawFd, &Connection)> {
        self.connections.iter().map(|(&fd, conn)| (fd, conn))
    }

    /// Remove every connection, e.g. for shutdown.
    pub fn drain(&mut self) -> impl Iterator<Item = Connection> + '_ {
        self.connections.drain().map(|(_, conn)| conn)
    }
}
