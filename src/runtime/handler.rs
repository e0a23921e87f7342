//! Accept, read, write and close handlers driven by the event loop.
//!
//! Handlers only touch connection buffers, the multiplexer interest set and
//! the connection table. A connection-level failure closes that connection
//! and never propagates further.

use crate::error::BackendError;
use crate::runtime::connection::{Connection, ConnectionTable, FlushOutcome, ReadOutcome};
use crate::runtime::listener::Listener;
use crate::runtime::multiplexer::{Event, Interest, Multiplexer};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use tracing::{debug, error, trace, warn};

/// Per-server settings consulted when accepting.
#[derive(Debug, Clone)]
pub struct AcceptSettings {
    /// Queued on every new connection ahead of any echoed bytes.
    pub greeting: Vec<u8>,
    pub max_connections: usize,
}

/// Rate limit for a failure that level-triggered polling reports on every
/// wakeup (e.g. `EMFILE` on accept). Only the 1st, 2nd, 4th, 8th... repeat
/// in a row is logged.
#[derive(Debug, Default)]
pub struct LogThrottle {
    repeats: u64,
}

impl LogThrottle {
    /// Count one failure; returns the running count when it should be logged.
    pub fn hit(&mut self) -> Option<u64> {
        self.repeats = self.repeats.saturating_add(1);
        self.repeats.is_power_of_two().then_some(self.repeats)
    }

    pub fn reset(&mut self) {
        self.repeats = 0;
    }
}

/// Accept pending connections after the listener reported readable.
///
/// Backends that coalesce pending connections into one notification are
/// drained until would-block; otherwise one connection is accepted per
/// event and level-triggered polling reports the rest.
///
/// Returns the number of connections added to the table.
pub fn accept_connections(
    listener: &Listener,
    mux: &mut dyn Multiplexer,
    table: &mut ConnectionTable,
    settings: &AcceptSettings,
    errors: &mut LogThrottle,
) -> usize {
    let drain = mux.coalesces_accepts();
    let mut accepted = 0;

    loop {
        let (stream, peer) = match listener.accept_one() {
            Ok(Some(pair)) => pair,
            Ok(None) => break,
            Err(e) => {
                if let Some(repeats) = errors.hit() {
                    error!(error = %e, repeats, "Accept error");
                }
                break;
            }
        };
        errors.reset();

        if table.len() >= settings.max_connections {
            // Dropping the stream rejects the client.
            warn!(peer = %peer, limit = settings.max_connections, "Connection limit reached");
        } else {
            let fd = stream.as_raw_fd();
            match mux.register(fd, Interest::READABLE) {
                Ok(()) => {
                    let mut conn = Connection::new(stream, peer);
                    let needs_write = conn.queue(&settings.greeting);
                    let interest = conn.interest();
                    table.insert(conn);
                    accepted += 1;
                    debug!(fd, peer = %peer, "Accepted connection");

                    if needs_write {
                        if let Err(e) = mux.update(fd, interest) {
                            warn!(fd, error = %e, "Failed to watch for writes");
                            close_connection(mux, table, fd);
                        }
                    }
                }
                // Dropping the stream closes it.
                Err(e) => warn!(fd, peer = %peer, error = %e, "Failed to register connection"),
            }
        }

        if !drain {
            break;
        }
    }

    accepted
}

/// Dispatch one readiness event for a client handle.
pub fn handle_connection_event(
    event: &Event,
    mux: &mut dyn Multiplexer,
    table: &mut ConnectionTable,
    scratch: &mut [u8],
) {
    let fd = event.handle();
    if !table.contains(fd) {
        return;
    }

    if event.is_error() {
        debug!(fd, "Error or hang-up reported");
        close_connection(mux, table, fd);
        return;
    }

    if let Err(e) = dispatch(event, mux, table, scratch) {
        match e.kind() {
            io::ErrorKind::UnexpectedEof => debug!(fd, "Peer closed connection"),
            _ => debug!(fd, error = %e, "Connection error"),
        }
        close_connection(mux, table, fd);
    }
}

fn dispatch(
    event: &Event,
    mux: &mut dyn Multiplexer,
    table: &mut ConnectionTable,
    scratch: &mut [u8],
) -> io::Result<()> {
    let fd = event.handle();

    if event.is_readable() {
        handle_readable(fd, mux, table, scratch)?;
    }

    if event.is_writable() && table.contains(fd) {
        handle_writable(fd, mux, table)?;
    }

    Ok(())
}

/// Read one chunk and queue it for echo.
///
/// An `Err` means the connection must be closed; orderly peer shutdown is
/// reported as `UnexpectedEof`.
pub fn handle_readable(
    fd: RawFd,
    mux: &mut dyn Multiplexer,
    table: &mut ConnectionTable,
    scratch: &mut [u8],
) -> io::Result<()> {
    let conn = table.get_mut(fd).ok_or_else(not_found)?;

    match conn.read_chunk(scratch)? {
        ReadOutcome::Data { n, needs_write } => {
            trace!(fd, bytes = n, "Read");
            if needs_write {
                mux.update(fd, conn.interest()).map_err(backend_io)?;
            }
        }
        ReadOutcome::Closed => {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "EOF"));
        }
        ReadOutcome::WouldBlock => {}
    }

    Ok(())
}

/// Flush the outbound queue; drop write interest once it is empty.
pub fn handle_writable(
    fd: RawFd,
    mux: &mut dyn Multiplexer,
    table: &mut ConnectionTable,
) -> io::Result<()> {
    let conn = table.get_mut(fd).ok_or_else(not_found)?;

    match conn.flush()? {
        FlushOutcome::Drained { n } => {
            trace!(fd, bytes = n, "Write drained");
            mux.update(fd, Interest::READABLE).map_err(backend_io)?;
        }
        FlushOutcome::Partial { n } => {
            trace!(fd, bytes = n, remaining = conn.outbound().len(), "Partial write");
        }
        FlushOutcome::WouldBlock => {}
    }

    Ok(())
}

/// Deregister, remove and close a connection. No-op if already gone.
pub fn close_connection(mux: &mut dyn Multiplexer, table: &mut ConnectionTable, fd: RawFd) {
    if let Some(conn) = table.remove(fd) {
        if let Err(e) = mux.deregister(fd) {
            debug!(fd, error = %e, "Deregister failed");
        }
        debug!(
            fd,
            peer = %conn.peer_addr(),
            received = conn.bytes_received(),
            sent = conn.bytes_sent(),
            pending = conn.outbound().len(),
            "Connection closed"
        );
        // Socket closes here.
        drop(conn);
    }
}

/// Close every live connection. Returns how many were closed.
pub fn close_all(mux: &mut dyn Multiplexer, table: &mut ConnectionTable) -> usize {
    let handles: Vec<RawFd> = table.iter().map(|(fd, _)| fd).collect();
    for &fd in &handles {
        close_connection(mux, table, fd);
    }
    handles.len()
}

fn not_found() -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, "connection not found")
}

fn backend_io(e: BackendError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e)
}
