//! Listening socket setup and non-blocking accept.

use crate::error::ServerError;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};
use tracing::debug;

/// The server's bound, non-blocking listening socket.
#[derive(Debug)]
pub struct Listener {
    inner: TcpListener,
}

impl Listener {
    /// Resolve `host:port`, then bind and listen with `SO_REUSEADDR`.
    ///
    /// The first resolved address is used.
    pub fn bind_and_listen(host: &str, port: u16, backlog: i32) -> Result<Self, ServerError> {
        let target = format!("{host}:{port}");
        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|e| ServerError::bind(&target, e))?
            .next()
            .ok_or_else(|| {
                ServerError::bind(
                    &target,
                    io::Error::new(io::ErrorKind::AddrNotAvailable, "host did not resolve"),
                )
            })?;

        let inner = create_listener(addr, backlog).map_err(|e| ServerError::bind(addr, e))?;
        Ok(Self { inner })
    }

    /// Accept one pending connection without blocking.
    ///
    /// Returns `Ok(None)` when nothing is pending. The returned stream is
    /// already in non-blocking mode.
    pub fn accept_one(&self) -> io::Result<Option<(TcpStream, SocketAddr)>> {
        match self.inner.accept() {
            Ok((stream, peer)) => {
                stream.set_nonblocking(true)?;
                Ok(Some((stream, peer)))
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            // Peer gave up before we got to it, or a signal landed mid-call.
            Err(ref e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::ConnectionAborted | io::ErrorKind::Interrupted
                ) =>
            {
                debug!(error = %e, "Transient accept failure");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub fn handle(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    socket.set_nonblocking(true)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_one_would_block() {
        let listener = Listener::bind_and_listen("127.0.0.1", 0, 16).unwrap();
        assert!(listener.accept_one().unwrap().is_none());
    }

    #[test]
    fn test_accept_one_returns_nonblocking_stream() {
        let listener = Listener::bind_and_listen("127.0.0.1", 0, 16).unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();

        let mut accepted = None;
        for _ in 0..200 {
            if let Some(pair) = listener.accept_one().unwrap() {
                accepted = Some(pair);
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        let (stream, peer) = accepted.expect("connection never became acceptable");
        assert_eq!(peer, client.local_addr().unwrap());

        let mut buf = [0u8; 1];
        let err = std::io::Read::read(&mut &stream, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_bind_conflict_is_bind_error() {
        let first = Listener::bind_and_listen("127.0.0.1", 0, 16).unwrap();
        let port = first.local_addr().unwrap().port();
        // SO_REUSEADDR does not allow two active listeners on one port.
        let err = Listener::bind_and_listen("127.0.0.1", port, 16).unwrap_err();
        assert!(matches!(err, ServerError::Bind { .. }));
    }

    #[test]
    fn test_unresolvable_host_is_bind_error() {
        let err = Listener::bind_and_listen("no such host.invalid", 0, 16).unwrap_err();
        assert!(matches!(err, ServerError::Bind { .. }));
    }
}
