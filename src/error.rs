//! Error types for the echo server.
//!
//! Only setup and poll-level failures reach the caller of `Server::start`.
//! Connection-level failures are handled (and logged) where they occur.

use std::io;
use std::os::unix::io::RawFd;

/// A multiplexer registration call failed for a single handle.
#[derive(Debug)]
pub struct BackendError {
    /// Which call failed (`register`, `update`, `deregister`, `create`).
    pub op: &'static str,
    /// Handle the call was made for.
    pub handle: RawFd,
    pub source: io::Error,
}

impl BackendError {
    pub fn new(op: &'static str, handle: RawFd, source: io::Error) -> Self {
        Self { op, handle, source }
    }

    /// Capture `errno` for a failed libc call.
    pub fn last_os_error(op: &'static str, handle: RawFd) -> Self {
        Self::new(op, handle, io::Error::last_os_error())
    }
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} failed for fd {}: {}", self.op, self.handle, self.source)
    }
}

impl std::error::Error for BackendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Errors surfaced by the server's control surface.
#[derive(Debug)]
pub enum ServerError {
    /// Listening socket could not be set up; the loop never starts.
    Bind {
        addr: String,
        source: io::Error,
    },
    /// Multiplexer could not be created, or the listener could not be registered.
    Backend(BackendError),
    /// Unrecoverable poll failure; the loop stopped and released everything.
    Poll(io::Error),
    /// The requested backend is not available on this platform.
    Unsupported(String),
}

impl ServerError {
    pub(crate) fn bind(addr: impl std::fmt::Display, source: io::Error) -> Self {
        ServerError::Bind {
            addr: addr.to_string(),
            source,
        }
    }
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Bind { addr, source } => {
                write!(f, "Failed to listen on '{}': {}", addr, source)
            }
            ServerError::Backend(e) => write!(f, "Multiplexer error: {}", e),
            ServerError::Poll(e) => write!(f, "Poll failed: {}", e),
            ServerError::Unsupported(msg) => write!(f, "Unsupported: {}", msg),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Bind { source, .. } => Some(source),
            ServerError::Backend(e) => Some(e),
            ServerError::Poll(e) => Some(e),
            ServerError::Unsupported(_) => None,
        }
    }
}

impl From<BackendError> for ServerError {
    fn from(e: BackendError) -> Self {
        ServerError::Backend(e)
    }
}
