//! Backend-agnostic readiness multiplexer interface.
//!
//! The event loop only talks to a `Box<dyn Multiplexer>`; epoll and select
//! are interchangeable implementations. Both report readiness
//! level-triggered: a handle with unread data (or free send space, when
//! write interest is set) is reported on every poll until that changes.

use crate::error::BackendError;
use std::io;
use std::ops::BitOr;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// Set of event types a handle is watched for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    readable: bool,
    writable: bool,
}

impl Interest {
    pub const READABLE: Interest = Interest {
        readable: true,
        writable: false,
    };

    pub const WRITABLE: Interest = Interest {
        readable: false,
        writable: true,
    };

    pub fn is_readable(self) -> bool {
        self.readable
    }

    pub fn is_writable(self) -> bool {
        self.writable
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, other: Interest) -> Interest {
        Interest {
            readable: self.readable || other.readable,
            writable: self.writable || other.writable,
        }
    }
}

/// Readiness reported for one handle by a single poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    /// Error condition or hang-up.
    pub error: bool,
}

/// One entry of a poll batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    handle: RawFd,
    readiness: Readiness,
}

impl Event {
    pub fn new(handle: RawFd, readiness: Readiness) -> Self {
        Self { handle, readiness }
    }

    pub fn handle(&self) -> RawFd {
        self.handle
    }

    pub fn is_readable(&self) -> bool {
        self.readiness.readable
    }

    pub fn is_writable(&self) -> bool {
        self.readiness.writable
    }

    pub fn is_error(&self) -> bool {
        self.readiness.error
    }
}

/// OS readiness-notification mechanism.
pub trait Multiplexer: Send {
    /// Start watching `handle` (or replace its interest if already watched).
    fn register(&mut self, handle: RawFd, interest: Interest) -> Result<(), BackendError>;

    /// Change the interest of an already-registered handle.
    fn update(&mut self, handle: RawFd, interest: Interest) -> Result<(), BackendError>;

    /// Stop watching `handle`. The handle may already be closed, so callers
    /// log failures and carry on.
    fn deregister(&mut self, handle: RawFd) -> Result<(), BackendError>;

    /// Wait up to `timeout` (forever if `None`) and replace the contents of
    /// `events` with the ready handles. An interrupted wait yields an empty
    /// batch rather than an error.
    fn poll(&mut self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<()>;

    /// Whether a single listener readiness may stand for several pending
    /// connections, so the accept path must drain until would-block.
    fn coalesces_accepts(&self) -> bool {
        false
    }

    /// Short backend name for logs.
    fn name(&self) -> &'static str;
}

/// Convert an optional timeout into whole milliseconds for C poll APIs.
///
/// Sub-millisecond remainders round up so a tiny timeout never becomes a
/// non-blocking spin.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
pub(crate) fn timeout_millis(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(t) => {
            let mut ms = t.as_millis();
            if Duration::from_millis(ms as u64) < t {
                ms += 1;
            }
            ms.min(libc::c_int::MAX as u128) as libc::c_int
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interest_union() {
        let both = Interest::READABLE | Interest::WRITABLE;
        assert!(both.is_readable());
        assert!(both.is_writable());
        assert!(!Interest::READABLE.is_writable());
        assert_eq!(Interest::READABLE | Interest::READABLE, Interest::READABLE);
    }

    #[test]
    fn test_event_accessors() {
        let ev = Event::new(
            9,
            Readiness {
                readable: true,
                writable: false,
                error: true,
            },
        );
        assert_eq!(ev.handle(), 9);
        assert!(ev.is_readable());
        assert!(!ev.is_writable());
        assert!(ev.is_error());
    }

    #[test]
    fn test_timeout_millis() {
        assert_eq!(timeout_millis(None), -1);
        assert_eq!(timeout_millis(Some(Duration::ZERO)), 0);
        assert_eq!(timeout_millis(Some(Duration::from_millis(250))), 250);
        assert_eq!(timeout_millis(Some(Duration::from_micros(1500))), 2);
    }
}
