//! Legacy multiplexer backed by `select(2)`.
//!
//! Interest lives in user space and the descriptor sets are rebuilt and
//! rescanned on every poll, bounded by the largest live handle. Handles at
//! or above `FD_SETSIZE` cannot be watched.
//!
//! `select` has no hang-up flag: a closed or failed peer shows up as
//! readable and the following read reports it.

use crate::error::BackendError;
use crate::runtime::multiplexer::{Event, Interest, Multiplexer, Readiness};
use std::collections::BTreeMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;
use tracing::trace;

const FD_LIMIT: RawFd = libc::FD_SETSIZE as RawFd;

#[derive(Default)]
pub struct Select {
    /// Ordered so the last key is the highest live handle.
    interests: BTreeMap<RawFd, Interest>,
}

impl Select {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest registered handle, if any.
    pub fn max_handle(&self) -> Option<RawFd> {
        self.interests.keys().next_back().copied()
    }

    fn not_registered(op: &'static str, handle: RawFd) -> BackendError {
        BackendError::new(op, handle, io::Error::from_raw_os_error(libc::ENOENT))
    }
}

fn empty_set() -> libc::fd_set {
    // SAFETY: fd_set is plain data; FD_ZERO puts it in its canonical empty state.
    unsafe {
        let mut set: libc::fd_set = std::mem::zeroed();
        libc::FD_ZERO(&mut set);
        set
    }
}

impl Multiplexer for Select {
    fn register(&mut self, handle: RawFd, interest: Interest) -> Result<(), BackendError> {
        if !(0..FD_LIMIT).contains(&handle) {
            return Err(BackendError::new(
                "register",
                handle,
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("handle outside select range 0..{FD_LIMIT}"),
                ),
            ));
        }
        self.interests.insert(handle, interest);
        Ok(())
    }

    fn update(&mut self, handle: RawFd, interest: Interest) -> Result<(), BackendError> {
        match self.interests.get_mut(&handle) {
            Some(current) => {
                *current = interest;
                Ok(())
            }
            None => Err(Self::not_registered("update", handle)),
        }
    }

    fn deregister(&mut self, handle: RawFd) -> Result<(), BackendError> {
        self.interests
            .remove(&handle)
            .map(|_| ())
            .ok_or_else(|| Self::not_registered("deregister", handle))
    }

    fn poll(&mut self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<()> {
        events.clear();

        let mut read_set = empty_set();
        let mut write_set = empty_set();
        for (&fd, interest) in &self.interests {
            // SAFETY: register() keeps every fd within 0..FD_SETSIZE.
            unsafe {
                if interest.is_readable() {
                    libc::FD_SET(fd, &mut read_set);
                }
                if interest.is_writable() {
                    libc::FD_SET(fd, &mut write_set);
                }
            }
        }

        let nfds = self.max_handle().map_or(0, |fd| fd + 1);
        let mut tv = timeout.map(|t| libc::timeval {
            tv_sec: t.as_secs() as libc::time_t,
            tv_usec: t.subsec_micros() as libc::suseconds_t,
        });
        let tv_ptr = tv
            .as_mut()
            .map_or(std::ptr::null_mut(), |tv| tv as *mut libc::timeval);

        let n = unsafe {
            libc::select(
                nfds,
                &mut read_set,
                &mut write_set,
                std::ptr::null_mut(),
                tv_ptr,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                trace!("select interrupted");
                return Ok(());
            }
            return Err(err);
        }
        if n == 0 {
            return Ok(());
        }

        for &fd in self.interests.keys() {
            // SAFETY: fd < nfds <= FD_SETSIZE and both sets were filled by select.
            let (readable, writable) = unsafe {
                (
                    libc::FD_ISSET(fd, &read_set),
                    libc::FD_ISSET(fd, &write_set),
                )
            };
            if readable || writable {
                events.push(Event::new(
                    fd,
                    Readiness {
                        readable,
                        writable,
                        error: false,
                    },
                ));
            }
        }
        Ok(())
    }

    fn coalesces_accepts(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "select"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    const SHORT: Option<Duration> = Some(Duration::from_millis(50));

    #[test]
    fn test_readable_is_level_triggered() {
        let mut sel = Select::new();
        let (mut a, mut b) = UnixStream::pair().unwrap();
        sel.register(b.as_raw_fd(), Interest::READABLE).unwrap();

        let mut events = Vec::new();
        sel.poll(&mut events, SHORT).unwrap();
        assert!(events.is_empty());

        a.write_all(b"hello").unwrap();
        for _ in 0..2 {
            sel.poll(&mut events, SHORT).unwrap();
            assert_eq!(events.len(), 1);
            assert!(events[0].is_readable());
            assert!(!events[0].is_error());
        }

        let mut buf = [0u8; 8];
        assert_eq!(b.read(&mut buf).unwrap(), 5);
        sel.poll(&mut events, SHORT).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_events_in_ascending_handle_order() {
        let mut sel = Select::new();
        let (_a1, b1) = UnixStream::pair().unwrap();
        let (_a2, b2) = UnixStream::pair().unwrap();
        sel.register(b2.as_raw_fd(), Interest::WRITABLE).unwrap();
        sel.register(b1.as_raw_fd(), Interest::WRITABLE).unwrap();

        let mut events = Vec::new();
        sel.poll(&mut events, SHORT).unwrap();
        let handles: Vec<_> = events.iter().map(|e| e.handle()).collect();
        let mut sorted = handles.clone();
        sorted.sort();
        assert_eq!(handles.len(), 2);
        assert_eq!(handles, sorted);
    }

    #[test]
    fn test_max_handle_tracks_removals() {
        let mut sel = Select::new();
        let (_a1, b1) = UnixStream::pair().unwrap();
        let (_a2, b2) = UnixStream::pair().unwrap();
        let (lo, hi) = if b1.as_raw_fd() < b2.as_raw_fd() {
            (b1.as_raw_fd(), b2.as_raw_fd())
        } else {
            (b2.as_raw_fd(), b1.as_raw_fd())
        };
        assert_eq!(sel.max_handle(), None);
        sel.register(lo, Interest::READABLE).unwrap();
        sel.register(hi, Interest::READABLE).unwrap();
        assert_eq!(sel.max_handle(), Some(hi));
        sel.deregister(hi).unwrap();
        assert_eq!(sel.max_handle(), Some(lo));
    }

    #[test]
    fn test_rejects_out_of_range_handles() {
        let mut sel = Select::new();
        assert!(sel.register(FD_LIMIT, Interest::READABLE).is_err());
        assert!(sel.register(-1, Interest::READABLE).is_err());
    }

    #[test]
    fn test_update_requires_registration() {
        let mut sel = Select::new();
        let err = sel.update(3, Interest::WRITABLE).unwrap_err();
        assert_eq!(err.op, "update");
        assert!(sel.deregister(3).is_err());
    }

    #[test]
    fn test_closed_peer_reports_readable() {
        let mut sel = Select::new();
        let (a, b) = UnixStream::pair().unwrap();
        sel.register(b.as_raw_fd(), Interest::READABLE).unwrap();
        drop(a);

        let mut events = Vec::new();
        sel.poll(&mut events, SHORT).unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].is_readable());
    }
}
