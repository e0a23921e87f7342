//! Scalable multiplexer backed by Linux epoll.
//!
//! Interest is registered once with the kernel and persists across polls;
//! each poll returns only the ready subset. Registrations are
//! level-triggered (no `EPOLLET`), so a handle is reported again until it is
//! drained.

use crate::error::BackendError;
use crate::runtime::multiplexer::{timeout_millis, Event, Interest, Multiplexer, Readiness};
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;
use tracing::trace;

pub struct Epoll {
    fd: OwnedFd,
    /// Kernel-filled event batch; capacity bounds events per poll.
    buffer: Vec<libc::epoll_event>,
}

impl Epoll {
    /// Create an epoll instance returning at most `capacity` events per poll.
    pub fn new(capacity: usize) -> Result<Self, BackendError> {
        let raw = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if raw < 0 {
            return Err(BackendError::last_os_error("epoll_create1", -1));
        }
        // SAFETY: `raw` is a freshly created descriptor owned by nobody else.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        Ok(Self {
            fd,
            buffer: Vec::with_capacity(capacity.max(1)),
        })
    }

    fn ctl(&self, op: libc::c_int, handle: RawFd, interest: Interest) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: interest_bits(interest),
            u64: handle as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.fd.as_raw_fd(), op, handle, &mut ev) };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

fn interest_bits(interest: Interest) -> u32 {
    let mut bits = 0;
    if interest.is_readable() {
        bits |= libc::EPOLLIN as u32;
    }
    if interest.is_writable() {
        bits |= libc::EPOLLOUT as u32;
    }
    bits
}

impl Multiplexer for Epoll {
    fn register(&mut self, handle: RawFd, interest: Interest) -> Result<(), BackendError> {
        match self.ctl(libc::EPOLL_CTL_ADD, handle, interest) {
            Ok(()) => Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::EEXIST) => self
                .ctl(libc::EPOLL_CTL_MOD, handle, interest)
                .map_err(|e| BackendError::new("register", handle, e)),
            Err(e) => Err(BackendError::new("register", handle, e)),
        }
    }

    fn update(&mut self, handle: RawFd, interest: Interest) -> Result<(), BackendError> {
        self.ctl(libc::EPOLL_CTL_MOD, handle, interest)
            .map_err(|e| BackendError::new("update", handle, e))
    }

    fn deregister(&mut self, handle: RawFd) -> Result<(), BackendError> {
        // Kernels before 2.6.9 require a non-null event pointer for DEL.
        let mut ev = libc::epoll_event { events: 0, u64: 0 };
        let rc = unsafe {
            libc::epoll_ctl(self.fd.as_raw_fd(), libc::EPOLL_CTL_DEL, handle, &mut ev)
        };
        if rc < 0 {
            return Err(BackendError::last_os_error("deregister", handle));
        }
        Ok(())
    }

    fn poll(&mut self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<()> {
        events.clear();
        self.buffer.clear();

        let n = unsafe {
            libc::epoll_wait(
                self.fd.as_raw_fd(),
                self.buffer.as_mut_ptr(),
                self.buffer.capacity() as libc::c_int,
                timeout_millis(timeout),
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                trace!("epoll_wait interrupted");
                return Ok(());
            }
            return Err(err);
        }
        // SAFETY: epoll_wait initialized the first `n` entries, n <= capacity.
        unsafe { self.buffer.set_len(n as usize) };

        for ev in &self.buffer {
            let bits = ev.events;
            let handle = ev.u64 as RawFd;
            events.push(Event::new(
                handle,
                Readiness {
                    readable: bits & libc::EPOLLIN as u32 != 0,
                    writable: bits & libc::EPOLLOUT as u32 != 0,
                    error: bits & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0,
                },
            ));
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "epoll"
    }
}
