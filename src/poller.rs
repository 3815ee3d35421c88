//! Thin epoll wrapper.
//!
//! Connections are always registered oneshot: after an event fires the
//! descriptor is disarmed until `rearm()` is called for it.
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use anyhow::{Context, Result};

/// What a connection is waiting for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
}

impl Interest {
    fn bits(self) -> u32 {
        let rw = match self {
            Interest::Read => libc::EPOLLIN,
            Interest::Write => libc::EPOLLOUT,
        };
        (rw | libc::EPOLLRDHUP | libc::EPOLLONESHOT) as u32
    }
}

/// One readiness event, decoded.
#[derive(Clone, Copy, Debug)]
pub struct Event {
    pub token: u64,
    bits: u32,
}

impl Event {
    #[must_use]
    pub fn readable(&self) -> bool {
        self.bits & libc::EPOLLIN as u32 != 0
    }
    #[must_use]
    pub fn writable(&self) -> bool {
        self.bits & libc::EPOLLOUT as u32 != 0
    }

    /// Peer hung up, or the socket is in error.
    #[must_use]
    pub fn hangup(&self) -> bool {
        self.bits & (libc::EPOLLRDHUP | libc::EPOLLHUP | libc::EPOLLERR) as u32 != 0
    }
}

pub struct Poller {
    fd: OwnedFd,
    events: Vec<libc::epoll_event>,
}

impl Poller {
    /// Create an epoll instance handing back up to `max_events` per wait.
    pub fn new(max_events: usize) -> Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(std::io::Error::last_os_error()).context("epoll_create1()");
        }
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
            events: vec![libc::epoll_event { events: 0, u64: 0 }; max_events.max(1)],
        })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, token: u64, bits: u32) -> std::io::Result<()> {
        let mut ev = libc::epoll_event { events: bits, u64: token };
        let ret = unsafe { libc::epoll_ctl(self.fd.as_raw_fd(), op, fd, &raw mut ev) };
        if ret < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    /// Register a long lived, level triggered reader (listener, signal
    /// channel).
    pub fn add_persistent(&self, fd: RawFd, token: u64) -> std::io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, libc::EPOLLIN as u32)
    }

    /// Register a connection, armed for one event.
    pub fn add(&self, fd: RawFd, token: u64, interest: Interest) -> std::io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, interest.bits())
    }

    /// Arm a connection for one more event.
    pub fn rearm(&self, fd: RawFd, token: u64, interest: Interest) -> std::io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, token, interest.bits())
    }

    pub fn delete(&self, fd: RawFd) -> std::io::Result<()> {
        let ret = unsafe {
            libc::epoll_ctl(
                self.fd.as_raw_fd(),
                libc::EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            )
        };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOENT) {
                return Err(err);
            }
        }
        Ok(())
    }

    /// Block until at least one event is ready. An interrupting signal
    /// returns an empty batch.
    pub fn wait(&mut self) -> std::io::Result<Vec<Event>> {
        let n = unsafe {
            libc::epoll_wait(
                self.fd.as_raw_fd(),
                self.events.as_mut_ptr(),
                libc::c_int::try_from(self.events.len()).unwrap_or(libc::c_int::MAX),
                -1,
            )
        };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(err);
        }
        let n = usize::try_from(n).unwrap_or(0);
        Ok(self.events[..n]
            .iter()
            .map(|e| Event {
                token: e.u64,
                bits: e.events,
            })
            .collect())
    }
}
