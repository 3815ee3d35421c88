//! Self-pipe for asynchronous notifications to the reactor.
//!
//! Signal handlers, worker threads and `Handle`s all write one byte per
//! notification into a socket pair. The reactor polls the read end like any
//! other descriptor.
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, trace, warn};
use nix::sys::signal::{SigHandler, Signal};
use signal_hook::SigId;

/// A notification for the reactor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Notice {
    /// Time for an expiry sweep.
    Tick,

    /// Stop serving.
    Terminate,

    /// A worker finished with a connection.
    Completed,
}

impl Notice {
    #[must_use]
    fn code(self) -> u8 {
        match self {
            Notice::Tick => b't',
            Notice::Terminate => b'q',
            Notice::Completed => b'c',
        }
    }

    #[must_use]
    fn from_code(code: u8) -> Option<Self> {
        match code {
            b't' => Some(Notice::Tick),
            b'q' => Some(Notice::Terminate),
            b'c' => Some(Notice::Completed),
            _ => None,
        }
    }
}

/// Write end of the channel. Cheap to clone.
#[derive(Clone, Debug)]
pub struct Notifier {
    tx: Arc<UnixStream>,
}

impl Notifier {
    /// Send a notice. A full channel already means the reactor will wake up,
    /// so that's not an error.
    pub fn notify(&self, notice: Notice) {
        match (&*self.tx).write(&[notice.code()]) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                trace!("Notification channel full, dropping {notice:?}");
            }
            Err(e) => warn!("Failed to send {notice:?}: {e}"),
        }
    }
}

pub struct SignalChannel {
    rx: UnixStream,
    tx: Arc<UnixStream>,
    registered: Vec<SigId>,
}

impl SignalChannel {
    pub fn new() -> Result<Self> {
        let (rx, tx) = UnixStream::pair().context("socketpair() for signal channel")?;
        rx.set_nonblocking(true)?;
        tx.set_nonblocking(true)?;
        Ok(Self {
            rx,
            tx: Arc::new(tx),
            registered: Vec::new(),
        })
    }

    #[must_use]
    pub fn notifier(&self) -> Notifier {
        Notifier {
            tx: self.tx.clone(),
        }
    }

    /// Route SIGALRM and SIGTERM into the channel, and ignore SIGPIPE.
    pub fn install(&mut self) -> Result<()> {
        let fd = self.tx.as_raw_fd();
        for (sig, notice) in [
            (libc::SIGALRM, Notice::Tick),
            (libc::SIGTERM, Notice::Terminate),
        ] {
            let code = notice.code();
            // The handler only does a nonblocking send(), which is
            // async-signal-safe. `tx` stays open until the handler is
            // unregistered in drop().
            let id = unsafe {
                signal_hook::low_level::register(sig, move || {
                    libc::send(
                        fd,
                        (&raw const code).cast::<libc::c_void>(),
                        1,
                        libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL,
                    );
                })
            }
            .with_context(|| format!("registering handler for signal {sig}"))?;
            self.registered.push(id);
        }
        unsafe { nix::sys::signal::signal(Signal::SIGPIPE, SigHandler::SigIgn) }
            .context("ignoring SIGPIPE")?;
        debug!("Signal handlers installed");
        Ok(())
    }

    /// Drain everything pending.
    pub fn drain(&self) -> Vec<Notice> {
        let mut out = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            match (&self.rx).read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    for &code in &buf[..n] {
                        match Notice::from_code(code) {
                            Some(notice) => out.push(notice),
                            None => warn!("Unknown notification code {code}"),
                        }
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("Reading signal channel: {e}");
                    break;
                }
            }
        }
        out
    }
}

impl AsRawFd for SignalChannel {
    fn as_raw_fd(&self) -> RawFd {
        self.rx.as_raw_fd()
    }
}

impl Drop for SignalChannel {
    fn drop(&mut self) {
        for id in self.registered.drain(..) {
            if !signal_hook::low_level::unregister(id) {
                debug!("Signal handler {id:?} was already gone");
            }
        }
    }
}

/// Schedule the next SIGALRM. Whole seconds only, at least one.
pub fn schedule_alarm(interval: Duration) {
    let secs = libc::c_uint::try_from(interval.as_secs().max(1)).unwrap_or(libc::c_uint::MAX);
    if let Some(left) = nix::unistd::alarm::set(secs) {
        trace!("Replaced pending alarm with {left}s left");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notices_round_trip_through_channel() -> Result<()> {
        let ch = SignalChannel::new()?;
        assert!(ch.drain().is_empty());
        let n = ch.notifier();
        let n2 = n.clone();
        n.notify(Notice::Completed);
        n2.notify(Notice::Tick);
        n.notify(Notice::Terminate);
        assert_eq!(
            ch.drain(),
            [Notice::Completed, Notice::Tick, Notice::Terminate]
        );
        assert!(ch.drain().is_empty());
        Ok(())
    }

    #[test]
    fn full_channel_is_not_fatal() -> Result<()> {
        let ch = SignalChannel::new()?;
        let n = ch.notifier();
        // Way more than a socket buffer.
        for _ in 0..100_000 {
            n.notify(Notice::Completed);
        }
        assert!(!ch.drain().is_empty());
        Ok(())
    }
}
