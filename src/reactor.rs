//! The dispatch loop.
//!
//! One thread owns the listener, the connection table, the readiness
//! registrations and the expiry list. It does every accept, read, write and
//! close. Workers only ever see a connection that has been moved to them,
//! and hand it back through the completion channel.
use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::time::Instant;

use anyhow::{Context, Result};
use log::{debug, info, trace, warn};

use crate::config::{Config, MAX_EVENT_NUMBER, MAX_FD};
use crate::conn::{Connection, Phase, Processed, WriteProgress};
use crate::docroot::DocRoot;
use crate::expiry::ExpiryList;
use crate::poller::{Event, Interest, Poller};
use crate::pool::ThreadPool;
use crate::signals::{self, Notice, Notifier, SignalChannel};
use crate::sock::set_nodelay;

// Readiness token for the listening socket.
const TOKEN_LISTENER: u64 = u64::MAX;

// Readiness token for the notification channel. Connection tokens are their
// descriptors, so they never get this high.
const TOKEN_SIGNALS: u64 = TOKEN_LISTENER - 1;

type Completion = (Box<Connection>, Processed);

enum Slot {
    /// No socket. Holds on to the buffers of the last connection that had
    /// this descriptor, if any.
    Free(Option<Box<Connection>>),

    /// Owned by the reactor.
    Here(Box<Connection>),

    /// Moved to a worker. If the idle sweep wanted to close it in the
    /// meantime, it's closed as soon as it comes back.
    Lent { expired: bool },
}

// Connection table, indexed by descriptor.
struct Connections {
    slots: Vec<Slot>,
    live: usize,
}

impl Connections {
    #[must_use]
    fn new(n: usize) -> Self {
        Self {
            slots: (0..n).map(|_| Slot::Free(None)).collect(),
            live: 0,
        }
    }

    #[must_use]
    fn index(&self, fd: RawFd) -> Option<usize> {
        usize::try_from(fd).ok().filter(|&i| i < self.slots.len())
    }

    #[must_use]
    fn get(&mut self, fd: RawFd) -> Option<&mut Connection> {
        let idx = self.index(fd)?;
        match &mut self.slots[idx] {
            Slot::Here(con) => Some(&mut **con),
            _ => None,
        }
    }

    /// Take an unused slot for a new socket.
    fn claim(&mut self, idx: usize) -> Box<Connection> {
        match std::mem::replace(&mut self.slots[idx], Slot::Free(None)) {
            Slot::Free(con) => con.unwrap_or_else(Connection::new),
            _ => panic!("accepted descriptor {idx} is still in use"),
        }
    }

    /// Move a connection out, to a worker.
    fn lend(&mut self, idx: usize) -> Box<Connection> {
        match std::mem::replace(&mut self.slots[idx], Slot::Lent { expired: false }) {
            Slot::Here(con) => con,
            _ => panic!("lending connection {idx}, which the reactor doesn't have"),
        }
    }

    /// Take a connection back from a worker. Returns true if it expired
    /// while it was away.
    fn restore(&mut self, idx: usize, con: Box<Connection>) -> bool {
        match std::mem::replace(&mut self.slots[idx], Slot::Here(con)) {
            Slot::Lent { expired } => expired,
            _ => panic!("connection {idx} returned by a worker, but was never lent out"),
        }
    }
}

/// Remote control for a running `Server`. Cheap to clone, and usable from
/// any thread.
#[derive(Clone, Debug)]
pub struct Handle {
    stop: Arc<AtomicBool>,
    notifier: Notifier,
}

impl Handle {
    /// Ask the server to stop, same as SIGTERM.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.notifier.notify(Notice::Terminate);
    }

    /// Ask for an idle connection sweep now, same as SIGALRM.
    pub fn tick(&self) {
        self.notifier.notify(Notice::Tick);
    }
}

pub struct Server {
    config: Config,
    listener: TcpListener,
    poller: Poller,
    signals: SignalChannel,
    timers: ExpiryList<RawFd>,
    cons: Connections,
    pool: ThreadPool<Box<Connection>>,
    completed: mpsc::Receiver<Completion>,
    stop: Arc<AtomicBool>,

    // Set once signal handlers are installed. Then every sweep schedules
    // the next SIGALRM.
    alarm: bool,

    // Counters, for logging.
    accepted: u64,
    requests: u64,
}

impl Server {
    /// Set up the listener, the readiness poller, the notification channel
    /// and the worker pool. Nothing is served until `run()`.
    pub fn bind(config: Config) -> Result<Self> {
        let root = DocRoot::new(&config.doc_root);
        Self::bind_with(config, move |con: &mut Connection| con.process(&root))
    }

    /// Like `bind()`, with `process` run by the workers on each connection.
    fn bind_with<P>(config: Config, process: P) -> Result<Self>
    where
        P: Fn(&mut Connection) -> Processed + Send + Sync + 'static,
    {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, config.port))
            .with_context(|| format!("Binding to port {}", config.port))?;
        listener
            .set_nonblocking(true)
            .context("Making listener nonblocking")?;
        // Setting TCP_NODELAY on the listening socket sets it on all
        // accepted connections too.
        set_nodelay(&listener).context("Setting TCP_NODELAY on listener")?;

        let poller = Poller::new(MAX_EVENT_NUMBER)?;
        poller
            .add_persistent(listener.as_raw_fd(), TOKEN_LISTENER)
            .context("Registering listener")?;
        let signals = SignalChannel::new()?;
        poller
            .add_persistent(signals.as_raw_fd(), TOKEN_SIGNALS)
            .context("Registering notification channel")?;

        let (tx, completed) = mpsc::channel::<Completion>();
        let notifier = signals.notifier();
        let pool = ThreadPool::new(
            config.threads,
            config.max_requests,
            move |mut con: Box<Connection>| {
                let outcome = process(&mut *con);
                if tx.send((con, outcome)).is_err() {
                    debug!("Reactor is gone, dropping connection");
                    return;
                }
                notifier.notify(Notice::Completed);
            },
        )?;

        Ok(Self {
            cons: Connections::new(MAX_FD.max(config.max_connections)),
            config,
            listener,
            poller,
            signals,
            timers: ExpiryList::new(),
            pool,
            completed,
            stop: Arc::new(AtomicBool::new(false)),
            alarm: false,
            accepted: 0,
            requests: 0,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().context("Getting listener address")
    }

    #[must_use]
    pub fn handle(&self) -> Handle {
        Handle {
            stop: self.stop.clone(),
            notifier: self.signals.notifier(),
        }
    }

    /// Deliver SIGALRM and SIGTERM through the notification channel, and
    /// start the periodic alarm.
    ///
    /// Signal dispositions are process wide, so only one server per process
    /// should do this.
    pub fn install_signal_handlers(&mut self) -> Result<()> {
        self.signals.install()?;
        self.alarm = true;
        signals::schedule_alarm(self.config.tick_interval);
        Ok(())
    }

    /// Serve until asked to stop. Then every connection the reactor holds is
    /// closed.
    pub fn run(&mut self) -> Result<()> {
        info!(
            "Serving {} on {} with {} workers",
            self.config.doc_root.display(),
            self.local_addr()?,
            self.config.threads
        );
        while !self.stop.load(Ordering::SeqCst) {
            let events = self.poller.wait().context("Waiting for events")?;
            trace!("Got {} events", events.len());
            let mut tick = false;
            for ev in events {
                match ev.token {
                    TOKEN_LISTENER => self.accept(),
                    TOKEN_SIGNALS => {
                        for notice in self.signals.drain() {
                            match notice {
                                Notice::Tick => tick = true,
                                Notice::Terminate => {
                                    info!("Shutdown requested");
                                    self.stop.store(true, Ordering::SeqCst);
                                }
                                Notice::Completed => {}
                            }
                        }
                        // A dropped Completed notice still leaves its
                        // connection in the channel, so always look.
                        self.collect_completed();
                    }
                    _ => self.connection_event(ev),
                }
            }
            // I/O first, then expiry.
            if tick {
                self.sweep();
                if self.alarm {
                    signals::schedule_alarm(self.config.tick_interval);
                }
            }
        }
        self.close_all();
        info!(
            "Stopped after {} connections and {} requests",
            self.accepted, self.requests
        );
        Ok(())
    }

    #[must_use]
    fn deadline(&self) -> Instant {
        Instant::now() + self.config.idle_timeout
    }

    fn accept(&mut self) {
        loop {
            let (sock, peer) = match self.listener.accept() {
                Ok(x) => x,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("accept(): {e}");
                    return;
                }
            };
            let fd = sock.as_raw_fd();
            let idx = match self.cons.index(fd) {
                Some(idx) if self.cons.live < self.config.max_connections => idx,
                _ => {
                    warn!(
                        "Rejecting {peer} on fd {fd}: {} connections live",
                        self.cons.live
                    );
                    continue;
                }
            };
            if let Err(e) = sock.set_nonblocking(true) {
                warn!("Making fd {fd} nonblocking: {e}");
                continue;
            }
            let mut con = self.cons.claim(idx);
            con.init(sock, peer);
            if let Err(e) = self.poller.add(fd, fd as u64, Interest::Read) {
                warn!("Registering fd {fd}: {e}");
                drop(con.deinit());
                self.cons.slots[idx] = Slot::Free(Some(con));
                continue;
            }
            self.cons.slots[idx] = Slot::Here(con);
            self.cons.live += 1;
            self.accepted += 1;
            let deadline = self.deadline();
            self.timers.insert(fd, deadline);
            info!("Accepted {peer} on fd {fd}, {} live", self.cons.live);
        }
    }

    fn connection_event(&mut self, ev: Event) {
        let Ok(fd) = RawFd::try_from(ev.token) else {
            warn!("Event with unknown token {}", ev.token);
            return;
        };
        let Some(idx) = self.cons.index(fd) else {
            warn!("Event for out of range fd {fd}");
            return;
        };
        match &self.cons.slots[idx] {
            Slot::Here(_) => {}
            Slot::Lent { .. } => panic!("event {ev:?} for fd {fd}, which a worker holds"),
            Slot::Free(_) => {
                debug!("Event for closed fd {fd}");
                return;
            }
        }
        if ev.hangup() {
            debug!("fd {fd} hung up");
            self.close(fd);
        } else if ev.readable() {
            self.on_readable(fd, idx);
        } else if ev.writable() {
            self.on_writable(fd);
        } else {
            warn!("Unexpected event {ev:?} for fd {fd}");
        }
    }

    fn on_readable(&mut self, fd: RawFd, idx: usize) {
        let deadline = self.deadline();
        self.timers.reschedule(fd, deadline);
        let Some(con) = self.cons.get(fd) else {
            return;
        };
        con.set_phase(Phase::Reading);
        if let Err(e) = con.read() {
            debug!("Reading fd {fd}: {e}");
            self.close(fd);
            return;
        }
        con.set_phase(Phase::Queued);
        let con = self.cons.lend(idx);
        if let Err(con) = self.pool.append(con) {
            warn!(
                "Work queue full ({} tasks), closing fd {fd}",
                self.pool.capacity()
            );
            // Never reached a worker.
            self.cons.restore(idx, con);
            self.close(fd);
        }
    }

    fn on_writable(&mut self, fd: RawFd) {
        let deadline = self.deadline();
        self.timers.reschedule(fd, deadline);
        let Some(con) = self.cons.get(fd) else {
            return;
        };
        match con.write() {
            Ok(WriteProgress::Pending) => self.rearm(fd, Interest::Write),
            Ok(WriteProgress::KeepAlive) => {
                con.set_phase(Phase::Idle);
                self.rearm(fd, Interest::Read);
            }
            Ok(WriteProgress::Done) => self.close(fd),
            Err(e) => {
                debug!("Writing fd {fd}: {e}");
                self.close(fd);
            }
        }
    }

    /// Take back everything the workers are done with.
    fn collect_completed(&mut self) {
        while let Ok((mut con, outcome)) = self.completed.try_recv() {
            let Some(fd) = con.fd() else {
                panic!("worker returned a connection without a socket");
            };
            let Some(idx) = self.cons.index(fd) else {
                panic!("worker returned out of range fd {fd}");
            };
            match outcome {
                Processed::NeedRead => con.set_phase(Phase::Idle),
                Processed::Respond(status) => {
                    self.requests += 1;
                    debug!("fd {fd}: responding {}", status.code());
                    con.set_phase(Phase::Writing);
                }
                Processed::Close => {}
            }
            if self.cons.restore(idx, con) {
                debug!("fd {fd} expired while being processed");
                self.close(fd);
                continue;
            }
            match outcome {
                Processed::NeedRead => self.rearm(fd, Interest::Read),
                Processed::Respond(_) => self.rearm(fd, Interest::Write),
                Processed::Close => self.close(fd),
            }
        }
    }

    fn rearm(&mut self, fd: RawFd, interest: Interest) {
        if let Err(e) = self.poller.rearm(fd, fd as u64, interest) {
            warn!("Rearming fd {fd} for {interest:?}: {e}");
            self.close(fd);
        }
    }

    /// Close idle connections.
    fn sweep(&mut self) {
        let expired = self.timers.tick(Instant::now());
        for fd in expired {
            let Some(idx) = self.cons.index(fd) else {
                continue;
            };
            if let Slot::Lent { expired } = &mut self.cons.slots[idx] {
                *expired = true;
            } else if matches!(self.cons.slots[idx], Slot::Here(_)) {
                info!("fd {fd} idle for too long");
                self.close(fd);
            }
        }
        trace!(
            "Sweep done, {} live, {} timers, {} queued",
            self.cons.live,
            self.timers.len(),
            self.pool.queued()
        );
    }

    /// Deregister, drop the timer, and close the socket. The slot keeps its
    /// buffers for the next connection on this descriptor.
    fn close(&mut self, fd: RawFd) {
        let Some(idx) = self.cons.index(fd) else {
            return;
        };
        if let Err(e) = self.poller.delete(fd) {
            warn!("Deregistering fd {fd}: {e}");
        }
        self.timers.remove(fd);
        match std::mem::replace(&mut self.cons.slots[idx], Slot::Free(None)) {
            Slot::Here(mut con) => {
                let peer = con.peer();
                drop(con.deinit());
                self.cons.slots[idx] = Slot::Free(Some(con));
                self.cons.live -= 1;
                info!("Closed fd {fd} ({peer:?}), {} live", self.cons.live);
            }
            Slot::Lent { .. } => panic!("closing fd {fd} while a worker holds it"),
            free @ Slot::Free(_) => self.cons.slots[idx] = free,
        }
    }

    fn close_all(&mut self) {
        let fds: Vec<RawFd> = self
            .cons
            .slots
            .iter()
            .filter_map(|s| match s {
                Slot::Here(con) => con.fd(),
                _ => None,
            })
            .collect();
        debug!("Closing {} connections", fds.len());
        for fd in fds {
            self.close(fd);
        }
    }
}
