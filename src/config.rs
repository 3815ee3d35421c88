use std::path::PathBuf;
use std::time::Duration;

// Size of the connection table. Connections are indexed by their file
// descriptor, so this is also the highest descriptor we'll serve.
pub const MAX_FD: usize = 65536;

// Max events handed back by one readiness wait.
pub const MAX_EVENT_NUMBER: usize = 10000;

// Every connection has a fixed read buffer (for the request). This is the
// size.
pub const READ_BUFFER_SIZE: usize = 2048;

// Outgoing status line, headers, and error bodies must fit in this.
pub const WRITE_BUFFER_SIZE: usize = 1024;

// Max length of document root plus request path.
pub const FILENAME_LEN: usize = 200;

pub const THREAD_NUMBER: usize = 8;

// Max outstanding tasks in the worker queue.
pub const MAX_REQUESTS: usize = 10000;

// Periodic wakeup for the expiry sweep.
pub const TIMESLOT: Duration = Duration::from_secs(5);

// Connections idle for longer than this are closed by the sweep.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(3 * TIMESLOT.as_secs());

pub const DOC_ROOT: &str = "/var/www/mmapd";

/// Everything the server needs to know at startup.
///
/// The binary only ever uses `Config::new()`, which fills in the compiled-in
/// values above. The fields are public so that the library can be driven
/// with a different document root or shorter timeouts.
#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub doc_root: PathBuf,
    pub max_connections: usize,
    pub threads: usize,
    pub max_requests: usize,
    pub idle_timeout: Duration,

    /// How often SIGALRM should trigger a sweep. Only used once signal
    /// handlers are installed.
    pub tick_interval: Duration,
}

impl Config {
    #[must_use]
    pub fn new(port: u16) -> Self {
        Self {
            port,
            doc_root: PathBuf::from(DOC_ROOT),
            max_connections: MAX_FD,
            threads: THREAD_NUMBER,
            max_requests: MAX_REQUESTS,
            idle_timeout: IDLE_TIMEOUT,
            tick_interval: TIMESLOT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = Config::new(8080);
        assert_eq!(c.port, 8080);
        assert_eq!(c.idle_timeout, Duration::from_secs(15));
        assert_eq!(c.max_connections, MAX_FD);
        assert_eq!(c.doc_root, PathBuf::from(DOC_ROOT));
    }
}
