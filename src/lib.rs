//! Static file HTTP/1.1 server.
//!
//! One reactor thread multiplexes all sockets with oneshot readiness
//! notifications, and a fixed pool of workers parses requests and maps the
//! requested files. Responses are written straight from the mapping.
pub mod config;
pub mod conn;
pub mod docroot;
pub mod expiry;
pub mod http;
pub mod poller;
pub mod pool;
pub mod reactor;
pub mod signals;
pub mod sock;

pub use config::Config;
pub use reactor::{Handle, Server};
