use std::os::fd::AsFd;

use anyhow::{Context, Result};
use nix::sys::socket::{setsockopt, sockopt};

/// Disable Nagle on a socket.
///
/// Accepted connections inherit this from their listener, so setting it
/// once on the listener covers every connection.
pub fn set_nodelay<F: AsFd>(sock: &F) -> Result<()> {
    setsockopt(sock, sockopt::TcpNoDelay, &true).context("setsockopt(TCP_NODELAY)")
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::socket::getsockopt;

    #[test]
    fn accepted_sockets_inherit_nodelay() -> Result<()> {
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        set_nodelay(&listener)?;
        let _client = std::net::TcpStream::connect(listener.local_addr()?)?;
        let (server, _) = listener.accept()?;
        assert!(getsockopt(&server, sockopt::TcpNoDelay)?);
        Ok(())
    }
}
