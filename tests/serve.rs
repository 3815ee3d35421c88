use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::Command;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};

use mmapd::{Config, Handle, Server};

const TIMEOUT: Duration = Duration::from_secs(5);

// Server on its own thread, stopped on drop.
struct Running {
    addr: SocketAddr,
    handle: Handle,
    thread: Option<JoinHandle<Result<()>>>,
}

impl Running {
    fn start(config: Config) -> Result<Self> {
        let mut server = Server::bind(config)?;
        let addr = server.local_addr()?;
        let handle = server.handle();
        let thread = std::thread::spawn(move || server.run());
        Ok(Self {
            addr,
            handle,
            thread: Some(thread),
        })
    }

    fn connect(&self) -> Result<TcpStream> {
        let s = TcpStream::connect(("127.0.0.1", self.addr.port()))?;
        s.set_read_timeout(Some(TIMEOUT))?;
        Ok(s)
    }

    fn stop(mut self) -> Result<()> {
        self.handle.shutdown();
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        thread
            .join()
            .map_err(|_| anyhow!("server thread panicked"))?
    }
}

impl Drop for Running {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.handle.shutdown();
            let _ = thread.join();
        }
    }
}

fn write_file(dir: &Path, name: &str, data: &[u8], mode: u32) -> Result<()> {
    let p = dir.join(name);
    std::fs::write(&p, data)?;
    std::fs::set_permissions(&p, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

fn site() -> Result<tempfile::TempDir> {
    let dir = tempfile::TempDir::new()?;
    write_file(dir.path(), "index.html", b"hello world", 0o644)?;
    write_file(dir.path(), "secret.html", b"top secret", 0o640)?;
    write_file(dir.path(), "empty.html", b"", 0o644)?;
    std::fs::create_dir(dir.path().join("sub"))?;
    Ok(dir)
}

fn config(root: &Path) -> Config {
    let mut c = Config::new(0);
    c.doc_root = root.to_path_buf();
    c.threads = 2;
    c.max_connections = 64;
    c
}

/// Read one response. Returns the head, and the body as given by
/// Content-Length.
fn read_response(s: &mut TcpStream) -> Result<(String, Vec<u8>)> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if s.read(&mut byte)? == 0 {
            bail!(
                "EOF in response head after {:?}",
                String::from_utf8_lossy(&head)
            );
        }
        head.push(byte[0]);
    }
    let head = String::from_utf8(head)?;
    let len: usize = head
        .lines()
        .find_map(|l| l.strip_prefix("Content-Length: "))
        .ok_or_else(|| anyhow!("no Content-Length in {head:?}"))?
        .trim()
        .parse()?;
    let mut body = vec![0; len];
    s.read_exact(&mut body)?;
    Ok((head, body))
}

fn get(s: &mut TcpStream, path: &str, keep_alive: bool) -> Result<(String, Vec<u8>)> {
    let conn = if keep_alive { "keep-alive" } else { "close" };
    write!(
        s,
        "GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: {conn}\r\n\r\n"
    )?;
    read_response(s)
}

fn assert_closed(s: &mut TcpStream) {
    let mut buf = [0u8; 64];
    match s.read(&mut buf) {
        Ok(0) => {}
        Ok(n) => panic!("expected EOF, got {n} bytes"),
        Err(e) => assert_eq!(e.kind(), ErrorKind::ConnectionReset, "{e}"),
    }
}

#[test]
fn keep_alive_serves_several_requests() -> Result<()> {
    let dir = site()?;
    let server = Running::start(config(dir.path()))?;
    let mut s = server.connect()?;

    let (head, body) = get(&mut s, "/index.html", true)?;
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");
    assert!(head.contains("Content-Length: 11\r\n"), "{head}");
    assert!(head.contains("Content-Type: text/html\r\n"), "{head}");
    assert!(head.contains("Connection: keep-alive\r\n"), "{head}");
    assert_eq!(body, b"hello world");

    // Same socket, fresh parser state.
    let (head, body) = get(&mut s, "/empty.html", true)?;
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");
    assert!(body.is_empty());

    let (head, body) = get(&mut s, "/index.html", false)?;
    assert!(head.contains("Connection: close\r\n"), "{head}");
    assert_eq!(body, b"hello world");
    assert_closed(&mut s);

    server.stop()
}

#[test]
fn error_statuses() -> Result<()> {
    let dir = site()?;
    let server = Running::start(config(dir.path()))?;
    let mut s = server.connect()?;

    let (head, body) = get(&mut s, "/missing.html", true)?;
    assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"), "{head}");
    assert_eq!(body, b"The request file was not found");

    let (head, body) = get(&mut s, "/secret.html", true)?;
    assert!(head.starts_with("HTTP/1.1 403 Forbidden\r\n"), "{head}");
    assert_eq!(body, b"You do not have permission to get file");

    // Directories are never listed, and the connection survives.
    let (head, body) = get(&mut s, "/sub", true)?;
    assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{head}");
    assert!(head.contains("Connection: keep-alive\r\n"), "{head}");
    assert_eq!(body, b"Your request has bad syntax");

    let (head, _) = get(&mut s, "/../etc/passwd", true)?;
    assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{head}");
    assert!(head.contains("Connection: close\r\n"), "{head}");
    assert_closed(&mut s);

    server.stop()
}

#[test]
fn post_is_rejected_and_closed() -> Result<()> {
    let dir = site()?;
    let server = Running::start(config(dir.path()))?;
    let mut s = server.connect()?;
    s.write_all(b"POST /index.html HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")?;
    let (head, body) = read_response(&mut s)?;
    assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{head}");
    assert!(head.contains("Connection: close\r\n"), "{head}");
    assert_eq!(body, b"Your request has bad syntax");
    assert_closed(&mut s);
    server.stop()
}

#[test]
fn huge_content_length_is_rejected() -> Result<()> {
    let dir = site()?;
    let mut cfg = config(dir.path());
    cfg.threads = 1;
    let server = Running::start(cfg)?;

    // More of them than there are workers.
    for _ in 0..3 {
        let mut s = server.connect()?;
        s.write_all(
            b"GET /index.html HTTP/1.1\r\nConnection: keep-alive\r\nContent-Length: 18446744073709551615\r\n\r\n",
        )?;
        let (head, body) = read_response(&mut s)?;
        assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{head}");
        assert!(head.contains("Connection: close\r\n"), "{head}");
        assert_eq!(body, b"Your request has bad syntax");
        assert_closed(&mut s);
    }

    let mut s = server.connect()?;
    let (head, body) = get(&mut s, "/index.html", true)?;
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");
    assert_eq!(body, b"hello world");
    server.stop()
}

#[test]
fn trickled_absolute_uri() -> Result<()> {
    let dir = site()?;
    let server = Running::start(config(dir.path()))?;
    let mut s = server.connect()?;
    s.set_nodelay(true)?;
    let req = b"GET http://localhost:8080/index.html HTTP/1.1\r\nHost: localhost\r\nContent-Length: 3\r\n\r\nabc";
    for b in req {
        s.write_all(&[*b])?;
        std::thread::sleep(Duration::from_millis(1));
    }
    let (head, body) = read_response(&mut s)?;
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");
    assert!(head.contains("Connection: close\r\n"), "{head}");
    assert_eq!(body, b"hello world");
    assert_closed(&mut s);
    server.stop()
}

#[test]
fn large_file_arrives_intact() -> Result<()> {
    let dir = site()?;
    let data: Vec<u8> = (0..4_000_000u32).map(|n| (n % 251) as u8).collect();
    write_file(dir.path(), "big.bin", &data, 0o644)?;
    let server = Running::start(config(dir.path()))?;
    let mut s = server.connect()?;
    let (head, body) = get(&mut s, "/big.bin", true)?;
    assert!(head.contains("Content-Length: 4000000\r\n"), "{head}");
    assert!(body == data, "body differs");
    let (head, _) = get(&mut s, "/index.html", true)?;
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");
    server.stop()
}

#[test]
fn idle_connections_expire_on_tick() -> Result<()> {
    let dir = site()?;
    let mut cfg = config(dir.path());
    cfg.idle_timeout = Duration::from_millis(500);
    let server = Running::start(cfg)?;

    let mut idle = server.connect()?;
    std::thread::sleep(Duration::from_secs(1));
    let mut fresh = server.connect()?;
    server.handle.tick();

    assert_closed(&mut idle);
    let (head, _) = get(&mut fresh, "/index.html", true)?;
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");
    server.stop()
}

#[test]
fn connection_limit() -> Result<()> {
    let dir = site()?;
    let mut cfg = config(dir.path());
    cfg.max_connections = 1;
    let server = Running::start(cfg)?;

    let mut first = server.connect()?;
    get(&mut first, "/index.html", true)?;

    let mut second = server.connect()?;
    assert_closed(&mut second);

    let (head, _) = get(&mut first, "/index.html", true)?;
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");
    server.stop()
}

#[test]
fn shutdown_closes_connections() -> Result<()> {
    let dir = site()?;
    let server = Running::start(config(dir.path()))?;
    let mut s = server.connect()?;
    get(&mut s, "/index.html", true)?;
    server.stop()?;
    assert_closed(&mut s);
    Ok(())
}

#[test]
fn binary_rejects_bad_port() -> Result<()> {
    let cases: [&[&str]; 3] = [&["0"], &["http"], &[]];
    for args in cases {
        let out = Command::new(env!("CARGO_BIN_EXE_mmapd"))
            .args(args)
            .output()?;
        assert!(!out.status.success(), "{args:?} was accepted");
    }
    Ok(())
}
