//! Per connection HTTP state machine.
//!
//! A `Connection` is only ever touched by one thread at a time. The reactor
//! does the socket reads and writes, and moves the whole `Box<Connection>`
//! to a worker for `process()`, getting it back afterwards.
use std::io::{ErrorKind, IoSlice, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};

use anyhow::Result;
use arrayvec::ArrayVec;
use log::{debug, info, trace, warn};
use zeroize::Zeroize;

use crate::config::READ_BUFFER_SIZE;
use crate::docroot::{DocRoot, MappedFile, Resolution};
use crate::http::{
    CheckState, Header, HeaderBuf, LineStatus, ResponseHead, Status, parse_header, parse_line,
    parse_request_line,
};

type ReadBuf = [u8; READ_BUFFER_SIZE];

/// Who is working on a connection, and on what.
///
/// Only the transitions in `can_become()` are allowed. Closing is not a
/// transition: it resets the slot to `Idle` from anywhere.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Armed for reading, nothing in flight.
    Idle,

    /// The reactor is reading from the socket.
    Reading,

    /// In the worker queue.
    Queued,

    /// A worker is running `process()`.
    Processing,

    /// A response is being written, possibly over several writable events.
    Writing,
}

impl Phase {
    #[must_use]
    pub fn can_become(self, to: Phase) -> bool {
        use Phase::{Idle, Processing, Queued, Reading, Writing};
        matches!(
            (self, to),
            (Idle, Reading)
                | (Reading, Queued)
                | (Queued, Processing)
                | (Processing, Idle | Writing)
                | (Writing, Idle)
        )
    }
}

/// What the parser got out of the bytes received so far.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ParseOutcome {
    /// Need more bytes.
    Incomplete,
    Complete,
    Malformed,

    /// Parser ended up somewhere it shouldn't be.
    Internal,
}

/// What the reactor should do with a connection a worker handed back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Processed {
    /// No full request yet. Wait for more input.
    NeedRead,

    /// A response is ready to be written.
    Respond(Status),

    /// Give up on the connection without responding.
    Close,
}

/// Result of a write attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteProgress {
    /// Socket buffer full. Wait until writable.
    Pending,

    /// Response sent, and state reset for the next request.
    KeepAlive,

    /// Response sent, and the connection should be closed.
    Done,
}

/// Request bytes, and how far they've been looked at.
struct ReadState {
    buf: ReadBuf,

    // Bytes received.
    read_idx: usize,

    // Bytes scanned by the line parser.
    check_idx: usize,

    // Start of the line being parsed.
    start_line: usize,
}

impl ReadState {
    fn new() -> Self {
        Self {
            buf: [0; READ_BUFFER_SIZE],
            read_idx: 0,
            check_idx: 0,
            start_line: 0,
        }
    }

    fn reset(&mut self) {
        self.buf.zeroize();
        self.read_idx = 0;
        self.check_idx = 0;
        self.start_line = 0;
    }

    /// Read until the reader would block.
    ///
    /// Peer shutdown is an error, as is calling this with a full buffer.
    fn fill_from<R: Read>(&mut self, mut r: R) -> std::io::Result<usize> {
        if self.read_idx >= self.buf.len() {
            return Err(std::io::Error::other("read buffer full"));
        }
        let mut total = 0;
        while self.read_idx < self.buf.len() {
            match r.read(&mut self.buf[self.read_idx..]) {
                Ok(0) => {
                    return Err(std::io::Error::new(
                        ErrorKind::UnexpectedEof,
                        "peer closed connection",
                    ));
                }
                Ok(n) => {
                    self.read_idx += n;
                    total += n;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }
}

/// Find the segment that byte `pos` of the concatenation falls in, and the
/// offset into it. Past the end gives `(segments.len(), 0)`.
#[must_use]
pub fn locate(segments: &[&[u8]], pos: usize) -> (usize, usize) {
    let mut pos = pos;
    for (i, s) in segments.iter().enumerate() {
        if pos < s.len() {
            return (i, pos);
        }
        pos -= s.len();
    }
    (segments.len(), 0)
}

/// The outgoing response: header bytes, then file bytes, and a single count
/// of how much of that has been sent.
struct WriteState {
    header_buf: HeaderBuf,
    file: Option<MappedFile>,
    bytes_sent: usize,
}

impl WriteState {
    fn new() -> Self {
        Self {
            header_buf: HeaderBuf::new(),
            file: None,
            bytes_sent: 0,
        }
    }

    fn segments(&self) -> [&[u8]; 2] {
        [
            self.header_buf.as_slice(),
            self.file.as_ref().map_or(&[][..], MappedFile::as_slice),
        ]
    }

    fn total(&self) -> usize {
        self.segments().iter().map(|s| s.len()).sum()
    }

    fn remaining(&self) -> usize {
        self.total().saturating_sub(self.bytes_sent)
    }

    /// What's left to send, as at most two slices.
    fn pending(&self) -> ArrayVec<IoSlice<'_>, 2> {
        let segs = self.segments();
        let (idx, off) = locate(&segs, self.bytes_sent);
        let mut out = ArrayVec::new();
        for (i, s) in segs.into_iter().enumerate().skip(idx) {
            let s = if i == idx { &s[off..] } else { s };
            if !s.is_empty() {
                out.push(IoSlice::new(s));
            }
        }
        out
    }

    /// Scatter-write until done (true) or the writer would block (false).
    fn flush_to<W: Write>(&mut self, mut w: W) -> std::io::Result<bool> {
        while self.remaining() > 0 {
            let res = {
                let bufs = self.pending();
                w.write_vectored(&bufs)
            };
            match res {
                Ok(0) => return Err(ErrorKind::WriteZero.into()),
                Ok(n) => self.bytes_sent += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    /// Drop the file mapping, if any.
    fn release(&mut self) {
        if let Some(f) = self.file.take() {
            trace!("Unmapping {} bytes", f.len());
        }
    }

    fn reset(&mut self) {
        self.release();
        self.header_buf.zeroize();
        self.header_buf.clear();
        self.bytes_sent = 0;
    }
}

// Connection slot. Reused for every connection that gets the same
// descriptor.
pub struct Connection {
    sock: Option<TcpStream>,
    peer: Option<SocketAddr>,
    phase: Phase,

    rd: ReadState,

    // Parse state.
    check_state: CheckState,
    path: Option<String>,
    host: Option<String>,
    keep_alive: bool,
    content_length: usize,

    // Where the body starts in the read buffer. Only meaningful in
    // `CheckState::Body`.
    body_start: usize,

    wr: WriteState,
}

impl Connection {
    /// Create an unused connection slot.
    #[must_use]
    pub fn new() -> Box<Self> {
        Box::new(Self {
            sock: None,
            peer: None,
            phase: Phase::Idle,
            rd: ReadState::new(),
            check_state: CheckState::RequestLine,
            path: None,
            host: None,
            keep_alive: false,
            content_length: 0,
            body_start: 0,
            wr: WriteState::new(),
        })
    }

    /// Take ownership of a freshly accepted socket.
    pub fn init(&mut self, sock: TcpStream, peer: SocketAddr) {
        debug_assert!(self.sock.is_none());
        self.sock = Some(sock);
        self.peer = Some(peer);
        self.phase = Phase::Idle;
        self.reset();
    }

    /// Give the socket back and return the slot to its unused state. Any
    /// file mapping is released.
    pub fn deinit(&mut self) -> Option<TcpStream> {
        self.reset();
        self.phase = Phase::Idle;
        self.peer = None;
        self.sock.take()
    }

    /// Get ready for the next request on the same socket.
    fn reset(&mut self) {
        self.rd.reset();
        self.wr.reset();
        self.check_state = CheckState::RequestLine;
        self.path = None;
        self.host = None;
        self.keep_alive = false;
        self.content_length = 0;
        self.body_start = 0;
    }

    /// Socket descriptor, if the slot is in use.
    #[must_use]
    pub fn fd(&self) -> Option<RawFd> {
        self.sock.as_ref().map(AsRawFd::as_raw_fd)
    }

    #[must_use]
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    #[must_use]
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    #[cfg(test)]
    fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    #[cfg(test)]
    fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    /// Move to another phase. Panics on a transition that skips a step.
    pub fn set_phase(&mut self, to: Phase) {
        assert!(
            self.phase.can_become(to),
            "connection {:?}: illegal phase change {:?} -> {to:?}",
            self.fd(),
            self.phase
        );
        self.phase = to;
    }

    /// Read whatever the peer has sent, without blocking.
    pub fn read(&mut self) -> std::io::Result<usize> {
        let Some(sock) = self.sock.as_ref() else {
            return Err(ErrorKind::NotConnected.into());
        };
        let n = self.rd.fill_from(sock)?;
        trace!(
            "fd {} read {n} bytes, {} buffered",
            sock.as_raw_fd(),
            self.rd.read_idx
        );
        Ok(n)
    }

    /// Parse what's been read, and if it's a full request, prepare the
    /// response. Runs on a worker thread.
    pub fn process(&mut self, root: &DocRoot) -> Processed {
        self.set_phase(Phase::Processing);
        let status = match self.process_read() {
            ParseOutcome::Incomplete => return Processed::NeedRead,
            ParseOutcome::Malformed => {
                // Never keep a connection that spoke garbage.
                self.keep_alive = false;
                Status::BadRequest
            }
            ParseOutcome::Internal => Status::InternalError,
            ParseOutcome::Complete => match self.do_request(root) {
                Some(status) => status,
                None => return Processed::Close,
            },
        };
        if let Err(e) = self.build_response(status) {
            warn!("Building {} response: {e:#}", status.code());
            if let Err(e) = self.build_response(Status::InternalError) {
                warn!("Building fallback 500 response: {e:#}");
                self.wr.release();
                return Processed::Close;
            }
            return Processed::Respond(Status::InternalError);
        }
        Processed::Respond(status)
    }

    /// Run the line parser over everything not parsed yet.
    fn process_read(&mut self) -> ParseOutcome {
        loop {
            if self.check_state == CheckState::Body {
                // The body isn't interpreted, just waited for.
                // Checked against the buffer size when the headers ended.
                return if self.rd.read_idx - self.body_start >= self.content_length {
                    ParseOutcome::Complete
                } else {
                    ParseOutcome::Incomplete
                };
            }
            match parse_line(&mut self.rd.buf, &mut self.rd.check_idx, self.rd.read_idx) {
                LineStatus::Open => return ParseOutcome::Incomplete,
                LineStatus::Bad => return ParseOutcome::Malformed,
                LineStatus::Ok => {}
            }
            let start = self.rd.start_line;
            let end = self.rd.check_idx - 2;
            self.rd.start_line = self.rd.check_idx;
            let Ok(line) = std::str::from_utf8(&self.rd.buf[start..end]) else {
                debug!("Non-UTF-8 request line or header");
                return ParseOutcome::Malformed;
            };
            debug!(">>> {line}");
            match self.check_state {
                CheckState::RequestLine => {
                    let Some(req) = parse_request_line(line) else {
                        return ParseOutcome::Malformed;
                    };
                    trace!("Request for {} ({})", req.path, req.version);
                    self.path = Some(req.path.to_owned());
                    self.check_state = CheckState::Headers;
                }
                CheckState::Headers => match parse_header(line) {
                    None => return ParseOutcome::Malformed,
                    Some(Header::End) => {
                        if self.content_length == 0 {
                            return ParseOutcome::Complete;
                        }
                        // A body that can't fit in the read buffer would
                        // never arrive.
                        if self.content_length > READ_BUFFER_SIZE - self.rd.check_idx {
                            debug!(
                                "Body of {} bytes does not fit after {} header bytes",
                                self.content_length, self.rd.check_idx
                            );
                            return ParseOutcome::Malformed;
                        }
                        self.body_start = self.rd.check_idx;
                        self.check_state = CheckState::Body;
                    }
                    Some(Header::Connection { keep_alive }) => self.keep_alive = keep_alive,
                    Some(Header::ContentLength(n)) => self.content_length = n,
                    Some(Header::Host(h)) => self.host = Some(h.to_owned()),
                    Some(Header::Other(h)) => debug!("Unknown header: {h}"),
                },
                CheckState::Body => return ParseOutcome::Internal,
            }
        }
    }

    /// Look up the requested file. None means the file can't be served and
    /// no response should be attempted.
    fn do_request(&mut self, root: &DocRoot) -> Option<Status> {
        let Some(path) = self.path.as_deref() else {
            return Some(Status::InternalError);
        };
        Some(match root.resolve(path) {
            Resolution::File(f) => {
                debug!("Serving {path}: {} bytes", f.len());
                self.wr.file = Some(f);
                Status::Ok
            }
            Resolution::NotFound => Status::NotFound,
            Resolution::Forbidden => Status::Forbidden,
            Resolution::Directory => Status::BadRequest,
            Resolution::Failed => Status::InternalError,
            Resolution::Unmappable => return None,
        })
    }

    /// Put status line and headers (and the body, for errors) in the header
    /// buffer. Only fails if they don't fit.
    pub fn build_response(&mut self, status: Status) -> Result<()> {
        self.wr.header_buf.clear();
        self.wr.bytes_sent = 0;
        let head = if status == Status::Ok {
            let len = self.wr.file.as_ref().map_or(0, MappedFile::len);
            ResponseHead::new(Status::Ok).content_length(len as u64)
        } else {
            self.wr.release();
            ResponseHead::error(status)
        };
        head.keep_alive(self.keep_alive)
            .write_to(&mut self.wr.header_buf)?;
        Ok(())
    }

    /// Send as much of the response as the socket takes.
    ///
    /// On error the mapping is released, and the caller should close.
    pub fn write(&mut self) -> std::io::Result<WriteProgress> {
        let Some(sock) = self.sock.as_ref() else {
            return Err(ErrorKind::NotConnected.into());
        };
        match self.wr.flush_to(sock) {
            Ok(false) => {
                trace!("fd {}: {} bytes left to write", sock.as_raw_fd(), self.wr.remaining());
                Ok(WriteProgress::Pending)
            }
            Ok(true) => {
                info!(
                    "fd {} wrote {} bytes to {:?}",
                    sock.as_raw_fd(),
                    self.wr.bytes_sent,
                    self.peer
                );
                self.wr.release();
                if self.keep_alive {
                    self.reset();
                    Ok(WriteProgress::KeepAlive)
                } else {
                    Ok(WriteProgress::Done)
                }
            }
            Err(e) => {
                self.wr.release();
                Err(e)
            }
        }
    }
}
