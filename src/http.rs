//! HTTP/1.1 wire format: line framing, request line and header parsing, and
//! response head composition.
//!
//! Nothing in here does I/O. The connection state machine feeds it bytes and
//! asks it to compose headers into a fixed buffer.
use anyhow::{Result, anyhow};
use arrayvec::ArrayVec;
use log::trace;

use crate::config::WRITE_BUFFER_SIZE;

pub type HeaderBuf = ArrayVec<u8, WRITE_BUFFER_SIZE>;

/// Result of looking for the end of the current line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LineStatus {
    /// A full line was found, and the cursor moved past it.
    Ok,

    /// Bare LF, or CR followed by something other than LF.
    Bad,

    /// No line terminator yet. Need more data.
    Open,
}

/// Scan `buf[*check..read]` for the end of a line.
///
/// On success both terminator bytes are overwritten with NUL, and `check`
/// points at the start of the next line. A CR as the very last received
/// byte is left alone, so that the next call sees it again together with
/// the LF that follows.
pub fn parse_line(buf: &mut [u8], check: &mut usize, read: usize) -> LineStatus {
    while *check < read {
        match buf[*check] {
            b'\r' => {
                if *check + 1 == read {
                    return LineStatus::Open;
                }
                if buf[*check + 1] == b'\n' {
                    buf[*check] = 0;
                    buf[*check + 1] = 0;
                    *check += 2;
                    return LineStatus::Ok;
                }
                return LineStatus::Bad;
            }
            b'\n' => {
                // CR at the end of a previous read, LF at the start of this
                // one.
                if *check > 1 && buf[*check - 1] == b'\r' {
                    buf[*check - 1] = 0;
                    buf[*check] = 0;
                    *check += 1;
                    return LineStatus::Ok;
                }
                return LineStatus::Bad;
            }
            _ => *check += 1,
        }
    }
    LineStatus::Open
}

/// Where the request parser is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckState {
    RequestLine,
    Headers,
    Body,
}

/// The parts of a request line we care about.
#[derive(Debug, PartialEq, Eq)]
pub struct RequestLine<'a> {
    pub path: &'a str,
    pub version: &'a str,
}

fn is_blank(c: char) -> bool {
    c == ' ' || c == '\t'
}

/// Strip a case insensitive ASCII prefix.
fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| &s[prefix.len()..])
}

/// Parse `METHOD SP target SP version`.
///
/// Returns None if the line is malformed. Only GET is allowed, and
/// absolute-URI targets are cut down to their path.
#[must_use]
pub fn parse_request_line(line: &str) -> Option<RequestLine<'_>> {
    let (method, rest) = line.split_once(is_blank)?;
    if !method.eq_ignore_ascii_case("GET") {
        trace!("Rejecting method {method:?}");
        return None;
    }
    let (target, version) = rest.split_once(is_blank)?;
    let version = version.trim_start_matches(is_blank);

    let path = match strip_prefix_ignore_case(target, "http://") {
        Some(hostpath) => &hostpath[hostpath.find('/')?..],
        None => target,
    };
    if !path.starts_with('/') {
        return None;
    }
    if path.split('/').any(|segment| segment == "..") {
        trace!("Rejecting path escaping the document root: {path:?}");
        return None;
    }
    Some(RequestLine { path, version })
}

/// One parsed header line.
#[derive(Debug, PartialEq, Eq)]
pub enum Header<'a> {
    /// The empty line after the headers.
    End,
    Connection { keep_alive: bool },
    ContentLength(usize),
    Host(&'a str),
    Other(&'a str),
}

/// Parse a single header line. Returns None if a recognized header has a
/// value we can't make sense of.
#[must_use]
pub fn parse_header(line: &str) -> Option<Header<'_>> {
    if line.is_empty() {
        return Some(Header::End);
    }
    if let Some(v) = strip_prefix_ignore_case(line, "Connection:") {
        let v = v.trim_matches(is_blank);
        return Some(Header::Connection {
            keep_alive: v.eq_ignore_ascii_case("keep-alive"),
        });
    }
    if let Some(v) = strip_prefix_ignore_case(line, "Content-Length:") {
        // Digits only. `parse()` alone would also take a leading '+'.
        let v = v.trim_matches(is_blank);
        if v.is_empty() || !v.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        return v.parse().ok().map(Header::ContentLength);
    }
    if let Some(v) = strip_prefix_ignore_case(line, "Host:") {
        return Some(Header::Host(v.trim_matches(is_blank)));
    }
    Some(Header::Other(line))
}

/// Response statuses this server produces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Ok,
    BadRequest,
    Forbidden,
    NotFound,
    InternalError,
}

impl Status {
    #[must_use]
    pub fn code(self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::BadRequest => 400,
            Status::Forbidden => 403,
            Status::NotFound => 404,
            Status::InternalError => 500,
        }
    }

    #[must_use]
    pub fn reason(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::BadRequest => "Bad Request",
            Status::Forbidden => "Forbidden",
            Status::NotFound => "Not Found",
            Status::InternalError => "Internal Error",
        }
    }

    /// Fixed body sent for error statuses.
    #[must_use]
    pub fn error_body(self) -> Option<&'static str> {
        match self {
            Status::Ok => None,
            Status::BadRequest => Some("Your request has bad syntax"),
            Status::Forbidden => Some("You do not have permission to get file"),
            Status::NotFound => Some("The request file was not found"),
            Status::InternalError => {
                Some("There was an unusual problem serving the request file")
            }
        }
    }
}

/// Typed builder for a response head.
///
/// Fields are collected first, and only written into the output buffer once
/// the whole thing is known to fit.
#[derive(Debug)]
pub struct ResponseHead {
    status: Status,
    content_length: u64,
    keep_alive: bool,
    body: Option<&'static str>,
}

impl ResponseHead {
    #[must_use]
    pub fn new(status: Status) -> Self {
        Self {
            status,
            content_length: 0,
            keep_alive: false,
            body: None,
        }
    }

    /// Error response with its canned body, which travels in the header
    /// buffer.
    #[must_use]
    pub fn error(status: Status) -> Self {
        let body = status.error_body().unwrap_or("");
        Self::new(status)
            .content_length(body.len() as u64)
            .body(body)
    }

    #[must_use]
    pub fn content_length(mut self, len: u64) -> Self {
        self.content_length = len;
        self
    }

    #[must_use]
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    #[must_use]
    pub fn body(mut self, body: &'static str) -> Self {
        self.body = Some(body);
        self
    }

    /// Append the head (and inline body, if any) to `out`.
    ///
    /// Fails without touching `out` if it doesn't fit.
    pub fn write_to<const N: usize>(&self, out: &mut ArrayVec<u8, N>) -> Result<usize> {
        use std::io::Write;

        let mut tmp = ArrayVec::<u8, N>::new();
        let fits = write!(
            tmp,
            "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nContent-Type: text/html\r\nConnection: {}\r\n\r\n{}",
            self.status.code(),
            self.status.reason(),
            self.content_length,
            if self.keep_alive { "keep-alive" } else { "close" },
            self.body.unwrap_or(""),
        );
        if fits.is_err() {
            return Err(anyhow!(
                "response head for {} does not fit in {} bytes",
                self.status.code(),
                N - out.len()
            ));
        }
        out.try_extend_from_slice(&tmp).map_err(|_| {
            anyhow!(
                "response head of {} bytes does not fit after {} used bytes",
                tmp.len(),
                out.len()
            )
        })?;
        Ok(tmp.len())
    }
}
