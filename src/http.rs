//! # HTTP/1.1 Wire Handling
//!
//! Just enough HTTP for the protocol: a zero-copy request parser over a
//! client slot's buffer and a cursor-tracked response writer into the same
//! buffer. Headers get case-insensitive, first-value-wins lookup; bodies
//! are located via `Content-Length`. Chunked transfer encoding is not
//! supported.

use std::fmt;

/// Upper bound on headers per request. More than this is hostile input.
const MAX_HEADERS: usize = 32;

/// Outcome of a parse attempt over a partially filled buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// The buffer does not yet hold a complete request; read more.
    Incomplete,
    /// The bytes can never become a valid request.
    Malformed,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Incomplete => write!(f, "request is incomplete"),
            ParseError::Malformed => write!(f, "request is malformed"),
        }
    }
}

impl std::error::Error for ParseError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Put,
    Options,
    /// Any other token; the handler answers 405.
    Unsupported,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Put => "PUT",
            Method::Options => "OPTIONS",
            Method::Unsupported => "?",
        }
    }
}

/// A parsed request view borrowing the slot buffer.
#[derive(Debug)]
pub struct Request<'a> {
    pub method: Method,
    pub path: &'a str,
    headers: Vec<(&'a str, &'a str)>,
    pub body: &'a [u8],
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

impl<'a> Request<'a> {
    /// Parses the filled prefix of a slot buffer.
    ///
    /// # Errors
    /// [`ParseError::Incomplete`] until the header terminator and the full
    /// `Content-Length` body have arrived; [`ParseError::Malformed`] for
    /// anything that can never parse.
    pub fn parse(buf: &'a [u8]) -> Result<Self, ParseError> {
        let header_end = find_subsequence(buf, b"\r\n\r\n").ok_or(ParseError::Incomplete)? + 4;
        let head = std::str::from_utf8(&buf[..header_end]).map_err(|_| ParseError::Malformed)?;

        let mut lines = head.split("\r\n");
        let request_line = lines.next().ok_or(ParseError::Malformed)?;
        let mut parts = request_line.split(' ');
        let method = match parts.next().ok_or(ParseError::Malformed)? {
            "" => return Err(ParseError::Malformed),
            "GET" => Method::Get,
            "PUT" => Method::Put,
            "OPTIONS" => Method::Options,
            _ => Method::Unsupported,
        };
        let path = parts.next().ok_or(ParseError::Malformed)?;
        if !path.starts_with('/') {
            return Err(ParseError::Malformed);
        }
        let version = parts.next().ok_or(ParseError::Malformed)?;
        if !version.starts_with("HTTP/1.") || parts.next().is_some() {
            return Err(ParseError::Malformed);
        }

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            if headers.len() == MAX_HEADERS {
                return Err(ParseError::Malformed);
            }
            let (name, value) = line.split_once(':').ok_or(ParseError::Malformed)?;
            if name.is_empty() || name.contains(' ') {
                return Err(ParseError::Malformed);
            }
            headers.push((name, value.trim()));
        }

        let request = Self { method, path, headers, body: &[] };
        let content_length = match request.header("Content-Length") {
            Some(v) => v.parse::<usize>().map_err(|_| ParseError::Malformed)?,
            None => 0,
        };
        let body_end = header_end.checked_add(content_length).ok_or(ParseError::Malformed)?;
        if buf.len() < body_end {
            return Err(ParseError::Incomplete);
        }

        Ok(Self { body: &buf[header_end..body_end], ..request })
    }

    /// Case-insensitive header lookup; the first value wins.
    pub fn header(&self, name: &str) -> Option<&'a str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| *v)
    }
}

/// Canonical reason phrase for every status the server emits.
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        304 => "Not Modified",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        409 => "Conflict",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}

/// Cursor-tracked response writer over a slot buffer.
///
/// Writes never allocate; on overflow the writer latches a flag and the
/// caller force-closes the connection instead of sending a torn response.
pub struct ResponseWriter<'a> {
    buf: &'a mut [u8],
    len: usize,
    overflow: bool,
}

impl<'a> ResponseWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, len: 0, overflow: false }
    }

    fn push(&mut self, bytes: &[u8]) {
        let end = self.len + bytes.len();
        if end > self.buf.len() {
            self.overflow = true;
            return;
        }
        self.buf[self.len..end].copy_from_slice(bytes);
        self.len = end;
    }

    /// Writes the status line.
    pub fn status(&mut self, status: u16) -> &mut Self {
        self.push(b"HTTP/1.1 ");
        let _ = fmt::Write::write_fmt(self, format_args!("{status} {}\r\n", reason_phrase(status)));
        self
    }

    pub fn header(&mut self, name: &str, value: &str) -> &mut Self {
        self.push(name.as_bytes());
        self.push(b": ");
        self.push(value.as_bytes());
        self.push(b"\r\n");
        self
    }

    /// Terminates the head with a `Content-Length` and appends the body.
    /// Returns the total response length.
    pub fn finish(&mut self, body: &[u8]) -> usize {
        let _ = fmt::Write::write_fmt(self, format_args!("Content-Length: {}\r\n\r\n", body.len()));
        self.push(body);
        self.len
    }

    /// Terminates a bodiless response. Returns the total response length.
    pub fn finish_empty(&mut self) -> usize {
        self.push(b"\r\n");
        self.len
    }

    pub fn overflowed(&self) -> bool {
        self.overflow
    }
}

impl fmt::Write for ResponseWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.push(s.as_bytes());
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
