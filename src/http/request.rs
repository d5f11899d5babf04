//! Client request framing and parsing.
//!
//! # Responsibilities
//! - Read the header block line by line until the blank line
//! - Keep the received header bytes verbatim for forwarding
//! - Parse the request line and headers once into a fixed record
//! - Read exactly `Content-Length` body bytes for POST
//!
//! # Design Decisions
//! - Header block and body size are bounded before buffering
//! - Every read from the client carries the configured idle deadline
//! - `Content-Length` is matched case-insensitively; a malformed value aborts
//!   the request instead of defaulting to zero

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::config::LimitsConfig;
use crate::resilience::{with_timeout, TimeoutError};

/// Errors raised while framing a client request.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("client closed the connection before sending a request")]
    ConnectionClosed,

    #[error("stream ended before the request was complete")]
    PrematureEof,

    #[error("header block exceeds {limit} bytes")]
    HeaderTooLarge { limit: usize },

    #[error("declared body of {declared} bytes exceeds {limit} bytes")]
    BodyTooLarge { declared: u64, limit: u64 },

    #[error("malformed request line `{0}`")]
    MalformedRequestLine(String),

    #[error("unsupported method `{0}`")]
    UnsupportedMethod(String),

    #[error("invalid Content-Length `{0}`")]
    InvalidContentLength(String),

    #[error(transparent)]
    Timeout(#[from] TimeoutError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Methods the proxy relays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = ParseError;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        match token.to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            _ => Err(ParseError::UnsupportedMethod(token.to_string())),
        }
    }
}

/// A fully framed client request. Immutable once parsed.
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    target: String,
    version: String,
    host: Option<String>,
    target_port: Option<String>,
    content_length: Option<u64>,
    header_lines: Vec<String>,
    headers: Vec<(String, String)>,
    raw_header: Vec<u8>,
    body: Vec<u8>,
}

impl Request {
    pub fn method(&self) -> Method {
        self.method
    }

    /// The request-target exactly as sent; also the cache key.
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Trimmed value of the Host header, if the client sent one.
    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    /// Port text written in the request-target authority, if any.
    pub fn target_port(&self) -> Option<&str> {
        self.target_port.as_deref()
    }

    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// Header lines in arrival order, line terminators removed.
    /// The first entry is the request line.
    pub fn header_lines(&self) -> &[String] {
        &self.header_lines
    }

    /// First value of the named header, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The header block as received, blank terminator line included.
    pub fn raw_header(&self) -> &[u8] {
        &self.raw_header
    }

    /// POST body; empty for GET.
    pub fn body(&self) -> &[u8] {
        &self.body
    }
}

/// Reads one request off a buffered client stream.
#[derive(Debug, Clone)]
pub struct RequestParser {
    max_header_bytes: usize,
    max_body_bytes: u64,
    read_timeout: Option<Duration>,
}

impl RequestParser {
    pub fn new(limits: &LimitsConfig, read_timeout: Option<Duration>) -> Self {
        Self {
            max_header_bytes: limits.max_header_bytes,
            max_body_bytes: limits.max_body_bytes,
            read_timeout,
        }
    }

    /// Frame and parse one request.
    pub async fn parse<R>(&self, reader: &mut R) -> Result<Request, ParseError>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut raw_header = Vec::new();
        let mut header_lines: Vec<String> = Vec::new();
        // Bytes taken off the wire, skipped blank lines included.
        let mut consumed = 0usize;

        loop {
            let line = self.read_line(reader, consumed).await?;
            let Some(line) = line else {
                return Err(if raw_header.is_empty() {
                    ParseError::ConnectionClosed
                } else {
                    ParseError::PrematureEof
                });
            };

            consumed += line.len();
            let text = trim_line_ending(&line);
            if text.is_empty() {
                // Stray blank lines ahead of the request line are skipped.
                if header_lines.is_empty() {
                    continue;
                }
                raw_header.extend_from_slice(&line);
                break;
            }

            raw_header.extend_from_slice(&line);
            header_lines.push(String::from_utf8_lossy(text).into_owned());
        }

        let mut request = build_request(raw_header, header_lines)?;

        if request.method == Method::Post {
            let declared = request.content_length.unwrap_or(0);
            if declared > self.max_body_bytes {
                return Err(ParseError::BodyTooLarge {
                    declared,
                    limit: self.max_body_bytes,
                });
            }
            request.body = self.read_body(reader, declared).await?;
        }

        tracing::debug!(
            method = %request.method,
            target = %request.target,
            header_bytes = request.raw_header.len(),
            body_bytes = request.body.len(),
            "Request parsed"
        );

        Ok(request)
    }

    /// Read one line including its terminator. `Ok(None)` on clean EOF.
    async fn read_line<R>(&self, reader: &mut R, used: usize) -> Result<Option<Vec<u8>>, ParseError>
    where
        R: AsyncBufRead + Unpin,
    {
        let remaining = self.max_header_bytes.saturating_sub(used);
        if remaining == 0 {
            return Err(ParseError::HeaderTooLarge {
                limit: self.max_header_bytes,
            });
        }

        let mut line = Vec::new();
        let mut limited = (&mut *reader).take(remaining as u64);
        let n = with_timeout(
            self.read_timeout,
            "client header read",
            limited.read_until(b'\n', &mut line),
        )
        .await??;

        if n == 0 {
            return Ok(None);
        }
        if line.last() != Some(&b'\n') {
            return Err(if n == remaining {
                ParseError::HeaderTooLarge {
                    limit: self.max_header_bytes,
                }
            } else {
                ParseError::PrematureEof
            });
        }
        Ok(Some(line))
    }

    async fn read_body<R>(&self, reader: &mut R, len: u64) -> Result<Vec<u8>, ParseError>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut body = Vec::with_capacity(len.min(64 * 1024) as usize);
        let mut limited = (&mut *reader).take(len);
        let mut chunk = [0u8; 8192];

        while (body.len() as u64) < len {
            let n = with_timeout(self.read_timeout, "client body read", limited.read(&mut chunk))
                .await??;
            if n == 0 {
                return Err(ParseError::PrematureEof);
            }
            body.extend_from_slice(&chunk[..n]);
        }
        Ok(body)
    }
}

fn trim_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn build_request(raw_header: Vec<u8>, header_lines: Vec<String>) -> Result<Request, ParseError> {
    let request_line = &header_lines[0];
    let mut fields = request_line.split_whitespace();
    let (Some(method), Some(target)) = (fields.next(), fields.next()) else {
        return Err(ParseError::MalformedRequestLine(request_line.clone()));
    };
    let method: Method = method.parse()?;
    let target = target.to_string();
    let version = fields.next().unwrap_or_default().to_string();

    let mut headers = Vec::with_capacity(header_lines.len() - 1);
    let mut host = None;
    let mut content_length = None;

    for line in &header_lines[1..] {
        let Some((name, value)) = line.split_once(':') else {
            tracing::trace!(line = %line, "Ignoring header line without colon");
            continue;
        };
        let name = name.trim();
        let value = value.trim();

        if name.eq_ignore_ascii_case("content-length") {
            let parsed = value
                .parse::<u64>()
                .map_err(|_| ParseError::InvalidContentLength(value.to_string()))?;
            content_length = Some(parsed);
        } else if name.eq_ignore_ascii_case("host") && host.is_none() {
            host = Some(value.to_string());
        }
        headers.push((name.to_string(), value.to_string()));
    }

    let target_port = port_in_target(&target).map(str::to_string);

    Ok(Request {
        method,
        target,
        version,
        host,
        target_port,
        content_length,
        header_lines,
        headers,
        raw_header,
        body: Vec::new(),
    })
}

/// Port text after the authority's colon, e.g. `8080` in
/// `http://example.org:8080/x`. Origin-form targets have none.
fn port_in_target(target: &str) -> Option<&str> {
    let rest = match target.find("://") {
        Some(idx) => &target[idx + 3..],
        None if target.starts_with('/') => return None,
        None => target,
    };
    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let authority = authority
        .rsplit_once('@')
        .map_or(authority, |(_, host)| host);

    let port = match authority.strip_prefix('[') {
        Some(bracketed) => bracketed.split_once(']')?.1.strip_prefix(':')?,
        None => authority.split_once(':')?.1,
    };
    (!port.is_empty()).then_some(port)
}
