//! HTTP/1.x header parsing and synthesis shared by the Download Agent
//! (parsing upstream responses) and the Client Job (parsing requests,
//! synthesizing responses).
//!
//! Grounded on `original_source/src/header.cc`: a flat, case-insensitive
//! header bag keyed by a small fixed vocabulary plus a passthrough list of
//! "unknown" headers, and a front line that is either a request line or a
//! status line.

use crate::errors::{AcngError, Result};
use std::fmt;

/// Mirrors `tRemoteStatus`: an HTTP status code plus its reason phrase.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RemoteStatus {
    pub code: u16,
    pub message: String,
}

impl RemoteStatus {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn is_redirect(&self) -> bool {
        matches!(self.code, 301 | 302 | 303 | 307 | 308)
    }

    /// No response body is permitted for these statuses (RFC 7230 §3.3.3).
    pub fn must_not_have_body(&self) -> bool {
        matches!(self.code, 304 | 204) || (100..200).contains(&self.code)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }
}

impl fmt::Display for RemoteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    Http10,
    Http11,
}

impl HttpVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpVersion::Http10 => "HTTP/1.0",
            HttpVersion::Http11 => "HTTP/1.1",
        }
    }
}

/// A decoded set of header lines, preserving insertion order and allowing
/// duplicate keys (needed for e.g. multiple `Set-Cookie`, though the core
/// engine itself only ever looks at a small fixed set of names).
#[derive(Debug, Clone, Default)]
pub struct Headers(pub Vec<(String, String)>);

impl Headers {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.0
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    pub fn remove(&mut self, name: &str) {
        self.0.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Either `Connection: close` or `Proxy-Connection: close` (case
    /// insensitive) is treated as authoritative, per spec.md §9 and
    /// SPEC_FULL.md §11.3.
    pub fn wants_close(&self) -> bool {
        [self.get("connection"), self.get("proxy-connection")]
            .into_iter()
            .flatten()
            .any(|v| v.split(',').any(|tok| tok.trim().eq_ignore_ascii_case("close")))
    }

    pub fn is_chunked(&self) -> bool {
        self.get("transfer-encoding")
            .is_some_and(|v| v.split(',').any(|tok| tok.trim().eq_ignore_ascii_case("chunked")))
    }

    pub fn content_length(&self) -> Option<i64> {
        self.get("content-length").and_then(|v| v.trim().parse().ok())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Other,
}

#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub raw_method: String,
    pub path: String,
    pub version: HttpVersion,
    pub headers: Headers,
}

/// Parses one HTTP request (request line + headers, no body) out of a byte
/// slice. Returns `None` if the terminating blank line hasn't arrived yet.
pub fn parse_request(buf: &[u8]) -> Result<Option<RequestHead>> {
    let Some(head_end) = find_header_end(buf) else {
        return Ok(None);
    };
    let text = std::str::from_utf8(&buf[..head_end])
        .map_err(|_| AcngError::MalformedHttp("request is not valid utf-8".into()))?;
    let mut lines = text.split("\r\n");
    let request_line = lines
        .next()
        .ok_or_else(|| AcngError::MalformedHttp("empty request".into()))?;

    let mut parts = request_line.split(' ');
    let raw_method = parts
        .next()
        .ok_or_else(|| AcngError::MalformedHttp("missing method".into()))?
        .to_string();
    let path = parts
        .next()
        .ok_or_else(|| AcngError::MalformedHttp("missing path".into()))?
        .to_string();
    let version_str = parts.next().unwrap_or("HTTP/1.0");
    let version = if version_str.trim() == "HTTP/1.1" {
        HttpVersion::Http11
    } else {
        HttpVersion::Http10
    };

    let method = match raw_method.as_str() {
        "GET" => Method::Get,
        "HEAD" => Method::Head,
        _ => Method::Other,
    };

    let headers = parse_header_lines(lines)?;

    Ok(Some(RequestHead {
        method,
        raw_method,
        path,
        version,
        headers,
    }))
}

#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub version: HttpVersion,
    pub status: RemoteStatus,
    pub headers: Headers,
}

/// Returns `(ResponseHead, bytes_consumed)` or `None` if incomplete.
pub fn parse_response(buf: &[u8]) -> Result<Option<(ResponseHead, usize)>> {
    let Some(head_end) = find_header_end(buf) else {
        return Ok(None);
    };
    let text = std::str::from_utf8(&buf[..head_end])
        .map_err(|_| AcngError::MalformedHttp("response is not valid utf-8".into()))?;
    let mut lines = text.split("\r\n");
    let status_line = lines
        .next()
        .ok_or_else(|| AcngError::MalformedHttp("empty response".into()))?;

    let mut parts = status_line.splitn(3, ' ');
    let version_str = parts
        .next()
        .ok_or_else(|| AcngError::MalformedHttp("missing http version".into()))?;
    let version = if version_str.trim() == "HTTP/1.0" {
        HttpVersion::Http10
    } else {
        HttpVersion::Http11
    };
    let code: u16 = parts
        .next()
        .ok_or_else(|| AcngError::MalformedHttp("missing status code".into()))?
        .parse()
        .map_err(|_| AcngError::MalformedHttp("non-numeric status code".into()))?;
    let message = parts.next().unwrap_or("").to_string();

    let headers = parse_header_lines(lines)?;

    Ok(Some((
        ResponseHead {
            version,
            status: RemoteStatus::new(code, message),
            headers,
        },
        head_end,
    )))
}

fn parse_header_lines<'a>(lines: impl Iterator<Item = &'a str>) -> Result<Headers> {
    let mut headers = Headers::default();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let Some(colon) = line.find(':') else {
            continue;
        };
        let name = line[..colon].trim().to_string();
        let value = line[colon + 1..].trim().to_string();
        headers.push(name, value);
    }
    Ok(headers)
}

/// Finds the offset just past the first `\r\n\r\n` (or `\n\n`), returning the
/// length of the header block excluding the terminator.
fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|p| p + 4)
        .or_else(|| {
            buf.windows(2)
                .position(|w| w == b"\n\n")
                .map(|p| p + 2)
        })
}

/// Synthesizes a status line + headers + trailing blank line, ready to
/// prefix a body.
pub fn format_response_head(version: HttpVersion, status: &RemoteStatus, headers: &Headers) -> Vec<u8> {
    let mut out = format!("{} {} {}\r\n", version.as_str(), status.code, status.message).into_bytes();
    for (k, v) in &headers.0 {
        out.extend_from_slice(k.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(v.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_get() {
        let raw = b"GET /debian/Release HTTP/1.1\r\nHost: example.com\r\nConnection: close\r\n\r\n";
        let req = parse_request(raw).unwrap().unwrap();
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.path, "/debian/Release");
        assert!(req.headers.wants_close());
    }

    #[test]
    fn incomplete_request_returns_none() {
        let raw = b"GET /x HTTP/1.1\r\nHost: example.com\r\n";
        assert!(parse_request(raw).unwrap().is_none());
    }

    #[test]
    fn parses_response_with_content_length() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 42\r\n\r\nbody-follows";
        let (head, consumed) = parse_response(raw).unwrap().unwrap();
        assert_eq!(head.status.code, 200);
        assert_eq!(head.headers.content_length(), Some(42));
        assert_eq!(&raw[consumed..], b"body-follows");
    }

    #[test]
    fn detects_chunked_transfer() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n";
        let (head, _) = parse_response(raw).unwrap().unwrap();
        assert!(head.headers.is_chunked());
    }

    #[test]
    fn either_connection_header_close_is_authoritative() {
        let mut h = Headers::default();
        h.push("Proxy-Connection", "close");
        assert!(h.wants_close());
    }
}
