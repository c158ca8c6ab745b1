// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! HTTP/1.x request parsing.
//!
//! The parser consumes a byte slice and either reports that it needs more data
//! ([`ParseOutcome::Incomplete`]) or returns a fully-formed [`Request`] along with the number of
//! bytes consumed from the front of the slice. Chunked transfer encoding on the request side is
//! out of scope; only `Content-Length` bodies are understood.

use std::collections::HashMap;

use crate::{get_non_whitespace_pos, method::Method, version::Version, ParseError};

/// A single HTTP header, as parsed from the wire.
#[derive(Debug, Clone)]
pub struct Header {
    /// Header field name, lower-cased for case-insensitive lookups.
    pub name: String,
    /// Header field value, with surrounding whitespace trimmed.
    pub value: String,
}

/// A fully parsed HTTP/1.x request.
#[derive(Debug, Clone)]
pub struct Request {
    /// Request method.
    pub method: Method,
    /// Request target, e.g. `/index.html` or `/login?user=a`.
    pub target: String,
    /// Request version.
    pub version: Version,
    /// Headers in wire order.
    pub headers: Vec<Header>,
    /// Request body, if any (drawn from `Content-Length` bytes following the header block).
    pub body: Vec<u8>,
    /// Whether the connection should be kept alive after this request completes, per
    /// `Connection` header semantics and the version default.
    pub keep_alive: bool,
}

impl Request {
    /// Looks up a header by case-insensitive name, returning the first match.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    /// Parses `application/x-www-form-urlencoded` bodies into a name -> value map. Used by the
    /// simple form dispatch against the database pool.
    pub fn form_fields(&self) -> HashMap<String, String> {
        let body = String::from_utf8_lossy(&self.body);
        body.split('&')
            .filter_map(|pair| {
                let mut parts = pair.splitn(2, '=');
                let key = parts.next()?;
                let value = parts.next().unwrap_or("");
                if key.is_empty() {
                    return None;
                }
                Some((url_decode(key), url_decode(value)))
            })
            .collect()
    }

    /// Splits `target` into the path component, discarding any query string.
    pub fn path(&self) -> &str {
        self.target.split('?').next().unwrap_or("/")
    }
}

fn url_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                if let Some(byte) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    out.push(byte);
                    i += 3;
                } else {
                    out.push(bytes[i]);
                    i += 1;
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Result of attempting to parse a request out of a buffer.
#[derive(Debug)]
pub enum ParseOutcome {
    /// A complete request was parsed, consuming this many bytes from the front of the buffer.
    Complete(Box<Request>, usize),
    /// The buffer does not yet contain a complete request; the caller should read more.
    Incomplete,
}

const MAX_HEADERS: usize = 64;

/// Attempts to parse one HTTP/1.x request from the front of `buf`.
///
/// This is the sole entry point the connection state machine's `Process()` step calls. It never
/// panics on malformed input; malformed requests produce a [`ParseError`].
pub fn parse(buf: &[u8]) -> Result<ParseOutcome, ParseError> {
    let head_end = match find_header_end(buf) {
        Some(pos) => pos,
        None => return Ok(ParseOutcome::Incomplete),
    };

    let head = &buf[..head_end];
    let mut lines = split_lines(head);

    let request_line = lines.next().ok_or(ParseError::Method)?;
    let (method, target, version) = parse_request_line(request_line)?;

    let mut headers = Vec::with_capacity(8);
    for line in lines {
        if headers.len() >= MAX_HEADERS {
            return Err(ParseError::HeaderName);
        }
        headers.push(parse_header(line)?);
    }

    let body_start = head_end + 4; // skip the blank line's CRLFCRLF
    let content_length = headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("content-length"))
        .map(|h| h.value.parse::<usize>().map_err(|_| ParseError::HeaderValue))
        .transpose()?
        .unwrap_or(0);

    if buf.len() < body_start + content_length {
        return Ok(ParseOutcome::Incomplete);
    }

    let body = buf[body_start..body_start + content_length].to_vec();
    let keep_alive = resolve_keep_alive(version, &headers);

    let request = Request {
        method,
        target,
        version,
        headers,
        body,
        keep_alive,
    };

    Ok(ParseOutcome::Complete(
        Box::new(request),
        body_start + content_length,
    ))
}

fn resolve_keep_alive(version: Version, headers: &[Header]) -> bool {
    let connection = headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("connection"))
        .map(|h| h.value.to_ascii_lowercase());

    match connection.as_deref() {
        Some("close") => false,
        Some("keep-alive") => true,
        _ => version == Version::Http11,
    }
}

/// Finds the offset of the `\r\n\r\n` terminating the header block, if present.
fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn split_lines(head: &[u8]) -> impl Iterator<Item = &[u8]> {
    head.split(|&b| b == b'\n')
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
        .filter(|line| !line.is_empty())
}

fn parse_request_line(line: &[u8]) -> Result<(Method, String, Version), ParseError> {
    let mut parts = line.split(|&b| b == b' ').filter(|p| !p.is_empty());
    let method_tok = parts.next().ok_or(ParseError::Method)?;
    let target_tok = parts.next().ok_or(ParseError::Target)?;
    let version_tok = parts.next().ok_or(ParseError::Version)?;

    let method = Method::parse(method_tok)?;
    let target = std::str::from_utf8(target_tok)
        .map_err(|_| ParseError::Target)?
        .to_owned();
    let version = Version::parse(version_tok)?;

    Ok((method, target, version))
}

fn parse_header(line: &[u8]) -> Result<Header, ParseError> {
    let colon = line.iter().position(|&b| b == b':').ok_or(ParseError::HeaderName)?;
    let (name, rest) = line.split_at(colon);
    let value = &rest[1..];

    if name.is_empty() || !name.iter().all(|&b| is_token_byte(b)) {
        return Err(ParseError::HeaderName);
    }

    let value_start = get_non_whitespace_pos(value, 0).unwrap_or(0);
    let value = &value[value_start..];
    let value = std::str::from_utf8(value)
        .map_err(|_| ParseError::HeaderValue)?
        .trim_end();

    Ok(Header {
        name: std::str::from_utf8(name)
            .map_err(|_| ParseError::HeaderName)?
            .to_ascii_lowercase(),
        value: value.to_owned(),
    })
}

fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_get() {
        let raw = b"GET /index.html HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n";
        match parse(raw).unwrap() {
            ParseOutcome::Complete(req, consumed) => {
                assert_eq!(req.method, Method::Get);
                assert_eq!(req.target, "/index.html");
                assert_eq!(req.version, Version::Http11);
                assert!(!req.keep_alive);
                assert_eq!(consumed, raw.len());
            }
            ParseOutcome::Incomplete => panic!("expected complete request"),
        }
    }

    #[test]
    fn keep_alive_defaults_for_http11() {
        let raw = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n";
        match parse(raw).unwrap() {
            ParseOutcome::Complete(req, _) => assert!(req.keep_alive),
            ParseOutcome::Incomplete => panic!("expected complete request"),
        }
    }

    #[test]
    fn incomplete_without_terminator() {
        let raw = b"GET / HTTP/1.1\r\nHost: x\r\n";
        assert!(matches!(parse(raw).unwrap(), ParseOutcome::Incomplete));
    }

    #[test]
    fn waits_for_full_body() {
        let raw = b"POST /login HTTP/1.1\r\nContent-Length: 20\r\n\r\nuser=a&pass=b";
        assert!(matches!(parse(raw).unwrap(), ParseOutcome::Incomplete));
    }

    #[test]
    fn parses_form_body_once_complete() {
        let body = b"user=alice&pass=hunter2";
        let raw = format!(
            "POST /login HTTP/1.1\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            String::from_utf8_lossy(body)
        );
        match parse(raw.as_bytes()).unwrap() {
            ParseOutcome::Complete(req, consumed) => {
                let fields = req.form_fields();
                assert_eq!(fields.get("user").map(String::as_str), Some("alice"));
                assert_eq!(fields.get("pass").map(String::as_str), Some("hunter2"));
                assert_eq!(consumed, raw.len());
            }
            ParseOutcome::Incomplete => panic!("expected complete request"),
        }
    }

    #[test]
    fn rejects_malformed_header() {
        let raw = b"GET / HTTP/1.1\r\nBadHeaderNoColon\r\n\r\n";
        assert!(matches!(parse(raw), Err(ParseError::HeaderName)));
    }
}
