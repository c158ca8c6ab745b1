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

#![deny(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unused_imports
)]

//! HTTP/1.1 request parsing and response serialization.
//!
//! This crate is the wire-format collaborator the networking core treats as opaque: it knows
//! nothing about sockets, reactors, or buffers beyond the byte slices it is handed. Chunked
//! transfer encoding on the request side, HTTP/2, and HTTP/3 are out of scope.

use std::fmt::Display;

pub mod method;
pub mod request;
pub mod response;
pub mod status;
pub mod version;

/// Possible failures while parsing a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// Invalid or unrecognized byte sequence in the method.
    Method,
    /// Invalid byte in the request target.
    Target,
    /// Invalid or unsupported HTTP version.
    Version,
    /// Invalid byte in a header name.
    HeaderName,
    /// Invalid byte in a header value.
    HeaderValue,
    /// Invalid or missing new line.
    NewLine,
}

impl ParseError {
    fn description_str(self) -> &'static str {
        match self {
            ParseError::Method => "invalid token in method",
            ParseError::Target => "invalid token in target",
            ParseError::Version => "invalid or unsupported version",
            ParseError::HeaderName => "invalid token in header name",
            ParseError::HeaderValue => "invalid token in header value",
            ParseError::NewLine => "invalid or missing new line",
        }
    }
}

impl Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.description_str())
    }
}

impl std::error::Error for ParseError {}

/// Finds the offset of the next non-whitespace character in `buf`, starting at `start`.
///
/// In RFC 9112 Section 3, this is defined as any SP, HTAB, VT, FF, or CR without LF.
pub(crate) fn get_non_whitespace_pos(buf: &[u8], start: usize) -> Option<usize> {
    buf.iter()
        .skip(start)
        .position(|&b| !matches!(b, b' ' | b'\t' | 0x0b | 0x0c | b'\r'))
        .map(|pos| pos + start)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_non_whitespace() {
        assert_eq!(get_non_whitespace_pos(b"   x", 0), Some(3));
        assert_eq!(get_non_whitespace_pos(b"x", 0), Some(0));
        assert_eq!(get_non_whitespace_pos(b"   ", 0), None);
    }
}
