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

//! Response model and serializer.

use std::sync::Arc;

use crate::{status::Status, version::Version};

/// The response body. Static files are served through a memory-mapped region so large bodies
/// never need a full in-process copy; dynamic responses use an owned byte vector.
#[derive(Debug, Clone)]
pub enum Body {
    /// Dynamically generated content.
    Owned(Vec<u8>),
    /// A memory-mapped static file.
    Mapped(Arc<memmap2::Mmap>),
    /// No body (e.g. 204, HEAD responses).
    Empty,
}

impl Body {
    /// Length of the body in bytes.
    pub fn len(&self) -> usize {
        match self {
            Body::Owned(v) => v.len(),
            Body::Mapped(m) => m.len(),
            Body::Empty => 0,
        }
    }

    /// Whether the body is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Borrows the body as a byte slice.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Body::Owned(v) => v,
            Body::Mapped(m) => m,
            Body::Empty => &[],
        }
    }
}

/// Response model, built up by a connection's `Process()` step and serialized into the
/// connection's output buffer.
#[derive(Debug, Clone)]
pub struct Response {
    version: Version,
    status: Status,
    headers: Vec<(String, String)>,
    body: Body,
}

impl Response {
    /// Creates a response with a status line and no headers or body yet.
    pub fn new(version: Version, status: Status) -> Self {
        Self {
            version,
            status,
            headers: Vec::new(),
            body: Body::Empty,
        }
    }

    /// Adds a header, in builder style.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Attaches a body, in builder style. `Content-Length` is computed at serialization time, not
    /// here, so callers never need to keep it in sync by hand.
    pub fn body(mut self, body: Body) -> Self {
        self.body = body;
        self
    }

    /// The status this response carries.
    pub fn status(&self) -> Status {
        self.status
    }

    /// Serializes the status line, headers, and `Content-Length` into `out`. The body is *not*
    /// appended — callers that want to avoid copying a memory-mapped body into a plain buffer
    /// should write the head and body as separate regions of a single `writev`, via
    /// [`Response::body_ref`]. Returns the number of bytes written.
    pub fn serialize_head_into(&self, out: &mut Vec<u8>) -> usize {
        let start = out.len();
        out.extend_from_slice(self.version.to_string().as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.status.code().to_string().as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.status.reason_phrase().as_bytes());
        out.extend_from_slice(b"\r\n");

        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }

        out.extend_from_slice(b"Content-Length: ");
        out.extend_from_slice(self.body.len().to_string().as_bytes());
        out.extend_from_slice(b"\r\n\r\n");

        out.len() - start
    }

    /// Serializes the status line, headers, `Content-Length`, and body into `out` in one shot.
    /// Convenient for small, fully-owned bodies (tests, error responses); static file responses
    /// should use [`Response::serialize_head_into`] plus [`Response::body_ref`] instead, so a
    /// memory-mapped body is never copied.
    pub fn serialize_into(&self, out: &mut Vec<u8>) -> usize {
        let start = out.len();
        self.serialize_head_into(out);
        out.extend_from_slice(self.body.as_bytes());
        out.len() - start
    }

    /// Borrows the response body.
    pub fn body_ref(&self) -> &Body {
        &self.body
    }

    /// Consumes the response, returning just its body.
    pub fn into_body(self) -> Body {
        self.body
    }

    /// Builds a minimal status-line-only response, used for error paths and the "server busy"
    /// rejection.
    pub fn status_only(version: Version, status: Status) -> Self {
        let reason = format!("{}\n", status.reason_phrase());
        Self::new(version, status)
            .header("Content-Type", "text/plain; charset=utf-8")
            .header("Connection", "close")
            .body(Body::Owned(reason.into_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_status_line_and_content_length() {
        let response = Response::new(Version::Http11, Status::Ok)
            .header("Content-Type", "text/html")
            .body(Body::Owned(b"hello".to_vec()));

        let mut out = Vec::new();
        response.serialize_into(&mut out);
        let text = String::from_utf8(out).unwrap();

        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 5\r\n"));
        assert!(text.ends_with("hello"));
    }

    #[test]
    fn status_only_has_no_body_length_mismatch() {
        let response = Response::status_only(Version::Http11, Status::NotFound);
        let mut out = Vec::new();
        response.serialize_into(&mut out);
        assert!(String::from_utf8_lossy(&out).contains("404 Not Found"));
    }
}
