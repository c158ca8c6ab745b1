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

//! Per-connection state machine.
//!
//! ```text
//! NEW ──init──► READING ──parse_ok──► WRITING ──drain──► (keep_alive ? READING : CLOSED)
//!                 │                       │
//!                 └──read_err/hup─────────┴──write_err──► CLOSED
//! ```
//!
//! A `Connection` owns exactly one fd (via its `mio::net::TcpStream`), its read/write buffers, and
//! enough parser-facing state to resume a request across multiple non-blocking reads. It does not
//! know about the reactor's fd table or the timer wheel beyond carrying the [`TimerKey`] it was
//! assigned; wiring those together is the reactor's job.

use std::{
    io::{self, ErrorKind, IoSlice, Write},
    net::SocketAddr,
    sync::Arc,
};

use mio::{net::TcpStream, Token};
use parser::{
    request::ParseOutcome,
    response::{Body, Response},
    status::Status,
    version::Version,
};
use tracing::{info, trace};

use crate::{dbpool::DbPool, dispatch, static_files::StaticFiles, timer::TimerKey};

/// Shared, read-mostly context every connection needs to answer a request: where static files
/// live, and how to reach the database pool for the form dispatch.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Static file resolver rooted at the configured resource directory.
    pub static_files: Arc<StaticFiles>,
    /// Database pool backing the dynamic form dispatch.
    pub db_pool: Arc<DbPool>,
}

/// Outcome of a single `Process()` call.
#[derive(Debug, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// A response was produced and is ready to be written; the caller should re-arm for OUT.
    ReadyToWrite,
    /// The input buffer does not yet hold a complete request; the caller should re-arm for IN.
    WantMoreData,
}

/// Per-client connection state.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    addr: SocketAddr,
    token: Token,
    timer_key: TimerKey,
    input: crate::buffer::Buffer,
    output: crate::buffer::Buffer,
    pending_body: Body,
    body_written: usize,
    to_write: usize,
    keep_alive: bool,
    closed: bool,
    edge_triggered: bool,
    processing: bool,
}

const READ_BUFFER_CAPACITY: usize = 4096;
const WRITE_BUFFER_CAPACITY: usize = 4096;

impl Connection {
    /// `Init`: builds a fresh connection in the `READING` state for a just-accepted socket.
    pub fn new(
        stream: TcpStream,
        addr: SocketAddr,
        token: Token,
        timer_key: TimerKey,
        edge_triggered: bool,
    ) -> Self {
        Self {
            stream,
            addr,
            token,
            timer_key,
            input: crate::buffer::Buffer::new(READ_BUFFER_CAPACITY),
            output: crate::buffer::Buffer::new(WRITE_BUFFER_CAPACITY),
            pending_body: Body::Empty,
            body_written: 0,
            to_write: 0,
            keep_alive: false,
            closed: false,
            edge_triggered,
            processing: false,
        }
    }

    /// The mio token identifying this connection's registration.
    pub fn token(&self) -> Token {
        self.token
    }

    /// The timer wheel key tracking this connection's idle deadline.
    pub fn timer_key(&self) -> TimerKey {
        self.timer_key
    }

    /// Peer address, for logging.
    pub fn peer_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Whether the last completed request asked to keep the connection alive.
    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Whether `Close()` has already run.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Bytes still queued to be written (head + body).
    pub fn to_write(&self) -> usize {
        self.to_write
    }

    /// Whether a worker task is currently in flight for this connection, from the moment one is
    /// enqueued until its response (if any) has been fully written. At most one `Process()` call
    /// is ever allowed in flight per connection, so a second can't overwrite the first's
    /// still-unwritten output.
    pub fn is_processing(&self) -> bool {
        self.processing
    }

    /// Marks a worker task as started. Callers must check [`Connection::is_processing`] first,
    /// under the same lock acquisition, before enqueuing.
    pub fn mark_processing(&mut self) {
        self.processing = true;
    }

    /// Clears the in-flight marker, once `Process()` needed no response or its response has been
    /// fully written.
    pub fn clear_processing(&mut self) {
        self.processing = false;
    }

    /// Mutable access to the underlying stream, for registration with the multiplexer.
    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// `Read`: fills the input buffer from the socket. Under edge-triggered mode, loops until
    /// EAGAIN/EWOULDBLOCK to fully drain the socket buffer, since no further readiness event will
    /// arrive until new data is written by the peer. Under level-triggered mode, a single read is
    /// enough: another readiness event will arrive for a subsequent read.
    ///
    /// Returns the total number of bytes read. `Ok(0)` with `is_closed() == false` means EAGAIN
    /// was hit immediately; `Ok(0)` is never returned after a genuine peer close, which instead
    /// sets `closed` and is reported by a subsequent `is_closed()` check.
    pub fn read(&mut self) -> io::Result<usize> {
        let mut total = 0;
        loop {
            match self.input.read_fd(&mut self.stream) {
                Ok(0) => {
                    if total == 0 {
                        self.closed = true;
                    }
                    return Ok(total);
                }
                Ok(n) => {
                    total += n;
                    if !self.edge_triggered {
                        return Ok(total);
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(total),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// `Process()`: runs the parser against the input buffer. On a complete request, builds the
    /// response (static file or dynamic dispatch) into the output buffer and pending body, and
    /// returns [`ProcessOutcome::ReadyToWrite`]. On an incomplete request, consumes nothing and
    /// returns [`ProcessOutcome::WantMoreData`].
    pub fn process(&mut self, ctx: &RequestContext) -> ProcessOutcome {
        match parser::request::parse(self.input.readable()) {
            Ok(ParseOutcome::Incomplete) => ProcessOutcome::WantMoreData,
            Ok(ParseOutcome::Complete(request, consumed)) => {
                self.input.retrieve(consumed);
                self.keep_alive = request.keep_alive;

                let response = if let Some(result) = dispatch::dispatch(&ctx.db_pool, &request) {
                    Response::new(Version::Http11, result.status)
                        .header("Content-Type", "text/plain; charset=utf-8")
                        .body(result.body)
                } else {
                    match ctx.static_files.resolve(request.path()) {
                        crate::static_files::Resolved::Found { body, content_type } => {
                            Response::new(Version::Http11, Status::Ok)
                                .header("Content-Type", content_type)
                                .body(body)
                        }
                        resolved => {
                            self.keep_alive = false;
                            let status = crate::static_files::status_for(&resolved);
                            Response::new(Version::Http11, status)
                                .header("Content-Type", "text/plain; charset=utf-8")
                                .body(Body::Empty)
                        }
                    }
                };

                self.prepare_response(response);
                ProcessOutcome::ReadyToWrite
            }
            Err(_) => {
                self.keep_alive = false;
                self.prepare_response(Response::status_only(Version::Http11, Status::BadRequest));
                ProcessOutcome::ReadyToWrite
            }
        }
    }

    /// Loads a response into the output buffer (head) and pending body (payload), ready for
    /// `Write()`. Resets the write cursor.
    fn prepare_response(&mut self, response: Response) {
        let mut head = Vec::new();
        response.serialize_head_into(&mut head);
        self.output.append(&head);
        let body_len = response.body_ref().len();
        self.pending_body = response.into_body();
        self.body_written = 0;
        self.to_write = head.len() + body_len;
    }

    /// `Write()`: issues a single `writev` over the head (output buffer) and body (pending body)
    /// regions. Updates both cursors and `to_write`. Returns bytes written this call.
    pub fn write(&mut self) -> io::Result<usize> {
        let head = self.output.readable();
        let body = self.pending_body.as_bytes();
        let body_remaining = &body[self.body_written..];

        if head.is_empty() && body_remaining.is_empty() {
            return Ok(0);
        }

        let slices = [IoSlice::new(head), IoSlice::new(body_remaining)];
        match self.stream.write_vectored(&slices) {
            Ok(n) => {
                let from_head = n.min(head.len());
                self.output.retrieve(from_head);
                self.body_written += n - from_head;
                self.to_write = self.to_write.saturating_sub(n);
                Ok(n)
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(0),
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// Whether the full response has been drained to the socket.
    pub fn write_complete(&self) -> bool {
        self.to_write == 0
    }

    /// Resets per-request write state so the connection can read the next pipelined request on a
    /// keep-alive connection.
    pub fn reset_for_next_request(&mut self) {
        self.pending_body = Body::Empty;
        self.body_written = 0;
        self.to_write = 0;
    }

    /// `Close()`: closes the fd exactly once. Idempotent from the caller's perspective; a second
    /// call is a no-op rather than a double-close.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        trace!(peer = %self.addr, "connection closed");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if !self.closed {
            info!(peer = %self.addr, "connection dropped without explicit close");
        }
    }
}
