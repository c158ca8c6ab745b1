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

//! Growable, contiguous scatter-gather byte buffer.
//!
//! A `Buffer` tracks `read_pos <= write_pos <= capacity`. The readable region is
//! `[read_pos, write_pos)`, the prependable region is `[0, read_pos)`, and the writable region is
//! `[write_pos, capacity)`. `read_fd`/`write_fd` drive vectored I/O directly against a `Read +
//! Write` socket, pairing the buffer's writable tail with a stack-allocated spill region so a
//! single syscall can drain far more than the buffer currently has room for.

use std::io::{ErrorKind, IoSlice, IoSliceMut, Read, Write};

const INITIAL_CAPACITY: usize = 1024;
const SPILL_CAPACITY: usize = 64 * 1024;

/// A growable byte buffer with separate read and write cursors.
#[derive(Debug)]
pub struct Buffer {
    data: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl Buffer {
    /// Creates a new buffer with at least `capacity` bytes available.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity.max(INITIAL_CAPACITY)],
            read_pos: 0,
            write_pos: 0,
        }
    }

    /// Number of bytes available to read.
    pub fn readable_bytes(&self) -> usize {
        self.write_pos - self.read_pos
    }

    /// Number of bytes available to write without growing.
    pub fn writable_bytes(&self) -> usize {
        self.data.len() - self.write_pos
    }

    /// Number of bytes available in the prependable region.
    pub fn prependable_bytes(&self) -> usize {
        self.read_pos
    }

    /// Borrows the readable region.
    pub fn readable(&self) -> &[u8] {
        &self.data[self.read_pos..self.write_pos]
    }

    /// Ensures at least `need` more bytes are writable, growing or compacting as necessary.
    pub fn ensure_writable(&mut self, need: usize) {
        if self.writable_bytes() >= need {
            return;
        }

        if self.writable_bytes() + self.prependable_bytes() < need {
            let new_len = (self.data.len() + need).next_power_of_two();
            self.data.resize(new_len, 0);
        } else {
            self.compact();
        }
    }

    /// Shifts the readable region down to offset 0, reclaiming the prependable region.
    fn compact(&mut self) {
        if self.read_pos == 0 {
            return;
        }
        self.data.copy_within(self.read_pos..self.write_pos, 0);
        self.write_pos -= self.read_pos;
        self.read_pos = 0;
    }

    /// Appends `bytes` to the writable region, growing as needed.
    pub fn append(&mut self, bytes: &[u8]) {
        self.ensure_writable(bytes.len());
        let end = self.write_pos + bytes.len();
        self.data[self.write_pos..end].copy_from_slice(bytes);
        self.write_pos = end;
    }

    /// Marks `n` bytes as written past `write_pos` (used after a direct vectored read).
    fn mark_written(&mut self, n: usize) {
        self.write_pos = self.data.len().min(self.write_pos + n);
    }

    /// Advances `read_pos` by `n`. If the buffer is fully drained, both cursors reset to 0.
    pub fn retrieve(&mut self, n: usize) {
        self.read_pos = self.write_pos.min(self.read_pos + n);
        if self.read_pos == self.write_pos {
            self.read_pos = 0;
            self.write_pos = 0;
        }
    }

    /// Retrieves up to `n` readable bytes as an owned, UTF-8-lossy string, advancing `read_pos`.
    pub fn retrieve_as_string(&mut self, n: usize) -> String {
        let n = n.min(self.readable_bytes());
        let s = String::from_utf8_lossy(&self.data[self.read_pos..self.read_pos + n]).into_owned();
        self.retrieve(n);
        s
    }

    /// Issues a vectored read from `source` into the buffer's writable tail, spilling overflow
    /// into a stack-allocated 64 KiB region. Returns `(bytes_read, error_kind)`: `bytes_read ==
    /// 0` with `error_kind` of `WouldBlock` signals EAGAIN; any other `Err` is a hard failure.
    pub fn read_fd<S: Read>(&mut self, source: &mut S) -> std::io::Result<usize> {
        self.ensure_writable(4096);

        let mut spill = [0u8; SPILL_CAPACITY];
        let mut slices = [
            IoSliceMut::new(&mut self.data[self.write_pos..]),
            IoSliceMut::new(&mut spill),
        ];

        match source.read_vectored(&mut slices) {
            Ok(0) => Ok(0),
            Ok(n) => {
                let in_buf = n.min(self.writable_bytes());
                self.mark_written(in_buf);
                let overflow = n - in_buf;
                if overflow > 0 {
                    self.append(&spill[..overflow]);
                }
                Ok(n)
            }
            Err(e) => Err(e),
        }
    }

    /// Writes the readable region to `sink` in a single syscall. Partial writes leave the buffer
    /// intact from `read_pos + n` onward. Returns the number of bytes written.
    pub fn write_fd<S: Write>(&mut self, sink: &mut S) -> std::io::Result<usize> {
        if self.readable_bytes() == 0 {
            return Ok(0);
        }

        let slice = [IoSlice::new(self.readable())];
        match sink.write_vectored(&slice) {
            Ok(n) => {
                self.retrieve(n);
                Ok(n)
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new(INITIAL_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn cursors_respect_invariant() {
        let mut buf = Buffer::new(16);
        buf.append(b"hello world");
        assert!(buf.read_pos <= buf.write_pos);
        assert!(buf.write_pos <= buf.data.len());
        assert_eq!(buf.readable_bytes(), 11);
    }

    #[test]
    fn retrieve_all_resets_cursors() {
        let mut buf = Buffer::new(16);
        buf.append(b"abc");
        buf.retrieve(3);
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.read_pos, 0);
        assert_eq!(buf.write_pos, 0);
    }

    #[test]
    fn round_trips_appended_data() {
        let mut buf = Buffer::new(4);
        buf.append(b"abc");
        buf.append(b"defgh");
        let mut out = String::new();
        out.push_str(&buf.retrieve_as_string(3));
        out.push_str(&buf.retrieve_as_string(5));
        assert_eq!(out, "abcdefgh");
    }

    #[test]
    fn grows_past_small_initial_capacity() {
        let mut buf = Buffer::new(2);
        let payload = vec![7u8; 10_000];
        buf.append(&payload);
        assert_eq!(buf.readable_bytes(), 10_000);
    }

    #[test]
    fn compacts_instead_of_growing_when_prependable_suffices() {
        let mut buf = Buffer::new(16);
        buf.append(b"0123456789abcdef");
        buf.retrieve(12);
        let cap_before = buf.data.len();
        buf.append(b"xyz");
        assert_eq!(buf.data.len(), cap_before);
    }

    #[test]
    fn read_fd_drains_small_stream() {
        let mut cursor = Cursor::new(b"hello".to_vec());
        let mut buf = Buffer::new(16);
        let n = buf.read_fd(&mut cursor).unwrap();
        assert_eq!(n, 5);
        assert_eq!(buf.readable(), b"hello");
    }

    #[test]
    fn write_fd_drains_readable_region() {
        let mut buf = Buffer::new(16);
        buf.append(b"hello");
        let mut out = Vec::new();
        let n = buf.write_fd(&mut out).unwrap();
        assert_eq!(n, 5);
        assert_eq!(out, b"hello");
        assert_eq!(buf.readable_bytes(), 0);
    }
}
