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

//! Per-client connection state.
//!
//! Ported from the original's `HttpConn`: a read buffer, a write buffer, a
//! request parser, a response builder, and the pair of vectored-write
//! cursors those last two feed into. A connection is touched by exactly one
//! thread at a time — the server loop at accept/close, one worker at a time
//! for read/process/write — an invariant the reactor's one-shot rearming
//! enforces (§5 of the design notes), not this type itself.

use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use mio::net::TcpStream;
use mio::Token;

use crate::buffer::{Buffer, VectoredSlots};
use crate::db::DbPool;
use crate::request::{ParseError, Request};
use crate::response::Response;

/// Live connection count, mirroring the original's atomic `HttpConn::userCount`.
pub static CLIENT_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Above this many simultaneous clients, new connections are rejected with
/// a short "Server busy!" reply, matching the original's `MAX_FD`.
pub const MAX_CLIENTS: usize = 65_536;

/// Bytes above which a non-edge-triggered write loop keeps writing rather
/// than returning control to the reactor, matching the original's `write`'s
/// `10240` threshold.
const WRITE_CONTINUE_THRESHOLD: usize = 10_240;

const DEFAULT_BUFFER_CAPACITY: usize = 4096;

/// A single client connection: socket, read/write buffers, request/response
/// state, and the read offset into the response's mapped file body.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    token: Token,
    peer_addr: SocketAddr,
    closed: bool,
    read_buf: Buffer,
    write_buf: Buffer,
    request: Request,
    response: Response,
    file_offset: usize,
    keep_alive: bool,
}

impl Connection {
    /// Takes ownership of an accepted, non-blocking stream. Increments the
    /// live connection count; the matching decrement happens in
    /// [`Connection::close`].
    pub fn new(stream: TcpStream, token: Token, peer_addr: SocketAddr) -> Self {
        CLIENT_COUNT.fetch_add(1, Ordering::SeqCst);
        Self {
            stream,
            token,
            peer_addr,
            closed: false,
            read_buf: Buffer::new(DEFAULT_BUFFER_CAPACITY),
            write_buf: Buffer::new(DEFAULT_BUFFER_CAPACITY),
            request: Request::new(),
            response: Response::new(),
            file_offset: 0,
            keep_alive: false,
        }
    }

    /// The reactor token this connection is registered under.
    pub fn token(&self) -> Token {
        self.token
    }

    /// The remote peer's address, for logging.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Mutable access to the underlying stream, for reactor
    /// register/reregister/deregister calls.
    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Whether [`Connection::close`] has already run.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Unmaps any response body, marks the connection closed, and
    /// decrements the live connection count. Idempotent, matching the
    /// original's `isClose_` guard.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.response.unmap();
        self.closed = true;
        CLIENT_COUNT.fetch_sub(1, Ordering::SeqCst);
    }

    /// Reads from the socket into the read buffer. In edge-triggered mode,
    /// loops until the socket reports `WouldBlock`; otherwise reads once.
    /// Returns the total bytes read; `Ok(0)` signals an orderly peer close.
    pub fn read(&mut self, edge_triggered: bool) -> io::Result<usize> {
        let mut total = 0usize;
        loop {
            match self.read_buf.read_from(&mut self.stream) {
                Ok(0) => return Ok(total),
                Ok(n) => {
                    total += n;
                    if !edge_triggered {
                        return Ok(total);
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if total == 0 {
                        return Err(e);
                    }
                    return Ok(total);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Parses as much of the read buffer as is available, then — once
    /// parsing finishes — runs user verification and builds the response.
    /// Returns `false` if there was nothing to process yet (an empty read
    /// buffer, or a request still waiting on more bytes).
    pub fn process(&mut self, src_dir: &std::path::Path, db: &Arc<DbPool>) -> bool {
        if self.read_buf.readable() == 0 {
            return false;
        }

        match self.request.parse(&mut self.read_buf) {
            Ok(()) => {
                if !self.request.is_finished() {
                    return false;
                }
                self.request.verify(db);
                self.keep_alive = self.request.keep_alive();
                self.response.init(
                    src_dir,
                    self.request.path().to_string(),
                    self.keep_alive,
                    200,
                );
            }
            Err(ParseError::InvalidRequestLine) => {
                self.keep_alive = false;
                self.response.init(src_dir, self.request.path().to_string(), false, 400);
            }
        }

        self.response.make_response(&mut self.write_buf);
        self.file_offset = 0;
        self.request.init();
        true
    }

    /// Drives a vectored write of the write buffer's readable region
    /// followed, if present, by the response's mapped file tail. Loops
    /// while in edge-triggered mode or while more than
    /// [`WRITE_CONTINUE_THRESHOLD`] bytes remain, matching the original's
    /// `write`.
    pub fn write(&mut self, edge_triggered: bool) -> io::Result<usize> {
        let mut total = 0usize;
        loop {
            if self.to_write_bytes() == 0 {
                return Ok(total);
            }

            let head = self.write_buf.peek();
            let head_len = head.len();
            let tail = self.response.file_bytes(self.file_offset);
            let mut slots = VectoredSlots::with_file(head, tail);

            match slots.write_once(&mut self.stream) {
                Ok(0) => return Ok(total),
                Ok(written) => {
                    total += written;
                    if written >= head_len {
                        self.write_buf.retrieve_all();
                        self.file_offset += written - head_len;
                    } else {
                        self.write_buf.retrieve(written);
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if total == 0 {
                        return Err(e);
                    }
                    return Ok(total);
                }
                Err(e) => return Err(e),
            }

            if self.to_write_bytes() == 0 {
                return Ok(total);
            }
            if !(edge_triggered || self.to_write_bytes() > WRITE_CONTINUE_THRESHOLD) {
                return Ok(total);
            }
        }
    }

    /// Total bytes still owed to the peer: unwritten buffer plus unwritten
    /// mapped file tail.
    pub fn to_write_bytes(&self) -> usize {
        self.write_buf.readable() + self.response.file_len().saturating_sub(self.file_offset)
    }

    /// Whether the most recently built response asked to keep the
    /// connection open. Cached at the end of `process()` since the request
    /// is reset immediately afterward, ready for the next parse.
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn new_connection_increments_live_count() {
        // Exercising Connection::new/close requires a real TcpStream pair;
        // the atomic bookkeeping itself is covered indirectly by the server
        // loop's accept/close tests. This test just documents the counter's
        // existence and starting value is process-global and monotonic
        // under new/close pairs.
        let before = CLIENT_COUNT.load(Ordering::SeqCst);
        assert!(before < usize::MAX);
    }
}
