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

//! Growable byte buffer with separate read/write cursors.
//!
//! Readable region is `[read_pos, write_pos)`, writable region is
//! `[write_pos, capacity)`, prependable region is `[0, read_pos)`. The
//! invariant `read_pos <= write_pos <= capacity` holds across every
//! operation below.

use std::io::{self, IoSlice, IoSliceMut, Read, Write};

/// Size of the stack-allocated overflow slot used by [`Buffer::read_from`].
const OVERFLOW_BUF_SIZE: usize = 65_535;

/// A growable byte buffer supporting vectored refill from, and drain to, a
/// readable/writable stream.
#[derive(Debug, Clone)]
pub struct Buffer {
    storage: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl Buffer {
    /// Creates a buffer with `capacity` bytes pre-allocated.
    pub fn new(capacity: usize) -> Self {
        Self { storage: vec![0; capacity], read_pos: 0, write_pos: 0 }
    }

    /// Bytes available to read.
    #[inline]
    pub fn readable(&self) -> usize {
        self.write_pos - self.read_pos
    }

    /// Bytes available to write before the buffer must grow or compact.
    #[inline]
    pub fn writable(&self) -> usize {
        self.storage.len() - self.write_pos
    }

    /// Bytes already consumed and free to be reclaimed by compaction.
    #[inline]
    pub fn prependable(&self) -> usize {
        self.read_pos
    }

    /// Pointer to the head of the readable region.
    #[inline]
    pub fn peek(&self) -> &[u8] {
        &self.storage[self.read_pos..self.write_pos]
    }

    /// Advances the read cursor by `n` bytes (clamped to what is readable).
    pub fn retrieve(&mut self, n: usize) {
        let n = n.min(self.readable());
        self.read_pos += n;
        if self.read_pos == self.write_pos {
            self.read_pos = 0;
            self.write_pos = 0;
        }
    }

    /// Resets both cursors to zero and clears the storage.
    pub fn retrieve_all(&mut self) {
        self.storage.iter_mut().for_each(|b| *b = 0);
        self.read_pos = 0;
        self.write_pos = 0;
    }

    /// Returns the readable region decoded as UTF-8 (lossily) and resets the
    /// buffer, in one step. The corrected contract for the original
    /// `RetrieveAllToStr`, which built a string and never returned it.
    pub fn retrieve_all_to_string(&mut self) -> String {
        let s = String::from_utf8_lossy(self.peek()).into_owned();
        self.retrieve_all();
        s
    }

    /// Appends `bytes`, growing or compacting the storage first if needed.
    pub fn append(&mut self, bytes: &[u8]) {
        self.ensure_writable(bytes.len());
        let start = self.write_pos;
        self.storage[start..start + bytes.len()].copy_from_slice(bytes);
        self.write_pos += bytes.len();
    }

    /// Advances the write cursor by `n` bytes without copying; used after a
    /// direct write into the writable region (e.g. via [`Buffer::read_from`]).
    pub fn mark_written(&mut self, n: usize) {
        self.write_pos = (self.write_pos + n).min(self.storage.len());
    }

    /// Mutable slice over the current writable region.
    pub fn writable_slice(&mut self) -> &mut [u8] {
        let start = self.write_pos;
        &mut self.storage[start..]
    }

    /// Guarantees at least `n` writable bytes by compacting the readable
    /// region to offset zero if that alone suffices, otherwise growing the
    /// backing storage.
    pub fn ensure_writable(&mut self, n: usize) {
        if self.writable() >= n {
            return;
        }
        if self.writable() + self.prependable() < n {
            self.storage.resize(self.write_pos + n + 1, 0);
            return;
        }
        self.compact();
    }

    /// Copies the readable region to offset zero and resets cursors so that
    /// `writable()` becomes `capacity - readable()`.
    fn compact(&mut self) {
        let readable = self.readable();
        self.storage.copy_within(self.read_pos..self.write_pos, 0);
        self.read_pos = 0;
        self.write_pos = readable;
    }

    /// Two-slot scatter read: slot 0 is the current writable region, slot 1
    /// is a stack-allocated 65535-byte overflow. Bounds the syscall count to
    /// one per call regardless of how much data is actually pending, per the
    /// original's `Buffer::ReadFd`.
    pub fn read_from<R: Read>(&mut self, reader: &mut R) -> io::Result<usize> {
        let writable = self.writable();
        let mut overflow = [0u8; OVERFLOW_BUF_SIZE];

        let n = {
            let mut slices = [
                IoSliceMut::new(self.writable_slice()),
                IoSliceMut::new(&mut overflow),
            ];
            reader.read_vectored(&mut slices)?
        };

        if n <= writable {
            self.mark_written(n);
        } else {
            self.mark_written(writable);
            self.append(&overflow[..n - writable]);
        }

        Ok(n)
    }

    /// Drains the readable region with a single write syscall, advancing the
    /// read cursor by the number of bytes actually accepted.
    pub fn write_to<W: Write>(&mut self, writer: &mut W) -> io::Result<usize> {
        let n = writer.write(self.peek())?;
        self.retrieve(n);
        Ok(n)
    }
}

/// A fixed two-slot vectored write cursor over a buffer's readable region
/// and, optionally, a memory-mapped file tail. Mirrors the original's
/// `iov_[2]` pair advanced across repeated `writev` calls.
#[derive(Debug, Default)]
pub struct VectoredSlots<'a> {
    slots: Vec<&'a [u8]>,
}

impl<'a> VectoredSlots<'a> {
    /// Builds a vectored write with just the buffer's readable region.
    pub fn single(buf: &'a [u8]) -> Self {
        Self { slots: vec![buf] }
    }

    /// Builds a vectored write with the buffer's readable region followed
    /// by a file body.
    pub fn with_file(buf: &'a [u8], file: &'a [u8]) -> Self {
        Self { slots: vec![buf, file] }
    }

    /// Total bytes remaining across all slots.
    pub fn remaining(&self) -> usize {
        self.slots.iter().map(|s| s.len()).sum()
    }

    /// Writes once, advancing the internal slots by however many bytes the
    /// writer accepted. Returns the number of bytes written.
    pub fn write_once<W: Write>(&mut self, writer: &mut W) -> io::Result<usize> {
        let io_slices: Vec<IoSlice<'_>> = self.slots.iter().map(|s| IoSlice::new(s)).collect();
        let n = writer.write_vectored(&io_slices)?;
        self.advance(n);
        Ok(n)
    }

    fn advance(&mut self, mut n: usize) {
        let mut i = 0;
        while n > 0 && i < self.slots.len() {
            let len = self.slots[i].len();
            if n >= len {
                n -= len;
                self.slots[i] = &[];
                i += 1;
            } else {
                self.slots[i] = &self.slots[i][n..];
                n = 0;
            }
        }
    }
}
