// Library for concurrent I/O resource management using reactor pattern.
//
// SPDX-License-Identifier: Apache-2.0
//
// Written in 2021-2025 by
//     Dr. Maxim Orlovsky <orlovsky@ubideco.org>
//     Alexis Sellier <alexis@cloudhead.io>
//
// Copyright 2022-2025 UBIDECO Labs, InDCS, Lugano, Switzerland. All Rights reserved.
// Copyright 2021-2023 Alexis Sellier <alexis@cloudhead.io>. All Rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not use this file except
// in compliance with the License. You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software distributed under the License
// is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express
// or implied. See the License for the specific language governing permissions and limitations under
// the License.

//! Pooled byte buffers used by socket read and write queues.
//!
//! Buffers are owned values which move between the pool, socket queues and
//! the application. Releasing a buffer clears its content but keeps the
//! allocation, so steady-state operation does not allocate.

/// An owned, growable byte sequence with a consumed-bytes cursor.
///
/// The cursor tracks how much of the buffer has already been written to the
/// kernel, which is what makes partial writes safe: a short `write(2)` only
/// advances the cursor, and the next writable tick resumes from there.
#[derive(Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct Buffer {
    data: Vec<u8>,
    consumed: usize,
}

impl Buffer {
    pub(crate) fn new() -> Self { Buffer::default() }

    /// Creates a buffer holding a copy of `bytes`, bypassing the pool.
    ///
    /// Intended for tests and one-off conversions; reactor code paths obtain
    /// buffers from [`BufferPool::acquire`] instead.
    pub fn from_slice(bytes: &[u8]) -> Self {
        Buffer {
            data: bytes.to_vec(),
            consumed: 0,
        }
    }

    /// Appends bytes at the end of the buffer.
    pub fn append(&mut self, bytes: &[u8]) { self.data.extend_from_slice(bytes); }

    /// Total number of bytes stored, including already-consumed ones.
    pub fn len(&self) -> usize { self.data.len() }

    pub fn is_empty(&self) -> bool { self.data.is_empty() }

    /// Byte at `pos`, or `None` past the end.
    pub fn get(&self, pos: usize) -> Option<u8> { self.data.get(pos).copied() }

    /// Overwrites the byte at `pos`. Returns `false` if `pos` is out of range.
    pub fn set(&mut self, pos: usize, byte: u8) -> bool {
        match self.data.get_mut(pos) {
            Some(b) => {
                *b = byte;
                true
            }
            None => false,
        }
    }

    /// The full stored content.
    pub fn as_bytes(&self) -> &[u8] { &self.data }

    /// The part of the buffer not yet consumed by a writer.
    pub fn unread(&self) -> &[u8] { &self.data[self.consumed..] }

    /// Advances the consumed cursor after a (possibly partial) write.
    pub fn advance(&mut self, n: usize) { self.consumed = (self.consumed + n).min(self.data.len()); }

    /// Whether every stored byte has been consumed.
    pub fn is_drained(&self) -> bool { self.consumed >= self.data.len() }

    /// Drops the content and resets the cursor, keeping the allocation.
    pub fn clear(&mut self) {
        self.data.clear();
        self.consumed = 0;
    }
}

/// Counters describing pool usage.
///
/// Conservation invariant: `allocated == free + in_use` at all times.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct PoolStats {
    /// Buffers ever allocated by the pool.
    pub allocated: usize,
    /// Buffers currently sitting on the free list.
    pub free: usize,
    /// Buffers currently held by sockets or the application.
    pub in_use: usize,
}

/// Free-list pool of [`Buffer`]s.
///
/// Single-threaded: the pool is owned by the reactor and only ever touched
/// from the reactor thread, so no locking is involved. Buffers handed out by
/// [`BufferPool::acquire`] must eventually come back through
/// [`BufferPool::release`] to keep the conservation counters meaningful.
#[derive(Debug, Default)]
pub struct BufferPool {
    free: Vec<Buffer>,
    allocated: usize,
}

impl BufferPool {
    pub fn new() -> Self { BufferPool::default() }

    /// Returns a cleared buffer, reusing a released one when available.
    pub fn acquire(&mut self) -> Buffer {
        match self.free.pop() {
            Some(buf) => buf,
            None => {
                self.allocated += 1;
                Buffer::new()
            }
        }
    }

    /// Clears `buf` and pushes it onto the free list.
    pub fn release(&mut self, mut buf: Buffer) {
        buf.clear();
        self.free.push(buf);
    }

    /// Releases a batch of buffers, e.g. a socket's queues on teardown.
    pub fn release_all(&mut self, bufs: impl IntoIterator<Item = Buffer>) {
        for buf in bufs {
            self.release(buf);
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            allocated: self.allocated,
            free: self.free.len(),
            in_use: self.allocated - self.free.len(),
        }
    }
}

/// Concatenates the full content of a buffer list into one byte vector.
pub fn concat(buffers: &[Buffer]) -> Vec<u8> {
    let mut out = Vec::with_capacity(buffers.iter().map(Buffer::len).sum());
    for buf in buffers {
        out.extend_from_slice(buf.as_bytes());
    }
    out
}
