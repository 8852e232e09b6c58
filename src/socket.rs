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

//! Non-blocking connected TCP socket with buffered read and write queues.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};

use socket2::{Domain, Protocol, Type};

use crate::buffer::{Buffer, BufferPool};
use crate::reactor::PollableId;

/// Bytes read from the kernel per readable tick.
pub(crate) const READ_CHUNK: usize = 4096;

/// Once the tail read buffer reaches this size a fresh buffer is appended.
pub(crate) const READ_SOFT_LIMIT: usize = 4096;

/// Outcome of one non-blocking read attempt.
pub(crate) enum ReadOutcome {
    /// Bytes were appended to the tail read buffer.
    Data,
    /// The peer performed an orderly shutdown (read returned zero).
    Closed,
    /// Nothing to read right now (EAGAIN / EINTR).
    WouldBlock,
    /// Fatal I/O error.
    Err(io::Error),
}

/// A connected TCP socket, client or server side.
///
/// The descriptor is non-blocking whenever present. Bytes read from the
/// kernel accumulate in `pending_reads` until the application takes them;
/// bytes queued by the application accumulate in `pending_writes` until the
/// kernel accepts them. POLLOUT interest is reconciled externally by the
/// socket manager — nothing in here talks to the reactor.
#[derive(Debug)]
pub struct Socket {
    id: PollableId,
    stream: Option<TcpStream>,
    remote_addr: String,
    remote_port: u16,
    pending_reads: VecDeque<Buffer>,
    pending_writes: VecDeque<Buffer>,
    close_when_drained: bool,
}

impl Socket {
    pub(crate) fn new(id: PollableId) -> Self {
        Socket {
            id,
            stream: None,
            remote_addr: String::new(),
            remote_port: 0,
            pending_reads: empty!(),
            pending_writes: empty!(),
            close_when_drained: false,
        }
    }

    pub fn id(&self) -> PollableId { self.id }

    /// Opens a non-blocking connection to `host:port`.
    ///
    /// Name resolution is synchronous. EINPROGRESS is success: the connect
    /// completes in the background and the first write readiness (or error
    /// condition) reports the outcome through the normal event flow.
    pub fn connect(&mut self, host: &str, port: u16) -> io::Result<()> {
        let addr = (host, port)
            .to_socket_addrs()?
            .find(SocketAddr::is_ipv4)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no IPv4 address resolved"))?;

        let sock = socket2::Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        sock.set_nonblocking(true)?;
        match sock.connect(&addr.into()) {
            Ok(()) => {}
            Err(err) if err.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => return Err(err),
        }

        self.stream = Some(sock.into());
        self.remote_addr = host.to_owned();
        self.remote_port = port;

        #[cfg(feature = "log")]
        log::debug!(target: "socket", "Socket {} connecting to {}:{}", self.id, host, port);

        Ok(())
    }

    /// Takes ownership of an accepted stream.
    pub(crate) fn adopt(&mut self, stream: TcpStream, peer: SocketAddr) {
        self.remote_addr = peer.ip().to_string();
        self.remote_port = peer.port();
        self.stream = Some(stream);
    }

    pub fn remote_addr(&self) -> &str { &self.remote_addr }

    pub fn remote_port(&self) -> u16 { self.remote_port }

    pub fn is_open(&self) -> bool { self.stream.is_some() }

    pub(crate) fn raw_fd(&self) -> Option<RawFd> { self.stream.as_ref().map(|s| s.as_raw_fd()) }

    /// Appends application bytes to the write queue.
    ///
    /// The bytes go to the kernel on subsequent writable ticks; POLLOUT
    /// interest follows from the queue becoming non-empty at the manager's
    /// reconciliation pass.
    pub fn queue_write(&mut self, data: &[u8], pool: &mut BufferPool) {
        if data.is_empty() {
            return;
        }
        match self.pending_writes.back_mut() {
            Some(tail) => tail.append(data),
            None => {
                let mut buf = pool.acquire();
                buf.append(data);
                self.pending_writes.push_back(buf);
            }
        }
    }

    /// Reads one bounded chunk into the tail read buffer.
    pub(crate) fn handle_read(&mut self, pool: &mut BufferPool) -> ReadOutcome {
        let Some(stream) = self.stream.as_mut() else {
            return ReadOutcome::WouldBlock;
        };

        let mut chunk = [0u8; READ_CHUNK];
        match stream.read(&mut chunk) {
            Ok(0) => ReadOutcome::Closed,
            Ok(n) => {
                let need_new = match self.pending_reads.back() {
                    None => true,
                    Some(tail) => tail.len() >= READ_SOFT_LIMIT,
                };
                if need_new {
                    self.pending_reads.push_back(pool.acquire());
                }
                let tail = self.pending_reads.back_mut().expect("tail buffer just ensured");
                tail.append(&chunk[..n]);
                ReadOutcome::Data
            }
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::Interrupted =>
            {
                ReadOutcome::WouldBlock
            }
            Err(err) => ReadOutcome::Err(err),
        }
    }

    /// Writes as much of the queue head as the kernel accepts.
    ///
    /// Partial writes advance the buffer's consumed cursor; fully drained
    /// buffers are released back to the pool. Returns a fatal error, if any.
    pub(crate) fn handle_write(&mut self, pool: &mut BufferPool) -> Option<io::Error> {
        let Some(stream) = self.stream.as_mut() else {
            return None;
        };

        while let Some(head) = self.pending_writes.front_mut() {
            if head.is_drained() {
                let drained = self.pending_writes.pop_front().expect("front just checked");
                pool.release(drained);
                continue;
            }
            match stream.write(head.unread()) {
                Ok(0) => break,
                Ok(n) => {
                    head.advance(n);
                    if head.is_drained() {
                        let drained = self.pending_writes.pop_front().expect("front just checked");
                        pool.release(drained);
                    } else {
                        // Kernel took a partial chunk; wait for the next
                        // writable tick
                        break;
                    }
                }
                Err(err)
                    if err.kind() == io::ErrorKind::WouldBlock
                        || err.kind() == io::ErrorKind::Interrupted =>
                {
                    break
                }
                Err(err) => return Some(err),
            }
        }
        None
    }

    pub fn has_pending_writes(&self) -> bool { !self.pending_writes.is_empty() }

    /// Transfers all queued read buffers to the caller.
    ///
    /// The caller is expected to release them back to the pool once consumed.
    pub fn take_reads(&mut self) -> Vec<Buffer> { self.pending_reads.drain(..).collect() }

    /// Peeks the latest read buffer without taking ownership.
    pub fn current_read_buffer(&self) -> Option<&Buffer> { self.pending_reads.back() }

    /// Requests an orderly close once the write queue has drained.
    ///
    /// The socket manager reports the socket as closed on the tick where the
    /// queue empties; until then queued bytes keep flowing.
    pub fn close_when_drained(&mut self) { self.close_when_drained = true; }

    pub(crate) fn take_drain_close(&mut self) -> bool {
        let marked = self.close_when_drained && self.pending_writes.is_empty();
        if marked {
            self.close_when_drained = false;
        }
        marked
    }

    /// Returns every queued buffer for release on teardown.
    pub(crate) fn drain_buffers(&mut self) -> Vec<Buffer> {
        self.pending_reads.drain(..).chain(self.pending_writes.drain(..)).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use super::*;

    #[test]
    fn connect_nonblocking_is_in_progress() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut socket = Socket::new(PollableId::test_value(1));
        socket.connect("127.0.0.1", port).unwrap();
        assert!(socket.is_open());
        assert_eq!(socket.remote_addr(), "127.0.0.1");
        assert_eq!(socket.remote_port(), port);
    }

    #[test]
    fn queued_writes_coalesce_into_tail() {
        let mut pool = BufferPool::new();
        let mut socket = Socket::new(PollableId::test_value(1));
        socket.queue_write(b"hello ", &mut pool);
        socket.queue_write(b"world", &mut pool);
        assert!(socket.has_pending_writes());
        assert_eq!(pool.stats().in_use, 1);

        let bufs = socket.drain_buffers();
        assert_eq!(bufs.len(), 1);
        assert_eq!(bufs[0].as_bytes(), b"hello world");
        pool.release_all(bufs);
        assert_eq!(pool.stats().in_use, 0);
    }

    #[test]
    fn drain_close_waits_for_empty_queue() {
        let mut pool = BufferPool::new();
        let mut socket = Socket::new(PollableId::test_value(1));
        socket.queue_write(b"bye", &mut pool);
        socket.close_when_drained();
        assert!(!socket.take_drain_close(), "queue still holds bytes");

        pool.release_all(socket.drain_buffers());
        assert!(socket.take_drain_close());
        assert!(!socket.take_drain_close(), "reported only once");
    }
}
