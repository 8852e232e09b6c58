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

//! Managers translating raw reactor readiness into socket I/O and accepts.
//!
//! [`SocketManager`] owns the POLLOUT lifecycle: after dispatching a tick's
//! events it reconciles write interest for every socket, which is the single
//! place where `pending_writes non-empty ⇔ POLLOUT watched` is established.
//! Sockets themselves never talk to the reactor.

use crate::poller::PollerEvent;
use crate::reactor::{PollableId, Reactor};
use crate::socket::ReadOutcome;

/// Result of socket I/O dispatch for one tick.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum SocketResult {
    /// Bytes were appended to the socket's read queue. Emitted at most once
    /// per socket per tick.
    Data(PollableId),
    /// The peer closed the connection, or a requested drain-close completed.
    Closed(PollableId),
    /// An error or hangup condition was reported for the socket.
    Error(PollableId),
}

impl SocketResult {
    pub fn socket(self) -> PollableId {
        match self {
            SocketResult::Data(id) | SocketResult::Closed(id) | SocketResult::Error(id) => id,
        }
    }
}

/// A connection produced by a readable listener.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct ConnectionResult {
    pub listener: PollableId,
    pub socket: PollableId,
}

/// Translates reactor readiness into per-socket reads and writes.
#[derive(Debug, Default)]
pub struct SocketManager {}

impl SocketManager {
    pub fn new() -> Self { SocketManager::default() }

    /// Dispatches one tick's events to the registered sockets.
    ///
    /// Error bits are checked first and short-circuit further processing for
    /// the socket. Reads and writes are both non-blocking; transient
    /// conditions produce no result. The trailing reconciliation pass updates
    /// POLLOUT interest for every socket and reports completed drain-closes.
    pub fn process(&mut self, reactor: &mut Reactor, events: &[PollerEvent]) -> Vec<SocketResult> {
        let mut results = vec![];

        for event in events {
            let Some((socket, pool)) = reactor.socket_with_pool(event.id) else {
                continue;
            };

            if event.revents.is_error() {
                #[cfg(feature = "log")]
                log::debug!(target: "socket", "Socket {} reported {}", event.id, event.revents);
                results.push(SocketResult::Error(event.id));
                continue;
            }

            if event.revents.is_readable() {
                match socket.handle_read(pool) {
                    ReadOutcome::Data => results.push(SocketResult::Data(event.id)),
                    ReadOutcome::Closed => {
                        results.push(SocketResult::Closed(event.id));
                        continue;
                    }
                    ReadOutcome::WouldBlock => {}
                    ReadOutcome::Err(_err) => {
                        #[cfg(feature = "log")]
                        log::debug!(target: "socket", "Read error on socket {}: {_err}", event.id);
                        results.push(SocketResult::Error(event.id));
                        continue;
                    }
                }
            }

            if event.revents.is_writable() {
                if let Some(_err) = socket.handle_write(pool) {
                    #[cfg(feature = "log")]
                    log::debug!(target: "socket", "Write error on socket {}: {_err}", event.id);
                    results.push(SocketResult::Error(event.id));
                }
            }
        }

        // Single point of POLLOUT control: reconcile write interest for every
        // socket after the tick's I/O has been dispatched
        for id in reactor.socket_ids() {
            let Some(socket) = reactor.socket_mut(id) else {
                continue;
            };
            if socket.has_pending_writes() {
                reactor.enable_pollout(id);
            } else {
                if socket.take_drain_close() {
                    results.push(SocketResult::Closed(id));
                }
                reactor.disable_pollout(id);
            }
        }

        results
    }
}

/// Translates listener readiness into accepted connections.
#[derive(Debug, Default)]
pub struct ListenerManager {}

impl ListenerManager {
    pub fn new() -> Self { ListenerManager::default() }

    /// Accepts one connection per readable listener event.
    ///
    /// EAGAIN is skipped silently; the level-triggered poll re-reports the
    /// listener while a backlog remains. Any other errno is logged and the
    /// event skipped.
    pub fn process(
        &mut self,
        reactor: &mut Reactor,
        events: &[PollerEvent],
    ) -> Vec<ConnectionResult> {
        let mut results = vec![];

        for event in events {
            if !event.revents.is_readable() {
                continue;
            }
            let accepted = match reactor.listener(event.id) {
                Some(listener) => listener.accept(),
                None => continue,
            };
            match accepted {
                Ok(Some((stream, peer))) => {
                    let socket = reactor.adopt_socket(stream, peer);
                    #[cfg(feature = "log")]
                    log::debug!(target: "listener", "Accepted {peer} on listener {} as socket {socket}", event.id);
                    results.push(ConnectionResult {
                        listener: event.id,
                        socket,
                    });
                }
                Ok(None) => {}
                Err(_err) => {
                    #[cfg(feature = "log")]
                    log::warn!(target: "listener", "Accept failed on listener {}: {_err}", event.id);
                }
            }
        }

        results
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::net::TcpStream;

    use super::*;
    use crate::clock::Timestamp;

    fn tick(
        reactor: &mut Reactor,
        listeners: &mut ListenerManager,
        sockets: &mut SocketManager,
    ) -> (Vec<ConnectionResult>, Vec<SocketResult>) {
        let events = reactor.poll(10);
        let conns = listeners.process(reactor, &events);
        let results = sockets.process(reactor, &events);
        (conns, results)
    }

    #[test]
    fn accept_read_and_pollout_invariant() {
        let mut reactor = Reactor::new().unwrap();
        let mut listeners = ListenerManager::new();
        let mut sockets = SocketManager::new();

        let lid = reactor.create_listener();
        reactor.listener_mut(lid).unwrap().start(0).unwrap();
        let port = reactor.listener(lid).unwrap().local_port();

        let mut peer = TcpStream::connect(("127.0.0.1", port)).unwrap();
        peer.write_all(b"hello").unwrap();

        let mut accepted = None;
        let mut got_data = false;
        let started = Timestamp::now();
        while (!got_data || accepted.is_none()) && started.elapsed_ms() < 2000 {
            let (conns, results) = tick(&mut reactor, &mut listeners, &mut sockets);
            if let Some(conn) = conns.first() {
                assert_eq!(conn.listener, lid);
                accepted = Some(conn.socket);
            }
            for res in results {
                if let SocketResult::Data(id) = res {
                    assert_eq!(Some(id), accepted);
                    got_data = true;
                }
            }
        }
        let sid = accepted.expect("connection accepted");
        assert!(got_data);

        let reads = reactor.socket_mut(sid).unwrap().take_reads();
        assert_eq!(crate::buffer::concat(&reads), b"hello");
        let pool = reactor.buffer_pool();
        pool.release_all(reads);

        // Invariant between ticks: pending writes iff POLLOUT watched
        assert!(!reactor.watches_pollout(sid));
        let (socket, pool) = reactor.socket_with_pool(sid).unwrap();
        socket.queue_write(b"echo", pool);
        let events = reactor.poll(0);
        sockets.process(&mut reactor, &events);
        // The write either drained on this tick or POLLOUT is now armed
        let socket = reactor.socket(sid).unwrap();
        assert_eq!(socket.has_pending_writes(), reactor.watches_pollout(sid));
    }

    #[test]
    fn peer_close_is_reported_once() {
        let mut reactor = Reactor::new().unwrap();
        let mut listeners = ListenerManager::new();
        let mut sockets = SocketManager::new();

        let lid = reactor.create_listener();
        reactor.listener_mut(lid).unwrap().start(0).unwrap();
        let port = reactor.listener(lid).unwrap().local_port();

        let peer = TcpStream::connect(("127.0.0.1", port)).unwrap();

        let mut accepted = None;
        let started = Timestamp::now();
        while accepted.is_none() && started.elapsed_ms() < 2000 {
            let (conns, _) = tick(&mut reactor, &mut listeners, &mut sockets);
            accepted = conns.first().map(|c| c.socket);
        }
        let sid = accepted.expect("connection accepted");

        drop(peer);

        let mut closed = false;
        let started = Timestamp::now();
        while !closed && started.elapsed_ms() < 2000 {
            let (_, results) = tick(&mut reactor, &mut listeners, &mut sockets);
            for res in results {
                match res {
                    SocketResult::Closed(id) | SocketResult::Error(id) => {
                        assert_eq!(id, sid);
                        closed = true;
                    }
                    SocketResult::Data(_) => panic!("no data was sent"),
                }
            }
        }
        assert!(closed);
        reactor.remove(sid);
        reactor.poll(0);
    }
}
