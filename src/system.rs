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

//! Facade unifying the reactor with the listener and socket managers behind a
//! flat list of normalized [`NetworkEvent`]s.

use std::io;

use crate::buffer::{concat, Buffer, PoolStats};
use crate::listener::Listener;
use crate::managers::{ListenerManager, SocketManager, SocketResult};
use crate::reactor::{PollableId, Reactor, Waker};
use crate::socket::Socket;
use crate::timers::TimerId;

/// Failures surfaced while setting up listeners and sockets.
///
/// Transient I/O never appears here — it is swallowed inside the tick.
#[derive(Debug, Display, Error, From)]
#[display(doc_comments)]
pub enum Error {
    /// can't listen on port {port}. Details: {err}
    Listen {
        port: u16,
        err: io::Error,
    },

    /// can't connect to {host}:{port}. Details: {err}
    Connect {
        host: String,
        port: u16,
        err: io::Error,
    },

    /// reactor setup has failed. Details: {0}
    #[from]
    Setup(io::Error),
}

/// Normalized event produced by one [`NetworkSystem::poll`] tick.
///
/// Events carry stable pollable ids; the pollables themselves stay owned by
/// the reactor and are reached through the facade's accessors. Events are
/// never queued across ticks.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum NetworkEvent {
    /// A listener accepted a new connection.
    Accepted {
        listener: PollableId,
        socket: PollableId,
    },
    /// A socket received data, retrievable via [`NetworkSystem::take_reads`].
    /// At most one per socket per tick.
    SocketData(PollableId),
    /// The peer closed the connection, or a drain-close completed.
    SocketClosed(PollableId),
    /// A fatal error condition was reported for the socket.
    SocketError(PollableId),
}

impl NetworkEvent {
    /// The socket this event concerns.
    pub fn socket(self) -> PollableId {
        match self {
            NetworkEvent::Accepted { socket, .. }
            | NetworkEvent::SocketData(socket)
            | NetworkEvent::SocketClosed(socket)
            | NetworkEvent::SocketError(socket) => socket,
        }
    }
}

/// Facade over [`Reactor`], [`ListenerManager`] and [`SocketManager`].
///
/// One instance per event loop thread. Applications drive it with
/// `poll → dispatch events → remove_closed_sockets`, enqueueing writes and
/// arming timers from within dispatch as needed.
pub struct NetworkSystem {
    reactor: Reactor,
    listeners: ListenerManager,
    sockets: SocketManager,
}

impl NetworkSystem {
    pub fn new() -> Result<Self, Error> {
        Ok(NetworkSystem {
            reactor: Reactor::new()?,
            listeners: ListenerManager::new(),
            sockets: SocketManager::new(),
        })
    }

    /// Direct access to the underlying reactor for advanced uses.
    pub fn reactor(&self) -> &Reactor { &self.reactor }

    pub fn reactor_mut(&mut self) -> &mut Reactor { &mut self.reactor }

    /// Cross-thread wakeup handle for the blocking poll.
    pub fn waker(&self) -> Waker { self.reactor.waker() }

    /// Creates, binds and starts a listener on `port` (zero for ephemeral).
    ///
    /// On failure the pollable is discarded before registration becomes
    /// observable and the error is returned.
    pub fn create_listener(&mut self, port: u16) -> Result<PollableId, Error> {
        let id = self.reactor.create_listener();
        let listener = self.reactor.listener_mut(id).expect("listener just created");
        match listener.start(port) {
            Ok(()) => Ok(id),
            Err(err) => {
                self.reactor.discard(id);
                Err(Error::Listen { port, err })
            }
        }
    }

    /// Creates a socket and starts a non-blocking connect to `host:port`.
    ///
    /// EINPROGRESS counts as success; connect failures discovered later
    /// arrive as [`NetworkEvent::SocketError`].
    pub fn create_socket(&mut self, host: &str, port: u16) -> Result<PollableId, Error> {
        let id = self.reactor.create_socket();
        let socket = self.reactor.socket_mut(id).expect("socket just created");
        match socket.connect(host, port) {
            Ok(()) => Ok(id),
            Err(err) => {
                self.reactor.discard(id);
                Err(Error::Connect {
                    host: host.to_owned(),
                    port,
                    err,
                })
            }
        }
    }

    /// Runs one tick and returns the normalized event list.
    ///
    /// Accept events come first, then socket results, preserving the order
    /// in which the managers dispatched them. All events of tick N are
    /// delivered before any event of tick N+1 can exist.
    pub fn poll(&mut self, timeout_ms: i32) -> Vec<NetworkEvent> {
        let poller_events = self.reactor.poll(timeout_ms);

        let mut events = vec![];
        for conn in self.listeners.process(&mut self.reactor, &poller_events) {
            events.push(NetworkEvent::Accepted {
                listener: conn.listener,
                socket: conn.socket,
            });
        }
        for result in self.sockets.process(&mut self.reactor, &poller_events) {
            events.push(match result {
                SocketResult::Data(id) => NetworkEvent::SocketData(id),
                SocketResult::Closed(id) => NetworkEvent::SocketClosed(id),
                SocketResult::Error(id) => NetworkEvent::SocketError(id),
            });
        }
        events
    }

    /// Schedules removal for every socket mentioned in a closed or errored
    /// event. Safe to call with the full event list of a tick, repeatedly.
    pub fn remove_closed_sockets(&mut self, events: &[NetworkEvent]) {
        for event in events {
            match event {
                NetworkEvent::SocketClosed(id) | NetworkEvent::SocketError(id) => {
                    self.reactor.remove(*id)
                }
                _ => {}
            }
        }
    }

    /// Schedules removal of a pollable at the end of the next tick.
    pub fn remove(&mut self, id: PollableId) { self.reactor.remove(id); }

    pub fn listener(&self, id: PollableId) -> Option<&Listener> { self.reactor.listener(id) }

    pub fn socket(&self, id: PollableId) -> Option<&Socket> { self.reactor.socket(id) }

    /// Queues bytes for writing on a socket. Unknown ids are ignored and
    /// reported as `false`.
    pub fn send(&mut self, id: PollableId, data: &[u8]) -> bool {
        match self.reactor.socket_with_pool(id) {
            Some((socket, pool)) => {
                socket.queue_write(data, pool);
                true
            }
            None => false,
        }
    }

    /// Transfers ownership of a socket's queued read buffers to the caller.
    pub fn take_reads(&mut self, id: PollableId) -> Vec<Buffer> {
        self.reactor.socket_mut(id).map(Socket::take_reads).unwrap_or_default()
    }

    /// Reads all queued bytes of a socket into one vector, recycling the
    /// underlying buffers.
    pub fn read_to_vec(&mut self, id: PollableId) -> Vec<u8> {
        let buffers = self.take_reads(id);
        let bytes = concat(&buffers);
        self.reactor.buffer_pool().release_all(buffers);
        bytes
    }

    /// Returns an application-held buffer to the pool.
    pub fn release_buffer(&mut self, buf: Buffer) { self.reactor.release_buffer(buf); }

    pub fn release_buffers(&mut self, bufs: impl IntoIterator<Item = Buffer>) {
        self.reactor.buffer_pool().release_all(bufs);
    }

    /// Asks for an orderly close of `id` once its write queue drains.
    pub fn close_when_drained(&mut self, id: PollableId) {
        if let Some(socket) = self.reactor.socket_mut(id) {
            socket.close_when_drained();
        }
    }

    pub fn pool_stats(&mut self) -> PoolStats { self.reactor.buffer_pool().stats() }

    // Timer API, delegated to the reactor's level-triggered wheel.

    pub fn create_timer(&mut self, delay_ms: u64, repeat: bool) -> TimerId {
        self.reactor.create_timer(delay_ms, repeat)
    }

    pub fn is_timer_expired(&self, id: TimerId) -> bool { self.reactor.is_timer_expired(id) }

    pub fn reset_timer(&mut self, id: TimerId) { self.reactor.reset_timer(id); }

    pub fn destroy_timer(&mut self, id: TimerId) { self.reactor.destroy_timer(id); }
}
