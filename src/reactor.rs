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

//! The reactor: readiness multiplexer, pollable registry, timer wheel and
//! self-pipe waker, all owned by a single thread.
//!
//! One call to [`Reactor::poll`] is one tick: expired timers are flagged, the
//! readiness set is rebuilt from the registry, the thread blocks on poll(2)
//! up to the computed timeout, the waker is drained, and per-pollable
//! readiness is returned as [`PollerEvent`]s. The reactor never invokes
//! application callbacks — dispatch belongs to the caller.
//!
//! Removal of pollables is always deferred to the end of the tick, so event
//! dispatch can freely call [`Reactor::remove`] without invalidating the
//! iteration that produced the events.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

use crate::buffer::{Buffer, BufferPool};
use crate::clock::Timestamp;
use crate::listener::Listener;
use crate::poller::{IoType, PollSet, PollerEvent};
use crate::socket::Socket;
use crate::timers::{TimerId, TimerWheel};

/// Stable identifier of a listener or socket within one reactor's lifetime.
///
/// Monotonically allocated and never reused while the pollable is alive, so
/// an id held across ticks either still names the same object or names
/// nothing.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Display)]
#[display(inner)]
pub struct PollableId(u32);

impl PollableId {
    /// Id reserved for the waker (always zero, never in the registry).
    pub const WAKER: PollableId = PollableId(0);

    #[cfg(test)]
    pub(crate) fn test_value(id: u32) -> Self { PollableId(id) }
}

/// Kind of a registered pollable.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum PollableKind {
    Listener,
    Socket,
}

/// Thread-safe handle waking a blocked [`Reactor::poll`] call.
///
/// This is the only reactor operation permitted from other threads. Waking
/// from the reactor thread itself is a no-op — the loop is already awake.
#[derive(Clone)]
pub struct Waker {
    tx: Arc<Mutex<UnixStream>>,
    home: ThreadId,
}

impl Waker {
    /// Writes one byte into the self-pipe.
    pub fn wake(&self) -> io::Result<()> {
        use io::ErrorKind::*;

        if thread::current().id() == self.home {
            return Ok(());
        }

        let mut tx = self.tx.lock().map_err(|_| {
            #[cfg(feature = "log")]
            log::error!(target: "reactor", "Waker lock is poisoned");
            io::Error::from(WouldBlock)
        })?;
        loop {
            match tx.write_all(&[0x1]) {
                Ok(_) => return Ok(()),
                Err(e) if e.kind() == WouldBlock => {
                    #[cfg(feature = "log")]
                    log::warn!(target: "reactor", "Waker pipe overfilled, draining and repeating");
                    reset_fd(&*tx)?;
                }
                Err(e) if e.kind() == Interrupted => {}
                Err(e) => {
                    #[cfg(feature = "log")]
                    log::error!(target: "reactor", "Waker error: {e}");
                    return Err(e);
                }
            }
        }
    }
}

/// Drains a non-blocking descriptor until EAGAIN.
fn reset_fd(fd: &impl AsRawFd) -> io::Result<()> {
    let mut buf = [0u8; 4096];

    loop {
        // Low-level read: constructing a `UnixStream` from the raw fd would
        // close it on drop.
        match unsafe {
            libc::read(
                fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        } {
            -1 => match io::Error::last_os_error() {
                e if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                e => {
                    #[cfg(feature = "log")]
                    log::error!(target: "reactor", "Unable to drain waker pipe: {e}");
                    return Err(e);
                }
            },
            0 => return Ok(()),
            _ => continue,
        }
    }
}

/// Single-threaded readiness multiplexer with an embedded timer wheel.
pub struct Reactor {
    listeners: BTreeMap<PollableId, Listener>,
    sockets: BTreeMap<PollableId, Socket>,
    next_id: u32,
    pollout: BTreeSet<PollableId>,
    removals: Vec<PollableId>,
    timers: TimerWheel,
    pool: BufferPool,
    set: PollSet,
    waker_rx: UnixStream,
    waker: Waker,
}

impl Reactor {
    /// Sets up the waker channel and an empty registry.
    pub fn new() -> io::Result<Self> {
        let (waker_tx, waker_rx) = UnixStream::pair()?;
        waker_rx.set_nonblocking(true)?;
        waker_tx.set_nonblocking(true)?;

        Ok(Reactor {
            listeners: empty!(),
            sockets: empty!(),
            next_id: 0,
            pollout: empty!(),
            removals: vec![],
            timers: TimerWheel::new(),
            pool: BufferPool::new(),
            set: PollSet::new(),
            waker_rx,
            waker: Waker {
                tx: Arc::new(Mutex::new(waker_tx)),
                home: thread::current().id(),
            },
        })
    }

    /// A cloneable cross-thread wakeup handle.
    pub fn waker(&self) -> Waker { self.waker.clone() }

    fn allocate_id(&mut self) -> PollableId {
        self.next_id += 1;
        PollableId(self.next_id)
    }

    /// Registers a fresh, unbound listener and returns its id.
    pub fn create_listener(&mut self) -> PollableId {
        let id = self.allocate_id();
        self.listeners.insert(id, Listener::new(id));
        #[cfg(feature = "log")]
        log::debug!(target: "reactor", "Created listener {id}");
        id
    }

    /// Registers a fresh, unconnected socket and returns its id.
    pub fn create_socket(&mut self) -> PollableId {
        let id = self.allocate_id();
        self.sockets.insert(id, Socket::new(id));
        #[cfg(feature = "log")]
        log::debug!(target: "reactor", "Created socket {id}");
        id
    }

    /// Adopts an accepted stream as a new registered socket.
    pub(crate) fn adopt_socket(&mut self, stream: TcpStream, peer: SocketAddr) -> PollableId {
        let id = self.create_socket();
        self.sockets
            .get_mut(&id)
            .expect("socket just created")
            .adopt(stream, peer);
        id
    }

    pub fn kind(&self, id: PollableId) -> Option<PollableKind> {
        if self.listeners.contains_key(&id) {
            Some(PollableKind::Listener)
        } else if self.sockets.contains_key(&id) {
            Some(PollableKind::Socket)
        } else {
            None
        }
    }

    pub fn listener(&self, id: PollableId) -> Option<&Listener> { self.listeners.get(&id) }

    pub fn listener_mut(&mut self, id: PollableId) -> Option<&mut Listener> {
        self.listeners.get_mut(&id)
    }

    pub fn socket(&self, id: PollableId) -> Option<&Socket> { self.sockets.get(&id) }

    pub fn socket_mut(&mut self, id: PollableId) -> Option<&mut Socket> {
        self.sockets.get_mut(&id)
    }

    /// Split borrow of a socket together with the buffer pool, for I/O paths
    /// which read into or release pooled buffers.
    pub(crate) fn socket_with_pool(
        &mut self,
        id: PollableId,
    ) -> Option<(&mut Socket, &mut BufferPool)> {
        let Reactor { sockets, pool, .. } = self;
        sockets.get_mut(&id).map(|socket| (socket, &mut *pool))
    }

    /// Ids of all registered sockets, in registry order.
    pub fn socket_ids(&self) -> Vec<PollableId> { self.sockets.keys().copied().collect() }

    pub fn buffer_pool(&mut self) -> &mut BufferPool { &mut self.pool }

    /// Releases an application-held buffer back to the pool.
    pub fn release_buffer(&mut self, buf: Buffer) { self.pool.release(buf); }

    /// Schedules removal of a pollable at the end of the current tick.
    ///
    /// Safe to call any number of times, including from event dispatch for
    /// the pollable whose event is being handled. Queued buffers return to
    /// the pool when the removal is applied.
    pub fn remove(&mut self, id: PollableId) { self.removals.push(id); }

    /// Immediately drops a pollable which never became operational.
    ///
    /// Only for setup failure paths, before any event involving the id could
    /// have been dispatched.
    pub(crate) fn discard(&mut self, id: PollableId) {
        self.removals.retain(|r| *r != id);
        self.drop_pollable(id);
    }

    /// Marks the socket for POLLOUT watching on subsequent ticks.
    pub fn enable_pollout(&mut self, id: PollableId) {
        if self.sockets.contains_key(&id) {
            self.pollout.insert(id);
        }
    }

    pub fn disable_pollout(&mut self, id: PollableId) { self.pollout.remove(&id); }

    /// Whether the readiness set built next tick will request POLLOUT.
    pub fn watches_pollout(&self, id: PollableId) -> bool { self.pollout.contains(&id) }

    // Timer API. Expiry is level-triggered: the reactor only flips flags, and
    // applications poll them between ticks.

    pub fn create_timer(&mut self, delay_ms: u64, repeat: bool) -> TimerId {
        self.timers.create(delay_ms, repeat, Timestamp::now())
    }

    pub fn is_timer_expired(&self, id: TimerId) -> bool { self.timers.is_expired(id) }

    pub fn reset_timer(&mut self, id: TimerId) { self.timers.reset(id, Timestamp::now()); }

    pub fn destroy_timer(&mut self, id: TimerId) { self.timers.destroy(id); }

    /// Runs one reactor tick and returns per-pollable readiness.
    ///
    /// `timeout_ms` bounds the blocking wait: zero polls without blocking,
    /// negative blocks until readiness. The nearest pending timer expiry
    /// shortens the wait so flags are raised close to their due time.
    pub fn poll(&mut self, timeout_ms: i32) -> Vec<PollerEvent> {
        let now = Timestamp::now();
        self.timers.scan(now);

        let timeout = match self.timers.next_expiry_ms(now) {
            Some(ms) => {
                let ms = ms.min(i32::MAX as u64) as i32;
                if timeout_ms < 0 {
                    ms
                } else {
                    timeout_ms.min(ms)
                }
            }
            None => timeout_ms,
        };

        self.set.clear();
        self.set.push(None, self.waker_rx.as_raw_fd(), IoType::read_only());
        for (id, listener) in &self.listeners {
            if let Some(fd) = listener.raw_fd() {
                self.set.push(Some(*id), fd, IoType::read_only());
            }
        }
        for (id, socket) in &self.sockets {
            if let Some(fd) = socket.raw_fd() {
                let interest = if self.pollout.contains(id) {
                    IoType::read_write()
                } else {
                    IoType::read_only()
                };
                self.set.push(Some(*id), fd, interest);
            }
        }

        #[cfg(feature = "log")]
        log::trace!(target: "reactor", "Polling {} descriptors with timeout {timeout}ms", self.set.len());

        let res = self.set.poll(timeout);

        // Second scan: expiries during the blocking wait become observable on
        // this very tick, before any I/O event is dispatched
        self.timers.scan(Timestamp::now());

        let mut events = vec![];
        match res {
            Ok(0) => {}
            Ok(_) => {
                for (slot, revents) in self.set.events() {
                    match slot {
                        None => {
                            #[cfg(feature = "log")]
                            log::trace!(target: "reactor", "Awoken through the waker");
                            reset_fd(&self.waker_rx).expect("waker failure");
                        }
                        Some(id) => events.push(PollerEvent { id, revents }),
                    }
                }
            }
            Err(err) => {
                #[cfg(feature = "log")]
                log::error!(target: "reactor", "Error during poll operation: {err}");
                #[cfg(not(feature = "log"))]
                let _ = err;
            }
        }

        self.apply_removals();
        events
    }

    fn apply_removals(&mut self) {
        while let Some(id) = self.removals.pop() {
            self.drop_pollable(id);
        }
    }

    fn drop_pollable(&mut self, id: PollableId) {
        self.pollout.remove(&id);
        if let Some(mut socket) = self.sockets.remove(&id) {
            let buffers = socket.drain_buffers();
            self.pool.release_all(buffers);
            #[cfg(feature = "log")]
            log::debug!(target: "reactor", "Removed socket {id}");
        } else if self.listeners.remove(&id).is_some() {
            #[cfg(feature = "log")]
            log::debug!(target: "reactor", "Removed listener {id}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn one_shot_timer_over_poll_ticks() {
        let mut reactor = Reactor::new().unwrap();
        let timer = reactor.create_timer(100, false);

        let started = Timestamp::now();
        while started.elapsed_ms() < 150 {
            reactor.poll(10);
        }
        assert!(reactor.is_timer_expired(timer));

        reactor.reset_timer(timer);
        assert!(!reactor.is_timer_expired(timer));
        reactor.poll(0);
        assert!(!reactor.is_timer_expired(timer), "a reset one-shot never re-fires");
        reactor.destroy_timer(timer);
        reactor.destroy_timer(timer);
    }

    #[test]
    fn repeating_timer_with_resets() {
        let mut reactor = Reactor::new().unwrap();
        let timer = reactor.create_timer(50, true);

        let mut expiries = 0;
        let started = Timestamp::now();
        while started.elapsed_ms() < 300 {
            reactor.poll(10);
            if reactor.is_timer_expired(timer) {
                expiries += 1;
                reactor.reset_timer(timer);
            }
        }
        assert!(expiries >= 3, "expired {expiries} times in 300ms");
    }

    #[test]
    fn unknown_timer_ops_are_noops() {
        let mut reactor = Reactor::new().unwrap();
        let timer = reactor.create_timer(10, false);
        reactor.destroy_timer(timer);
        assert!(!reactor.is_timer_expired(timer));
        reactor.reset_timer(timer);
        reactor.destroy_timer(timer);
    }

    #[test]
    fn waker_interrupts_blocked_poll() {
        let mut reactor = Reactor::new().unwrap();
        let waker = reactor.waker();

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            waker.wake().unwrap();
        });

        let started = Timestamp::now();
        let events = reactor.poll(5000);
        assert!(started.elapsed_ms() < 4000, "poll returned early via the waker");
        assert!(events.is_empty(), "waker readiness is internal, not an event");
        handle.join().unwrap();
    }

    #[test]
    fn wake_on_reactor_thread_is_noop() {
        let reactor = Reactor::new().unwrap();
        // Would block forever on a full pipe if it actually wrote in a loop;
        // on the owning thread it must return at once
        reactor.waker().wake().unwrap();
    }

    #[test]
    fn removal_is_deferred_and_idempotent() {
        let mut reactor = Reactor::new().unwrap();
        let id = reactor.create_socket();
        assert_eq!(reactor.kind(id), Some(PollableKind::Socket));

        reactor.remove(id);
        reactor.remove(id);
        assert!(reactor.socket(id).is_some(), "removal applies at end of tick");

        reactor.poll(0);
        assert!(reactor.socket(id).is_none());
        assert_eq!(reactor.kind(id), None);

        // Removing an already-removed id changes nothing
        reactor.remove(id);
        reactor.poll(0);
    }

    #[test]
    fn ids_are_never_reused() {
        let mut reactor = Reactor::new().unwrap();
        let a = reactor.create_socket();
        reactor.remove(a);
        reactor.poll(0);
        let b = reactor.create_socket();
        assert_ne!(a, b);
        assert_ne!(b, PollableId::WAKER);
    }

    #[test]
    fn pollout_interest_toggles() {
        let mut reactor = Reactor::new().unwrap();
        let id = reactor.create_socket();
        assert!(!reactor.watches_pollout(id));
        reactor.enable_pollout(id);
        assert!(reactor.watches_pollout(id));
        reactor.disable_pollout(id);
        assert!(!reactor.watches_pollout(id));

        // Unknown ids are ignored
        reactor.remove(id);
        reactor.poll(0);
        reactor.enable_pollout(id);
        assert!(!reactor.watches_pollout(id));
    }

    #[test]
    fn removed_socket_buffers_return_to_pool() {
        let mut reactor = Reactor::new().unwrap();
        let id = reactor.create_socket();
        let (socket, pool) = reactor.socket_with_pool(id).unwrap();
        socket.queue_write(b"pending", pool);
        assert_eq!(reactor.buffer_pool().stats().in_use, 1);

        reactor.remove(id);
        reactor.poll(0);
        let stats = reactor.buffer_pool().stats();
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.allocated, stats.free);
    }
}
