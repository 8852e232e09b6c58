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

//! Readiness-set construction and the poll(2) syscall wrapper.
//!
//! The [`PollSet`] is rebuilt by the reactor on every tick from the current
//! registry state, so pollables added or removed between ticks can never
//! leave a stale entry behind.

use std::fmt::{self, Display, Formatter};
use std::io;
use std::os::unix::io::RawFd;

use crate::reactor::PollableId;

/// I/O interest subscribed for a file descriptor.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug)]
pub struct IoType {
    /// Watch the descriptor for readable data.
    pub read: bool,
    /// Watch the descriptor for write readiness.
    pub write: bool,
}

impl IoType {
    pub fn none() -> Self {
        Self {
            read: false,
            write: false,
        }
    }

    pub fn read_only() -> Self {
        Self {
            read: true,
            write: false,
        }
    }

    pub fn write_only() -> Self {
        Self {
            read: false,
            write: true,
        }
    }

    pub fn read_write() -> Self {
        Self {
            read: true,
            write: true,
        }
    }

    pub fn is_none(self) -> bool { !self.read && !self.write }

    fn events(self) -> i16 {
        let mut events = 0;
        if self.read {
            events |= libc::POLLIN;
        }
        if self.write {
            events |= libc::POLLOUT;
        }
        events
    }
}

impl Display for IoType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match (self.read, self.write) {
            (false, false) => f.write_str("none"),
            (true, false) => f.write_str("read"),
            (false, true) => f.write_str("write"),
            (true, true) => f.write_str("read-write"),
        }
    }
}

/// Readiness bits reported by poll(2) for one descriptor.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct Revents(i16);

impl Revents {
    const ERROR_MASK: i16 = libc::POLLERR | libc::POLLHUP | libc::POLLNVAL;

    pub fn new(bits: i16) -> Self { Revents(bits) }

    pub fn bits(self) -> i16 { self.0 }

    pub fn is_empty(self) -> bool { self.0 == 0 }

    pub fn is_readable(self) -> bool { self.0 & libc::POLLIN != 0 }

    pub fn is_writable(self) -> bool { self.0 & libc::POLLOUT != 0 }

    /// Any of the error, hangup or invalid-descriptor conditions.
    pub fn is_error(self) -> bool { self.0 & Self::ERROR_MASK != 0 }
}

impl Display for Revents {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.is_error() {
            f.write_str("error")
        } else {
            match (self.is_readable(), self.is_writable()) {
                (false, false) => f.write_str("none"),
                (true, false) => f.write_str("read"),
                (false, true) => f.write_str("write"),
                (true, true) => f.write_str("read-write"),
            }
        }
    }
}

/// Readiness reported for a single registered pollable during one tick.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct PollerEvent {
    pub id: PollableId,
    pub revents: Revents,
}

/// The pollfd array for one reactor tick.
///
/// Slots are pushed in registry iteration order; the slot pushed with
/// `id = None` is the waker. The array and the id side-table always have the
/// same length.
#[derive(Default)]
pub struct PollSet {
    fds: Vec<libc::pollfd>,
    ids: Vec<Option<PollableId>>,
}

impl PollSet {
    pub fn new() -> Self { PollSet::default() }

    pub fn clear(&mut self) {
        self.fds.clear();
        self.ids.clear();
    }

    pub fn len(&self) -> usize { self.fds.len() }

    pub fn is_empty(&self) -> bool { self.fds.is_empty() }

    /// Adds a descriptor to the set with the given interest.
    pub fn push(&mut self, id: Option<PollableId>, fd: RawFd, interest: IoType) {
        self.fds.push(libc::pollfd {
            fd,
            events: interest.events(),
            revents: 0,
        });
        self.ids.push(id);
    }

    /// Blocks until readiness or timeout.
    ///
    /// `timeout_ms` of zero polls without blocking; a negative value blocks
    /// indefinitely. EINTR is swallowed and reported as zero ready
    /// descriptors, so an interrupted tick simply yields no events.
    pub fn poll(&mut self, timeout_ms: i32) -> io::Result<usize> {
        let ret = unsafe {
            libc::poll(
                self.fds.as_mut_ptr(),
                self.fds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }
        Ok(ret as usize)
    }

    /// Iterates slots with non-zero readiness bits, in push order.
    pub fn events(&self) -> impl Iterator<Item = (Option<PollableId>, Revents)> + '_ {
        self.fds
            .iter()
            .zip(&self.ids)
            .filter(|(pfd, _)| pfd.revents != 0)
            .map(|(pfd, id)| (*id, Revents::new(pfd.revents)))
    }
}
