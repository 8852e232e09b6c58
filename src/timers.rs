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

//! Level-triggered timer wheel embedded in the reactor.
//!
//! Timers never fire callbacks. A tick only flips the `expired` flag, and
//! applications poll flags between ticks; this removes every reentrancy
//! hazard around arming, cancelling or destroying timers from application
//! code. `reset` re-arms a repeating timer to `now + interval` rather than
//! `previous_expiry + interval`, so a stalled loop does not produce a burst
//! of catch-up expiries.

use std::collections::BTreeMap;

use crate::clock::Timestamp;

/// Identifier of a timer within one reactor's lifetime. Never reused.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Display)]
#[display(inner)]
pub struct TimerId(u32);

#[derive(Copy, Clone, Debug)]
struct TimerEntry {
    expiry: Timestamp,
    interval_ms: u64, // 0 for one-shot timers
    repeat: bool,
    expired: bool,
    active: bool,
}

/// Collection of one-shot and repeating monotonic timers keyed by [`TimerId`].
///
/// All operations on unknown ids are no-ops (`is_expired` returns `false`),
/// which makes teardown-ordering races in application code harmless.
#[derive(Debug, Default)]
pub struct TimerWheel {
    timers: BTreeMap<TimerId, TimerEntry>,
    next_id: u32,
}

impl TimerWheel {
    pub fn new() -> Self { TimerWheel::default() }

    pub fn len(&self) -> usize { self.timers.len() }

    pub fn is_empty(&self) -> bool { self.timers.is_empty() }

    /// Registers a timer expiring `delay_ms` from `now`.
    ///
    /// Repeating timers keep `delay_ms` as their interval; they re-arm on
    /// [`TimerWheel::reset`], not by themselves.
    pub fn create(&mut self, delay_ms: u64, repeat: bool, now: Timestamp) -> TimerId {
        self.next_id += 1;
        let id = TimerId(self.next_id);
        self.timers.insert(id, TimerEntry {
            expiry: now.add_ms(delay_ms),
            interval_ms: if repeat { delay_ms } else { 0 },
            repeat,
            expired: false,
            active: true,
        });
        id
    }

    /// Whether the timer has expired and was not reset since.
    ///
    /// Level-triggered: stays `true` until `reset` or `destroy`. Unknown ids
    /// report `false`.
    pub fn is_expired(&self, id: TimerId) -> bool {
        self.timers.get(&id).map(|t| t.expired).unwrap_or(false)
    }

    /// Clears the expired flag.
    ///
    /// A repeating timer is re-armed to `now + interval`; an expired one-shot
    /// timer is deactivated but remains addressable until destroyed.
    pub fn reset(&mut self, id: TimerId, now: Timestamp) {
        let Some(timer) = self.timers.get_mut(&id) else {
            return;
        };
        timer.expired = false;
        if timer.repeat {
            timer.expiry = now.add_ms(timer.interval_ms);
            timer.active = true;
        } else {
            timer.active = false;
        }
    }

    /// Removes the timer. Idempotent.
    pub fn destroy(&mut self, id: TimerId) { self.timers.remove(&id); }

    /// Marks every active timer whose expiry has passed as expired.
    ///
    /// Called by the reactor at the start of each tick and again right after
    /// the poll syscall returns, so an expiry during the blocking wait is
    /// observable in the same tick, before any I/O event.
    pub fn scan(&mut self, now: Timestamp) {
        for timer in self.timers.values_mut() {
            if timer.active && !timer.expired && timer.expiry <= now {
                timer.expired = true;
            }
        }
    }

    /// Milliseconds until the nearest pending expiry.
    ///
    /// Timers whose flag is already raised do not constrain the poll timeout;
    /// their state cannot change until the application resets them.
    pub fn next_expiry_ms(&self, now: Timestamp) -> Option<u64> {
        self.timers
            .values()
            .filter(|t| t.active && !t.expired)
            .map(|t| now.millis_until(t.expiry))
            .min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_shot_expiry_and_reset() {
        let now = Timestamp::now();
        let mut wheel = TimerWheel::new();
        let id = wheel.create(100, false, now);

        wheel.scan(now.add_ms(50));
        assert!(!wheel.is_expired(id));

        wheel.scan(now.add_ms(150));
        assert!(wheel.is_expired(id));

        // The flag is level-triggered: further scans keep it raised
        wheel.scan(now.add_ms(500));
        assert!(wheel.is_expired(id));

        // Reset deactivates a one-shot timer without destroying it
        wheel.reset(id, now.add_ms(500));
        assert!(!wheel.is_expired(id));
        wheel.scan(now.add_ms(10_000));
        assert!(!wheel.is_expired(id));
        assert_eq!(wheel.len(), 1);
    }

    #[test]
    fn repeating_rearms_from_reset_time() {
        let now = Timestamp::now();
        let mut wheel = TimerWheel::new();
        let id = wheel.create(50, true, now);

        let mut expiries = 0;
        let mut at = now;
        for _ in 0..6 {
            at = at.add_ms(50);
            wheel.scan(at);
            if wheel.is_expired(id) {
                expiries += 1;
                wheel.reset(id, at);
            }
        }
        assert!(expiries >= 3);

        // Without a reset the flag holds and no catch-up burst accumulates
        wheel.scan(at.add_ms(1000));
        assert!(wheel.is_expired(id));
        wheel.reset(id, at.add_ms(1000));
        wheel.scan(at.add_ms(1040));
        assert!(!wheel.is_expired(id), "next expiry counts from reset time");
    }

    #[test]
    fn unknown_ids_are_noops() {
        let now = Timestamp::now();
        let mut wheel = TimerWheel::new();
        let id = wheel.create(10, false, now);
        wheel.destroy(id);
        wheel.destroy(id);
        assert!(!wheel.is_expired(id));
        wheel.reset(id, now);
        assert!(wheel.is_empty());
    }

    #[test]
    fn poll_timeout_ignores_raised_flags() {
        let now = Timestamp::now();
        let mut wheel = TimerWheel::new();
        let fast = wheel.create(10, false, now);
        wheel.create(500, false, now);

        assert_eq!(wheel.next_expiry_ms(now), Some(10));
        wheel.scan(now.add_ms(20));
        assert!(wheel.is_expired(fast));
        // The raised flag no longer drives the timeout
        assert_eq!(wheel.next_expiry_ms(now.add_ms(20)), Some(480));
    }
}
