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

//! Cooperative task sequencer: an ordered chain of delayed callbacks, plain
//! waits and wait-for-condition steps, driven by level-triggered timers.
//!
//! A sequence holds at most one outstanding timer. Applications call
//! [`Sequence::tick`] once per event-loop iteration; everything else — step
//! advance, condition re-polling, pause remainders — derives from the timer's
//! expiry flag. No callback ever runs from inside the reactor tick itself.

use crate::clock::Timestamp;
use crate::system::NetworkSystem;
use crate::timers::TimerId;

enum Step {
    /// Wait `delay_ms`, invoke the callback, advance.
    Callback {
        f: Box<dyn FnMut()>,
        delay_ms: u64,
    },
    /// Wait `period_ms`, advance.
    Wait { period_ms: u64 },
    /// Every `poll_ms`, evaluate the predicate; advance once it holds or
    /// once `timeout_ms` has elapsed since the step started. A timed-out
    /// condition advances exactly like a met one.
    WaitCondition {
        pred: Box<dyn FnMut() -> bool>,
        poll_ms: u64,
        timeout_ms: u64,
    },
}

impl Step {
    fn first_delay(&self) -> u64 {
        match self {
            Step::Callback { delay_ms, .. } => *delay_ms,
            Step::Wait { period_ms } => *period_ms,
            Step::WaitCondition { poll_ms, .. } => *poll_ms,
        }
    }
}

/// An ordered, pausable chain of timer-driven steps.
///
/// Steps may be appended while the sequence runs; they execute after the
/// current tail. Stopping clears progress but keeps the steps; starting
/// again replays from the beginning.
#[derive(Default)]
pub struct Sequence {
    steps: Vec<Step>,
    current: usize,
    running: bool,
    paused: bool,
    timer: Option<TimerId>,
    /// Duration the outstanding timer was armed with.
    armed_ms: u64,
    /// When the outstanding timer was armed.
    armed_at: Option<Timestamp>,
    /// When the current wait-condition step first armed.
    condition_since: Option<Timestamp>,
    /// Carry-over computed by `pause`, consumed by the next arm.
    remaining_ms: Option<u64>,
}

impl Sequence {
    pub fn new() -> Self { Sequence::default() }

    /// Appends a step which waits `delay_ms` and then invokes `f`.
    pub fn add_callback(&mut self, delay_ms: u64, f: impl FnMut() + 'static) {
        self.steps.push(Step::Callback {
            f: Box::new(f),
            delay_ms,
        });
    }

    /// Appends a plain delay step.
    pub fn add_wait(&mut self, period_ms: u64) {
        self.steps.push(Step::Wait { period_ms });
    }

    /// Appends a step polling `pred` every `poll_ms`, advancing when it
    /// returns `true` or after `timeout_ms` at the latest.
    pub fn add_wait_condition(
        &mut self,
        pred: impl FnMut() -> bool + 'static,
        poll_ms: u64,
        timeout_ms: u64,
    ) {
        self.steps.push(Step::WaitCondition {
            pred: Box::new(pred),
            poll_ms,
            timeout_ms,
        });
    }

    /// Drops all steps and any outstanding timer.
    pub fn clear(&mut self, net: &mut NetworkSystem) {
        self.steps.clear();
        self.reset_progress(net);
        self.running = false;
        self.paused = false;
    }

    pub fn is_running(&self) -> bool { self.running }

    pub fn is_paused(&self) -> bool { self.paused }

    /// Index of the step currently waited on.
    pub fn current_step(&self) -> usize { self.current }

    /// Starts execution from the first step. No-op while running.
    pub fn start(&mut self, net: &mut NetworkSystem) {
        if self.running {
            return;
        }
        #[cfg(feature = "log")]
        log::debug!(target: "sequence", "Starting sequence of {} steps", self.steps.len());
        self.running = true;
        self.paused = false;
        self.current = 0;
        self.remaining_ms = None;
        self.condition_since = None;
        self.arm(net);
    }

    /// Stops execution and discards progress.
    pub fn stop(&mut self, net: &mut NetworkSystem) {
        self.running = false;
        self.paused = false;
        self.reset_progress(net);
    }

    /// Suspends execution, remembering the remaining time of the armed step.
    pub fn pause(&mut self, net: &mut NetworkSystem) {
        if !self.running || self.paused {
            return;
        }
        self.paused = true;
        if let Some(timer) = self.timer.take() {
            net.destroy_timer(timer);
            let elapsed = self.armed_at.map(|at| at.elapsed_ms().max(0) as u64).unwrap_or(0);
            self.remaining_ms = Some(self.armed_ms.saturating_sub(elapsed));
            #[cfg(feature = "log")]
            log::debug!(target: "sequence", "Paused with {}ms remaining", self.armed_ms.saturating_sub(elapsed));
        }
    }

    /// Resumes a paused sequence with the stored remainder.
    pub fn resume(&mut self, net: &mut NetworkSystem) {
        if !self.running || !self.paused {
            return;
        }
        self.paused = false;
        self.arm(net);
    }

    /// Advances the chain; call once per event-loop iteration.
    pub fn tick(&mut self, net: &mut NetworkSystem) {
        if !self.running || self.paused {
            return;
        }
        let Some(timer) = self.timer else {
            return;
        };
        if !net.is_timer_expired(timer) {
            return;
        }
        net.destroy_timer(timer);
        self.timer = None;

        match &mut self.steps[self.current] {
            Step::Callback { f, .. } => {
                f();
                self.advance(net);
            }
            Step::Wait { .. } => self.advance(net),
            Step::WaitCondition {
                pred, timeout_ms, ..
            } => {
                let timeout_ms = *timeout_ms;
                let satisfied = pred();
                let elapsed = self
                    .condition_since
                    .map(|since| since.elapsed_ms().max(0) as u64)
                    .unwrap_or(0);
                if satisfied || elapsed >= timeout_ms {
                    // Timeout is best-effort progress, not an error
                    self.advance(net);
                } else {
                    self.arm(net);
                }
            }
        }
    }

    fn advance(&mut self, net: &mut NetworkSystem) {
        self.current += 1;
        self.remaining_ms = None;
        self.condition_since = None;
        self.arm(net);
    }

    /// Arms the timer for the current step, finishing the sequence when no
    /// steps remain.
    fn arm(&mut self, net: &mut NetworkSystem) {
        if self.current >= self.steps.len() {
            #[cfg(feature = "log")]
            log::debug!(target: "sequence", "Sequence finished");
            self.running = false;
            return;
        }
        let step = &self.steps[self.current];
        let delay = self.remaining_ms.take().unwrap_or_else(|| step.first_delay());
        if matches!(step, Step::WaitCondition { .. }) && self.condition_since.is_none() {
            self.condition_since = Some(Timestamp::now());
        }
        self.armed_ms = delay;
        self.armed_at = Some(Timestamp::now());
        self.timer = Some(net.create_timer(delay, false));
    }

    fn reset_progress(&mut self, net: &mut NetworkSystem) {
        self.current = 0;
        self.remaining_ms = None;
        self.condition_since = None;
        self.armed_at = None;
        if let Some(timer) = self.timer.take() {
            net.destroy_timer(timer);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    const DEADLINE_MS: i64 = 5000;

    fn run_to_completion(net: &mut NetworkSystem, seq: &mut Sequence) {
        let started = Timestamp::now();
        while seq.is_running() && started.elapsed_ms() < DEADLINE_MS {
            net.poll(5);
            seq.tick(net);
        }
        assert!(!seq.is_running(), "sequence stuck after {DEADLINE_MS}ms");
    }

    #[test]
    fn callbacks_run_in_order_after_delays() {
        let mut net = NetworkSystem::new().unwrap();
        let mut seq = Sequence::new();
        let log: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(vec![]));

        let slot = log.clone();
        seq.add_callback(20, move || slot.borrow_mut().push("first"));
        seq.add_wait(30);
        let slot = log.clone();
        seq.add_callback(0, move || slot.borrow_mut().push("second"));

        let started = Timestamp::now();
        seq.start(&mut net);
        run_to_completion(&mut net, &mut seq);

        assert_eq!(log.borrow().as_slice(), &["first", "second"]);
        assert!(started.elapsed_ms() >= 50, "delays were honored");
    }

    #[test]
    fn condition_met_advances_early() {
        let mut net = NetworkSystem::new().unwrap();
        let mut seq = Sequence::new();
        let flag = Rc::new(RefCell::new(0u32));
        let done: Rc<RefCell<bool>> = Rc::new(RefCell::new(false));

        let probe = flag.clone();
        seq.add_wait_condition(
            move || {
                *probe.borrow_mut() += 1;
                *probe.borrow() >= 3
            },
            10,
            10_000,
        );
        let slot = done.clone();
        seq.add_callback(0, move || *slot.borrow_mut() = true);

        let started = Timestamp::now();
        seq.start(&mut net);
        run_to_completion(&mut net, &mut seq);

        assert!(*done.borrow());
        assert!(*flag.borrow() >= 3);
        assert!(started.elapsed_ms() < 5000, "did not wait for the full timeout");
    }

    #[test]
    fn condition_timeout_still_advances() {
        let mut net = NetworkSystem::new().unwrap();
        let mut seq = Sequence::new();
        let reached = Rc::new(RefCell::new(false));

        seq.add_wait_condition(|| false, 10, 80);
        let slot = reached.clone();
        seq.add_callback(0, move || *slot.borrow_mut() = true);

        seq.start(&mut net);
        run_to_completion(&mut net, &mut seq);
        assert!(*reached.borrow(), "timed-out condition advances like a met one");
    }

    #[test]
    fn pause_stores_remainder_and_resume_continues() {
        let mut net = NetworkSystem::new().unwrap();
        let mut seq = Sequence::new();
        let fired = Rc::new(RefCell::new(false));
        let slot = fired.clone();
        seq.add_callback(100, move || *slot.borrow_mut() = true);

        seq.start(&mut net);
        // Let roughly a third of the delay elapse
        let started = Timestamp::now();
        while started.elapsed_ms() < 30 {
            net.poll(5);
            seq.tick(&mut net);
        }
        seq.pause(&mut net);
        assert!(seq.is_paused());
        assert!(!*fired.borrow());

        // Time spent paused must not count towards the delay
        std::thread::sleep(std::time::Duration::from_millis(120));
        net.poll(0);
        seq.tick(&mut net);
        assert!(!*fired.borrow(), "paused sequence does not advance");

        seq.resume(&mut net);
        let resumed = Timestamp::now();
        run_to_completion(&mut net, &mut seq);
        assert!(*fired.borrow());
        assert!(resumed.elapsed_ms() >= 50, "resume waited the remainder, not zero");
    }

    #[test]
    fn stop_halts_and_restart_replays() {
        let mut net = NetworkSystem::new().unwrap();
        let mut seq = Sequence::new();
        let count = Rc::new(RefCell::new(0u32));
        let slot = count.clone();
        seq.add_callback(10, move || *slot.borrow_mut() += 1);

        seq.start(&mut net);
        seq.stop(&mut net);
        let started = Timestamp::now();
        while started.elapsed_ms() < 50 {
            net.poll(5);
            seq.tick(&mut net);
        }
        assert_eq!(*count.borrow(), 0);

        seq.start(&mut net);
        run_to_completion(&mut net, &mut seq);
        assert_eq!(*count.borrow(), 1);
    }

    #[test]
    fn steps_may_be_appended_while_running() {
        let mut net = NetworkSystem::new().unwrap();
        let mut seq = Sequence::new();
        let log: Rc<RefCell<Vec<u32>>> = Rc::new(RefCell::new(vec![]));

        let slot = log.clone();
        seq.add_callback(10, move || slot.borrow_mut().push(1));
        seq.start(&mut net);

        let slot = log.clone();
        seq.add_callback(10, move || slot.borrow_mut().push(2));

        run_to_completion(&mut net, &mut seq);
        assert_eq!(log.borrow().as_slice(), &[1, 2]);
    }
}
