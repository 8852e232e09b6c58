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

//! Monotonic clock used for timer expiry and diagnostic timing.

use std::time::{Duration, Instant};

/// A monotonic point in time.
///
/// Backed by [`Instant`], so it is unaffected by wall-clock adjustments. All
/// timer expiries in the reactor are expressed as `Timestamp`s.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug)]
pub struct Timestamp(Instant);

impl Timestamp {
    /// Returns the current monotonic time.
    pub fn now() -> Self { Timestamp(Instant::now()) }

    /// Returns a time point `ms` milliseconds after this one.
    pub fn add_ms(self, ms: u64) -> Self { Timestamp(self.0 + Duration::from_millis(ms)) }

    /// Signed number of milliseconds elapsed from `earlier` to `self`.
    ///
    /// Negative when `self` precedes `earlier`.
    pub fn millis_since(self, earlier: Timestamp) -> i64 {
        if self.0 >= earlier.0 {
            self.0.duration_since(earlier.0).as_millis() as i64
        } else {
            -(earlier.0.duration_since(self.0).as_millis() as i64)
        }
    }

    /// Milliseconds elapsed from this time point until now.
    pub fn elapsed_ms(self) -> i64 { Timestamp::now().millis_since(self) }

    /// Milliseconds remaining until `later`, or zero if `later` has passed.
    pub fn millis_until(self, later: Timestamp) -> u64 {
        later.millis_since(self).max(0) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_diff() {
        let a = Timestamp::now();
        let b = a.add_ms(250);
        assert_eq!(b.millis_since(a), 250);
        assert_eq!(a.millis_since(b), -250);
        assert_eq!(a.millis_until(b), 250);
        assert_eq!(b.millis_until(a), 0);
    }

    #[test]
    fn ordering_is_monotonic() {
        let a = Timestamp::now();
        let b = Timestamp::now();
        assert!(b >= a);
        assert!(a.elapsed_ms() >= 0);
    }
}
