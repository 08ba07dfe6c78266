// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Moments and time-to-live values.
//!
//! The clock enters the engine only through [`Moment::now`]; every
//! expiry path also has an `_at(now)` variant so tests can drive time
//! forward explicitly.

use core::ops::Add;
use core::time::Duration;
use std::time::Instant;

/// The number of milliseconds in a second.
pub const MILLIS: u64 = 1_000;

/// A point in time on a monotonic clock.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct Moment(Instant);

impl Moment {
    pub fn now() -> Self {
        Self(Instant::now())
    }

    /// The number of milliseconds elapsed since `earlier`.
    ///
    /// Saturates to zero if `earlier` is actually later than `self`.
    pub fn delta_as_millis(&self, earlier: Moment) -> u64 {
        self.0.saturating_duration_since(earlier.0).as_millis() as u64
    }
}

impl Add<Duration> for Moment {
    type Output = Moment;

    fn add(self, dur: Duration) -> Self::Output {
        Moment(self.0 + dur)
    }
}

/// The Time To Live in milliseconds.
#[derive(Clone, Copy, Debug)]
pub struct Ttl(u64);

impl Ttl {
    pub fn as_seconds(&self) -> u64 {
        self.0 / 1_000
    }

    pub fn as_milliseconds(&self) -> u64 {
        self.0
    }

    /// Is `last_hit` expired?
    pub fn is_expired(&self, last_hit: Moment, now: Moment) -> bool {
        now.delta_as_millis(last_hit) >= self.0
    }

    /// Create a new TTL based on seconds.
    pub const fn new_seconds(seconds: u64) -> Self {
        Ttl(seconds * MILLIS)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ttl_expiry() {
        let ttl = Ttl::new_seconds(60);
        let start = Moment::now();
        assert!(!ttl.is_expired(start, start));
        assert!(!ttl.is_expired(start, start + Duration::from_secs(59)));
        assert!(ttl.is_expired(start, start + Duration::from_secs(60)));
    }
}
