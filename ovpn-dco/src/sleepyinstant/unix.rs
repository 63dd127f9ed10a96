// Copyright (c) 2024 Cableguard, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

use std::ops::{Add, Sub};
use std::time::Duration;

use nix::sys::time::TimeSpec;
use nix::time::{clock_gettime, ClockId};

#[cfg(any(target_os = "linux", target_os = "android"))]
const CLOCK_ID: ClockId = ClockId::CLOCK_BOOTTIME;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const CLOCK_ID: ClockId = ClockId::CLOCK_MONOTONIC;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct Instant {
    since_boot: Duration,
}

impl Instant {
    pub(crate) fn now() -> Self {
        // clock_gettime with a valid clock id cannot fail on supported platforms
        let t = clock_gettime(CLOCK_ID).unwrap_or_else(|_| TimeSpec::new(0, 0));
        Self {
            since_boot: Duration::new(t.tv_sec() as u64, t.tv_nsec() as u32),
        }
    }

    pub(crate) fn checked_duration_since(&self, earlier: Instant) -> Option<Duration> {
        self.since_boot.checked_sub(earlier.since_boot)
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;

    fn add(self, rhs: Duration) -> Instant {
        Instant {
            since_boot: self.since_boot + rhs,
        }
    }
}

impl Sub<Duration> for Instant {
    type Output = Instant;

    fn sub(self, rhs: Duration) -> Instant {
        Instant {
            since_boot: self.since_boot.saturating_sub(rhs),
        }
    }
}
