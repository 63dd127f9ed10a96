// Copyright (c) 2024 Cableguard, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! Monotonic instant that keeps advancing while the host is suspended, so a
//! peer that went quiet during a suspend is still expired on resume.

use std::ops::{Add, Sub};
use std::time::Duration;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as inner;

#[cfg(not(unix))]
mod inner {
    pub(super) use std::time::Instant;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Instant {
    t: inner::Instant,
}

impl Instant {
    pub fn now() -> Self {
        Self {
            t: inner::Instant::now(),
        }
    }

    /// Saturates to zero when `earlier` is later than `self`.
    pub fn duration_since(&self, earlier: Instant) -> Duration {
        self.t.checked_duration_since(earlier.t).unwrap_or_default()
    }

    pub fn checked_duration_since(&self, earlier: Instant) -> Option<Duration> {
        self.t.checked_duration_since(earlier.t)
    }

    pub fn saturating_duration_since(&self, earlier: Instant) -> Duration {
        self.duration_since(earlier)
    }

    pub fn elapsed(&self) -> Duration {
        Self::now().duration_since(*self)
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;

    fn add(self, rhs: Duration) -> Instant {
        Instant { t: self.t + rhs }
    }
}

impl Sub<Duration> for Instant {
    type Output = Instant;

    fn sub(self, rhs: Duration) -> Instant {
        Instant { t: self.t - rhs }
    }
}
