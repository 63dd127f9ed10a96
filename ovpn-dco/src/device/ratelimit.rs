// Copyright (c) 2024 Cableguard, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::Instant;

/// Number of data path diagnostics we emit per second at most
pub const LOG_RATE_LIMIT: u64 = 10;

const RESET_PERIOD: Duration = Duration::from_secs(1);

/// Caps how often dropped-packet diagnostics reach the log, so junk from
/// the network cannot flood it. The counter is reset lazily by the first
/// caller of a new period.
#[derive(Debug)]
pub struct LogRateLimiter {
    limit: u64,
    count: AtomicU64,
    period_start: Mutex<Instant>,
}

impl LogRateLimiter {
    pub fn new(limit: u64) -> Self {
        LogRateLimiter {
            limit,
            count: AtomicU64::new(0),
            period_start: Mutex::new(Instant::now()),
        }
    }

    pub fn allow(&self) -> bool {
        self.allow_at(Instant::now())
    }

    pub fn allow_at(&self, now: Instant) -> bool {
        {
            let mut start = self.period_start.lock();
            if now.saturating_duration_since(*start) >= RESET_PERIOD {
                *start = now;
                self.count.store(0, Ordering::Relaxed);
            }
        }
        self.count.fetch_add(1, Ordering::Relaxed) < self.limit
    }
}

impl Default for LogRateLimiter {
    fn default() -> Self {
        LogRateLimiter::new(LOG_RATE_LIMIT)
    }
}
