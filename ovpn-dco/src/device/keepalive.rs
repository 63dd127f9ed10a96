// Copyright (c) 2024 Cableguard, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! Keepalive timers.
//!
//! Every peer carries two timers: a receive timeout after which the peer is
//! declared dead, and a transmit interval after which a ping is sent if no
//! other traffic left for the peer. A single worker sweeps all peers and
//! sleeps until the earliest deadline any of them has.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::Instant;

/// Outcome of checking one peer's timers at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveVerdict {
    /// Interval or timeout is zero, the peer is not tracked.
    Disabled,
    /// Nothing was received for at least the timeout.
    Expired,
    /// A ping is due now; the next check is due at `next_run`.
    SendPing { next_run: Instant },
    Idle { next_run: Instant },
}

#[derive(Debug)]
pub struct KeepaliveTimers {
    interval: Duration,
    timeout: Duration,
    last_sent: Instant,
    last_recv: Instant,
}

impl KeepaliveTimers {
    pub fn new(now: Instant) -> Self {
        KeepaliveTimers {
            interval: Duration::ZERO,
            timeout: Duration::ZERO,
            last_sent: now,
            last_recv: now,
        }
    }

    /// Configure both timers, both restart from `now`.
    pub fn set(&mut self, interval: Duration, timeout: Duration, now: Instant) {
        self.interval = interval;
        self.timeout = timeout;
        self.last_sent = now;
        self.last_recv = now;
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn last_sent(&self) -> Instant {
        self.last_sent
    }

    pub fn last_recv(&self) -> Instant {
        self.last_recv
    }

    // Timestamps only move forward, completions can arrive out of order
    pub fn xmit_reset(&mut self, now: Instant) {
        self.last_sent = self.last_sent.max(now);
    }

    pub fn recv_reset(&mut self, now: Instant) {
        self.last_recv = self.last_recv.max(now);
    }

    pub fn check(&self, now: Instant) -> KeepaliveVerdict {
        if self.interval.is_zero() || self.timeout.is_zero() {
            return KeepaliveVerdict::Disabled;
        }

        let since_recv = now.saturating_duration_since(self.last_recv);
        if since_recv >= self.timeout {
            return KeepaliveVerdict::Expired;
        }
        let recv_exp = now + (self.timeout - since_recv);

        let since_sent = now.saturating_duration_since(self.last_sent);
        if since_sent >= self.interval {
            return KeepaliveVerdict::SendPing {
                next_run: recv_exp.min(now + self.interval),
            };
        }
        let xmit_exp = now + (self.interval - since_sent);

        KeepaliveVerdict::Idle {
            next_run: recv_exp.min(xmit_exp),
        }
    }
}

/// Earliest of two optional deadlines.
pub fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

#[derive(Debug, Default)]
struct WorkerState {
    next_run: Option<Instant>,
    kicked: bool,
    stopped: bool,
}

/// Scheduling state of the keepalive sweep.
///
/// The sweep itself lives on the device; this only decides when it runs.
/// Whoever drives it loops on [`KeepaliveWorker::wait_until_due`] and runs
/// a sweep each time it returns true.
#[derive(Debug, Default)]
pub struct KeepaliveWorker {
    state: Mutex<WorkerState>,
    cond: Condvar,
}

impl KeepaliveWorker {
    /// Arm the worker for `next_run`, or disarm it when `None`.
    pub fn schedule(&self, next_run: Option<Instant>) {
        let mut state = self.state.lock();
        state.next_run = next_run;
        self.cond.notify_all();
    }

    /// Run a sweep as soon as possible.
    pub fn kick(&self) {
        let mut state = self.state.lock();
        state.kicked = true;
        self.cond.notify_all();
    }

    pub fn stop(&self) {
        let mut state = self.state.lock();
        state.stopped = true;
        self.cond.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    pub fn next_run(&self) -> Option<Instant> {
        self.state.lock().next_run
    }

    /// Block until a sweep is due. Returns false once the worker is stopped.
    pub fn wait_until_due(&self) -> bool {
        let mut state = self.state.lock();
        loop {
            if state.stopped {
                return false;
            }
            if state.kicked {
                state.kicked = false;
                return true;
            }
            match state.next_run {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        state.next_run = None;
                        return true;
                    }
                    self.cond
                        .wait_for(&mut state, deadline.saturating_duration_since(now));
                }
                None => self.cond.wait(&mut state),
            }
        }
    }
}
