// Copyright (c) 2024 Cableguard, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::errors::DcoError;

/// Transmit side packet id of a key slot.
///
/// Ids are handed out at submission time, so they are strictly increasing
/// in the order `next` is called no matter when the matching AEAD
/// operation completes. Id 0 is never used and the counter never wraps:
/// once `u32::MAX` has been handed out every further call fails.
#[derive(Debug)]
pub struct PacketIdXmit {
    last: AtomicU32,
}

impl Default for PacketIdXmit {
    fn default() -> Self {
        PacketIdXmit {
            last: AtomicU32::new(0),
        }
    }
}

impl PacketIdXmit {
    #[cfg(test)]
    pub(crate) fn starting_at(last: u32) -> Self {
        PacketIdXmit {
            last: AtomicU32::new(last),
        }
    }

    pub fn next(&self) -> Result<u32, DcoError> {
        self.last
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |last| {
                last.checked_add(1)
            })
            .map(|prev| prev + 1)
            .map_err(|_| DcoError::PacketIdExhausted)
    }

    /// Last id handed out, 0 if none.
    pub fn last(&self) -> u32 {
        self.last.load(Ordering::Relaxed)
    }
}

const WORD_SIZE: u64 = 64;
const N_WORDS: u64 = 16; // Suffice to reorder 64*16 = 1024 packets; can be increased at will
const N_BITS: u64 = WORD_SIZE * N_WORDS;

/// Receive side anti-replay window of a key slot.
///
/// `next` is one past the highest id accepted so far, the bitmap holds the
/// last `N_BITS` ids below it. Checking and marking are split so the slot
/// can reject obvious replays before spending time on the AEAD, and only
/// record an id once the packet carrying it authenticated.
#[derive(Debug)]
pub struct PacketIdRecv {
    window: Mutex<ReplayWindow>,
}

#[derive(Debug, Clone, Copy)]
struct ReplayWindow {
    next: u64,
    bitmap: [u64; N_WORDS as usize],
}

impl Default for PacketIdRecv {
    fn default() -> Self {
        PacketIdRecv {
            window: Mutex::new(ReplayWindow {
                next: 0,
                bitmap: [0; N_WORDS as usize],
            }),
        }
    }
}

impl ReplayWindow {
    #[inline(always)]
    fn set_bit(&mut self, idx: u64) {
        let bit_idx = idx % N_BITS;
        let word = (bit_idx / WORD_SIZE) as usize;
        let bit = (bit_idx % WORD_SIZE) as usize;
        self.bitmap[word] |= 1 << bit;
    }

    #[inline(always)]
    fn clear_bit(&mut self, idx: u64) {
        let bit_idx = idx % N_BITS;
        let word = (bit_idx / WORD_SIZE) as usize;
        let bit = (bit_idx % WORD_SIZE) as usize;
        self.bitmap[word] &= !(1u64 << bit);
    }

    /// Clear the word that contains idx
    #[inline(always)]
    fn clear_word(&mut self, idx: u64) {
        let bit_idx = idx % N_BITS;
        let word = (bit_idx / WORD_SIZE) as usize;
        self.bitmap[word] = 0;
    }

    /// Returns true if bit is set, false otherwise
    #[inline(always)]
    fn check_bit(&self, idx: u64) -> bool {
        let bit_idx = idx % N_BITS;
        let word = (bit_idx / WORD_SIZE) as usize;
        let bit = (bit_idx % WORD_SIZE) as usize;
        ((self.bitmap[word] >> bit) & 1) == 1
    }

    fn will_accept(&self, counter: u64) -> Result<(), DcoError> {
        if counter == 0 {
            return Err(DcoError::ReplayOrTooOld);
        }
        if counter >= self.next {
            // As long as the counter is growing no replay took place for sure
            return Ok(());
        }
        if counter + N_BITS < self.next {
            // Drop if too far back
            return Err(DcoError::ReplayOrTooOld);
        }
        if !self.check_bit(counter) {
            Ok(())
        } else {
            Err(DcoError::ReplayOrTooOld)
        }
    }

    fn mark_did_receive(&mut self, counter: u64) -> Result<(), DcoError> {
        self.will_accept(counter)?;

        if counter < self.next {
            // Inside the window: the check above saw the bit clear
            self.set_bit(counter);
            return Ok(());
        }

        // Packets where dropped, or maybe reordered, skip them and mark unused
        if counter - self.next >= N_BITS {
            // Too far ahead, clear all the bits
            for c in self.bitmap.iter_mut() {
                *c = 0;
            }
        } else {
            let mut i = self.next;
            while i % WORD_SIZE != 0 && i < counter {
                // Clear until i aligned to word size
                self.clear_bit(i);
                i += 1;
            }
            while i + WORD_SIZE < counter {
                // Clear whole word at a time
                self.clear_word(i);
                i = (i + WORD_SIZE) & 0u64.wrapping_sub(WORD_SIZE);
            }
            while i < counter {
                // Clear any remaining bits
                self.clear_bit(i);
                i += 1;
            }
        }
        self.set_bit(counter);
        self.next = counter + 1;
        Ok(())
    }
}

impl PacketIdRecv {
    /// Cheap pre-check, does not record anything.
    pub fn will_accept(&self, packet_id: u32) -> Result<(), DcoError> {
        self.window.lock().will_accept(packet_id as u64)
    }

    /// Re-check and record an authenticated packet id. Two completions
    /// racing on the same id are serialized here, only one succeeds.
    pub fn mark_did_receive(&self, packet_id: u32) -> Result<(), DcoError> {
        self.window.lock().mark_did_receive(packet_id as u64)
    }

    /// Highest id accepted so far, 0 if none.
    pub fn high_water_mark(&self) -> u32 {
        self.window.lock().next.saturating_sub(1) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn xmit_starts_at_one() {
        let pid = PacketIdXmit::default();
        assert_eq!(pid.last(), 0);
        assert_eq!(pid.next(), Ok(1));
        assert_eq!(pid.next(), Ok(2));
        assert_eq!(pid.last(), 2);
    }

    #[test]
    fn xmit_exhaustion_is_sticky() {
        let pid = PacketIdXmit::starting_at(u32::MAX - 1);
        assert_eq!(pid.next(), Ok(u32::MAX));
        assert_eq!(pid.next(), Err(DcoError::PacketIdExhausted));
        assert_eq!(pid.next(), Err(DcoError::PacketIdExhausted));
        assert_eq!(pid.last(), u32::MAX);
    }

    #[test]
    fn xmit_concurrent_ids_are_unique() {
        let pid = Arc::new(PacketIdXmit::default());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pid = Arc::clone(&pid);
                std::thread::spawn(move || {
                    let mut ids = Vec::with_capacity(1000);
                    for _ in 0..1000 {
                        ids.push(pid.next().unwrap());
                    }
                    ids
                })
            })
            .collect();

        let mut all = Vec::new();
        for h in handles {
            let ids = h.join().unwrap();
            assert!(ids.windows(2).all(|w| w[0] < w[1]));
            all.extend(ids);
        }
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 4000);
        assert_eq!(pid.last(), 4000);
    }

    #[test]
    fn recv_rejects_duplicate() {
        let r = PacketIdRecv::default();
        assert!(r.mark_did_receive(5).is_ok());
        assert!(r.mark_did_receive(6).is_ok());
        assert!(r.mark_did_receive(7).is_ok());
        assert_eq!(r.mark_did_receive(6), Err(DcoError::ReplayOrTooOld));
        assert_eq!(r.high_water_mark(), 7);
    }

    #[test]
    fn recv_rejects_zero() {
        let r = PacketIdRecv::default();
        assert_eq!(r.will_accept(0), Err(DcoError::ReplayOrTooOld));
        assert_eq!(r.mark_did_receive(0), Err(DcoError::ReplayOrTooOld));
    }

    #[test]
    fn will_accept_does_not_mark() {
        let r = PacketIdRecv::default();
        assert!(r.will_accept(3).is_ok());
        assert!(r.will_accept(3).is_ok());
        assert!(r.mark_did_receive(3).is_ok());
        assert!(r.will_accept(3).is_err());
    }

    #[test]
    fn recv_window() {
        let r = PacketIdRecv::default();
        let n = N_BITS as u32;

        for i in 1..n {
            assert!(r.mark_did_receive(i).is_ok());
            assert!(r.mark_did_receive(i).is_err());
        }

        // Reordered packets inside the window
        assert!(r.mark_did_receive(n + 2).is_ok());
        assert!(r.mark_did_receive(n + 1).is_ok());
        assert!(r.mark_did_receive(n).is_ok());
        assert!(r.mark_did_receive(n + 1).is_err());

        // Jump far ahead, everything old falls out of the window
        assert!(r.mark_did_receive(3 * n).is_ok());
        assert!(r.mark_did_receive(n + 3).is_err());
        assert!(r.mark_did_receive(2 * n).is_err());
        assert!(r.mark_did_receive(2 * n + 1).is_ok());
        assert!(r.mark_did_receive(3 * n - 1).is_ok());
        assert!(r.mark_did_receive(3 * n).is_err());
    }

    #[test]
    fn recv_skipped_ids_stay_acceptable() {
        let r = PacketIdRecv::default();
        assert!(r.mark_did_receive(1).is_ok());
        assert!(r.mark_did_receive(200).is_ok());
        for i in 2..200 {
            assert!(r.mark_did_receive(i).is_ok());
        }
        assert!(r.mark_did_receive(100).is_err());
    }
}
