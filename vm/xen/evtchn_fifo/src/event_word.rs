// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Guest-side transitions of a single event word.
//!
//! The hypervisor sets PENDING, LINKED and BUSY and writes LINK concurrently
//! with the guest, so every guest update is a single atomic read-modify-write
//! that leaves the bits it does not own untouched.

use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use xendef::EVTCHN_FIFO_BUSY;
use xendef::EVTCHN_FIFO_LINK_MASK;
use xendef::EVTCHN_FIFO_LINKED;
use xendef::EVTCHN_FIFO_MASKED;
use xendef::EVTCHN_FIFO_PENDING;
use xendef::EventWord;

const PENDING: u32 = 1 << EVTCHN_FIFO_PENDING;
const MASKED: u32 = 1 << EVTCHN_FIFO_MASKED;
const LINKED: u32 = 1 << EVTCHN_FIFO_LINKED;
const BUSY: u32 = 1 << EVTCHN_FIFO_BUSY;

/// An event word in shared memory.
#[derive(Copy, Clone)]
pub(crate) struct SharedEventWord<'a>(pub &'a AtomicU32);

impl SharedEventWord<'_> {
    pub fn load(&self) -> EventWord {
        EventWord::from_bits(self.0.load(Ordering::Acquire))
    }

    pub fn set_masked(&self) {
        self.0.fetch_or(MASKED, Ordering::SeqCst);
    }

    pub fn clear_pending(&self) {
        self.0.fetch_and(!PENDING, Ordering::SeqCst);
    }

    /// Returns true if the event should be delivered: it is pending and not
    /// masked.
    pub fn is_deliverable(&self) -> bool {
        let word = self.load();
        word.pending() && !word.masked()
    }

    /// Removes the word from its queue by clearing LINKED and LINK, returning
    /// the port that followed it (zero at the end of the queue).
    pub fn unlink(&self) -> u32 {
        let mut old = self.0.load(Ordering::Relaxed);
        loop {
            let new = old & !(LINKED | EVTCHN_FIFO_LINK_MASK);
            match self
                .0
                .compare_exchange_weak(old, new, Ordering::SeqCst, Ordering::Relaxed)
            {
                Ok(_) => break old & EVTCHN_FIFO_LINK_MASK,
                Err(current) => old = current,
            }
        }
    }

    /// Clears MASKED, waiting out any hypervisor update in progress (BUSY).
    ///
    /// Returns true if the word was masked and an event arrived while it was;
    /// that event was never queued, so PENDING is cleared and the caller
    /// must deliver it.
    pub fn unmask(&self) -> bool {
        let mut old = self.0.load(Ordering::Relaxed) & !BUSY;
        loop {
            match self.0.compare_exchange_weak(
                old,
                old & !MASKED,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => {
                    if current & BUSY != 0 {
                        std::hint::spin_loop();
                    }
                    old = current & !BUSY;
                }
            }
        }

        if old & MASKED == 0 {
            return false;
        }

        self.0.fetch_and(!PENDING, Ordering::SeqCst) & PENDING != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    fn word(value: u32) -> AtomicU32 {
        AtomicU32::new(value)
    }

    #[test]
    fn unlink_returns_next_and_keeps_flags() {
        let raw = word(PENDING | LINKED | 0x1_2345);
        let next = SharedEventWord(&raw).unlink();
        assert_eq!(next, 0x1_2345);
        assert_eq!(raw.load(Ordering::Relaxed), PENDING);

        assert_eq!(SharedEventWord(&raw).unlink(), 0);
        assert_eq!(raw.load(Ordering::Relaxed), PENDING);
    }

    #[test]
    fn unlink_races_with_pending_updates() {
        const NEXT: u32 = 0x1_0203;
        let raw = Arc::new(word(PENDING | MASKED));
        let stop = Arc::new(AtomicBool::new(false));
        let writer = std::thread::spawn({
            let raw = raw.clone();
            let stop = stop.clone();
            move || {
                // Flips come in pairs so PENDING ends where it started.
                while !stop.load(Ordering::Relaxed) {
                    raw.fetch_xor(PENDING, Ordering::SeqCst);
                    raw.fetch_xor(PENDING, Ordering::SeqCst);
                }
            }
        });

        for _ in 0..10_000 {
            raw.fetch_or(LINKED | NEXT, Ordering::SeqCst);
            assert_eq!(SharedEventWord(&raw).unlink(), NEXT);
            let value = raw.load(Ordering::SeqCst);
            assert_eq!(value & (LINKED | EVTCHN_FIFO_LINK_MASK), 0);
            assert_eq!(value & MASKED, MASKED);
        }

        stop.store(true, Ordering::Relaxed);
        writer.join().unwrap();
        assert_eq!(raw.load(Ordering::SeqCst), PENDING | MASKED);
    }

    #[test]
    fn ack_leaves_other_bits() {
        let raw = word(PENDING | MASKED | LINKED | 7);
        SharedEventWord(&raw).clear_pending();
        assert_eq!(raw.load(Ordering::Relaxed), MASKED | LINKED | 7);
    }

    #[test]
    fn unmask_unmasked() {
        let raw = word(PENDING);
        assert!(!SharedEventWord(&raw).unmask());
        assert_eq!(raw.load(Ordering::Relaxed), PENDING);
    }

    #[test]
    fn unmask_masked_idle() {
        let raw = word(MASKED);
        assert!(!SharedEventWord(&raw).unmask());
        assert_eq!(raw.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn unmask_masked_pending() {
        let raw = word(MASKED | PENDING);
        let event = SharedEventWord(&raw);
        assert!(event.unmask());
        assert_eq!(raw.load(Ordering::Relaxed), 0);

        event.set_masked();
        assert!(!event.unmask());
    }

    #[test]
    fn unmask_waits_for_busy() {
        let raw = Arc::new(word(MASKED | BUSY | PENDING));
        let thread = std::thread::spawn({
            let raw = raw.clone();
            move || SharedEventWord(&raw).unmask()
        });

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(raw.load(Ordering::SeqCst) & MASKED, MASKED);
        raw.fetch_and(!BUSY, Ordering::SeqCst);

        assert!(thread.join().unwrap());
        assert_eq!(raw.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn deliverable() {
        assert!(SharedEventWord(&word(PENDING | LINKED)).is_deliverable());
        assert!(!SharedEventWord(&word(PENDING | MASKED)).is_deliverable());
        assert!(!SharedEventWord(&word(LINKED)).is_deliverable());
    }
}
