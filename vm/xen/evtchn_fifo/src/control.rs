// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-VP control blocks and the guest's queue cursors.

use crate::memory::PinnedPage;
use crate::memory::WordPage;
use crate::table::PageSlots;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use xen_topology::VpIndex;
use xendef::CONTROL_BLOCK_HEAD_WORD;
use xendef::CONTROL_BLOCK_READY_WORD;
use xendef::EVTCHN_FIFO_MAX_QUEUES;

const READY_MASK: u32 = ((1u64 << EVTCHN_FIFO_MAX_QUEUES) - 1) as u32;

/// A control block in shared memory. The hypervisor writes `ready` and
/// `head`; the guest only ever takes `ready`.
#[derive(Copy, Clone)]
pub(crate) struct ControlBlock<'a>(pub &'a WordPage);

impl ControlBlock<'_> {
    /// Atomically takes the set of ready priorities. Bits beyond the last
    /// queue are dropped.
    pub fn take_ready(&self) -> u32 {
        self.0[CONTROL_BLOCK_READY_WORD].swap(0, Ordering::SeqCst) & READY_MASK
    }

    /// Reads the published head of queue `priority`.
    pub fn head(&self, priority: u32) -> u32 {
        self.0[CONTROL_BLOCK_HEAD_WORD + priority as usize].load(Ordering::Acquire)
    }
}

/// The guest's position in each queue of one VP.
///
/// Only the VP's own poll loop touches these, so relaxed accesses suffice.
pub(crate) struct PriorityCursors([AtomicU32; EVTCHN_FIFO_MAX_QUEUES]);

impl PriorityCursors {
    fn new() -> Self {
        Self([const { AtomicU32::new(0) }; EVTCHN_FIFO_MAX_QUEUES])
    }

    pub fn get(&self, priority: u32) -> u32 {
        self.0[priority as usize].load(Ordering::Relaxed)
    }

    pub fn set(&self, priority: u32, head: u32) {
        self.0[priority as usize].store(head, Ordering::Relaxed);
    }

    fn reset(&self) {
        for cursor in &self.0 {
            cursor.store(0, Ordering::Relaxed);
        }
    }
}

/// The control blocks of every VP, indexed by VP index.
pub(crate) struct ControlBlockSet {
    slots: PageSlots,
    cursors: Box<[PriorityCursors]>,
}

impl ControlBlockSet {
    /// Returns a set for VP indices below `vp_count`.
    pub fn new(vp_count: u32) -> Self {
        Self {
            slots: PageSlots::new(vp_count as usize),
            cursors: (0..vp_count).map(|_| PriorityCursors::new()).collect(),
        }
    }

    /// Returns the control block of `vp`.
    ///
    /// Panics if `vp` has no registered control block.
    pub fn control(&self, vp: VpIndex) -> ControlBlock<'_> {
        let Some(page) = self.slots.get(vp.index() as usize) else {
            panic!("vp {vp} has no control block");
        };
        ControlBlock(page)
    }

    pub fn cursors(&self, vp: VpIndex) -> &PriorityCursors {
        &self.cursors[vp.index() as usize]
    }

    /// Returns the page that last backed the control block of `vp`, if any.
    pub fn page(&self, vp: VpIndex) -> Option<PinnedPage> {
        self.slots.page(vp.index() as usize)
    }

    pub fn publish(&self, vp: VpIndex, page: &PinnedPage) {
        let index = vp.index() as usize;
        assert!(
            index < self.slots.capacity(),
            "vp {vp} is outside the topology"
        );
        self.cursors[index].reset();
        self.slots.publish(index, page);
    }

    pub fn clear(&self, vp: VpIndex) {
        self.slots.clear(vp.index() as usize);
        self.cursors[vp.index() as usize].reset();
    }
}
