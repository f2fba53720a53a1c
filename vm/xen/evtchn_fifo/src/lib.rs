// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Guest driver for the Xen FIFO event channel ABI.
//!
//! Each VP registers a control block with the hypervisor. When an event is
//! raised, the hypervisor links the port's event word onto one of sixteen
//! priority queues of the target VP and sets the queue's bit in the control
//! block's `ready` mask. [`EvtchnAbi::poll`] drains those queues on the VP,
//! unlinking each word and delivering the unmasked, pending ports.
//!
//! Event words live in an event array that grows a page at a time as ports
//! are enabled. Polling and the per-port operations take no lock; growth and
//! the acquire/release lifecycle serialize on a single structural lock.
//!
//! Callers must enable a port before it can be raised, unmasked, or
//! otherwise touched, and should quiesce all polling before the last release.
//! Pages shared with the hypervisor are kept until the instance is dropped,
//! so an operation racing with release may panic but never reads freed
//! memory.

// UNSAFETY: Viewing pages shared with the hypervisor as atomic words.
#![expect(unsafe_code)]

mod control;
pub mod emulated;
mod event_word;
pub mod hypercall;
mod lifecycle;
pub mod memory;
mod poll;
mod table;

pub use hypercall::EvtchnHypercalls;
pub use hypercall::InterdomainBinding;
pub use memory::PageAllocator;
pub use memory::PinnedPage;

use control::ControlBlockSet;
use parking_lot::Mutex;
use std::sync::Arc;
use table::EventWordTable;
use thiserror::Error;
use xen_topology::SystemTopology;
use xen_topology::VpIndex;
use xendef::DomainId;
use xendef::EventWord;
use xendef::EvtchnPort;
use xendef::XenError;

/// An error acquiring the ABI or enabling a port. The operation has been
/// rolled back.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to allocate a page")]
    AllocatePage(#[source] anyhow::Error),
    #[error("failed to register the control block for vp {vp}")]
    InitControl {
        vp: VpIndex,
        #[source]
        source: XenError,
    },
    #[error("failed to register event array page {index}")]
    ExpandArray {
        index: usize,
        #[source]
        source: XenError,
    },
}

/// A failure restoring the store event channel across an ABI reset.
#[derive(Debug, Error)]
pub enum ResetError {
    #[error("failed to read the store event channel parameter")]
    GetStoreChannel(#[source] XenError),
    #[error("store event channel parameter {0:#x} is not a port")]
    InvalidStoreChannel(u64),
    #[error("failed to query store event channel {port}")]
    QueryStoreChannel {
        port: EvtchnPort,
        #[source]
        source: XenError,
    },
    #[error("failed to reset the event channel abi")]
    Reset(#[source] XenError),
    #[error("failed to bind to {remote_domain} port {remote_port}")]
    BindStoreChannel {
        remote_domain: DomainId,
        remote_port: EvtchnPort,
        #[source]
        source: XenError,
    },
    #[error("failed to set the store event channel to {port}")]
    SetStoreChannel {
        port: EvtchnPort,
        #[source]
        source: XenError,
    },
}

/// The operations of an event channel ABI, as used by the event channel
/// front end.
pub trait EvtchnAbi: Send + Sync {
    /// Takes a reference on the ABI, registering with the hypervisor on the
    /// first one.
    fn acquire(&self) -> Result<(), Error>;

    /// Drops a reference taken by [`Self::acquire`]. Dropping the last one
    /// resets the ABI. Its pages are reused by the next acquire.
    fn release(&self);

    /// Delivers the pending events of logical processor `cpu` to `event`.
    /// Returns true if any call to `event` returned true.
    ///
    /// Must be called on `cpu`, or at least never concurrently for the same
    /// `cpu`.
    fn poll(&self, cpu: u32, event: &mut dyn FnMut(EvtchnPort) -> bool) -> bool;

    /// Makes `port` usable.
    fn port_enable(&self, port: EvtchnPort) -> Result<(), Error>;

    /// Stops delivery on `port`.
    fn port_disable(&self, port: EvtchnPort);

    /// Acknowledges a delivered event on `port`.
    fn port_ack(&self, port: EvtchnPort);

    /// Suppresses delivery on `port`.
    fn port_mask(&self, port: EvtchnPort);

    /// Resumes delivery on `port`. Returns true if an event arrived while the
    /// port was masked; the caller must deliver it.
    fn port_unmask(&self, port: EvtchnPort) -> bool;
}

/// The FIFO event channel ABI.
pub struct EvtchnFifo {
    fifo: Arc<Fifo>,
}

struct Fifo {
    topology: Arc<SystemTopology>,
    hypercalls: Arc<dyn EvtchnHypercalls>,
    allocator: Arc<dyn PageAllocator>,
    state: Mutex<FifoState>,
    events: EventWordTable,
    controls: ControlBlockSet,
}

/// State guarded by the structural lock. The lock also serializes growth and
/// contraction of the event array.
#[derive(Default)]
struct FifoState {
    references: usize,
}

impl EvtchnFifo {
    /// Creates an instance for the processors of `topology`. Nothing is
    /// registered with the hypervisor until the first acquire.
    pub fn new(
        topology: Arc<SystemTopology>,
        hypercalls: Arc<dyn EvtchnHypercalls>,
        allocator: Arc<dyn PageAllocator>,
    ) -> Self {
        let controls = ControlBlockSet::new(topology.vp_index_limit());
        tracing::debug!(cpus = topology.cpu_count(), "fifo event channel abi initialized");
        Self {
            fifo: Arc::new(Fifo {
                topology,
                hypercalls,
                allocator,
                state: Mutex::new(FifoState::default()),
                events: EventWordTable::new(),
                controls,
            }),
        }
    }

    /// Returns the ABI operations, bound to this instance.
    pub fn abi(&self) -> Arc<dyn EvtchnAbi> {
        self.fifo.clone()
    }

    /// Returns the number of outstanding references.
    pub fn references(&self) -> usize {
        self.fifo.state.lock().references
    }

    /// Returns the number of event array pages.
    pub fn event_page_count(&self) -> usize {
        self.fifo.events.page_count()
    }

    /// Reads the event word of `port`.
    ///
    /// Panics if `port` has not been enabled.
    pub fn event_word(&self, port: EvtchnPort) -> EventWord {
        self.fifo.events.word(port).load()
    }

    /// Destroys the instance. Event array pages enabled without an acquire
    /// are contracted here.
    ///
    /// Panics if it is still acquired.
    pub fn teardown(self) {
        let state = self.fifo.state.lock();
        assert_eq!(
            state.references, 0,
            "fifo event channel abi torn down while acquired"
        );
        let pages = self.fifo.events.page_count();
        if pages != 0 {
            tracing::warn!(pages, "event array expanded without acquire");
            self.fifo.events.contract();
        }
        tracing::debug!("fifo event channel abi torn down");
    }
}

impl EvtchnAbi for Fifo {
    fn acquire(&self) -> Result<(), Error> {
        self.add_reference()
    }

    fn release(&self) {
        self.remove_reference()
    }

    fn poll(&self, cpu: u32, event: &mut dyn FnMut(EvtchnPort) -> bool) -> bool {
        let vp = self.topology.virtual_cpu_index(cpu);
        poll::poll(
            &self.events,
            self.controls.control(vp),
            self.controls.cursors(vp),
            event,
        )
    }

    fn port_enable(&self, port: EvtchnPort) -> Result<(), Error> {
        let _state = self.state.lock();
        if !self.events.covers(port) {
            self.events
                .expand(port, self.hypercalls.as_ref(), self.allocator.as_ref())?;
        }
        Ok(())
    }

    fn port_disable(&self, port: EvtchnPort) {
        self.port_mask(port);
    }

    fn port_ack(&self, port: EvtchnPort) {
        self.events.word(port).clear_pending();
    }

    fn port_mask(&self, port: EvtchnPort) {
        self.events.word(port).set_masked();
    }

    fn port_unmask(&self, port: EvtchnPort) -> bool {
        self.events.word(port).unmask()
    }
}


#[cfg(test)]
mod tests {
    use crate::Error;
    use crate::emulated::Hypercall;
    use crate::test_helpers::TestFifo;
    use xen_topology::VpIndex;
    use xendef::EVENT_WORDS_PER_PAGE;
    use xendef::EVTCHN_FIFO_PRIORITY_DEFAULT;
    use xendef::EvtchnPort;
    use xendef::XenError;

    const VP0: VpIndex = VpIndex::BSP;

    fn expand_calls(test: &TestFifo) -> usize {
        test.hypervisor
            .calls()
            .iter()
            .filter(|call| matches!(call, Hypercall::ExpandArray { .. }))
            .count()
    }

    #[test]
    fn enable_covers_port() {
        let test = TestFifo::new(&[0]);
        test.abi.acquire().unwrap();
        for port in [1, 1023, 1024, 5000, 4095] {
            test.abi.port_enable(EvtchnPort::new(port)).unwrap();
            assert!(port as usize / EVENT_WORDS_PER_PAGE < test.fifo.event_page_count());
        }
        assert_eq!(test.fifo.event_page_count(), 5);
        assert_eq!(test.hypervisor.event_array_len(), 5);
    }

    #[test]
    fn enable_is_idempotent() {
        let test = TestFifo::new(&[0]);
        test.abi.acquire().unwrap();
        let port = EvtchnPort::new(2000);
        test.abi.port_enable(port).unwrap();
        let allocated = test.allocator.allocated();
        let calls = expand_calls(&test);

        test.abi.port_enable(port).unwrap();
        test.abi.port_enable(EvtchnPort::new(3)).unwrap();

        assert_eq!(test.fifo.event_page_count(), 2);
        assert_eq!(test.allocator.allocated(), allocated);
        assert_eq!(expand_calls(&test), calls);
    }

    #[test]
    fn enable_rolls_back_on_failure() {
        let test = TestFifo::new(&[0]);
        test.abi.acquire().unwrap();
        test.abi.port_enable(EvtchnPort::new(1)).unwrap();
        let outstanding = test.allocator.outstanding();

        test.hypervisor.fail_expand_array(2, XenError::ENOMEM);
        let err = test
            .abi
            .port_enable(EvtchnPort::new(3 * EVENT_WORDS_PER_PAGE as u32))
            .unwrap_err();
        assert!(matches!(err, Error::ExpandArray { index: 2, .. }));
        assert_eq!(test.fifo.event_page_count(), 1);
        assert_eq!(test.allocator.outstanding(), outstanding);

        // The same expansion succeeds once the fault has passed.
        test.abi
            .port_enable(EvtchnPort::new(3 * EVENT_WORDS_PER_PAGE as u32))
            .unwrap();
        assert_eq!(test.fifo.event_page_count(), 4);
    }

    #[test]
    fn new_ports_start_masked() {
        let test = TestFifo::new(&[0]);
        test.abi.acquire().unwrap();
        let port = EvtchnPort::new(9);
        test.abi.port_enable(port).unwrap();
        assert!(test.fifo.event_word(port).masked());

        // Raising a masked port leaves it pending but unqueued.
        assert!(!test.hypervisor.set_pending(port, VP0, EVTCHN_FIFO_PRIORITY_DEFAULT));
        let word = test.fifo.event_word(port);
        assert!(word.pending() && !word.linked());
    }

    #[test]
    fn unmask_without_event() {
        let test = TestFifo::new(&[0]);
        test.open(&[9]);
        let port = EvtchnPort::new(9);
        test.abi.port_mask(port);
        assert!(test.fifo.event_word(port).masked());
        assert!(!test.abi.port_unmask(port));
        assert!(!test.fifo.event_word(port).masked());
    }

    #[test]
    fn unmask_reports_suppressed_event_once() {
        let test = TestFifo::new(&[0]);
        test.open(&[9]);
        let port = EvtchnPort::new(9);
        test.abi.port_mask(port);
        test.hypervisor.set_pending(port, VP0, EVTCHN_FIFO_PRIORITY_DEFAULT);

        assert!(test.abi.port_unmask(port));
        assert!(!test.fifo.event_word(port).pending());
        assert!(!test.abi.port_unmask(port));
    }

    #[test]
    fn disable_masks() {
        let test = TestFifo::new(&[0]);
        test.open(&[9]);
        let port = EvtchnPort::new(9);
        test.abi.port_disable(port);
        assert!(test.fifo.event_word(port).masked());
        assert!(!test.hypervisor.set_pending(port, VP0, EVTCHN_FIFO_PRIORITY_DEFAULT));
    }

    #[test]
    fn ack_clears_only_pending() {
        let test = TestFifo::new(&[0]);
        test.open(&[9]);
        let port = EvtchnPort::new(9);
        assert!(test.hypervisor.set_pending(port, VP0, EVTCHN_FIFO_PRIORITY_DEFAULT));
        test.abi.port_mask(port);

        let before = test.hypervisor.event_word(port).unwrap();
        assert!(before.pending() && before.masked() && before.linked());

        test.abi.port_ack(port);
        let after = test.hypervisor.event_word(port).unwrap();
        assert_eq!(after, before.with_pending(false));
    }

    #[test]
    fn teardown_after_enable_without_acquire() {
        let test = TestFifo::new(&[0]);
        test.abi.port_enable(EvtchnPort::new(1500)).unwrap();
        assert_eq!(test.fifo.event_page_count(), 2);
        assert_eq!(test.fifo.references(), 0);

        test.fifo.teardown();
        drop(test.abi);
        assert_eq!(test.allocator.outstanding(), 0);
    }

    #[test]
    #[should_panic(expected = "is not enabled")]
    fn ack_without_enable() {
        let test = TestFifo::new(&[0]);
        test.abi.acquire().unwrap();
        test.abi.port_ack(EvtchnPort::new(1));
    }
}
