// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Draining a VP's event queues.

use crate::control::ControlBlock;
use crate::control::PriorityCursors;
use crate::table::EventWordTable;
use std::sync::atomic::Ordering;
use std::sync::atomic::fence;
use xendef::EvtchnPort;

/// Drains the ready queues of one VP, calling `event` for each delivered
/// port. Returns true if any call to `event` returned true.
///
/// Must not run concurrently with another poll of the same control block.
pub(crate) fn poll(
    events: &EventWordTable,
    control: ControlBlock<'_>,
    cursors: &PriorityCursors,
    event: &mut dyn FnMut(EvtchnPort) -> bool,
) -> bool {
    let mut ready = control.take_ready();
    let mut done = false;
    while ready != 0 {
        let priority = u32::BITS - 1 - ready.leading_zeros();
        done |= poll_priority(events, control, cursors, priority, &mut ready, event);
        ready |= control.take_ready();
    }
    done
}

/// Consumes the head of queue `priority`, clearing its bit in `ready` once
/// the queue is empty.
fn poll_priority(
    events: &EventWordTable,
    control: ControlBlock<'_>,
    cursors: &PriorityCursors,
    priority: u32,
    ready: &mut u32,
    event: &mut dyn FnMut(EvtchnPort) -> bool,
) -> bool {
    let mut head = cursors.get(priority);
    if head == 0 {
        fence(Ordering::SeqCst);
        head = control.head(priority);
        if head == 0 {
            tracing::trace!(priority, "ready queue has no head");
            *ready &= !(1 << priority);
            return false;
        }
    }

    let port = EvtchnPort::new(head);
    let word = events.word(port);
    let next = word.unlink();
    if next == 0 {
        *ready &= !(1 << priority);
    }

    let mut done = false;
    if word.is_deliverable() {
        tracing::trace!(%port, priority, "event");
        done = event(port);
    }

    cursors.set(priority, next);
    done
}

#[cfg(test)]
mod tests {
    use crate::test_helpers::TestFifo;
    use std::cell::RefCell;
    use xen_topology::VpIndex;
    use xendef::EVTCHN_FIFO_PRIORITY_DEFAULT;
    use xendef::EvtchnPort;

    const VP0: VpIndex = VpIndex::BSP;

    const A: EvtchnPort = EvtchnPort::new(10);
    const B: EvtchnPort = EvtchnPort::new(20);
    const C: EvtchnPort = EvtchnPort::new(1500);
    const D: EvtchnPort = EvtchnPort::new(40);
    const E: EvtchnPort = EvtchnPort::new(50);

    fn open(vp_indices: &[u8]) -> TestFifo {
        let test = TestFifo::new(vp_indices);
        test.open(&[A, B, C, D, E].map(EvtchnPort::get));
        test
    }

    fn poll_all(test: &TestFifo, cpu: u32) -> (bool, Vec<EvtchnPort>) {
        let mut seen = Vec::new();
        let done = test.abi.poll(cpu, &mut |port| {
            test.abi.port_ack(port);
            seen.push(port);
            true
        });
        (done, seen)
    }

    #[test]
    fn higher_bit_first_then_queue_order() {
        let test = open(&[0]);
        assert!(test.hypervisor.set_pending(B, VP0, 2));
        assert!(test.hypervisor.set_pending(C, VP0, 2));
        assert!(test.hypervisor.set_pending(A, VP0, 5));
        assert_eq!(test.hypervisor.ready(VP0), Some(1 << 2 | 1 << 5));

        let (done, seen) = poll_all(&test, 0);
        assert!(done);
        assert_eq!(seen, [A, B, C]);
        assert_eq!(test.hypervisor.ready(VP0), Some(0));
        for port in [A, B, C] {
            let word = test.fifo.event_word(port);
            assert!(!word.linked() && !word.pending());
            assert_eq!(word.link(), 0);
        }
    }

    #[test]
    fn result_reflects_callbacks() {
        let test = open(&[0]);
        test.hypervisor.set_pending(A, VP0, EVTCHN_FIFO_PRIORITY_DEFAULT);
        test.hypervisor.set_pending(B, VP0, EVTCHN_FIFO_PRIORITY_DEFAULT);
        let mut seen = Vec::new();
        let done = test.abi.poll(0, &mut |port| {
            seen.push(port);
            false
        });
        assert!(!done);
        assert_eq!(seen, [A, B]);

        test.hypervisor.set_pending(C, VP0, EVTCHN_FIFO_PRIORITY_DEFAULT);
        test.hypervisor.set_pending(D, VP0, EVTCHN_FIFO_PRIORITY_DEFAULT);
        let done = test.abi.poll(0, &mut |port| port == D);
        assert!(done);

        assert!(!test.abi.poll(0, &mut |_| true));
    }

    #[test]
    fn signals_during_poll_are_drained() {
        let test = open(&[0]);
        test.hypervisor.set_pending(B, VP0, 2);
        test.hypervisor.set_pending(C, VP0, 2);
        test.hypervisor.set_pending(A, VP0, 5);

        let seen = RefCell::new(Vec::new());
        let done = test.abi.poll(0, &mut |port| {
            seen.borrow_mut().push(port);
            test.abi.port_ack(port);
            match port {
                // A new, more important queue becomes ready.
                A => assert!(test.hypervisor.set_pending(D, VP0, 9)),
                // The queue being drained grows behind the guest's cursor.
                B => assert!(test.hypervisor.set_pending(E, VP0, 2)),
                _ => {}
            }
            true
        });

        assert!(done);
        assert_eq!(*seen.borrow(), [A, D, B, C, E]);
        assert_eq!(test.hypervisor.ready(VP0), Some(0));
    }

    #[test]
    fn drained_queue_restarts_from_published_head() {
        let test = open(&[0]);
        for _ in 0..3 {
            assert!(test.hypervisor.set_pending(A, VP0, EVTCHN_FIFO_PRIORITY_DEFAULT));
            let (done, seen) = poll_all(&test, 0);
            assert!(done);
            assert_eq!(seen, [A]);
        }
    }

    #[test]
    fn masked_events_are_unlinked_not_delivered() {
        let test = open(&[0]);
        test.hypervisor.set_pending(A, VP0, 4);
        test.hypervisor.set_pending(B, VP0, 4);
        test.abi.port_mask(A);

        let (_, seen) = poll_all(&test, 0);
        assert_eq!(seen, [B]);
        let word = test.fifo.event_word(A);
        assert!(word.pending() && word.masked() && !word.linked());

        assert!(test.abi.port_unmask(A));
    }

    #[test]
    fn pending_but_unqueued_is_skipped() {
        let test = open(&[0]);
        test.hypervisor.set_pending(A, VP0, 4);
        test.abi.port_ack(A);

        let (done, seen) = poll_all(&test, 0);
        assert!(!done);
        assert!(seen.is_empty());
        assert!(!test.fifo.event_word(A).linked());
    }

    #[test]
    fn each_vp_has_its_own_queues() {
        let test = open(&[0, 3]);
        let vp3 = VpIndex::new(3);
        test.hypervisor.set_pending(A, VP0, EVTCHN_FIFO_PRIORITY_DEFAULT);
        test.hypervisor.set_pending(B, vp3, EVTCHN_FIFO_PRIORITY_DEFAULT);
        test.hypervisor.set_pending(C, vp3, EVTCHN_FIFO_PRIORITY_DEFAULT);

        assert_eq!(poll_all(&test, 1).1, [B, C]);
        assert_eq!(test.hypervisor.ready(VP0), Some(1 << 7));
        assert_eq!(poll_all(&test, 0).1, [A]);
    }

    #[test]
    fn no_ready_bits() {
        let test = open(&[0]);
        let (done, seen) = poll_all(&test, 0);
        assert!(!done);
        assert!(seen.is_empty());
    }

    #[test]
    #[should_panic(expected = "has no control block")]
    fn poll_before_acquire() {
        let test = TestFifo::new(&[0]);
        test.abi.poll(0, &mut |_| true);
    }
}
