// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The event array: one event word per port, spread over a growing set of
//! pages registered with the hypervisor.
//!
//! Lookups take no lock. Page pointers live in fixed slots published before
//! the page count that makes them reachable, so a reader that observes a
//! count also observes every page below it. Growth and contraction are
//! serialized by the caller under the structural lock.

use crate::Error;
use crate::event_word::SharedEventWord;
use crate::hypercall::EvtchnHypercalls;
use crate::memory::PageAllocator;
use crate::memory::PinnedPage;
use crate::memory::WordPage;
use parking_lot::Mutex;
use std::ptr::null_mut;
use std::sync::atomic::AtomicPtr;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use xendef::EVENT_WORDS_PER_PAGE;
use xendef::EVTCHN_FIFO_MASKED;
use xendef::EVTCHN_FIFO_MAX_EVENT_PAGES;
use xendef::EVTCHN_FIFO_NR_CHANNELS;
use xendef::EvtchnPort;

/// Page pointers readable without a lock.
///
/// Each slot owns the first page ever published to it until the slots are
/// dropped. Clearing a slot hides the page from new lookups but keeps it
/// mapped, so a reader still holding a word from it stays valid, and the
/// page is published again the next time the slot is filled.
pub(crate) struct PageSlots {
    slots: Box<[AtomicPtr<WordPage>]>,
    pages: Mutex<Box<[Option<PinnedPage>]>>,
}

impl PageSlots {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| AtomicPtr::new(null_mut())).collect(),
            pages: Mutex::new((0..capacity).map(|_| None).collect()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Returns the page owned by slot `index`, if one was ever published.
    pub fn page(&self, index: usize) -> Option<PinnedPage> {
        self.pages.lock()[index].clone()
    }

    /// Makes `page` readable at `index`.
    ///
    /// Panics if the slot already owns a different page.
    pub fn publish(&self, index: usize, page: &PinnedPage) {
        let mut pages = self.pages.lock();
        let owned = pages[index].get_or_insert_with(|| page.clone());
        assert!(
            std::ptr::eq(owned.words(), page.words()),
            "slot {index} already owns page {owned:?}, not {page:?}"
        );
        let ptr = std::ptr::from_ref(owned.words()).cast_mut();
        self.slots[index].store(ptr, Ordering::Release);
    }

    pub fn clear(&self, index: usize) {
        self.slots[index].store(null_mut(), Ordering::Release);
    }

    pub fn get(&self, index: usize) -> Option<&WordPage> {
        let ptr = self.slots.get(index)?.load(Ordering::Acquire);
        // SAFETY: a non-null slot points at the page owned by `pages` at the
        // same index, which is never replaced and is only dropped with
        // `self`.
        unsafe { ptr.as_ref() }
    }
}

/// The event array.
pub(crate) struct EventWordTable {
    slots: PageSlots,
    page_count: AtomicUsize,
}

impl EventWordTable {
    pub fn new() -> Self {
        Self {
            slots: PageSlots::new(EVTCHN_FIFO_MAX_EVENT_PAGES),
            page_count: AtomicUsize::new(0),
        }
    }

    pub fn page_count(&self) -> usize {
        self.page_count.load(Ordering::Acquire)
    }

    pub fn covers(&self, port: EvtchnPort) -> bool {
        port.page_index() < self.page_count()
    }

    /// Returns the event word for `port`.
    ///
    /// Panics if the table has not been expanded to cover `port`.
    pub fn word(&self, port: EvtchnPort) -> SharedEventWord<'_> {
        let index = port.page_index();
        let page_count = self.page_count();
        assert!(
            index < page_count,
            "port {port} is not enabled, event array has {page_count} pages"
        );
        let Some(page) = self.slots.get(index) else {
            panic!("event array page {index} is not mapped");
        };
        SharedEventWord(&page[port.page_offset()])
    }

    /// Grows the table to cover `port`, registering each new page with the
    /// hypervisor. Pages left over from before the last contraction are
    /// reused.
    ///
    /// On failure, the pages allocated by this call are freed and the table
    /// is unchanged.
    pub fn expand(
        &self,
        port: EvtchnPort,
        hypercalls: &dyn EvtchnHypercalls,
        allocator: &dyn PageAllocator,
    ) -> Result<(), Error> {
        assert!(
            port.get() < EVTCHN_FIFO_NR_CHANNELS,
            "port {port} is beyond the fifo link space"
        );
        let old_count = self.page_count();
        let new_count = port.page_index() + 1;
        assert!(new_count > old_count, "port {port} is already covered");

        let mut new_pages = Vec::with_capacity(new_count - old_count);
        for index in old_count..new_count {
            let page = match self.slots.page(index) {
                Some(page) => page,
                None => allocator.allocate_page().map_err(|err| {
                    tracing::error!(
                        index,
                        error = err.as_ref() as &dyn std::error::Error,
                        "failed to allocate event array page"
                    );
                    Error::AllocatePage(err)
                })?,
            };

            page.fill(1 << EVTCHN_FIFO_MASKED);

            hypercalls.expand_array(page.pfn()).map_err(|source| {
                tracing::error!(
                    index,
                    pfn = page.pfn(),
                    error = &source as &dyn std::error::Error,
                    "failed to register event array page"
                );
                Error::ExpandArray { index, source }
            })?;

            tracing::info!(index, pfn = page.pfn(), "event array page registered");
            new_pages.push(page);
        }

        for (index, page) in (old_count..).zip(&new_pages) {
            self.slots.publish(index, page);
        }
        self.page_count.store(new_count, Ordering::Release);

        tracing::info!(
            start = old_count * EVENT_WORDS_PER_PAGE,
            end = new_count * EVENT_WORDS_PER_PAGE - 1,
            "added ports"
        );
        Ok(())
    }

    /// Hides every page from lookups. The pages stay owned by the table.
    pub fn contract(&self) {
        let page_count = self.page_count.swap(0, Ordering::AcqRel);
        for index in 0..page_count {
            self.slots.clear(index);
        }
    }

    /// Returns the word for `port` if it is covered.
    #[cfg(test)]
    pub fn raw_word(&self, port: EvtchnPort) -> Option<&std::sync::atomic::AtomicU32> {
        self.covers(port)
            .then(|| self.slots.get(port.page_index()))
            .flatten()
            .map(|page| &page[port.page_offset()])
    }
}
