// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Traits and types for pages shared with the hypervisor.

use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use xendef::EVENT_WORDS_PER_PAGE;
use xendef::XEN_PAGE_SIZE_USIZE;

/// A page viewed as 32-bit words, the unit the hypervisor accesses shared
/// pages in.
pub type WordPage = [AtomicU32; EVENT_WORDS_PER_PAGE];

/// A pinned, mapped page that can be shared with the hypervisor.
///
/// # Safety
/// The implementor must ensure that `base()` is page aligned, that the page
/// at `base()` remains mapped and is backed by frame `pfn()` for the
/// lifetime of the object, and that it is only ever accessed atomically.
pub unsafe trait MappedPage: Send + Sync {
    /// The virtual address of the mapped page.
    fn base(&self) -> *const u8;

    /// The frame number used to refer to the page when communicating with
    /// the hypervisor.
    fn pfn(&self) -> u64;
}

/// A handle to a pinned page. The page is freed when the last handle is
/// dropped.
///
/// Readers of the event array and control blocks borrow pages without a
/// handle, so pages published to them are only freed with the ABI instance.
#[derive(Clone)]
pub struct PinnedPage {
    mem: Arc<dyn MappedPage>,
}

impl PinnedPage {
    /// Wraps `mem`.
    pub fn new(mem: Arc<dyn MappedPage>) -> Self {
        assert_eq!(
            mem.base() as usize % XEN_PAGE_SIZE_USIZE,
            0,
            "page is not aligned"
        );
        Self { mem }
    }

    /// Gets the frame number of the page.
    pub fn pfn(&self) -> u64 {
        self.mem.pfn()
    }

    /// Gets the page as an array of atomic words.
    pub fn words(&self) -> &WordPage {
        // SAFETY: the page is mapped, aligned, and only accessed atomically
        // for the lifetime of `mem`, per the `MappedPage` contract.
        unsafe { &*self.mem.base().cast::<WordPage>() }
    }

    /// Stores `value` to every word of the page.
    pub fn fill(&self, value: u32) {
        for word in self.words() {
            word.store(value, Ordering::SeqCst);
        }
    }
}

impl std::fmt::Debug for PinnedPage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinnedPage")
            .field("pfn", &format_args!("{:#x}", self.pfn()))
            .finish()
    }
}

/// A source of pinned pages.
pub trait PageAllocator: Send + Sync {
    /// Allocates a zeroed page.
    fn allocate_page(&self) -> anyhow::Result<PinnedPage>;
}
