// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! An emulated hypervisor and page allocator, for running the FIFO ABI
//! without a real Xen host.
//!
//! The hypervisor side implements the FIFO queue insertion Xen performs when
//! it raises an event, so polling sees real linked queues.

use crate::hypercall::EvtchnHypercalls;
use crate::hypercall::InterdomainBinding;
use crate::memory::MappedPage;
use crate::memory::PageAllocator;
use crate::memory::PinnedPage;
use crate::memory::WordPage;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use xen_topology::VpIndex;
use xendef::CONTROL_BLOCK_HEAD_WORD;
use xendef::CONTROL_BLOCK_READY_WORD;
use xendef::EVTCHN_FIFO_BUSY;
use xendef::EVTCHN_FIFO_LINK_MASK;
use xendef::EVTCHN_FIFO_LINKED;
use xendef::EVTCHN_FIFO_MASKED;
use xendef::EVTCHN_FIFO_MAX_EVENT_PAGES;
use xendef::EVTCHN_FIFO_NR_CHANNELS;
use xendef::EVTCHN_FIFO_PENDING;
use xendef::EVTCHN_FIFO_PRIORITY_MIN;
use xendef::EventWord;
use xendef::EvtchnPort;
use xendef::HvmParam;
use xendef::XenError;
use xendef::XenResult;

/// The first frame number handed out by [`EmulatedPageAllocator`].
const FIRST_PFN: u64 = 0x1000;

#[repr(C, align(4096))]
struct Page(WordPage);

struct HeapPage {
    page: Box<Page>,
    pfn: u64,
    state: Arc<Mutex<AllocatorState>>,
}

// SAFETY: the page is a page-aligned heap allocation owned by this object,
// and it is only accessed through atomics.
unsafe impl MappedPage for HeapPage {
    fn base(&self) -> *const u8 {
        std::ptr::from_ref(&*self.page).cast()
    }

    fn pfn(&self) -> u64 {
        self.pfn
    }
}

impl Drop for HeapPage {
    fn drop(&mut self) {
        self.state.lock().pages.remove(&self.pfn);
    }
}

#[derive(Default)]
struct AllocatorState {
    pages: HashMap<u64, Weak<HeapPage>>,
    next_pfn: u64,
    allocated: usize,
    fail_at: Option<usize>,
}

/// A page allocator backed by the heap, assigning synthetic frame numbers.
#[derive(Clone)]
pub struct EmulatedPageAllocator {
    state: Arc<Mutex<AllocatorState>>,
}

impl EmulatedPageAllocator {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(AllocatorState {
                next_pfn: FIRST_PFN,
                ..Default::default()
            })),
        }
    }

    /// Fails the `n`th allocation from now, counting from one.
    pub fn fail_allocation(&self, n: usize) {
        assert_ne!(n, 0);
        let mut state = self.state.lock();
        state.fail_at = Some(state.allocated + n);
    }

    /// Returns the number of successful allocations.
    pub fn allocated(&self) -> usize {
        self.state.lock().allocated
    }

    /// Returns the number of pages not yet freed.
    pub fn outstanding(&self) -> usize {
        self.state.lock().pages.len()
    }

    /// Looks up a live page by frame number.
    pub fn lookup(&self, pfn: u64) -> Option<PinnedPage> {
        let page = self.state.lock().pages.get(&pfn)?.upgrade()?;
        Some(PinnedPage::new(page))
    }
}

impl Default for EmulatedPageAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl PageAllocator for EmulatedPageAllocator {
    fn allocate_page(&self) -> anyhow::Result<PinnedPage> {
        let mut state = self.state.lock();
        if state.fail_at == Some(state.allocated + 1) {
            state.fail_at = None;
            anyhow::bail!("out of memory");
        }
        state.allocated += 1;
        let pfn = state.next_pfn;
        state.next_pfn += 1;
        let page = Arc::new(HeapPage {
            page: Box::new(Page([0; xendef::EVENT_WORDS_PER_PAGE].map(AtomicU32::new))),
            pfn,
            state: self.state.clone(),
        });
        state.pages.insert(pfn, Arc::downgrade(&page));
        Ok(PinnedPage::new(page))
    }
}

/// A hypercall issued to [`EmulatedHypervisor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Hypercall {
    InitControl { pfn: u64, vp: VpIndex },
    ExpandArray { pfn: u64 },
    Reset,
    QueryInterdomain { port: EvtchnPort },
    BindInterdomain { remote: InterdomainBinding },
    GetParam { param: HvmParam },
    SetParam { param: HvmParam, value: u64 },
}

#[derive(Default)]
struct Fault {
    remaining: usize,
    error: Option<XenError>,
}

impl Fault {
    fn arm(&mut self, n: usize, error: XenError) {
        assert_ne!(n, 0);
        self.remaining = n;
        self.error = Some(error);
    }

    fn check(&mut self) -> XenResult<()> {
        if let Some(error) = self.error {
            self.remaining -= 1;
            if self.remaining == 0 {
                self.error = None;
                return Err(error);
            }
        }
        Ok(())
    }
}

#[derive(Default)]
struct HypervisorState {
    calls: Vec<Hypercall>,
    control_blocks: BTreeMap<VpIndex, u64>,
    event_array: Vec<u64>,
    tails: HashMap<(VpIndex, u32), EvtchnPort>,
    bindings: BTreeMap<EvtchnPort, InterdomainBinding>,
    params: HashMap<HvmParam, u64>,
    fail_init_control: Fault,
    fail_expand_array: Fault,
    fail_reset: Fault,
}

/// An emulated Xen hypervisor implementing the FIFO event channel
/// hypercalls.
pub struct EmulatedHypervisor {
    pages: EmulatedPageAllocator,
    state: Mutex<HypervisorState>,
}

impl EmulatedHypervisor {
    /// Creates a hypervisor that resolves frame numbers through `pages`.
    pub fn new(pages: EmulatedPageAllocator) -> Self {
        Self {
            pages,
            state: Mutex::new(HypervisorState::default()),
        }
    }

    /// Fails the `n`th `init_control` call from now with `error`.
    pub fn fail_init_control(&self, n: usize, error: XenError) {
        self.state.lock().fail_init_control.arm(n, error);
    }

    /// Fails the `n`th `expand_array` call from now with `error`.
    pub fn fail_expand_array(&self, n: usize, error: XenError) {
        self.state.lock().fail_expand_array.arm(n, error);
    }

    /// Fails the `n`th `reset` call from now with `error`.
    pub fn fail_reset(&self, n: usize, error: XenError) {
        self.state.lock().fail_reset.arm(n, error);
    }

    /// Returns the hypercalls issued so far, in order.
    pub fn calls(&self) -> Vec<Hypercall> {
        self.state.lock().calls.clone()
    }

    /// Returns the number of VPs with a registered control block.
    pub fn control_block_count(&self) -> usize {
        self.state.lock().control_blocks.len()
    }

    /// Returns the number of registered event array pages.
    pub fn event_array_len(&self) -> usize {
        self.state.lock().event_array.len()
    }

    /// Returns the remote end of `port`, if it is bound.
    pub fn binding(&self, port: EvtchnPort) -> Option<InterdomainBinding> {
        self.state.lock().bindings.get(&port).copied()
    }

    /// Binds a new port to `remote` and records it as the store channel, as
    /// the toolstack does at domain build.
    pub fn bind_store_channel(&self, remote: InterdomainBinding) -> XenResult<EvtchnPort> {
        let mut state = self.state.lock();
        let port = Self::bind(&mut state, remote)?;
        state
            .params
            .insert(HvmParam::STORE_EVTCHN, port.get().into());
        Ok(port)
    }

    /// Binds a new port to `remote`.
    pub fn bind_port(&self, remote: InterdomainBinding) -> XenResult<EvtchnPort> {
        Self::bind(&mut self.state.lock(), remote)
    }

    fn bind(state: &mut HypervisorState, remote: InterdomainBinding) -> XenResult<EvtchnPort> {
        let port = (1..EVTCHN_FIFO_NR_CHANNELS)
            .map(EvtchnPort::new)
            .find(|port| !state.bindings.contains_key(port))
            .ok_or(XenError::ENOSPC)?;
        state.bindings.insert(port, remote);
        Ok(port)
    }

    fn word(&self, state: &HypervisorState, port: EvtchnPort) -> Option<(PinnedPage, usize)> {
        let pfn = *state.event_array.get(port.page_index())?;
        Some((self.pages.lookup(pfn)?, port.page_offset()))
    }

    /// Reads the event word of `port` as the hypervisor sees it.
    pub fn event_word(&self, port: EvtchnPort) -> Option<EventWord> {
        let state = self.state.lock();
        let (page, offset) = self.word(&state, port)?;
        Some(EventWord::from_bits(
            page.words()[offset].load(Ordering::SeqCst),
        ))
    }

    /// Reads the `ready` mask of `vp`'s control block.
    pub fn ready(&self, vp: VpIndex) -> Option<u32> {
        let pfn = *self.state.lock().control_blocks.get(&vp)?;
        let page = self.pages.lookup(pfn)?;
        Some(page.words()[CONTROL_BLOCK_READY_WORD].load(Ordering::SeqCst))
    }

    /// Raises an event on `port`, queueing it on `vp` at `priority` the way
    /// Xen does. Returns true if the event was linked onto a queue.
    ///
    /// Panics if `port` is not covered by the event array or `vp` has no
    /// control block.
    pub fn set_pending(&self, port: EvtchnPort, vp: VpIndex, priority: u32) -> bool {
        assert!(priority <= EVTCHN_FIFO_PRIORITY_MIN);
        let mut state = self.state.lock();
        let Some((page, offset)) = self.word(&state, port) else {
            panic!("port {port} is not in the event array");
        };
        let word = &page.words()[offset];

        let old = word.fetch_or(1 << EVTCHN_FIFO_PENDING, Ordering::SeqCst);
        if old & ((1 << EVTCHN_FIFO_MASKED) | (1 << EVTCHN_FIFO_LINKED)) != 0 {
            return false;
        }
        if word.fetch_or(1 << EVTCHN_FIFO_LINKED, Ordering::SeqCst) & (1 << EVTCHN_FIFO_LINKED)
            != 0
        {
            return false;
        }

        let Some(control_page) = state
            .control_blocks
            .get(&vp)
            .and_then(|&pfn| self.pages.lookup(pfn))
        else {
            panic!("vp {vp} has no control block");
        };
        let control = control_page.words();

        // If the port was the tail of a queue that has since drained, that
        // queue is empty and must not be linked through it.
        state.tails.retain(|_, tail| *tail != port);

        let linked_to_tail = state
            .tails
            .get(&(vp, priority))
            .and_then(|&tail| self.word(&state, tail))
            .is_some_and(|(tail_page, tail_offset)| {
                set_link(&tail_page.words()[tail_offset], port)
            });
        if !linked_to_tail {
            control[CONTROL_BLOCK_HEAD_WORD + priority as usize]
                .store(port.get(), Ordering::SeqCst);
        }
        state.tails.insert((vp, priority), port);
        control[CONTROL_BLOCK_READY_WORD].fetch_or(1 << priority, Ordering::SeqCst);
        true
    }
}

/// Points a linked tail word at `port`. Fails if the guest has already
/// unlinked the tail, meaning the queue has drained.
fn set_link(tail: &AtomicU32, port: EvtchnPort) -> bool {
    let busy = 1 << EVTCHN_FIFO_BUSY;
    let mut old = tail.load(Ordering::SeqCst);
    loop {
        if old & (1 << EVTCHN_FIFO_LINKED) == 0 {
            return false;
        }
        match tail.compare_exchange(old, old | busy, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => break,
            Err(current) => old = current,
        }
    }
    let mut old = old | busy;
    loop {
        let new = if old & (1 << EVTCHN_FIFO_LINKED) != 0 {
            (old & !(EVTCHN_FIFO_LINK_MASK | busy)) | port.get()
        } else {
            old & !busy
        };
        match tail.compare_exchange(old, new, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => break old & (1 << EVTCHN_FIFO_LINKED) != 0,
            Err(current) => old = current,
        }
    }
}

impl EvtchnHypercalls for EmulatedHypervisor {
    fn init_control(&self, control_gfn: u64, vp: VpIndex) -> XenResult<()> {
        let mut state = self.state.lock();
        state.calls.push(Hypercall::InitControl {
            pfn: control_gfn,
            vp,
        });
        state.fail_init_control.check()?;
        if self.pages.lookup(control_gfn).is_none() {
            return Err(XenError::EINVAL);
        }
        if state.control_blocks.contains_key(&vp) {
            return Err(XenError::EINVAL);
        }
        state.control_blocks.insert(vp, control_gfn);
        Ok(())
    }

    fn expand_array(&self, array_gfn: u64) -> XenResult<()> {
        let mut state = self.state.lock();
        state.calls.push(Hypercall::ExpandArray { pfn: array_gfn });
        state.fail_expand_array.check()?;
        if self.pages.lookup(array_gfn).is_none() {
            return Err(XenError::EINVAL);
        }
        if state.event_array.len() == EVTCHN_FIFO_MAX_EVENT_PAGES {
            return Err(XenError::ENOSPC);
        }
        state.event_array.push(array_gfn);
        Ok(())
    }

    fn reset(&self) -> XenResult<()> {
        let mut state = self.state.lock();
        state.calls.push(Hypercall::Reset);
        state.fail_reset.check()?;
        state.control_blocks.clear();
        state.event_array.clear();
        state.tails.clear();
        state.bindings.clear();
        Ok(())
    }

    fn query_interdomain(&self, port: EvtchnPort) -> XenResult<InterdomainBinding> {
        let mut state = self.state.lock();
        state.calls.push(Hypercall::QueryInterdomain { port });
        state.bindings.get(&port).copied().ok_or(XenError::EINVAL)
    }

    fn bind_interdomain(&self, remote: InterdomainBinding) -> XenResult<EvtchnPort> {
        let mut state = self.state.lock();
        state.calls.push(Hypercall::BindInterdomain { remote });
        Self::bind(&mut state, remote)
    }

    fn get_param(&self, param: HvmParam) -> XenResult<u64> {
        let mut state = self.state.lock();
        state.calls.push(Hypercall::GetParam { param });
        Ok(state.params.get(&param).copied().unwrap_or(0))
    }

    fn set_param(&self, param: HvmParam, value: u64) -> XenResult<()> {
        let mut state = self.state.lock();
        state.calls.push(Hypercall::SetParam { param, value });
        state.params.insert(param, value);
        Ok(())
    }
}
