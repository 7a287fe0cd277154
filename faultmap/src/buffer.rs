//! Bounded cache of resident pages.
//!
//! The buffer owns a fixed set of page descriptors, indexed by slot. A
//! descriptor moves through `Free -> Filling -> Present` as a fault is
//! served, detours through `Updating` while write protection is being
//! removed, and leaves through `Leaving -> Free` when evicted. At most one
//! descriptor tracks a given page address at any instant.
//!
//! One mutex guards every descriptor field and every index; one condition
//! variable serves both "a slot was freed" and "an evicted page was
//! released" wake-ups. The fill and flush I/O dominate fault-service
//! latency, so finer-grained locking buys nothing here.

use crate::Error;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::{HashMap, VecDeque};
use tracing::trace;

pub(crate) type Slot = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PageState {
    Free,
    Filling,
    Present,
    Updating,
    Leaving,
}

#[derive(Debug)]
struct PageDescriptor {
    addr: u64,
    state: PageState,
    /// The page has taken at least one write fault since its last clean
    /// install.
    dirty: bool,
    /// Selected for eviction but not yet released.
    deferred: bool,
}

pub(crate) struct Inner {
    slots: Vec<PageDescriptor>,
    /// Aligned address -> slot, for states Filling/Present/Updating.
    present: HashMap<u64, Slot>,
    free: VecDeque<Slot>,
    /// Arrival order of installed pages (victim selection is FIFO over
    /// this). Contains Present slots, plus Updating slots which keep
    /// their position while write protection is dropped.
    queue: VecDeque<Slot>,
    /// Pages owned by flush workers, by address. A fault on one of these
    /// must wait for release before a new slot may be allocated.
    leaving: HashMap<u64, Slot>,
    /// Eviction latch: a threshold is queued but not yet executed.
    threshold_queued: bool,
    /// Eviction latch: victims selected but not yet released.
    unreleased_victims: usize,
}

pub(crate) struct PageBuffer {
    inner: Mutex<Inner>,
    cond: Condvar,
    capacity: usize,
    low: usize,
    high: usize,
}

impl PageBuffer {
    pub(crate) fn new(capacity: usize, low: usize, high: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| PageDescriptor {
                addr: 0,
                state: PageState::Free,
                dirty: false,
                deferred: false,
            })
            .collect();
        Self {
            inner: Mutex::new(Inner {
                slots,
                present: HashMap::with_capacity(capacity),
                free: (0..capacity).collect(),
                queue: VecDeque::with_capacity(capacity),
                leaving: HashMap::new(),
                threshold_queued: false,
                unreleased_victims: 0,
            }),
            cond: Condvar::new(),
            capacity,
            low,
            high,
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock()
    }

    /// Block on the buffer's condition variable, releasing the lock while
    /// waiting.
    pub(crate) fn wait(&self, inner: &mut MutexGuard<'_, Inner>) {
        self.cond.wait(inner);
    }

    pub(crate) fn lookup(
        &self,
        inner: &Inner,
        addr: u64,
    ) -> Option<(Slot, PageState, bool)> {
        inner.present.get(&addr).map(|&slot| {
            let pd = &inner.slots[slot];
            (slot, pd.state, pd.dirty)
        })
    }

    /// Whether watermark-driven eviction should be dispatched: the fill
    /// level is strictly above the high watermark and no eviction burst is
    /// already outstanding.
    pub(crate) fn eviction_needed(&self, inner: &Inner) -> bool {
        inner.queue.len() > self.high && !Self::eviction_latched(inner)
    }

    pub(crate) fn eviction_latched(inner: &Inner) -> bool {
        inner.threshold_queued || inner.unreleased_victims > 0
    }

    /// Record that the coordinator is about to queue a threshold, closing
    /// the latch until `select_victims` runs.
    pub(crate) fn note_threshold_queued(&self, inner: &mut Inner) {
        inner.threshold_queued = true;
    }

    pub(crate) fn free_exhausted(&self, inner: &Inner) -> bool {
        inner.free.is_empty()
    }

    /// A new slot may be handed out for `addr`: a free slot exists and the
    /// previous occupant of `addr` (if any) has finished leaving.
    pub(crate) fn can_allocate(&self, inner: &Inner, addr: u64) -> bool {
        !inner.free.is_empty() && !inner.leaving.contains_key(&addr)
    }

    /// Reserve a free slot for `addr` and begin filling it.
    pub(crate) fn allocate(&self, inner: &mut Inner, addr: u64, dirty: bool) -> Slot {
        debug_assert!(self.can_allocate(inner, addr));
        debug_assert!(!inner.present.contains_key(&addr));
        let slot = inner.free.pop_front().expect("free slot");
        let pd = &mut inner.slots[slot];
        pd.addr = addr;
        pd.state = PageState::Filling;
        pd.dirty = dirty;
        pd.deferred = false;
        inner.present.insert(addr, slot);
        trace!(addr, slot, dirty, "allocated page slot");
        self.check_invariants(inner);
        slot
    }

    /// Begin dropping write protection for a clean installed page.
    pub(crate) fn upgrade_for_write(&self, inner: &mut Inner, slot: Slot) {
        let pd = &mut inner.slots[slot];
        debug_assert_eq!(pd.state, PageState::Present);
        debug_assert!(!pd.dirty);
        pd.dirty = true;
        pd.state = PageState::Updating;
        trace!(addr = pd.addr, slot, "write upgrade");
    }

    /// Address and install mode for a fill in flight.
    pub(crate) fn fill_info(&self, slot: Slot) -> (u64, bool) {
        let inner = self.inner.lock();
        let pd = &inner.slots[slot];
        debug_assert_eq!(pd.state, PageState::Filling);
        (pd.addr, pd.dirty)
    }

    /// Address for a write upgrade in flight.
    pub(crate) fn update_info(&self, slot: Slot) -> u64 {
        let inner = self.inner.lock();
        let pd = &inner.slots[slot];
        debug_assert_eq!(pd.state, PageState::Updating);
        pd.addr
    }

    /// Address and dirtiness for an eviction in flight.
    pub(crate) fn evict_info(&self, slot: Slot) -> (u64, bool) {
        let inner = self.inner.lock();
        let pd = &inner.slots[slot];
        debug_assert_eq!(pd.state, PageState::Leaving);
        (pd.addr, pd.dirty)
    }

    /// The fill for `slot` completed and the page is installed.
    pub(crate) fn mark_present(&self, slot: Slot) {
        let mut inner = self.inner.lock();
        let pd = &mut inner.slots[slot];
        debug_assert_eq!(pd.state, PageState::Filling);
        pd.state = PageState::Present;
        inner.queue.push_back(slot);
        self.check_invariants(&inner);
        drop(inner);
        self.cond.notify_all();
    }

    /// Write protection for `slot` was removed.
    pub(crate) fn mark_writable(&self, slot: Slot) {
        let mut inner = self.inner.lock();
        let pd = &mut inner.slots[slot];
        debug_assert_eq!(pd.state, PageState::Updating);
        pd.state = PageState::Present;
        drop(inner);
        self.cond.notify_all();
    }

    /// Choose up to `high - low` eviction victims in arrival order,
    /// transferring ownership of each to the calling flush worker. Opens
    /// the threshold latch.
    pub(crate) fn select_victims(&self) -> Vec<(Slot, u64, bool)> {
        let mut inner = self.inner.lock();
        inner.threshold_queued = false;
        let target = self.high - self.low;
        let mut victims = Vec::new();
        let mut kept = VecDeque::with_capacity(inner.queue.len());
        while let Some(slot) = inner.queue.pop_front() {
            let pd = &mut inner.slots[slot];
            if victims.len() < target && pd.state == PageState::Present && !pd.deferred {
                pd.state = PageState::Leaving;
                pd.deferred = true;
                victims.push((slot, pd.addr, pd.dirty));
            } else {
                kept.push_back(slot);
            }
        }
        inner.queue = kept;
        for &(slot, addr, _) in &victims {
            inner.present.remove(&addr);
            inner.leaving.insert(addr, slot);
        }
        inner.unreleased_victims += victims.len();
        self.check_invariants(&inner);
        victims
    }

    /// An evicted page's slot returns to the free list.
    pub(crate) fn release(&self, slot: Slot) {
        let mut inner = self.inner.lock();
        let pd = &mut inner.slots[slot];
        debug_assert_eq!(pd.state, PageState::Leaving);
        let addr = pd.addr;
        pd.state = PageState::Free;
        pd.dirty = false;
        pd.deferred = false;
        inner.leaving.remove(&addr);
        inner.free.push_back(slot);
        inner.unreleased_victims -= 1;
        trace!(addr, slot, "released page slot");
        self.check_invariants(&inner);
        drop(inner);
        self.cond.notify_all();
    }

    /// Current number of installed pages.
    pub(crate) fn fill_level(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// The fill level is at or below the low watermark.
    pub(crate) fn low_reached(&self) -> bool {
        self.fill_level() <= self.low
    }

    /// (resident, dirty) page counts.
    pub(crate) fn counts(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        let dirty = inner
            .slots
            .iter()
            .filter(|pd| pd.state != PageState::Free && pd.dirty)
            .count();
        (inner.present.len(), dirty)
    }

    /// Write every dirty page back in place, leaving it resident, clean,
    /// and write-protected.
    ///
    /// `writeback` is invoked under the buffer lock, so no state
    /// transition can interleave with the copy-out; pages in transitional
    /// states (a fill or write upgrade in flight, or an eviction the flush
    /// workers own) are waited out on the condition variable. Returns once
    /// no descriptor is dirty — unless new write faults keep arriving, in
    /// which case the caller is responsible for quiescing them first.
    pub(crate) fn flush_dirty<F>(&self, mut writeback: F) -> Result<(), Error>
    where
        F: FnMut(u64) -> Result<(), Error>,
    {
        let mut inner = self.inner.lock();
        loop {
            let flushable: Vec<Slot> = inner
                .slots
                .iter()
                .enumerate()
                .filter(|(_, pd)| pd.state == PageState::Present && pd.dirty)
                .map(|(slot, _)| slot)
                .collect();
            let wrote = !flushable.is_empty();
            for slot in flushable {
                let addr = inner.slots[slot].addr;
                writeback(addr)?;
                inner.slots[slot].dirty = false;
            }
            let pending = inner
                .slots
                .iter()
                .any(|pd| pd.state != PageState::Free && pd.dirty);
            if !pending {
                return Ok(());
            }
            if !wrote {
                self.cond.wait(&mut inner);
            }
        }
    }

    /// Snapshot every non-free descriptor for the teardown sweep. Only
    /// meaningful once the coordinator and both pools have stopped.
    pub(crate) fn drain_for_shutdown(&self) -> Vec<(u64, PageState, bool)> {
        let inner = self.inner.lock();
        inner
            .slots
            .iter()
            .filter(|pd| pd.state != PageState::Free)
            .map(|pd| (pd.addr, pd.state, pd.dirty))
            .collect()
    }

    #[cfg(debug_assertions)]
    fn check_invariants(&self, inner: &Inner) {
        assert!(inner.queue.len() <= self.capacity);
        let mut filling = 0;
        let mut leaving = 0;
        for (slot, pd) in inner.slots.iter().enumerate() {
            match pd.state {
                PageState::Free => {
                    assert!(inner.free.contains(&slot));
                    assert!(inner.present.get(&pd.addr) != Some(&slot));
                }
                PageState::Filling => {
                    filling += 1;
                    assert_eq!(inner.present.get(&pd.addr), Some(&slot));
                }
                PageState::Present | PageState::Updating => {
                    assert_eq!(inner.present.get(&pd.addr), Some(&slot));
                    assert!(inner.queue.contains(&slot));
                }
                PageState::Leaving => {
                    leaving += 1;
                    assert!(pd.deferred);
                    assert!(!inner.queue.contains(&slot));
                    assert!(!inner.present.contains_key(&pd.addr));
                    assert_eq!(inner.leaving.get(&pd.addr), Some(&slot));
                }
            }
        }
        assert_eq!(
            inner.queue.len() + inner.free.len() + filling + leaving,
            self.capacity
        );
    }

    #[cfg(not(debug_assertions))]
    fn check_invariants(&self, _inner: &Inner) {}
}
