//! The public mapping surface.
//!
//! A [`Mapping`] wires a [`FaultListener`], a [`Store`], the page buffer,
//! the two worker pools, and the coordinator thread together, and owns
//! their shutdown order: stop the listener, join the coordinator, drain
//! and join the pools, then write back whatever is still dirty before the
//! region disappears.

use crate::{
    buffer::{PageBuffer, PageState},
    coordinator,
    listener::FaultListener,
    queue::WorkQueue,
    store::Store,
    worker::{self, Role, WorkItem, WorkerPool},
    Config, Error,
};
use parking_lot::Mutex;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread,
};
use tracing::{debug, error, info, warn};

/// State shared between the mapping handle, the coordinator, and the
/// worker pools.
pub(crate) struct Shared {
    pub(crate) listener: Arc<dyn FaultListener>,
    pub(crate) store: Arc<dyn Store>,
    pub(crate) buffer: PageBuffer,
    pub(crate) fill_queue: Arc<WorkQueue<WorkItem>>,
    pub(crate) flush_queue: Arc<WorkQueue<WorkItem>>,
    pub(crate) base: u64,
    pub(crate) page_size: usize,
    pub(crate) counters: Counters,
    /// First fatal error hit by a worker or the coordinator; surfaced by
    /// the next user-facing operation.
    failure: Mutex<Option<Error>>,
    failed: AtomicBool,
}

impl Shared {
    pub(crate) fn record_failure(&self, err: Error) {
        error!(%err, "fatal mapping failure recorded");
        self.failed.store(true, Ordering::Release);
        let mut failure = self.failure.lock();
        if failure.is_none() {
            *failure = Some(err);
        }
    }

    fn surface_failure(&self) -> Result<(), Error> {
        if !self.failed.load(Ordering::Acquire) {
            return Ok(());
        }
        match self.failure.lock().take() {
            Some(err) => Err(err),
            // A previous operation already surfaced the original error.
            None => Err(Error::Shutdown),
        }
    }
}

#[derive(Default)]
pub(crate) struct Counters {
    pub(crate) fills: AtomicU64,
    pub(crate) evictions: AtomicU64,
    pub(crate) writebacks: AtomicU64,
    pub(crate) write_upgrades: AtomicU64,
    pub(crate) spurious: AtomicU64,
}

/// A point-in-time view of a mapping's activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// Pages currently resident (installed or being installed).
    pub resident: usize,
    /// Resident pages holding unwritten modifications.
    pub dirty: usize,
    /// Buffer capacity in pages.
    pub capacity: usize,
    /// Pages read from the store and installed.
    pub fills: u64,
    /// Pages evicted from the buffer.
    pub evictions: u64,
    /// Dirty pages written back to the store.
    pub writebacks: u64,
    /// Write faults that upgraded a clean installed page.
    pub write_upgrades: u64,
    /// Faults dropped because a concurrent fault already resolved them.
    pub spurious_faults: u64,
}

/// A virtual-address range served from a [`Store`] by user-space paging.
pub struct Mapping {
    shared: Arc<Shared>,
    coordinator: Option<thread::JoinHandle<()>>,
    fill_pool: Option<WorkerPool>,
    flush_pool: Option<WorkerPool>,
    capacity: usize,
}

impl Mapping {
    /// Map `len` bytes of `store` into fresh virtual memory, serving
    /// faults through a `userfaultfd` listener.
    #[cfg(target_os = "linux")]
    pub fn map(config: Config, store: Arc<dyn Store>, len: usize) -> Result<Self, Error> {
        config.validate()?;
        let listener = Arc::new(crate::listener::UffdListener::new(
            len,
            config.page_size,
            config.max_fault_events.get(),
        )?);
        Self::with_listener(config, store, listener)
    }

    /// Build a mapping over an externally constructed fault listener.
    pub fn with_listener(
        config: Config,
        store: Arc<dyn Store>,
        listener: Arc<dyn FaultListener>,
    ) -> Result<Self, Error> {
        config.validate()?;
        if listener.len() == 0 || listener.len() % config.page_size != 0 {
            return Err(Error::InvalidConfig(
                "listener range must be a non-zero multiple of the page size",
            ));
        }
        if listener.base() % config.page_size as u64 != 0 {
            return Err(Error::InvalidConfig("listener base must be page-aligned"));
        }

        let capacity = config.buffer_capacity.get();
        // Queue bounds: every item references a distinct slot, so sizing
        // past capacity (plus the exit sentinels and one threshold)
        // guarantees fan-out can always complete.
        let fill_depth = capacity + config.fill_workers.get() + config.max_fault_events.get();
        let flush_depth = capacity + config.flush_workers.get() + 1;
        let shared = Arc::new(Shared {
            base: listener.base(),
            page_size: config.page_size,
            buffer: PageBuffer::new(capacity, config.low_watermark, config.high_watermark),
            fill_queue: Arc::new(WorkQueue::new(fill_depth)),
            flush_queue: Arc::new(WorkQueue::new(flush_depth)),
            listener,
            store,
            counters: Counters::default(),
            failure: Mutex::new(None),
            failed: AtomicBool::new(false),
        });

        let fill_pool = WorkerPool::spawn(&shared, Role::Fill, config.fill_workers)
            .map_err(Error::Map)?;
        let flush_pool = WorkerPool::spawn(&shared, Role::Flush, config.flush_workers)
            .map_err(Error::Map)?;
        let coordinator = thread::Builder::new()
            .name("faultmap-coordinator".into())
            .spawn({
                let shared = shared.clone();
                move || coordinator::run(shared)
            })
            .map_err(Error::Map)?;

        info!(
            base = shared.base,
            len = shared.listener.len(),
            capacity,
            "mapping established"
        );
        Ok(Self {
            shared,
            coordinator: Some(coordinator),
            fill_pool: Some(fill_pool),
            flush_pool: Some(flush_pool),
            capacity,
        })
    }

    /// Base address of the mapped range.
    pub fn base(&self) -> *mut u8 {
        self.shared.base as *mut u8
    }

    /// Length of the mapped range in bytes.
    pub fn len(&self) -> usize {
        self.shared.listener.len()
    }

    /// Whether the mapped range is empty (it never is; present for
    /// symmetry with `len`).
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured page size.
    pub fn page_size(&self) -> usize {
        self.shared.page_size
    }

    /// Snapshot activity counters and buffer occupancy.
    pub fn stats(&self) -> Stats {
        let (resident, dirty) = self.shared.buffer.counts();
        let counters = &self.shared.counters;
        Stats {
            resident,
            dirty,
            capacity: self.capacity,
            fills: counters.fills.load(Ordering::Relaxed),
            evictions: counters.evictions.load(Ordering::Relaxed),
            writebacks: counters.writebacks.load(Ordering::Relaxed),
            write_upgrades: counters.write_upgrades.load(Ordering::Relaxed),
            spurious_faults: counters.spurious.load(Ordering::Relaxed),
        }
    }

    /// Write every dirty page back to the store.
    ///
    /// Blocks until the buffer is clean: resident pages stay resident but
    /// are write-protected again, so later writes fault and re-dirty
    /// them. Faults keep being serviced while the flush runs; if writers
    /// are still active when `flush` is called, it chases them until the
    /// buffer quiesces.
    pub fn flush(&self) -> Result<(), Error> {
        self.shared.surface_failure()?;
        debug!("flush requested");
        let shared = &self.shared;
        shared.buffer.flush_dirty(|addr| writeback(shared, addr))?;
        self.shared.surface_failure()
    }

    /// Tear the mapping down, completing in-flight work and writing every
    /// dirty page back to the store first.
    pub fn unmap(mut self) -> Result<(), Error> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<(), Error> {
        let Some(coordinator) = self.coordinator.take() else {
            return Err(Error::Shutdown);
        };
        info!("unmapping");

        // No new faults are accepted past the sentinel; the coordinator
        // finishes the batch it is on and exits.
        self.shared.listener.stop();
        let _ = coordinator.join();

        // All work queued by the coordinator drains ahead of the exit
        // sentinels.
        if let Some(pool) = self.fill_pool.take() {
            pool.stop();
        }
        if let Some(pool) = self.flush_pool.take() {
            pool.stop();
        }

        // Evictions fanned out behind the exit sentinels are executed
        // here; stray thresholds are moot.
        while let Some(item) = self.shared.flush_queue.try_pop() {
            if let WorkItem::Evict { slot, .. } = item {
                if let Err(err) = worker::evict(&self.shared, slot, true) {
                    self.shared.record_failure(err);
                }
            }
        }

        // Whatever is left resident gets one final write-back. A slot
        // stuck filling never had contents installed and is skipped (its
        // store read already recorded the fatal error).
        for (addr, state, dirty) in self.shared.buffer.drain_for_shutdown() {
            if state == PageState::Filling || !dirty {
                continue;
            }
            if let Err(err) = writeback(&self.shared, addr) {
                self.shared.record_failure(err);
            }
        }

        debug!("mapping torn down");
        match self.shared.failure.lock().take() {
            Some(err) => Err(err),
            None if self.shared.failed.load(Ordering::Acquire) => Err(Error::Shutdown),
            None => Ok(()),
        }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        if self.coordinator.is_some() {
            if let Err(err) = self.shutdown() {
                warn!(%err, "error discarded while dropping mapping");
            }
        }
    }
}

/// Copy one resident page out to the store, write-protecting it first so
/// no write can land mid-copy.
fn writeback(shared: &Shared, addr: u64) -> Result<(), Error> {
    shared.listener.disable_writes(addr)?;
    let offset = addr - shared.base;
    // SAFETY: the page is installed in our address space and
    // write-protected; concurrent writers fault and block instead of
    // mutating it.
    let page = unsafe { std::slice::from_raw_parts(addr as *const u8, shared.page_size) };
    shared
        .store
        .write(page, offset)
        .map_err(|source| Error::StoreWrite {
            offset,
            len: shared.page_size,
            source,
        })?;
    shared.counters.writebacks.fetch_add(1, Ordering::Relaxed);
    Ok(())
}
