//! Fill and flush worker pools.
//!
//! Both pools pop tagged work items off a bounded queue. Fill workers
//! resolve faults (page reads and write-unprotects); flush workers evict
//! pages, writing dirty ones back first. Workers never coordinate with
//! each other: the buffer state machine guarantees that two open work
//! items never target the same page.

use crate::{mapping::Shared, queue::WorkQueue, Error};
use std::{num::NonZeroUsize, sync::atomic::Ordering, sync::Arc, thread};
use tracing::{debug, error, warn};

pub(crate) type Slot = crate::buffer::Slot;

pub(crate) enum WorkItem {
    /// Read a page from the store and install it.
    Fill { slot: Slot },
    /// Remove write protection from an installed page.
    WriteUnprotect { slot: Slot },
    /// Write back (if dirty) and reclaim one page.
    Evict { slot: Slot, retried: bool },
    /// Select eviction victims and fan out one `Evict` per victim.
    Threshold,
    /// Worker shutdown sentinel; one per worker is queued on stop.
    Exit,
}

#[derive(Clone, Copy)]
pub(crate) enum Role {
    Fill,
    Flush,
}

/// A fixed pool of named worker threads draining one queue.
pub(crate) struct WorkerPool {
    queue: Arc<WorkQueue<WorkItem>>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    pub(crate) fn spawn(
        shared: &Arc<Shared>,
        role: Role,
        count: NonZeroUsize,
    ) -> std::io::Result<Self> {
        let (prefix, queue) = match role {
            Role::Fill => ("faultmap-fill", shared.fill_queue.clone()),
            Role::Flush => ("faultmap-flush", shared.flush_queue.clone()),
        };
        let mut handles = Vec::with_capacity(count.get());
        for i in 0..count.get() {
            let shared = shared.clone();
            let handle = thread::Builder::new()
                .name(format!("{prefix}-{i}"))
                .spawn(move || match role {
                    Role::Fill => fill_main(&shared),
                    Role::Flush => flush_main(&shared),
                })?;
            handles.push(handle);
        }
        Ok(Self { queue, handles })
    }

    /// Queue one exit sentinel per worker behind any outstanding work and
    /// join the pool.
    pub(crate) fn stop(mut self) {
        for _ in 0..self.handles.len() {
            self.queue.push(WorkItem::Exit);
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn fill_main(shared: &Shared) {
    // Staging page, reused across fills.
    let mut scratch = vec![0u8; shared.page_size];
    loop {
        match shared.fill_queue.pop() {
            WorkItem::Exit => break,
            WorkItem::Fill { slot } => {
                if let Err(err) = fill(shared, slot, &mut scratch) {
                    shared.record_failure(err);
                }
            }
            WorkItem::WriteUnprotect { slot } => {
                if let Err(err) = write_unprotect(shared, slot) {
                    shared.record_failure(err);
                }
            }
            WorkItem::Evict { .. } | WorkItem::Threshold => {
                unreachable!("flush work dispatched to a fill worker")
            }
        }
    }
}

fn flush_main(shared: &Shared) {
    loop {
        match shared.flush_queue.pop() {
            WorkItem::Exit => break,
            WorkItem::Evict { slot, retried } => {
                if let Err(err) = evict(shared, slot, retried) {
                    shared.record_failure(err);
                }
            }
            WorkItem::Threshold => threshold(shared),
            WorkItem::Fill { .. } | WorkItem::WriteUnprotect { .. } => {
                unreachable!("fill work dispatched to a flush worker")
            }
        }
    }
}

fn fill(shared: &Shared, slot: Slot, scratch: &mut [u8]) -> Result<(), Error> {
    let (addr, dirty) = shared.buffer.fill_info(slot);
    let offset = addr - shared.base;
    shared
        .store
        .read(scratch, offset)
        .map_err(|source| Error::StoreRead {
            offset,
            len: scratch.len(),
            source,
        })?;
    // A page first faulted by a write is installed writable; a read fault
    // installs write-protected so a later write is observed.
    shared.listener.install_page(addr, scratch, dirty)?;
    shared.buffer.mark_present(slot);
    shared.counters.fills.fetch_add(1, Ordering::Relaxed);
    debug!(addr, write_enabled = dirty, "installed page");
    Ok(())
}

fn write_unprotect(shared: &Shared, slot: Slot) -> Result<(), Error> {
    let addr = shared.buffer.update_info(slot);
    shared.listener.enable_writes(addr)?;
    shared.buffer.mark_writable(slot);
    shared.counters.write_upgrades.fetch_add(1, Ordering::Relaxed);
    debug!(addr, "write-enabled page");
    Ok(())
}

/// Write back (if dirty) and reclaim one evicted page. Also used by the
/// teardown path to execute evictions stranded behind the exit sentinels.
pub(crate) fn evict(shared: &Shared, slot: Slot, retried: bool) -> Result<(), Error> {
    let (addr, dirty) = shared.buffer.evict_info(slot);
    if dirty {
        // Protect first so no write can land between the copy-out and the
        // store write; a write racing this evict faults and blocks until
        // the slot is released and refilled.
        shared.listener.disable_writes(addr)?;
        let offset = addr - shared.base;
        // SAFETY: the page is installed in our address space and
        // write-protected; nothing mutates it until release.
        let page = unsafe { std::slice::from_raw_parts(addr as *const u8, shared.page_size) };
        match shared.store.write(page, offset) {
            Ok(()) => {
                shared.counters.writebacks.fetch_add(1, Ordering::Relaxed);
            }
            Err(source) if !retried => {
                warn!(addr, offset, %source, "page write-back failed, requeueing once");
                shared
                    .flush_queue
                    .push(WorkItem::Evict { slot, retried: true });
                return Ok(());
            }
            Err(source) => {
                // Give the slot back regardless so the buffer cannot
                // wedge; the recorded failure surfaces on the next flush
                // or unmap.
                error!(addr, offset, %source, "page write-back failed twice, dropping page");
                shared.record_failure(Error::StoreWrite {
                    offset,
                    len: shared.page_size,
                    source,
                });
            }
        }
    }
    shared.listener.reclaim_page(addr)?;
    shared.buffer.release(slot);
    shared.counters.evictions.fetch_add(1, Ordering::Relaxed);
    debug!(addr, dirty, "evicted page");
    Ok(())
}

fn threshold(shared: &Shared) {
    let victims = shared.buffer.select_victims();
    debug!(
        count = victims.len(),
        level = shared.buffer.fill_level(),
        low_reached = shared.buffer.low_reached(),
        "eviction burst"
    );
    for (slot, _, _) in victims {
        shared.flush_queue.push(WorkItem::Evict {
            slot,
            retried: false,
        });
    }
}
