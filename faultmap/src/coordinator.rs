//! The single-threaded fault-service loop.
//!
//! The coordinator owns the listener's event stream. Each batch is
//! classified against the page buffer under its lock: faults on pages
//! already being handled are dropped as spurious, a write fault on a
//! clean installed page becomes a write-unprotect, and anything else
//! allocates a slot and becomes a fill. When the buffer runs past its
//! high watermark (or out of free slots), a threshold item is handed to
//! the flush workers and the lock is yielded so they can make room.
//!
//! Work items are staged locally and pushed whenever the buffer lock is
//! released: the queues are bounded and the workers themselves need the
//! lock to complete items, so the coordinator must never block on a
//! queue, or sleep on the buffer's condition variable, while staged work
//! is undispatched.

use crate::{
    buffer::{PageBuffer, PageState},
    listener::Event,
    mapping::Shared,
    worker::WorkItem,
};
use std::sync::{atomic::Ordering, Arc};
use tracing::{debug, trace};

pub(crate) fn run(shared: Arc<Shared>) {
    debug!(
        base = shared.base,
        page_size = shared.page_size,
        "fault service started"
    );
    loop {
        let events = match shared.listener.get_events() {
            Ok(events) => events,
            Err(err) => {
                shared.record_failure(err);
                break;
            }
        };
        if events.is_empty() {
            continue;
        }
        if matches!(events[0], Event::Shutdown) {
            debug!("fault service stopping");
            break;
        }
        service_batch(&shared, &events);
    }
}

fn service_batch(shared: &Shared, events: &[Event]) {
    let buffer = &shared.buffer;
    let mut pending: Vec<WorkItem> = Vec::new();
    let mut inner = buffer.lock();
    for &event in events {
        let Event::Fault { addr, write } = event else {
            continue;
        };

        // Batches can outrun the flushers; check the watermark per event.
        if buffer.eviction_needed(&inner) {
            buffer.note_threshold_queued(&mut inner);
            drop(inner);
            dispatch(shared, &mut pending, true);
            inner = buffer.lock();
        }

        match buffer.lookup(&inner, addr) {
            Some((slot, PageState::Present, false)) if write => {
                buffer.upgrade_for_write(&mut inner, slot);
                pending.push(WorkItem::WriteUnprotect { slot });
            }
            Some((_, state, dirty)) => {
                // Resolved by an earlier concurrent fault on the same
                // page; the kernel retries the access once that
                // resolution lands.
                shared.counters.spurious.fetch_add(1, Ordering::Relaxed);
                trace!(addr, write, ?state, dirty, "spurious fault");
            }
            None => {
                // May have to wait for a free slot, or for a previous
                // occupant of this address to finish leaving. At most one
                // threshold is dispatched per wake-up: an empty victim
                // selection (fills still in flight) must not turn into a
                // threshold storm.
                let mut triggered = false;
                while !buffer.can_allocate(&inner, addr) {
                    let trigger = !triggered
                        && buffer.free_exhausted(&inner)
                        && !PageBuffer::eviction_latched(&inner);
                    if trigger {
                        buffer.note_threshold_queued(&mut inner);
                        triggered = true;
                    }
                    if trigger || !pending.is_empty() {
                        drop(inner);
                        dispatch(shared, &mut pending, trigger);
                        inner = buffer.lock();
                        continue;
                    }
                    buffer.wait(&mut inner);
                    triggered = false;
                }
                let slot = buffer.allocate(&mut inner, addr, write);
                pending.push(WorkItem::Fill { slot });
            }
        }
    }
    drop(inner);
    dispatch(shared, &mut pending, false);
}

/// Push staged work. Never called with the buffer lock held.
fn dispatch(shared: &Shared, pending: &mut Vec<WorkItem>, threshold: bool) {
    if threshold {
        shared.flush_queue.push(WorkItem::Threshold);
    }
    for item in pending.drain(..) {
        shared.fill_queue.push(item);
    }
}
