//! Page-fault-driven user-space memory mapping over pluggable backing stores.
//!
//! `faultmap` backs a virtual-address range with an arbitrary data source: a
//! local file, a remote memory object, or anything that implements the
//! [`Store`] trait. Page faults on the range are intercepted in user space,
//! the faulting pages are fetched from the store into a bounded in-memory
//! page cache, and modified pages are written back on eviction or on an
//! explicit [`Mapping::flush`]. It is analogous to the kernel's memory-mapped
//! file mechanism, except that the page-fill and page-out policies run in
//! user space, so working sets larger than physical memory can be served
//! from stores the kernel knows nothing about.
//!
//! # Architecture
//!
//! A [`Mapping`] owns four cooperating pieces:
//!
//! - a [`FaultListener`] that delivers batched page-fault events for the
//!   registered range and accepts page install / write-protection commands
//!   (on Linux this is backed by `userfaultfd`);
//! - a bounded page buffer tracking resident pages, their dirty state, and
//!   the FIFO eviction order;
//! - a pool of fill workers that read pages from the [`Store`] and install
//!   them into the range;
//! - a pool of flush workers that write dirty pages back to the [`Store`]
//!   and reclaim their slots once the buffer passes its high watermark.
//!
//! A single coordinator thread classifies each fault against the buffer and
//! dispatches work to the pools. All scheduling is plain OS threads: page
//! I/O against the store is genuinely blocking and dominates fault latency.
//!
//! # Example
//!
//! ```no_run
//! use faultmap::{Config, FileStore, Mapping};
//! use std::sync::Arc;
//!
//! let config = Config::default();
//! let store = Arc::new(FileStore::create("data.bin", 1 << 30)?);
//! let mapping = Mapping::map(config, store, 1 << 30)?;
//!
//! // The range now behaves like ordinary memory; faults are served from
//! // the file and dirty pages written back under memory pressure.
//! let base = mapping.base() as *mut u64;
//! unsafe { base.write(42) };
//!
//! mapping.flush()?;
//! mapping.unmap()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::io;
use thiserror::Error;

mod buffer;
mod config;
mod coordinator;
pub mod listener;
mod mapping;
mod queue;
pub mod store;
mod worker;

pub use config::Config;
pub use listener::{Event, FaultListener, MockListener};
#[cfg(target_os = "linux")]
pub use listener::UffdListener;
pub use mapping::{Mapping, Stats};
pub use store::{FileStore, MemStore, Store};

/// Errors surfaced by a mapping.
///
/// Fill and flush failures are recorded by the worker that hit them and
/// surfaced by the next user-facing operation ([`Mapping::flush`] or
/// [`Mapping::unmap`]) rather than interrupting the fault-service loop
/// mid-batch.
#[derive(Debug, Error)]
pub enum Error {
    /// Rejected configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// The kernel fault-notification interface rejected an operation
    /// (registration, page install, or a write-protection change). Fatal
    /// for the mapping.
    #[error("fault listener: {0}")]
    Listener(#[source] io::Error),

    /// Setting up or tearing down the mapped region failed.
    #[error("mapped region: {0}")]
    Map(#[source] io::Error),

    /// The backing store failed to produce a page. The faulting thread
    /// cannot be resumed correctly; fatal for the mapping.
    #[error("store read of {len} bytes at offset {offset}: {source}")]
    StoreRead {
        offset: u64,
        len: usize,
        #[source]
        source: io::Error,
    },

    /// The backing store rejected a page write-back after a retry.
    #[error("store write of {len} bytes at offset {offset}: {source}")]
    StoreWrite {
        offset: u64,
        len: usize,
        #[source]
        source: io::Error,
    },

    /// The mapping has already been shut down (or a previous fatal error
    /// was already surfaced).
    #[error("mapping shut down")]
    Shutdown,
}

/// Returns the system page size.
#[cfg(unix)]
pub(crate) fn system_page_size() -> usize {
    // SAFETY: sysconf is safe to call.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as usize
    }
}

#[cfg(not(unix))]
pub(crate) fn system_page_size() -> usize {
    4096
}
