//! Fault delivery and page installation for a mapped range.
//!
//! A [`FaultListener`] is the mapping's only window onto the kernel: it
//! delivers page-fault events for the registered range and accepts the
//! commands that resolve them (installing a filled page, toggling write
//! protection, reclaiming an evicted page). The exact kernel protocol is
//! platform-specific; on Linux, [`UffdListener`] speaks `userfaultfd`.
//! [`MockListener`] simulates the kernel in process memory so the paging
//! core can be exercised deterministically in tests and benchmarks.

use crate::Error;

mod mock;
#[cfg(target_os = "linux")]
mod uffd;

pub use mock::MockListener;
#[cfg(target_os = "linux")]
pub use uffd::UffdListener;

/// A fault notification, or the shutdown sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// A page fault inside the mapped range.
    Fault {
        /// Faulting address, rounded down to the page boundary.
        addr: u64,
        /// Whether the faulting access was a write.
        write: bool,
    },
    /// The listener has been stopped; no further faults will be delivered.
    Shutdown,
}

/// Kernel-side fault channel for one registered virtual range.
///
/// Implementations serialize their own operations; the paging core may call
/// any of these methods from any of its threads.
pub trait FaultListener: Send + Sync {
    /// Base address of the registered range.
    fn base(&self) -> u64;

    /// Length of the registered range in bytes.
    fn len(&self) -> usize;

    /// Block until at least one fault event is available, then return a
    /// non-empty batch drained without further blocking. After [`stop`]
    /// has been called, returns a one-element batch containing
    /// [`Event::Shutdown`].
    ///
    /// [`stop`]: FaultListener::stop
    fn get_events(&self) -> Result<Vec<Event>, Error>;

    /// Atomically map the page at `addr` with the contents of `src`.
    ///
    /// Threads blocked faulting on `addr` resume only once the install is
    /// complete. With `write_enabled` false the page is installed
    /// write-protected, and a subsequent write re-enters [`get_events`] as
    /// a write fault.
    ///
    /// [`get_events`]: FaultListener::get_events
    fn install_page(&self, addr: u64, src: &[u8], write_enabled: bool) -> Result<(), Error>;

    /// Remove write protection from an installed page, resuming any thread
    /// blocked on a write fault for it.
    fn enable_writes(&self, addr: u64) -> Result<(), Error>;

    /// Re-apply write protection to an installed page (issued before a
    /// dirty page is copied out for eviction).
    fn disable_writes(&self, addr: u64) -> Result<(), Error>;

    /// Remove the page at `addr` from the range so that the next access
    /// faults again.
    fn reclaim_page(&self, addr: u64) -> Result<(), Error>;

    /// Cause the next (or current) [`get_events`] call to return the
    /// shutdown sentinel.
    ///
    /// [`get_events`]: FaultListener::get_events
    fn stop(&self);
}
