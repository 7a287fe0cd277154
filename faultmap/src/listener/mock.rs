use super::{Event, FaultListener};
use crate::Error;
use parking_lot::{Condvar, Mutex};
use std::{
    alloc::{alloc_zeroed, dealloc, Layout},
    collections::{HashMap, VecDeque},
    ptr::NonNull,
    sync::atomic::{AtomicU64, Ordering},
};

/// A [`FaultListener`] that simulates the kernel's fault channel in process
/// memory.
///
/// The listener owns a page-aligned region and a per-page protection map.
/// Accessors go through [`read`](MockListener::read) and
/// [`write`](MockListener::write) (or the lower-level
/// [`raise`](MockListener::raise)), which block exactly as the kernel blocks
/// a faulting thread: a missing page queues a fault event and waits for
/// [`install_page`](FaultListener::install_page); a write to a
/// write-protected page queues a write fault and waits for
/// [`enable_writes`](FaultListener::enable_writes). Waits re-queue their
/// event on every wake-up, so the same fault can be delivered more than
/// once — the spurious-fault behavior real kernels exhibit.
///
/// Operation counters are kept for assertions, in the spirit of an audited
/// test double.
pub struct MockListener {
    region: Region,
    page_size: usize,
    max_events: usize,
    state: Mutex<State>,
    /// Signaled when fault events are queued (or the listener stops).
    events: Condvar,
    /// Signaled when a fault-resolving command lands.
    resolved: Condvar,
    installs: AtomicU64,
    write_enables: AtomicU64,
    write_disables: AtomicU64,
    reclaims: AtomicU64,
    reclaim_log: Mutex<Vec<u64>>,
}

#[derive(Clone, Copy, PartialEq)]
enum Prot {
    ReadOnly,
    Writable,
}

struct State {
    /// Installed pages and their protection; absent means missing.
    pages: HashMap<u64, Prot>,
    queue: VecDeque<(u64, bool)>,
    stopped: bool,
}

impl MockListener {
    /// Create a listener over a fresh zero-filled region of `len` bytes.
    pub fn new(len: usize, page_size: usize, max_events: usize) -> Result<Self, Error> {
        if len == 0 || page_size == 0 || len % page_size != 0 {
            return Err(Error::InvalidConfig(
                "region length must be a non-zero multiple of the page size",
            ));
        }
        Ok(Self {
            region: Region::new(len, page_size)?,
            page_size,
            max_events,
            state: Mutex::new(State {
                pages: HashMap::new(),
                queue: VecDeque::new(),
                stopped: false,
            }),
            events: Condvar::new(),
            resolved: Condvar::new(),
            installs: AtomicU64::new(0),
            write_enables: AtomicU64::new(0),
            write_disables: AtomicU64::new(0),
            reclaims: AtomicU64::new(0),
            reclaim_log: Mutex::new(Vec::new()),
        })
    }

    /// Fault on `addr` (as a read or a write) and block until the paging
    /// core resolves it, without touching the page contents.
    pub fn raise(&self, addr: u64, write: bool) -> Result<(), Error> {
        let page = self.page_of(addr);
        let mut state = self.state.lock();
        self.wait_accessible(&mut state, page, write)
    }

    /// Read `dst.len()` bytes at `addr`, faulting the page in if necessary.
    /// The access must not cross a page boundary.
    pub fn read(&self, addr: u64, dst: &mut [u8]) -> Result<(), Error> {
        let page = self.page_of(addr);
        self.check_span(addr, dst.len(), page);
        let mut state = self.state.lock();
        self.wait_accessible(&mut state, page, false)?;
        // SAFETY: the range is inside the region (checked above) and the
        // state lock serializes this copy against installs and reclaims.
        unsafe {
            let src = self.region.ptr.as_ptr().add((addr - self.base()) as usize);
            std::ptr::copy_nonoverlapping(src, dst.as_mut_ptr(), dst.len());
        }
        Ok(())
    }

    /// Write `src` at `addr`, faulting and un-protecting the page first if
    /// necessary. The access must not cross a page boundary.
    pub fn write(&self, addr: u64, src: &[u8]) -> Result<(), Error> {
        let page = self.page_of(addr);
        self.check_span(addr, src.len(), page);
        let mut state = self.state.lock();
        self.wait_accessible(&mut state, page, true)?;
        // SAFETY: as in `read`; the page is writable and cannot be
        // re-protected while the state lock is held.
        unsafe {
            let dst = self.region.ptr.as_ptr().add((addr - self.base()) as usize);
            std::ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len());
        }
        Ok(())
    }

    /// Number of `install_page` calls observed.
    pub fn installs(&self) -> u64 {
        self.installs.load(Ordering::Relaxed)
    }

    /// Number of `enable_writes` calls observed.
    pub fn write_enables(&self) -> u64 {
        self.write_enables.load(Ordering::Relaxed)
    }

    /// Number of `disable_writes` calls observed.
    pub fn write_disables(&self) -> u64 {
        self.write_disables.load(Ordering::Relaxed)
    }

    /// Number of `reclaim_page` calls observed.
    pub fn reclaims(&self) -> u64 {
        self.reclaims.load(Ordering::Relaxed)
    }

    /// Addresses passed to `reclaim_page`, in call order.
    pub fn reclaim_order(&self) -> Vec<u64> {
        self.reclaim_log.lock().clone()
    }

    /// Addresses of the currently installed pages, sorted.
    pub fn installed_pages(&self) -> Vec<u64> {
        let mut pages: Vec<u64> = self.state.lock().pages.keys().copied().collect();
        pages.sort_unstable();
        pages
    }

    fn page_of(&self, addr: u64) -> u64 {
        assert!(
            addr >= self.base() && addr < self.base() + self.region.len as u64,
            "address {addr:#x} outside the mapped range"
        );
        addr & !(self.page_size as u64 - 1)
    }

    fn check_span(&self, addr: u64, len: usize, page: u64) {
        assert!(
            addr + len as u64 <= page + self.page_size as u64,
            "access at {addr:#x} crosses a page boundary"
        );
    }

    /// Block until `page` is accessible for the requested kind of access,
    /// queueing fault events along the way.
    fn wait_accessible(
        &self,
        state: &mut parking_lot::MutexGuard<'_, State>,
        page: u64,
        write: bool,
    ) -> Result<(), Error> {
        loop {
            if state.stopped {
                return Err(Error::Shutdown);
            }
            match state.pages.get(&page) {
                Some(Prot::Writable) => return Ok(()),
                Some(Prot::ReadOnly) if !write => return Ok(()),
                _ => {}
            }
            // The kernel may deliver the same fault to several threads;
            // re-queueing on every wake-up reproduces that.
            state.queue.push_back((page, write));
            self.events.notify_all();
            self.resolved.wait(state);
        }
    }

    /// Byte offset of an aligned page inside the region.
    fn offset_of(&self, addr: u64) -> Result<usize, Error> {
        if addr < self.base()
            || addr % self.page_size as u64 != 0
            || addr + self.page_size as u64 > self.base() + self.region.len as u64
        {
            return Err(Error::Listener(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("address {addr:#x} is not an aligned page in the range"),
            )));
        }
        Ok((addr - self.base()) as usize)
    }
}

impl FaultListener for MockListener {
    fn base(&self) -> u64 {
        self.region.ptr.as_ptr() as u64
    }

    fn len(&self) -> usize {
        self.region.len
    }

    fn get_events(&self) -> Result<Vec<Event>, Error> {
        let mut state = self.state.lock();
        loop {
            if state.stopped {
                return Ok(vec![Event::Shutdown]);
            }
            if !state.queue.is_empty() {
                let n = state.queue.len().min(self.max_events);
                return Ok(state
                    .queue
                    .drain(..n)
                    .map(|(addr, write)| Event::Fault { addr, write })
                    .collect());
            }
            self.events.wait(&mut state);
        }
    }

    fn install_page(&self, addr: u64, src: &[u8], write_enabled: bool) -> Result<(), Error> {
        let offset = self.offset_of(addr)?;
        assert_eq!(src.len(), self.page_size, "install source must be one page");
        let mut state = self.state.lock();
        // SAFETY: offset + page_size is inside the region (checked in
        // `slot`) and the state lock keeps accessors away until the page
        // is marked installed.
        unsafe {
            std::ptr::copy_nonoverlapping(
                src.as_ptr(),
                self.region.ptr.as_ptr().add(offset),
                src.len(),
            );
        }
        let prot = if write_enabled {
            Prot::Writable
        } else {
            Prot::ReadOnly
        };
        state.pages.insert(addr, prot);
        self.installs.fetch_add(1, Ordering::Relaxed);
        self.resolved.notify_all();
        Ok(())
    }

    fn enable_writes(&self, addr: u64) -> Result<(), Error> {
        self.offset_of(addr)?;
        let mut state = self.state.lock();
        state.pages.insert(addr, Prot::Writable);
        self.write_enables.fetch_add(1, Ordering::Relaxed);
        self.resolved.notify_all();
        Ok(())
    }

    fn disable_writes(&self, addr: u64) -> Result<(), Error> {
        self.offset_of(addr)?;
        let mut state = self.state.lock();
        state.pages.insert(addr, Prot::ReadOnly);
        self.write_disables.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn reclaim_page(&self, addr: u64) -> Result<(), Error> {
        let offset = self.offset_of(addr)?;
        let mut state = self.state.lock();
        state.pages.remove(&addr);
        // A reclaimed anonymous page reads back as zeroes.
        // SAFETY: the range is inside the region and accessors are held
        // off by the state lock.
        unsafe {
            std::ptr::write_bytes(self.region.ptr.as_ptr().add(offset), 0, self.page_size);
        }
        self.reclaims.fetch_add(1, Ordering::Relaxed);
        self.reclaim_log.lock().push(addr);
        Ok(())
    }

    fn stop(&self) {
        let mut state = self.state.lock();
        state.stopped = true;
        self.events.notify_all();
        self.resolved.notify_all();
    }
}

/// Page-aligned zero-filled heap region.
struct Region {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
}

// SAFETY: the region is plain memory; all access is coordinated by the
// listener's state lock.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    fn new(len: usize, align: usize) -> Result<Self, Error> {
        let layout = Layout::from_size_align(len, align)
            .map_err(|_| Error::InvalidConfig("region length overflows the allocator"))?;
        // SAFETY: layout has non-zero size (validated by the caller).
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or_else(|| {
            Error::Map(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                "region allocation failed",
            ))
        })?;
        Ok(Self { ptr, len, layout })
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        // SAFETY: allocated with the same layout in `new`.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread, time::Duration};

    const PAGE: usize = 4096;

    fn listener() -> Arc<MockListener> {
        Arc::new(MockListener::new(16 * PAGE, PAGE, 64).unwrap())
    }

    #[test]
    fn test_raise_blocks_until_install() {
        let listener = listener();
        let base = listener.base();

        let waiter = {
            let listener = listener.clone();
            thread::spawn(move || listener.raise(base, false))
        };

        // The fault must surface as an event.
        let events = listener.get_events().unwrap();
        assert_eq!(events[0], Event::Fault { addr: base, write: false });
        assert!(!waiter.is_finished());

        listener.install_page(base, &vec![3u8; PAGE], false).unwrap();
        waiter.join().unwrap().unwrap();

        let mut byte = [0u8; 1];
        listener.read(base, &mut byte).unwrap();
        assert_eq!(byte[0], 3);
    }

    #[test]
    fn test_write_fault_on_protected_page() {
        let listener = listener();
        let base = listener.base();
        listener.install_page(base, &vec![0u8; PAGE], false).unwrap();

        let writer = {
            let listener = listener.clone();
            thread::spawn(move || listener.write(base, &[7u8]))
        };

        // A write fault is queued because the page is write-protected.
        let events = listener.get_events().unwrap();
        assert_eq!(events[0], Event::Fault { addr: base, write: true });

        listener.enable_writes(base).unwrap();
        writer.join().unwrap().unwrap();
        assert_eq!(listener.write_enables(), 1);

        let mut byte = [0u8; 1];
        listener.read(base, &mut byte).unwrap();
        assert_eq!(byte[0], 7);
    }

    #[test]
    fn test_reclaim_zeroes_and_refaults() {
        let listener = listener();
        let base = listener.base();
        listener.install_page(base, &vec![9u8; PAGE], true).unwrap();
        listener.reclaim_page(base).unwrap();

        // Next access faults again.
        let reader = {
            let listener = listener.clone();
            thread::spawn(move || {
                let mut byte = [0xFFu8; 1];
                listener.read(base, &mut byte).map(|_| byte[0])
            })
        };
        let events = listener.get_events().unwrap();
        assert_eq!(events[0], Event::Fault { addr: base, write: false });
        listener.install_page(base, &vec![0u8; PAGE], false).unwrap();
        assert_eq!(reader.join().unwrap().unwrap(), 0);
    }

    #[test]
    fn test_stop_returns_sentinel_and_fails_accessors() {
        let listener = listener();
        let base = listener.base();

        let stopper = {
            let listener = listener.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                listener.stop();
            })
        };

        // Blocks until stop lands, then yields the sentinel.
        assert_eq!(listener.get_events().unwrap(), vec![Event::Shutdown]);
        assert_eq!(listener.get_events().unwrap(), vec![Event::Shutdown]);
        assert!(matches!(listener.raise(base, false), Err(Error::Shutdown)));
        stopper.join().unwrap();
    }

    #[test]
    fn test_batches_are_bounded() {
        let listener = Arc::new(MockListener::new(16 * PAGE, PAGE, 2).unwrap());
        let base = listener.base();
        let mut waiters = Vec::new();
        for i in 0..4 {
            let listener = listener.clone();
            let addr = base + (i * PAGE) as u64;
            waiters.push(thread::spawn(move || listener.raise(addr, false)));
        }

        // Wait until all four faults are queued.
        while listener.state.lock().queue.len() < 4 {
            thread::yield_now();
        }
        assert_eq!(listener.get_events().unwrap().len(), 2);
        assert_eq!(listener.get_events().unwrap().len(), 2);

        for i in 0..4 {
            let addr = base + (i * PAGE) as u64;
            listener.install_page(addr, &vec![0u8; PAGE], false).unwrap();
        }
        for waiter in waiters {
            waiter.join().unwrap().unwrap();
        }
    }
}
