//! End-to-end fault-service scenarios against the mock kernel channel.

use faultmap::{Config, FaultListener, FileStore, Mapping, MemStore, MockListener, Store};
use std::{
    io,
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

const PAGE: usize = 4096;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn config(capacity: usize, low: usize, high: usize) -> Config {
    Config {
        page_size: PAGE,
        buffer_capacity: NonZeroUsize::new(capacity).unwrap(),
        low_watermark: low,
        high_watermark: high,
        fill_workers: NonZeroUsize::new(1).unwrap(),
        flush_workers: NonZeroUsize::new(1).unwrap(),
        max_fault_events: NonZeroUsize::new(64).unwrap(),
    }
}

fn wait_for(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

fn page_addr(base: u64, page: u64) -> u64 {
    base + page * PAGE as u64
}

/// Read-touch four pages, then two more past the high watermark: the two
/// oldest pages leave, in order, and the store is never written.
#[test]
fn test_fifo_eviction_under_watermark_pressure() {
    init_tracing();
    let tmp = tempfile::NamedTempFile::new().unwrap();
    let store = Arc::new(FileStore::create(tmp.path(), (16 * PAGE) as u64).unwrap());
    let listener = Arc::new(MockListener::new(16 * PAGE, PAGE, 64).unwrap());
    let mapping = Mapping::with_listener(config(4, 1, 3), store, listener.clone()).unwrap();
    let base = listener.base();

    for page in 0..4 {
        listener.raise(page_addr(base, page), false).unwrap();
    }
    wait_for("initial fills", || mapping.stats().fills == 4);

    for page in 4..6 {
        listener.raise(page_addr(base, page), false).unwrap();
    }
    wait_for("eviction burst", || {
        mapping.stats().evictions == 2 && mapping.stats().fills == 6
    });

    // Strict FIFO: pages 0 and 1 leave, in that order.
    assert_eq!(
        listener.reclaim_order(),
        vec![page_addr(base, 0), page_addr(base, 1)]
    );
    assert_eq!(
        listener.installed_pages(),
        (2..6).map(|p| page_addr(base, p)).collect::<Vec<_>>()
    );
    assert_eq!(mapping.stats().resident, 4);
    assert_eq!(mapping.stats().writebacks, 0);

    // Everything was clean; the backing file is untouched.
    mapping.unmap().unwrap();
    let contents = std::fs::read(tmp.path()).unwrap();
    assert_eq!(contents.len(), 16 * PAGE);
    assert!(contents.iter().all(|&b| b == 0));
}

/// A write fault on a clean installed page upgrades it in place: one
/// write-unprotect, no second fill.
#[test]
fn test_write_fault_upgrades_without_refill() {
    init_tracing();
    let store = Arc::new(MemStore::new(16 * PAGE));
    let listener = Arc::new(MockListener::new(16 * PAGE, PAGE, 64).unwrap());
    let mapping = Mapping::with_listener(config(4, 1, 3), store, listener.clone()).unwrap();
    let base = listener.base();

    listener.raise(base, false).unwrap();
    wait_for("fill", || mapping.stats().fills == 1);

    listener.write(base, &[0xAB]).unwrap();
    wait_for("write upgrade", || mapping.stats().write_upgrades == 1);

    // Reading it back faults nothing further.
    let mut byte = [0u8; 1];
    listener.read(base, &mut byte).unwrap();
    assert_eq!(byte[0], 0xAB);

    assert_eq!(listener.installs(), 1);
    assert_eq!(listener.write_enables(), 1);
    assert_eq!(mapping.stats().dirty, 1);
    assert_eq!(mapping.stats().fills, 1);
}

/// Stream writes through a two-page buffer, then flush: the store holds
/// every page and the last two stay resident, clean.
#[test]
fn test_write_stream_with_flush() {
    init_tracing();
    let store = Arc::new(MemStore::new(8 * PAGE));
    let listener = Arc::new(MockListener::new(8 * PAGE, PAGE, 64).unwrap());
    let mapping =
        Mapping::with_listener(config(2, 0, 1), store.clone(), listener.clone()).unwrap();
    let base = listener.base();

    for page in 0..8 {
        let pattern = vec![page as u8 + 1; PAGE];
        listener.write(page_addr(base, page), &pattern).unwrap();
    }
    mapping.flush().unwrap();

    let contents = store.contents();
    for page in 0..8usize {
        assert!(
            contents[page * PAGE..(page + 1) * PAGE]
                .iter()
                .all(|&b| b == page as u8 + 1),
            "page {page} not persisted"
        );
    }
    assert_eq!(
        listener.installed_pages(),
        vec![page_addr(base, 6), page_addr(base, 7)]
    );
    let stats = mapping.stats();
    assert_eq!(stats.resident, 2);
    assert_eq!(stats.dirty, 0);
}

/// Eight threads write eight distinct pages through a four-page buffer;
/// every write persists.
#[test]
fn test_concurrent_writers_persist() {
    init_tracing();
    let store = Arc::new(MemStore::new(8 * PAGE));
    let listener = Arc::new(MockListener::new(8 * PAGE, PAGE, 64).unwrap());
    let mut config = config(4, 1, 3);
    config.fill_workers = NonZeroUsize::new(2).unwrap();
    config.flush_workers = NonZeroUsize::new(2).unwrap();
    let mapping = Mapping::with_listener(config, store.clone(), listener.clone()).unwrap();
    let base = listener.base();

    let mut writers = Vec::new();
    for page in 0..8 {
        let listener = listener.clone();
        writers.push(thread::spawn(move || {
            let pattern = vec![0x10 + page as u8; PAGE];
            listener.write(page_addr(base, page), &pattern).unwrap();
        }));
    }
    for writer in writers {
        writer.join().unwrap();
    }
    mapping.flush().unwrap();

    let contents = store.contents();
    for page in 0..8usize {
        assert!(
            contents[page * PAGE..(page + 1) * PAGE]
                .iter()
                .all(|&b| b == 0x10 + page as u8),
            "page {page} not persisted"
        );
    }
    assert_eq!(mapping.stats().dirty, 0);
}

/// Unmapping mid-stream completes accepted faults and rejects the rest;
/// the store sees whole pages only.
#[test]
fn test_unmap_mid_stream() {
    init_tracing();
    let store = Arc::new(MemStore::new(8 * PAGE));
    let listener = Arc::new(MockListener::new(8 * PAGE, PAGE, 64).unwrap());
    let mapping =
        Mapping::with_listener(config(4, 1, 3), store.clone(), listener.clone()).unwrap();
    let base = listener.base();

    let mut writers = Vec::new();
    for page in 0..8 {
        let listener = listener.clone();
        writers.push(thread::spawn(move || {
            let pattern = vec![0x20 + page as u8; PAGE];
            listener.write(page_addr(base, page), &pattern)
        }));
    }
    thread::sleep(Duration::from_millis(5));
    mapping.unmap().unwrap();

    // Writers either landed before the shutdown or were rejected by it.
    for writer in writers {
        let _ = writer.join().unwrap();
    }

    let contents = store.contents();
    for page in 0..8usize {
        let slice = &contents[page * PAGE..(page + 1) * PAGE];
        let untouched = slice.iter().all(|&b| b == 0);
        let persisted = slice.iter().all(|&b| b == 0x20 + page as u8);
        assert!(untouched || persisted, "page {page} is torn");
    }
}

/// A dirty byte survives flush, eviction, and a re-fill from the store.
#[test]
fn test_dirty_byte_survives_eviction_roundtrip() {
    init_tracing();
    let store = Arc::new(MemStore::new(8 * PAGE));
    let listener = Arc::new(MockListener::new(8 * PAGE, PAGE, 64).unwrap());
    let mapping =
        Mapping::with_listener(config(2, 0, 1), store.clone(), listener.clone()).unwrap();
    let base = listener.base();

    listener.write(base + 5, &[0xBB]).unwrap();
    mapping.flush().unwrap();

    // Touch other pages until page 0 is evicted.
    listener.raise(page_addr(base, 1), false).unwrap();
    listener.raise(page_addr(base, 2), false).unwrap();
    wait_for("page 0 eviction", || {
        !listener.installed_pages().contains(&base)
    });

    // Faulting it back reads the flushed byte from the store.
    let mut byte = [0u8; 1];
    listener.read(base + 5, &mut byte).unwrap();
    assert_eq!(byte[0], 0xBB);
}

/// Flushing a clean buffer writes nothing and returns immediately.
#[test]
fn test_flush_clean_buffer_is_noop() {
    init_tracing();
    let store = Arc::new(MemStore::new(8 * PAGE));
    let listener = Arc::new(MockListener::new(8 * PAGE, PAGE, 64).unwrap());
    let mapping = Mapping::with_listener(config(4, 1, 3), store, listener.clone()).unwrap();

    listener.raise(listener.base(), false).unwrap();
    mapping.flush().unwrap();
    mapping.flush().unwrap();
    assert_eq!(mapping.stats().writebacks, 0);
}

/// Concurrent faults on the same page while its fill is in flight resolve
/// with a single fill.
#[test]
fn test_concurrent_faults_single_fill() {
    init_tracing();
    let store = Arc::new(MemStore::new(8 * PAGE));
    let listener = Arc::new(MockListener::new(8 * PAGE, PAGE, 64).unwrap());
    let mapping = Mapping::with_listener(config(4, 1, 3), store, listener.clone()).unwrap();
    let base = listener.base();

    let mut readers = Vec::new();
    for _ in 0..4 {
        let listener = listener.clone();
        readers.push(thread::spawn(move || listener.raise(base, false)));
    }
    for reader in readers {
        reader.join().unwrap().unwrap();
    }
    assert_eq!(listener.installs(), 1);
    wait_for("single fill", || mapping.stats().fills == 1);
}

/// A single-slot buffer still makes progress on a stream of distinct
/// addresses.
#[test]
fn test_capacity_one_makes_progress() {
    init_tracing();
    let store = Arc::new(MemStore::new(8 * PAGE));
    let listener = Arc::new(MockListener::new(8 * PAGE, PAGE, 64).unwrap());
    let mapping = Mapping::with_listener(config(1, 0, 1), store, listener.clone()).unwrap();
    let base = listener.base();

    for page in 0..8 {
        listener.raise(page_addr(base, page), false).unwrap();
    }
    wait_for("fills", || mapping.stats().fills == 8);
    wait_for("evictions", || mapping.stats().evictions == 7);
    assert_eq!(mapping.stats().resident, 1);
}

/// Unmap writes dirty pages back, and a fresh mapping over the same store
/// sees identical contents at every offset.
#[test]
fn test_remap_preserves_contents() {
    init_tracing();
    let store = Arc::new(MemStore::new(4 * PAGE));
    let listener = Arc::new(MockListener::new(4 * PAGE, PAGE, 64).unwrap());
    let mapping =
        Mapping::with_listener(config(4, 1, 3), store.clone(), listener.clone()).unwrap();
    let base = listener.base();
    for page in 0..4 {
        let pattern = vec![0x40 + page as u8; PAGE];
        listener.write(page_addr(base, page), &pattern).unwrap();
    }
    mapping.unmap().unwrap();

    let listener = Arc::new(MockListener::new(4 * PAGE, PAGE, 64).unwrap());
    let mapping =
        Mapping::with_listener(config(4, 1, 3), store.clone(), listener.clone()).unwrap();
    let base = listener.base();
    for page in 0..4 {
        let mut out = vec![0u8; PAGE];
        listener.read(page_addr(base, page), &mut out).unwrap();
        assert_eq!(out, vec![0x40 + page as u8; PAGE], "page {page} differs");
    }
    drop(mapping);
}

/// A store that rejects a bounded number of writes, then recovers.
struct FlakyStore {
    inner: MemStore,
    write_failures: AtomicU64,
}

impl Store for FlakyStore {
    fn read(&self, dst: &mut [u8], offset: u64) -> io::Result<()> {
        self.inner.read(dst, offset)
    }

    fn write(&self, src: &[u8], offset: u64) -> io::Result<()> {
        let remaining = self.write_failures.load(Ordering::Relaxed);
        if remaining > 0 {
            self.write_failures.store(remaining - 1, Ordering::Relaxed);
            return Err(io::Error::other("transient write failure"));
        }
        self.inner.write(src, offset)
    }
}

/// A failed write-back is retried once and the page still persists.
#[test]
fn test_write_back_retries_once() {
    init_tracing();
    let store = Arc::new(FlakyStore {
        inner: MemStore::new(8 * PAGE),
        write_failures: AtomicU64::new(1),
    });
    let listener = Arc::new(MockListener::new(8 * PAGE, PAGE, 64).unwrap());
    let mapping =
        Mapping::with_listener(config(2, 0, 1), store.clone(), listener.clone()).unwrap();
    let base = listener.base();

    // Fill the buffer with dirty pages and push one more to force a
    // dirty eviction, whose first write attempt fails.
    for page in 0..3 {
        let pattern = vec![0x7A; PAGE];
        listener.write(page_addr(base, page), &pattern).unwrap();
    }
    mapping.flush().unwrap();

    let contents = store.inner.contents();
    for page in 0..3usize {
        assert!(
            contents[page * PAGE..(page + 1) * PAGE]
                .iter()
                .all(|&b| b == 0x7A),
            "page {page} not persisted"
        );
    }
}

/// A store whose writes always fail: the recorded error surfaces on
/// unmap.
struct BrokenStore;

impl Store for BrokenStore {
    fn read(&self, dst: &mut [u8], _offset: u64) -> io::Result<()> {
        dst.fill(0);
        Ok(())
    }

    fn write(&self, _src: &[u8], _offset: u64) -> io::Result<()> {
        Err(io::Error::other("write rejected"))
    }
}

#[test]
fn test_store_write_failure_surfaces_on_unmap() {
    init_tracing();
    let listener = Arc::new(MockListener::new(8 * PAGE, PAGE, 64).unwrap());
    let mapping =
        Mapping::with_listener(config(4, 1, 3), Arc::new(BrokenStore), listener.clone()).unwrap();

    listener.write(listener.base(), &[1]).unwrap();
    assert!(matches!(
        mapping.unmap(),
        Err(faultmap::Error::StoreWrite { .. })
    ));
}
