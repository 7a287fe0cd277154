use super::Store;
use parking_lot::Mutex;
use std::io;

/// An in-memory [`Store`] for tests and benchmarks.
pub struct MemStore {
    content: Mutex<Vec<u8>>,
}

impl MemStore {
    /// Create a zero-filled store of `len` bytes.
    pub fn new(len: usize) -> Self {
        Self {
            content: Mutex::new(vec![0u8; len]),
        }
    }

    /// Snapshot the full contents.
    pub fn contents(&self) -> Vec<u8> {
        self.content.lock().clone()
    }
}

impl Store for MemStore {
    fn read(&self, dst: &mut [u8], offset: u64) -> io::Result<()> {
        let content = self.content.lock();
        let offset = offset as usize;
        let available = content.len().saturating_sub(offset);
        let n = dst.len().min(available);
        dst[..n].copy_from_slice(&content[offset..offset + n]);
        dst[n..].fill(0);
        Ok(())
    }

    fn write(&self, src: &[u8], offset: u64) -> io::Result<()> {
        let mut content = self.content.lock();
        let offset = offset as usize;
        let required = offset + src.len();
        if required > content.len() {
            content.resize(required, 0);
        }
        content[offset..offset + src.len()].copy_from_slice(src);
        Ok(())
    }
}
