use super::Store;
use std::{
    fs::{File, OpenOptions},
    io,
    path::Path,
};

#[cfg(unix)]
use std::os::unix::fs::FileExt;

/// A [`Store`] backed by a local file.
///
/// Reads past the end of the file zero-fill the remainder of the page, so a
/// mapping may be longer than its backing file; pages are materialized on
/// first write-back.
pub struct FileStore {
    file: File,
}

impl FileStore {
    /// Wrap an already-open file.
    pub fn new(file: File) -> Self {
        Self { file }
    }

    /// Open an existing file for paging.
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self { file })
    }

    /// Create (or truncate) a file preallocated to `len` bytes.
    pub fn create<P: AsRef<Path>>(path: P, len: u64) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(len)?;
        Ok(Self { file })
    }
}

impl Store for FileStore {
    fn read(&self, dst: &mut [u8], offset: u64) -> io::Result<()> {
        let mut filled = 0;
        while filled < dst.len() {
            let n = self
                .file
                .read_at(&mut dst[filled..], offset + filled as u64)?;
            if n == 0 {
                // Short file: the rest of the page reads as zeroes.
                dst[filled..].fill(0);
                return Ok(());
            }
            filled += n;
        }
        Ok(())
    }

    fn write(&self, src: &[u8], offset: u64) -> io::Result<()> {
        self.file.write_all_at(src, offset)
    }
}
