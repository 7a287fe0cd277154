use crate::{system_page_size, Error};
use std::num::NonZeroUsize;

/// Configuration for a [`Mapping`](crate::Mapping).
///
/// The page size must equal the fault-notification quantum of the listener
/// backing the mapping; on Linux this is the system page size.
#[derive(Debug, Clone)]
pub struct Config {
    /// Bytes per page. Must be a power of two.
    pub page_size: usize,

    /// Maximum number of concurrently resident pages.
    pub buffer_capacity: NonZeroUsize,

    /// Fill level (in pages) at which a triggered eviction stops removing
    /// pages. Each eviction burst removes `high_watermark - low_watermark`
    /// pages.
    pub low_watermark: usize,

    /// Fill level (in pages) above which eviction is triggered. Must satisfy
    /// `low_watermark < high_watermark <= buffer_capacity`.
    pub high_watermark: usize,

    /// Number of fill worker threads.
    pub fill_workers: NonZeroUsize,

    /// Number of flush worker threads.
    pub flush_workers: NonZeroUsize,

    /// Upper bound on the number of fault events returned by a single
    /// listener wake-up.
    pub max_fault_events: NonZeroUsize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            page_size: system_page_size(),
            buffer_capacity: NonZeroUsize::new(1024).unwrap(),
            low_watermark: 256,
            high_watermark: 768,
            fill_workers: NonZeroUsize::new(4).unwrap(),
            flush_workers: NonZeroUsize::new(4).unwrap(),
            max_fault_events: NonZeroUsize::new(64).unwrap(),
        }
    }
}

impl Config {
    /// Ensure the configuration is internally consistent.
    pub fn validate(&self) -> Result<(), Error> {
        if self.page_size == 0 || !self.page_size.is_power_of_two() {
            return Err(Error::InvalidConfig("page size must be a power of two"));
        }
        if self.high_watermark > self.buffer_capacity.get() {
            return Err(Error::InvalidConfig(
                "high watermark must not exceed buffer capacity",
            ));
        }
        if self.low_watermark >= self.high_watermark {
            return Err(Error::InvalidConfig(
                "low watermark must be below high watermark",
            ));
        }
        Ok(())
    }
}
