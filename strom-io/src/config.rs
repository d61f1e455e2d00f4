//! Tunables for the DMA orchestration core.
//!
//! # Example
//!
//! ```
//! use strom_io::StromConfig;
//!
//! let config = StromConfig::builder()
//!     .task_slots(64)
//!     .dma_max_len(64 * 1024)
//!     .cache_threshold_percent(75)
//!     .build()
//!     .unwrap();
//! assert_eq!(config.max_pages_per_request(), 16);
//! ```

use crate::error::{Error, Result};

/// Host page size; chunk sizes and cache probes work in these units.
pub const PAGE_SIZE: usize = 4096;
/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: u32 = 12;

/// Default number of Memory Mapping Registry buckets.
pub const DEFAULT_MAPPING_SLOTS: usize = 48;
/// Default number of DMA Task Registry buckets.
pub const DEFAULT_TASK_SLOTS: usize = 240;
/// Default pinning boundary (64KiB).
pub const DEFAULT_PIN_BOUNDARY_SHIFT: u32 = 16;
/// Some NVMe SSDs reject requests larger than 128KiB.
pub const DEFAULT_DMA_MAX_LEN: usize = 128 * 1024;
/// Default writeback threshold: more than half of a chunk cached.
pub const DEFAULT_CACHE_THRESHOLD_PERCENT: u32 = 50;

/// Validated configuration of a [`Strom`](crate::Strom) service.
#[derive(Debug, Clone)]
pub struct StromConfig {
    mapping_slots: usize,
    task_slots: usize,
    pin_boundary_shift: u32,
    dma_max_len: usize,
    cache_threshold_percent: u32,
}

impl StromConfig {
    /// Create a new configuration builder.
    pub fn builder() -> StromConfigBuilder {
        StromConfigBuilder::new()
    }

    /// Number of Memory Mapping Registry buckets.
    pub fn mapping_slots(&self) -> usize {
        self.mapping_slots
    }

    /// Number of DMA Task Registry buckets.
    pub fn task_slots(&self) -> usize {
        self.task_slots
    }

    /// log2 of the alignment that pinned regions are rounded down to.
    pub fn pin_boundary_shift(&self) -> u32 {
        self.pin_boundary_shift
    }

    /// Pinning alignment in bytes.
    pub fn pin_boundary(&self) -> u64 {
        1u64 << self.pin_boundary_shift
    }

    /// Maximum bytes covered by a single hardware request.
    pub fn dma_max_len(&self) -> usize {
        self.dma_max_len
    }

    /// Host pages covered by a maximum-size request.
    pub fn max_pages_per_request(&self) -> usize {
        self.dma_max_len / PAGE_SIZE
    }

    /// Writeback threshold as a percentage of a chunk's pages.
    pub fn cache_threshold_percent(&self) -> u32 {
        self.cache_threshold_percent
    }

    /// Score a chunk of `nr_pages` must exceed to be written back from the
    /// page cache instead of read from the SSD.
    pub fn cache_threshold(&self, nr_pages: usize) -> usize {
        nr_pages * self.cache_threshold_percent as usize / 100
    }
}

impl Default for StromConfig {
    fn default() -> Self {
        Self {
            mapping_slots: DEFAULT_MAPPING_SLOTS,
            task_slots: DEFAULT_TASK_SLOTS,
            pin_boundary_shift: DEFAULT_PIN_BOUNDARY_SHIFT,
            dma_max_len: DEFAULT_DMA_MAX_LEN,
            cache_threshold_percent: DEFAULT_CACHE_THRESHOLD_PERCENT,
        }
    }
}

/// Builder for [`StromConfig`].
#[derive(Debug, Clone)]
pub struct StromConfigBuilder {
    config: StromConfig,
}

impl StromConfigBuilder {
    /// Create a new builder with default options.
    pub fn new() -> Self {
        Self {
            config: StromConfig::default(),
        }
    }

    /// Set the number of Memory Mapping Registry buckets.
    pub fn mapping_slots(mut self, slots: usize) -> Self {
        self.config.mapping_slots = slots;
        self
    }

    /// Set the number of DMA Task Registry buckets.
    pub fn task_slots(mut self, slots: usize) -> Self {
        self.config.task_slots = slots;
        self
    }

    /// Set the pinning alignment as a power of two.
    pub fn pin_boundary_shift(mut self, shift: u32) -> Self {
        self.config.pin_boundary_shift = shift;
        self
    }

    /// Set the maximum length of one hardware request.
    ///
    /// Must be a power of two and a multiple of [`PAGE_SIZE`].
    pub fn dma_max_len(mut self, len: usize) -> Self {
        self.config.dma_max_len = len;
        self
    }

    /// Set the writeback threshold (1..=100 percent of a chunk's pages).
    pub fn cache_threshold_percent(mut self, percent: u32) -> Self {
        self.config.cache_threshold_percent = percent;
        self
    }

    /// Validate and produce the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for zero slot counts, a malformed
    /// request length, an out-of-range threshold or pinning boundary.
    pub fn build(self) -> Result<StromConfig> {
        let c = self.config;
        if c.mapping_slots == 0 || c.task_slots == 0 {
            return Err(Error::InvalidArgument(
                "slot counts must be > 0".to_string(),
            ));
        }
        if !(PAGE_SHIFT..=30).contains(&c.pin_boundary_shift) {
            return Err(Error::InvalidArgument(format!(
                "pin boundary shift {} out of range",
                c.pin_boundary_shift
            )));
        }
        if c.dma_max_len < PAGE_SIZE || !c.dma_max_len.is_power_of_two() {
            return Err(Error::InvalidArgument(format!(
                "dma_max_len {} must be a power of two >= {}",
                c.dma_max_len, PAGE_SIZE
            )));
        }
        if !(1..=100).contains(&c.cache_threshold_percent) {
            return Err(Error::InvalidArgument(format!(
                "cache threshold {}% out of range",
                c.cache_threshold_percent
            )));
        }
        Ok(c)
    }
}

impl Default for StromConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
