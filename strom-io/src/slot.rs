//! Bucket selection and identifier allocation for the hashed registries.

use std::sync::atomic::{AtomicU64, Ordering};

/// Seed for Memory Mapping Registry bucket selection.
pub(crate) const MAPPING_SEED: u64 = 0x2014_0702;
/// Seed for DMA Task Registry bucket selection.
pub(crate) const TASK_SEED: u64 = 0x2012_0106;

/// Map `key` onto one of `nslots` buckets.
pub(crate) fn slot_index(key: u64, seed: u64, nslots: usize) -> usize {
    // splitmix64 finalizer; sequential ids must still spread over buckets
    let mut z = key ^ seed;
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^= z >> 31;
    (z % nslots as u64) as usize
}

/// Hands out opaque, never reused identifiers.
#[derive(Debug)]
pub(crate) struct IdAllocator {
    next: AtomicU64,
}

impl IdAllocator {
    /// Identifiers start at `base`, which keeps handle and task id spaces
    /// visually distinct in logs.
    pub(crate) fn new(base: u64) -> Self {
        Self {
            next: AtomicU64::new(base),
        }
    }

    pub(crate) fn allocate(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}
