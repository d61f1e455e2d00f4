//! Mock collaborators shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use parking_lot::Mutex;
use strom_io::{
    AccessMode, BlockDevice, CachedPage, DmaCompletion, DmaSubmitter, Error, Filesystem,
    MemoryHandle, MemoryPinner, PageTable, ReleaseHook, Result, ScatterRequest, SourceFile, Strom,
};

pub const BLOCK_SIZE: u32 = 4096;
pub const START_SECT: u64 = 2048;
/// Device block of file block 0 unless remapped.
pub const BLOCK_BASE: u64 = 1000;

/// Pins "GPU memory" whose physical addresses equal its virtual ones.
pub struct MockPinner {
    page_size: u64,
    frees: AtomicU32,
    hooks: Mutex<Vec<ReleaseHook>>,
}

impl MockPinner {
    pub fn new(page_size: u64) -> Arc<Self> {
        Arc::new(Self {
            page_size,
            frees: AtomicU32::new(0),
            hooks: Mutex::new(Vec::new()),
        })
    }

    pub fn frees(&self) -> u32 {
        self.frees.load(Ordering::SeqCst)
    }

    pub fn take_hook(&self, handle: MemoryHandle) -> Option<ReleaseHook> {
        let mut hooks = self.hooks.lock();
        let pos = hooks.iter().position(|h| h.handle() == handle)?;
        Some(hooks.remove(pos))
    }
}

impl MemoryPinner for MockPinner {
    fn get_pages(&self, address: u64, length: u64, hook: ReleaseHook) -> Result<PageTable> {
        let count = length.div_ceil(self.page_size);
        self.hooks.lock().push(hook);
        Ok(PageTable {
            version: 2,
            page_size: self.page_size,
            pages: (0..count).map(|i| address + i * self.page_size).collect(),
        })
    }

    fn free_page_table(&self, _address: u64, _table: &PageTable) -> Result<()> {
        self.frees.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct MockFile {
    pub ino: u64,
    pub size: u64,
    pub mode: AccessMode,
}

impl MockFile {
    pub fn new(size: u64) -> Arc<dyn SourceFile> {
        Arc::new(Self {
            ino: 42,
            size,
            mode: AccessMode::ReadOnly,
        })
    }

    pub fn with_mode(size: u64, mode: AccessMode) -> Arc<dyn SourceFile> {
        Arc::new(Self { ino: 43, size, mode })
    }
}

impl SourceFile for MockFile {
    fn ino(&self) -> u64 {
        self.ino
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn mode(&self) -> AccessMode {
        self.mode
    }
}

/// A cached page whose bytes all equal the low byte of its index.
pub struct MockPage {
    index: u64,
    dirty: bool,
}

impl CachedPage for MockPage {
    fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn copy_to(&self, dst: &mut [u8]) -> Result<()> {
        dst.fill(self.index as u8);
        Ok(())
    }
}

/// Single-file filesystem with a page cache and a file-to-device block map.
pub struct MockFs {
    block_size: u32,
    /// page index -> dirty
    cache: Mutex<HashMap<u64, bool>>,
    /// file block -> device block overrides
    remap: Mutex<HashMap<u64, u64>>,
    probed: Mutex<Vec<u64>>,
    reads: AtomicUsize,
}

impl MockFs {
    pub fn new() -> Arc<Self> {
        Self::with_block_size(BLOCK_SIZE)
    }

    pub fn with_block_size(block_size: u32) -> Arc<Self> {
        Arc::new(Self {
            block_size,
            cache: Mutex::new(HashMap::new()),
            remap: Mutex::new(HashMap::new()),
            probed: Mutex::new(Vec::new()),
            reads: AtomicUsize::new(0),
        })
    }

    pub fn cache_pages(&self, pages: impl IntoIterator<Item = u64>, dirty: bool) {
        let mut cache = self.cache.lock();
        for index in pages {
            cache.insert(index, dirty);
        }
    }

    pub fn remap_block(&self, iblock: u64, blocknr: u64) {
        self.remap.lock().insert(iblock, blocknr);
    }

    /// Page indices looked up in the cache, in order.
    pub fn probed(&self) -> Vec<u64> {
        self.probed.lock().clone()
    }

    /// Pages read synchronously because they were not cached.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

impl Filesystem for MockFs {
    fn probe(&self, _file: &dyn SourceFile) -> Result<BlockDevice> {
        Ok(BlockDevice {
            device_id: 7,
            name: "nvme0n1p1".to_string(),
            block_size: self.block_size,
            start_sect: START_SECT,
            nr_sects: 1 << 30,
        })
    }

    fn resolve_block(&self, _file: &dyn SourceFile, iblock: u64) -> Result<u64> {
        let remap = self.remap.lock();
        Ok(remap.get(&iblock).copied().unwrap_or(BLOCK_BASE + iblock))
    }

    fn find_lock_page(&self, _file: &dyn SourceFile, index: u64) -> Option<Box<dyn CachedPage>> {
        self.probed.lock().push(index);
        let dirty = *self.cache.lock().get(&index)?;
        Some(Box::new(MockPage { index, dirty }))
    }

    fn read_page(&self, _file: &dyn SourceFile, index: u64) -> Result<Box<dyn CachedPage>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockPage { index, dirty: false }))
    }
}

/// Records requests; completions are fired by the test unless `auto`.
pub struct MockSubmitter {
    auto: bool,
    fail_on: Option<usize>,
    submitted: AtomicUsize,
    pending: Mutex<Vec<(ScatterRequest, DmaCompletion)>>,
    requests: Mutex<Vec<ScatterRequest>>,
}

impl MockSubmitter {
    pub fn recording() -> Arc<Self> {
        Self::build(false, None)
    }

    pub fn auto() -> Arc<Self> {
        Self::build(true, None)
    }

    /// Completes requests immediately and rejects the `n`-th (0-based).
    pub fn failing_on(n: usize) -> Arc<Self> {
        Self::build(true, Some(n))
    }

    fn build(auto: bool, fail_on: Option<usize>) -> Arc<Self> {
        Arc::new(Self {
            auto,
            fail_on,
            submitted: AtomicUsize::new(0),
            pending: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<ScatterRequest> {
        self.requests.lock().clone()
    }

    pub fn take_completions(&self) -> Vec<DmaCompletion> {
        self.pending
            .lock()
            .drain(..)
            .map(|(_, done)| done)
            .collect()
    }
}

impl DmaSubmitter for MockSubmitter {
    fn submit(&self, req: ScatterRequest, done: DmaCompletion) -> Result<()> {
        let n = self.submitted.fetch_add(1, Ordering::SeqCst);
        if self.fail_on == Some(n) {
            return Err(Error::from_errno(libc::EIO));
        }
        self.requests.lock().push(req.clone());
        if self.auto {
            done.success();
        } else {
            self.pending.lock().push((req, done));
        }
        Ok(())
    }
}

pub struct Fixture {
    pub strom: Strom,
    pub pinner: Arc<MockPinner>,
    pub fs: Arc<MockFs>,
    pub submitter: Arc<MockSubmitter>,
}

pub fn fixture(submitter: Arc<MockSubmitter>) -> Fixture {
    fixture_with(MockFs::new(), submitter)
}

pub fn fixture_with(fs: Arc<MockFs>, submitter: Arc<MockSubmitter>) -> Fixture {
    let pinner = MockPinner::new(0x10000);
    let strom = Strom::builder()
        .filesystem(fs.clone())
        .pinner(pinner.clone())
        .submitter(submitter.clone())
        .build()
        .unwrap();
    Fixture {
        strom,
        pinner,
        fs,
        submitter,
    }
}
