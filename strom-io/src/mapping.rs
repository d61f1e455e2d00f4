//! Registry of pinned GPU memory.
//!
//! A caller pins a range of GPU virtual memory with [`MappingRegistry::pin`]
//! and gets back an opaque [`MemoryHandle`]. DMA setup code turns the handle
//! into a [`MemoryRef`], which keeps the physical page table alive and
//! readable for as long as it is held.
//!
//! A mapping can go away two ways:
//!
//! - explicit unmap by its owner, or
//! - the pinning service revoking it at an arbitrary time (the GPU buffer
//!   was freed, the owning process died, ...) through the [`ReleaseHook`]
//!   handed out at pin time.
//!
//! Both paths detach the record from the registry first, so no new
//! reference can be taken, then block until every outstanding
//! [`MemoryRef`] is dropped. Whichever path gets there first frees the page
//! table; the other finds it already gone.
//!
//! User supplied addresses need not be aligned to the pinning boundary. The
//! registry pins the smallest boundary-aligned range covering the request
//! and records the request's offset into it as `map_offset`: with
//! `map_offset = 0x500`, destination offset 2000 of the caller's buffer is
//! byte 0x500 + 2000 of the mapped pages.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex};

use crate::access::{AccessPolicy, Principal};
use crate::config::{PAGE_SIZE, StromConfig};
use crate::error::{Error, Result};
use crate::slot::{IdAllocator, MAPPING_SEED, slot_index};

/// Opaque identifier of a pinned GPU memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemoryHandle(pub u64);

impl fmt::Display for MemoryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Page granularities the pinning service may report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuPageSize {
    /// 4KiB pages
    Size4K,
    /// 64KiB pages
    Size64K,
    /// 128KiB pages
    Size128K,
}

impl GpuPageSize {
    /// Classify a page size in bytes; `None` for anything unrecognized.
    pub fn from_bytes(bytes: u64) -> Option<Self> {
        match bytes {
            0x1000 => Some(GpuPageSize::Size4K),
            0x10000 => Some(GpuPageSize::Size64K),
            0x20000 => Some(GpuPageSize::Size128K),
            _ => None,
        }
    }

    /// Page size in bytes.
    pub fn bytes(self) -> u64 {
        1u64 << self.shift()
    }

    /// log2 of the page size.
    pub fn shift(self) -> u32 {
        match self {
            GpuPageSize::Size4K => 12,
            GpuPageSize::Size64K => 16,
            GpuPageSize::Size128K => 17,
        }
    }
}

/// Physical page table produced by the pinning service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageTable {
    /// Table layout version reported by the service
    pub version: u32,
    /// Page size in bytes
    pub page_size: u64,
    /// Physical address of each page, in virtual address order
    pub pages: Vec<u64>,
}

/// External service that pins GPU virtual memory for peer-to-peer DMA.
pub trait MemoryPinner: Send + Sync {
    /// Pin `length` bytes of GPU virtual memory starting at `address`.
    ///
    /// The service keeps `hook` and calls [`ReleaseHook::release`] if it has
    /// to revoke the mapping on its own, at any time and from any thread.
    fn get_pages(&self, address: u64, length: u64, hook: ReleaseHook) -> Result<PageTable>;

    /// Release a page table returned by [`get_pages`](Self::get_pages).
    ///
    /// Called exactly once per successful pin.
    fn free_page_table(&self, address: u64, table: &PageTable) -> Result<()>;
}

/// A page table together with its classified granularity.
#[derive(Debug)]
pub struct GpuPages {
    page_size: GpuPageSize,
    table: PageTable,
}

impl GpuPages {
    pub(crate) fn new(page_size: GpuPageSize, table: PageTable) -> Self {
        Self { page_size, table }
    }

    /// Granularity of the pages.
    pub fn page_size(&self) -> GpuPageSize {
        self.page_size
    }

    /// The underlying page table.
    pub fn table(&self) -> &PageTable {
        &self.table
    }

    /// Physical addresses of the pages.
    pub fn addresses(&self) -> &[u64] {
        &self.table.pages
    }
}

struct MemState {
    /// Number of live [`MemoryRef`]s.
    refcnt: u32,
    /// Release paths blocked until `refcnt` drains.
    waiters: u32,
    /// Set once a release path has started; never cleared.
    revoked: bool,
    pages: Option<Arc<GpuPages>>,
}

pub(crate) struct MappedMemory {
    handle: MemoryHandle,
    hindex: usize,
    owner: Principal,
    map_address: u64,
    map_offset: u64,
    map_length: u64,
    state: Mutex<MemState>,
    drained: Condvar,
}

impl MappedMemory {
    /// Wait for all references to drop and take the page table.
    ///
    /// Returns `None` if another release path already took it.
    fn drain(&self) -> Option<Arc<GpuPages>> {
        let mut state = self.state.lock();
        state.revoked = true;
        while state.refcnt > 0 {
            tracing::debug!(
                handle = %self.handle,
                refcnt = state.refcnt,
                "waiting for in-flight DMA before release"
            );
            state.waiters += 1;
            self.drained.wait(&mut state);
            state.waiters -= 1;
        }
        state.pages.take()
    }
}

/// Callback handle given to the [`MemoryPinner`] for asynchronous release.
pub struct ReleaseHook {
    mem: Arc<MappedMemory>,
    registry: Weak<MappingShared>,
    pinner: Weak<dyn MemoryPinner>,
    busy: Arc<AtomicUsize>,
}

impl ReleaseHook {
    /// Handle of the mapping this hook releases.
    pub fn handle(&self) -> MemoryHandle {
        self.mem.handle
    }

    /// Revoke the mapping.
    ///
    /// Detaches it from the registry if an explicit unmap has not already
    /// done so, then blocks (uninterruptibly) until every in-flight user has
    /// dropped its reference, then frees the page table unless the unmap
    /// path already did. Still frees the table after the service is dropped.
    pub fn release(self) {
        let rc = match self.registry.upgrade() {
            Some(registry) => {
                registry.slots[self.mem.hindex]
                    .lock()
                    .remove(&self.mem.handle);
                registry.release(&self.mem)
            }
            None => {
                tracing::debug!(handle = %self.mem.handle, "release after service shutdown");
                let Some(pinner) = self.pinner.upgrade() else {
                    tracing::warn!(
                        handle = %self.mem.handle,
                        "pinner dropped, page table not freed"
                    );
                    return;
                };
                release_drained(&self.mem, pinner.as_ref(), &self.busy)
            }
        };
        if rc.is_ok() {
            tracing::info!(handle = %self.mem.handle, "P2P GPU memory was released");
        }
    }
}

impl fmt::Debug for ReleaseHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReleaseHook")
            .field("handle", &self.mem.handle)
            .finish()
    }
}

/// A counted reference to a pinned region.
///
/// While any `MemoryRef` exists the page table stays valid; release paths
/// block until the last one is dropped.
pub struct MemoryRef {
    mem: Arc<MappedMemory>,
    pages: Arc<GpuPages>,
}

impl MemoryRef {
    /// Handle of the mapping.
    pub fn handle(&self) -> MemoryHandle {
        self.mem.handle
    }

    /// Principal that pinned the memory.
    pub fn owner(&self) -> Principal {
        self.mem.owner
    }

    /// Offset of the caller's address from the start of the mapped pages.
    pub fn map_offset(&self) -> u64 {
        self.mem.map_offset
    }

    /// Length of the mapped area, including `map_offset`.
    pub fn map_length(&self) -> u64 {
        self.mem.map_length
    }

    /// The pinned pages.
    pub fn pages(&self) -> &GpuPages {
        &self.pages
    }

    pub(crate) fn pages_arc(&self) -> Arc<GpuPages> {
        Arc::clone(&self.pages)
    }
}

impl Drop for MemoryRef {
    fn drop(&mut self) {
        let mut state = self.mem.state.lock();
        assert!(state.refcnt > 0, "mapped memory refcount underflow");
        state.refcnt -= 1;
        if state.refcnt == 0 && state.waiters > 0 {
            self.mem.drained.notify_all();
        }
    }
}

impl fmt::Debug for MemoryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryRef")
            .field("handle", &self.mem.handle)
            .field("map_offset", &self.mem.map_offset)
            .field("map_length", &self.mem.map_length)
            .finish()
    }
}

/// Returned by a successful pin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapResult {
    /// Handle of the new mapping
    pub handle: MemoryHandle,
    /// GPU page size in bytes
    pub gpu_page_size: u64,
    /// Number of GPU pages pinned
    pub gpu_npages: usize,
}

/// Diagnostic description of a mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingInfo {
    /// Handle of the mapping
    pub handle: MemoryHandle,
    /// Page table version reported by the pinner
    pub version: u32,
    /// GPU page size in bytes
    pub gpu_page_size: u64,
    /// Principal that pinned the memory
    pub owner: Principal,
    /// Pin-boundary aligned start of the mapped area
    pub map_address: u64,
    /// Offset of the caller's address from `map_address`
    pub map_offset: u64,
    /// Length of the mapped area, including `map_offset`
    pub map_length: u64,
    /// Physical address of every pinned page
    pub paddrs: Vec<u64>,
}

impl MappingInfo {
    /// Number of pinned pages.
    pub fn nitems(&self) -> usize {
        self.paddrs.len()
    }
}

/// Result of enumerating live mappings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MappingList {
    /// Every live handle fit.
    Complete(Vec<MemoryHandle>),
    /// More handles exist than the caller made room for.
    Truncated {
        /// The first `capacity` handles
        handles: Vec<MemoryHandle>,
        /// Number of live handles
        total: usize,
    },
}

impl MappingList {
    /// The handles that were returned.
    pub fn handles(&self) -> &[MemoryHandle] {
        match self {
            MappingList::Complete(handles) => handles,
            MappingList::Truncated { handles, .. } => handles,
        }
    }

    /// Number of live handles, including any that did not fit.
    pub fn total(&self) -> usize {
        match self {
            MappingList::Complete(handles) => handles.len(),
            MappingList::Truncated { total, .. } => *total,
        }
    }
}

type MappingSlot = Mutex<HashMap<MemoryHandle, Arc<MappedMemory>>>;

struct MappingShared {
    slots: Box<[MappingSlot]>,
    pinner: Arc<dyn MemoryPinner>,
    policy: Arc<dyn AccessPolicy>,
    busy: Arc<AtomicUsize>,
    ids: IdAllocator,
    pin_boundary_shift: u32,
}

impl MappingShared {
    fn index(&self, handle: MemoryHandle) -> usize {
        slot_index(handle.0, MAPPING_SEED, self.slots.len())
    }

    /// Common tail of unmap and asynchronous release. `mem` must already be
    /// detached from its slot.
    fn release(&self, mem: &MappedMemory) -> Result<()> {
        release_drained(mem, self.pinner.as_ref(), &self.busy)
    }
}

/// Drain `mem` and free its page table if this caller took it.
fn release_drained(
    mem: &MappedMemory,
    pinner: &dyn MemoryPinner,
    busy: &AtomicUsize,
) -> Result<()> {
    let Some(pages) = mem.drain() else {
        tracing::debug!(handle = %mem.handle, "page table already released");
        return Ok(());
    };
    let rc = pinner.free_page_table(mem.map_address, &pages.table);
    busy.fetch_sub(1, Ordering::AcqRel);
    rc.inspect_err(|err| {
        tracing::error!(handle = %mem.handle, error = %err, "failed to free page table");
    })
}

/// Hashed registry of [`MappedMemory`] records.
pub(crate) struct MappingRegistry {
    shared: Arc<MappingShared>,
}

impl MappingRegistry {
    pub(crate) fn new(
        config: &StromConfig,
        pinner: Arc<dyn MemoryPinner>,
        policy: Arc<dyn AccessPolicy>,
        busy: Arc<AtomicUsize>,
    ) -> Self {
        let slots = (0..config.mapping_slots())
            .map(|_| Mutex::new(HashMap::new()))
            .collect();
        Self {
            shared: Arc::new(MappingShared {
                slots,
                pinner,
                policy,
                busy,
                ids: IdAllocator::new(0x1000),
                pin_boundary_shift: config.pin_boundary_shift(),
            }),
        }
    }

    /// Pin `length` bytes of GPU memory at `vaddress` on behalf of `owner`.
    pub(crate) fn pin(&self, owner: Principal, vaddress: u64, length: u64) -> Result<MapResult> {
        if length == 0 {
            return Err(Error::InvalidArgument("length must be > 0".to_string()));
        }
        let boundary = 1u64 << self.shared.pin_boundary_shift;
        let map_address = vaddress & !(boundary - 1);
        let map_offset = vaddress & (boundary - 1);
        let map_length = map_offset
            .checked_add(length)
            .ok_or_else(|| Error::InvalidArgument("length overflows".to_string()))?;

        let handle = MemoryHandle(self.shared.ids.allocate());
        let mem = Arc::new(MappedMemory {
            handle,
            hindex: self.shared.index(handle),
            owner,
            map_address,
            map_offset,
            map_length,
            state: Mutex::new(MemState {
                refcnt: 0,
                waiters: 0,
                revoked: false,
                pages: None,
            }),
            drained: Condvar::new(),
        });
        let hook = ReleaseHook {
            mem: Arc::clone(&mem),
            registry: Arc::downgrade(&self.shared),
            pinner: Arc::downgrade(&self.shared.pinner),
            busy: Arc::clone(&self.shared.busy),
        };

        let table = self
            .shared
            .pinner
            .get_pages(map_address, map_length, hook)
            .inspect_err(|err| {
                tracing::error!(
                    address = map_address,
                    length = map_length,
                    error = %err,
                    "failed to pin GPU pages"
                );
            })?;

        let Some(page_size) = GpuPageSize::from_bytes(table.page_size) else {
            let raw = table.page_size;
            if let Err(err) = self.shared.pinner.free_page_table(map_address, &table) {
                tracing::error!(error = %err, "failed to free unusable page table");
            }
            return Err(Error::InvalidArgument(format!(
                "unsupported GPU page size {raw}"
            )));
        };
        let version = table.version;
        let gpu_npages = table.pages.len();
        let pages = Arc::new(GpuPages::new(page_size, table));

        {
            let mut slot = self.shared.slots[mem.hindex].lock();
            let mut state = mem.state.lock();
            if state.revoked {
                // revoked before it was ever visible; nobody else holds the table
                drop(state);
                drop(slot);
                if let Err(err) = self.shared.pinner.free_page_table(map_address, &pages.table) {
                    tracing::error!(error = %err, "failed to free revoked page table");
                }
                return Err(Error::NotFound(format!(
                    "GPU memory {handle} was revoked while pinning"
                )));
            }
            state.pages = Some(pages);
            self.shared.busy.fetch_add(1, Ordering::AcqRel);
            slot.insert(handle, Arc::clone(&mem));
        }

        tracing::info!(
            %handle,
            version,
            page_size = page_size.bytes(),
            entries = gpu_npages,
            "P2P GPU memory mapped"
        );
        let page_mask = PAGE_SIZE as u64 - 1;
        if map_offset & page_mask != 0 || map_length & page_mask != 0 {
            tracing::warn!(
                %handle,
                map_offset,
                map_length,
                "GPU memory mapping is not page aligned; DMA requests may be inconvenient"
            );
        }

        Ok(MapResult {
            handle,
            gpu_page_size: page_size.bytes(),
            gpu_npages,
        })
    }

    /// Take a reference on a mapping visible to `requester`.
    pub(crate) fn acquire(&self, handle: MemoryHandle, requester: Principal) -> Result<MemoryRef> {
        {
            let slot = self.shared.slots[self.shared.index(handle)].lock();
            if let Some(mem) = slot.get(&handle) {
                if self.shared.policy.permits(mem.owner, requester) {
                    let mut state = mem.state.lock();
                    if let Some(pages) = &state.pages {
                        let pages = Arc::clone(pages);
                        state.refcnt += 1;
                        return Ok(MemoryRef {
                            mem: Arc::clone(mem),
                            pages,
                        });
                    }
                }
            }
        }
        tracing::error!(%handle, %requester, "P2P GPU memory not found");
        Err(Error::NotFound(format!("GPU memory handle {handle}")))
    }

    /// Detach a mapping and free its page table once in-flight DMA drains.
    pub(crate) fn unmap(&self, handle: MemoryHandle, requester: Principal) -> Result<()> {
        let mem = {
            let mut slot = self.shared.slots[self.shared.index(handle)].lock();
            // NOTE: the owner check is a placeholder authorization model
            let permitted = slot
                .get(&handle)
                .is_some_and(|mem| self.shared.policy.permits(mem.owner, requester));
            if permitted { slot.remove(&handle) } else { None }
        };
        let Some(mem) = mem else {
            tracing::error!(%handle, %requester, "no mapped GPU memory found");
            return Err(Error::NotFound(format!("GPU memory handle {handle}")));
        };
        self.shared.release(&mem)?;
        tracing::info!(%handle, "P2P GPU memory unmapped");
        Ok(())
    }

    /// Enumerate live handles, optionally only those visible to `filter`.
    pub(crate) fn list(&self, filter: Option<Principal>, capacity: usize) -> MappingList {
        let mut handles = Vec::with_capacity(capacity.min(64));
        let mut total = 0;
        for slot in self.shared.slots.iter() {
            let slot = slot.lock();
            for mem in slot.values() {
                if filter.is_some_and(|p| !self.shared.policy.permits(mem.owner, p)) {
                    continue;
                }
                total += 1;
                if handles.len() < capacity {
                    handles.push(mem.handle);
                }
            }
        }
        if total > handles.len() {
            MappingList::Truncated { handles, total }
        } else {
            MappingList::Complete(handles)
        }
    }

    /// Describe a mapping, holding a reference for the duration of the copy.
    pub(crate) fn describe(&self, handle: MemoryHandle, requester: Principal) -> Result<MappingInfo> {
        let mem = self.acquire(handle, requester)?;
        let table = mem.pages().table();
        Ok(MappingInfo {
            handle,
            version: table.version,
            gpu_page_size: mem.pages().page_size().bytes(),
            owner: mem.owner(),
            map_address: mem.mem.map_address,
            map_offset: mem.map_offset(),
            map_length: mem.map_length(),
            paddrs: table.pages.clone(),
        })
    }

    /// Current reference count of a live mapping.
    pub(crate) fn refcount(&self, handle: MemoryHandle) -> Option<u32> {
        let slot = self.shared.slots[self.shared.index(handle)].lock();
        slot.get(&handle).map(|mem| mem.state.lock().refcnt)
    }
}
