//! DMA task registry and the wait protocol.
//!
//! A [`DmaTask`] tracks one SSD-to-GPU transfer batch. It is reference
//! counted: the constructing context holds one reference until it freezes
//! the task, and every hardware request in flight holds one more, released
//! from the completion callback.
//!
//! ```text
//!  create ──▶ Active(refcnt=1) ──submit/complete──▶ … ──freeze──▶ Frozen
//!                                                                  │
//!                               last reference dropped ◀───────────┘
//!                                 │
//!                 ┌── no error ───┴── error ──┐
//!                 ▼                           ▼
//!               freed                Failed-Task Registry
//!                                             │ wait() / session teardown
//!                                             ▼
//!                                           freed
//! ```
//!
//! Asynchronous requests may fail long after the submitter returned, and
//! the application may or may not ever wait for the task. The first error
//! is kept (sticky) and the finished task is parked in the Failed-Task
//! Registry until [`wait`](TaskRegistry::wait) collects it or the owning
//! [`Session`] goes away.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering, fence};

use futures_channel::oneshot;
use parking_lot::{Condvar, Mutex};

use crate::backend::{BlockDevice, CachedPage, SourceFile};
use crate::config::StromConfig;
use crate::error::{Error, Result};
use crate::mapping::{GpuPages, MemoryRef};
use crate::session::Session;
use crate::slot::{IdAllocator, TASK_SEED, slot_index};

/// Opaque identifier of a DMA task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// How [`wait`](crate::Strom::memcpy_ssd2gpu_wait) may be cancelled.
#[derive(Debug, Clone, Copy)]
pub enum WaitMode<'a> {
    /// Sleep until the task resolves, ignoring interrupts.
    Uninterruptible,
    /// Return [`Error::Interrupted`] once the token is raised.
    Interruptible(&'a InterruptToken),
}

struct FailedTask {
    status: i64,
    session_id: u64,
}

#[derive(Default)]
struct SlotLists {
    active: HashSet<TaskId>,
    failed: HashMap<TaskId, FailedTask>,
    async_waiters: Vec<oneshot::Sender<()>>,
}

pub(crate) struct TaskSlot {
    lists: Mutex<SlotLists>,
    waitq: Condvar,
}

struct TaskResources {
    _memory: MemoryRef,
    _file: Arc<dyn SourceFile>,
    _session: Arc<Session>,
}

pub(crate) struct TaskRecord {
    id: TaskId,
    hindex: usize,
    refcnt: AtomicU32,
    frozen: AtomicBool,
    /// Sticky status; only written under the slot lock.
    status: AtomicI64,
    session_id: u64,
    resources: Mutex<Option<TaskResources>>,
}

pub(crate) enum WaitState {
    Failed(i64),
    Done,
    Running(oneshot::Receiver<()>),
}

pub(crate) struct TaskShared {
    slots: Box<[Arc<TaskSlot>]>,
    ids: IdAllocator,
    sessions: IdAllocator,
}

impl TaskShared {
    fn index(&self, id: TaskId) -> usize {
        slot_index(id.0, TASK_SEED, self.slots.len())
    }

    fn get(&self, record: &TaskRecord) {
        assert!(
            !record.frozen.load(Ordering::Acquire),
            "DMA task {} referenced after freeze",
            record.id
        );
        let prev = record.refcnt.fetch_add(1, Ordering::AcqRel);
        assert!(prev > 0, "DMA task {} revived from zero references", record.id);
    }

    fn put(&self, record: &TaskRecord, status: i64) {
        let slot = &self.slots[record.hindex];

        let mut locked = None;
        if status != 0 {
            let lists = slot.lists.lock();
            // first error wins
            let _ = record
                .status
                .compare_exchange(0, status, Ordering::AcqRel, Ordering::Acquire);
            locked = Some(lists);
        }

        let prev = record.refcnt.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "DMA task {} refcount underflow", record.id);
        if prev != 1 {
            return;
        }

        let mut lists = locked.unwrap_or_else(|| slot.lists.lock());
        assert!(
            record.frozen.load(Ordering::Acquire),
            "DMA task {} released before freeze",
            record.id
        );
        let status = record.status.load(Ordering::Acquire);
        assert!(
            lists.active.remove(&record.id),
            "DMA task {} missing from the active registry",
            record.id
        );
        if status != 0 {
            let prior = lists.failed.insert(
                record.id,
                FailedTask {
                    status,
                    session_id: record.session_id,
                },
            );
            assert!(prior.is_none(), "DMA task {} failed twice", record.id);
        }
        let async_waiters = std::mem::take(&mut lists.async_waiters);
        drop(lists);

        // memory reference, source file and session
        drop(record.resources.lock().take());

        slot.waitq.notify_all();
        for tx in async_waiters {
            let _ = tx.send(());
        }

        if status == 0 {
            tracing::debug!(task_id = %record.id, "DMA task completed");
        } else {
            tracing::warn!(task_id = %record.id, status, "DMA task completed with error");
        }
    }

    pub(crate) fn collect_orphans(&self, session_id: u64) {
        for slot in self.slots.iter() {
            let mut lists = slot.lists.lock();
            lists.failed.retain(|id, failed| {
                if failed.session_id != session_id {
                    return true;
                }
                tracing::info!(
                    task_id = %id,
                    status = failed.status,
                    "unreferenced asynchronous SSD2GPU DMA error"
                );
                false
            });
        }
    }

    fn wait(&self, id: TaskId, mode: WaitMode<'_>) -> Result<()> {
        let slot = &self.slots[self.index(id)];
        // must outlive `lists` so a raise can always reach our wait queue
        let _armed = match mode {
            WaitMode::Interruptible(token) => Some(token.arm(slot)),
            WaitMode::Uninterruptible => None,
        };
        let mut lists = slot.lists.lock();
        loop {
            if let Some(failed) = lists.failed.remove(&id) {
                tracing::debug!(task_id = %id, status = failed.status, "collected failed DMA task");
                return Err(Error::Io {
                    status: failed.status,
                });
            }
            if !lists.active.contains(&id) {
                return Ok(());
            }
            if let WaitMode::Interruptible(token) = mode {
                if token.is_raised() {
                    return Err(Error::Interrupted);
                }
            }
            slot.waitq.wait(&mut lists);
        }
    }

    pub(crate) fn poll_wait(&self, id: TaskId) -> WaitState {
        let mut lists = self.slots[self.index(id)].lists.lock();
        if let Some(failed) = lists.failed.remove(&id) {
            return WaitState::Failed(failed.status);
        }
        if !lists.active.contains(&id) {
            return WaitState::Done;
        }
        let (tx, rx) = oneshot::channel();
        lists.async_waiters.push(tx);
        WaitState::Running(rx)
    }
}

/// A counted reference to an unfrozen task, owned by one in-flight request.
pub(crate) struct TaskRef {
    record: Arc<TaskRecord>,
    tasks: Arc<TaskShared>,
}

impl TaskRef {
    pub(crate) fn id(&self) -> TaskId {
        self.record.id
    }

    /// Drop the reference, recording `status` if it is an error.
    pub(crate) fn release(self, status: i64) {
        self.tasks.put(&self.record, status);
    }
}

/// The reference held by the constructing context. Dropping it freezes
/// the task.
struct InitialRef {
    record: Arc<TaskRecord>,
    tasks: Arc<TaskShared>,
}

impl Drop for InitialRef {
    fn drop(&mut self) {
        self.record.frozen.store(true, Ordering::Release);
        fence(Ordering::SeqCst);
        self.tasks.put(&self.record, 0);
    }
}

/// State of the request being coalesced, in destination and device blocks.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PendingRequest {
    pub(crate) dest_offset: u64,
    pub(crate) src_block: u64,
    pub(crate) nr_blocks: u32,
}

/// A task under construction.
///
/// Only the constructing context touches the pending request and the page
/// scratch list. [`freeze`](Self::freeze) (or dropping the task) gives up
/// the initial reference; after that no new request can reference it.
pub(crate) struct DmaTask {
    pages: Arc<GpuPages>,
    map_offset: u64,
    map_length: u64,
    file: Arc<dyn SourceFile>,
    device: BlockDevice,
    block_shift: u32,
    max_nblocks: u32,
    pub(crate) pending: PendingRequest,
    /// Locked page-cache pages of the chunk being classified.
    pub(crate) file_pages: Vec<Option<Box<dyn CachedPage>>>,
    // declared last so it drops after the fields above
    initial: InitialRef,
}

impl DmaTask {
    pub(crate) fn id(&self) -> TaskId {
        self.initial.record.id
    }

    /// Take a reference for an asynchronous request.
    pub(crate) fn acquire(&self) -> TaskRef {
        self.initial.tasks.get(&self.initial.record);
        TaskRef {
            record: Arc::clone(&self.initial.record),
            tasks: Arc::clone(&self.initial.tasks),
        }
    }

    /// Freeze the task and drop the constructing reference.
    pub(crate) fn freeze(self) -> TaskId {
        self.id()
    }

    pub(crate) fn pages(&self) -> &GpuPages {
        &self.pages
    }

    pub(crate) fn map_offset(&self) -> u64 {
        self.map_offset
    }

    pub(crate) fn map_length(&self) -> u64 {
        self.map_length
    }

    pub(crate) fn file(&self) -> &dyn SourceFile {
        self.file.as_ref()
    }

    pub(crate) fn device(&self) -> &BlockDevice {
        &self.device
    }

    pub(crate) fn block_shift(&self) -> u32 {
        self.block_shift
    }

    pub(crate) fn max_nblocks(&self) -> u32 {
        self.max_nblocks
    }

    /// Unlock and release every probed page.
    pub(crate) fn release_pages(&mut self) {
        self.file_pages.iter_mut().for_each(|page| *page = None);
    }
}

/// Hashed registry of active and failed DMA tasks.
pub(crate) struct TaskRegistry {
    shared: Arc<TaskShared>,
}

impl TaskRegistry {
    pub(crate) fn new(config: &StromConfig) -> Self {
        let slots = (0..config.task_slots())
            .map(|_| {
                Arc::new(TaskSlot {
                    lists: Mutex::new(SlotLists::default()),
                    waitq: Condvar::new(),
                })
            })
            .collect();
        Self {
            shared: Arc::new(TaskShared {
                slots,
                ids: IdAllocator::new(0x10_0000),
                sessions: IdAllocator::new(1),
            }),
        }
    }

    pub(crate) fn shared(&self) -> &Arc<TaskShared> {
        &self.shared
    }

    pub(crate) fn open_session(&self) -> Arc<Session> {
        Arc::new(Session::new(
            self.shared.sessions.allocate(),
            Arc::downgrade(&self.shared),
        ))
    }

    /// Register a new task with one reference held by the caller.
    ///
    /// `device.block_size` must already be validated as a power of two.
    pub(crate) fn create(
        &self,
        memory: MemoryRef,
        file: Arc<dyn SourceFile>,
        device: BlockDevice,
        session: &Arc<Session>,
        config: &StromConfig,
    ) -> DmaTask {
        let id = TaskId(self.shared.ids.allocate());
        let hindex = self.shared.index(id);
        let block_shift = device.block_size.trailing_zeros();
        let max_nblocks = (config.dma_max_len() >> block_shift) as u32;

        let pages = memory.pages_arc();
        let map_offset = memory.map_offset();
        let map_length = memory.map_length();
        let record = Arc::new(TaskRecord {
            id,
            hindex,
            refcnt: AtomicU32::new(1),
            frozen: AtomicBool::new(false),
            status: AtomicI64::new(0),
            session_id: session.id(),
            resources: Mutex::new(Some(TaskResources {
                _memory: memory,
                _file: Arc::clone(&file),
                _session: Arc::clone(session),
            })),
        });

        self.shared.slots[hindex].lists.lock().active.insert(id);
        tracing::debug!(
            task_id = %id,
            device = %device.name,
            block_size = device.block_size,
            "DMA task created"
        );

        DmaTask {
            pages,
            map_offset,
            map_length,
            file,
            device,
            block_shift,
            max_nblocks,
            pending: PendingRequest::default(),
            file_pages: (0..config.max_pages_per_request()).map(|_| None).collect(),
            initial: InitialRef {
                record,
                tasks: Arc::clone(&self.shared),
            },
        }
    }

    /// Block until `id` leaves the active registry.
    ///
    /// Returns [`Error::Io`] with the sticky status if the task failed (and
    /// discards it), `Ok` if it completed cleanly or never existed.
    pub(crate) fn wait(&self, id: TaskId, mode: WaitMode<'_>) -> Result<()> {
        self.shared.wait(id, mode)
    }

    pub(crate) fn active_count(&self) -> usize {
        self.shared
            .slots
            .iter()
            .map(|slot| slot.lists.lock().active.len())
            .sum()
    }

    pub(crate) fn failed_count(&self) -> usize {
        self.shared
            .slots
            .iter()
            .map(|slot| slot.lists.lock().failed.len())
            .sum()
    }
}

#[derive(Default)]
struct TokenInner {
    raised: AtomicBool,
    armed: Mutex<Option<Arc<TaskSlot>>>,
}

/// Delivers an interrupt to an [`Interruptible`](WaitMode::Interruptible)
/// wait, possibly from another thread.
///
/// A token serves one wait at a time. Raising it before the wait starts
/// interrupts the wait as soon as it would sleep.
#[derive(Clone, Default)]
pub struct InterruptToken {
    inner: Arc<TokenInner>,
}

impl InterruptToken {
    /// Create a token that is not raised.
    pub fn new() -> Self {
        Self::default()
    }

    /// Interrupt the wait currently using this token, if any, and any
    /// later wait until [`clear`](Self::clear) is called.
    pub fn raise(&self) {
        self.inner.raised.store(true, Ordering::SeqCst);
        let slot = self.inner.armed.lock().clone();
        if let Some(slot) = slot {
            // taking the lock orders us after the waiter's last check
            let _lists = slot.lists.lock();
            slot.waitq.notify_all();
        }
    }

    /// True once raised.
    pub fn is_raised(&self) -> bool {
        self.inner.raised.load(Ordering::SeqCst)
    }

    /// Reset to the not-raised state.
    pub fn clear(&self) {
        self.inner.raised.store(false, Ordering::SeqCst);
    }

    fn arm(&self, slot: &Arc<TaskSlot>) -> Armed<'_> {
        *self.inner.armed.lock() = Some(Arc::clone(slot));
        Armed(self)
    }
}

impl fmt::Debug for InterruptToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterruptToken")
            .field("raised", &self.is_raised())
            .finish()
    }
}

struct Armed<'a>(&'a InterruptToken);

impl Drop for Armed<'_> {
    fn drop(&mut self) {
        *self.0.inner.armed.lock() = None;
    }
}
