//! The service object tying the registries to their collaborators.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use strom_io::{DmaSubmitter, Filesystem, MemoryPinner, Principal, Strom};
//!
//! fn run(
//!     fs: Arc<dyn Filesystem>,
//!     pinner: Arc<dyn MemoryPinner>,
//!     submitter: Arc<dyn DmaSubmitter>,
//! ) -> strom_io::Result<()> {
//!     let strom = Strom::builder()
//!         .filesystem(fs)
//!         .pinner(pinner)
//!         .submitter(submitter)
//!         .build()?;
//!
//!     let mapped = strom.map_gpu_memory(Principal(1000), 0x7f00_0000_0500, 256 * 1024)?;
//!     println!("pinned {} pages as {}", mapped.gpu_npages, mapped.handle);
//!     strom.unmap_gpu_memory(mapped.handle, Principal(1000))?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::access::{AccessPolicy, Principal, SameOwner};
use crate::backend::{BlockDevice, Filesystem, SourceFile};
use crate::complete::TaskWait;
use crate::config::{PAGE_SIZE, StromConfig};
use crate::dma::DmaSubmitter;
use crate::error::{Error, Result};
use crate::mapping::{
    MapResult, MappingInfo, MappingList, MappingRegistry, MemoryHandle, MemoryPinner, MemoryRef,
};
use crate::session::Session;
use crate::task::{DmaTask, TaskId, TaskRegistry, WaitMode};
use crate::writeback::{self, WritebackRequest, WritebackResult};

/// SSD-to-GPU DMA orchestration service.
///
/// Construct once with [`Strom::builder`] and share it (`Arc<Strom>`)
/// between every request path.
pub struct Strom {
    config: StromConfig,
    filesystem: Arc<dyn Filesystem>,
    submitter: Arc<dyn DmaSubmitter>,
    mappings: MappingRegistry,
    tasks: TaskRegistry,
    busy: Arc<AtomicUsize>,
}

impl Strom {
    /// Create a new service builder.
    pub fn builder() -> StromBuilder {
        StromBuilder::new()
    }

    /// Configuration in effect.
    pub fn config(&self) -> &StromConfig {
        &self.config
    }

    /// Check whether `file` can be the source (or, with `writable`, the
    /// target) of peer-to-peer DMA, and describe its device.
    ///
    /// # Errors
    ///
    /// - [`Error::PermissionDenied`] if the file is not open in the needed mode
    /// - [`Error::NotSupported`] if the file is too small, lives on an
    ///   unsupported filesystem or device, or has an unusable block size
    pub fn check_file(&self, file: &dyn SourceFile, writable: bool) -> Result<BlockDevice> {
        let mode = file.mode();
        let permitted = if writable { mode.can_write() } else { mode.can_read() };
        if !permitted {
            tracing::error!(ino = file.ino(), ?mode, "no permission to access file");
            return Err(Error::PermissionDenied(format!(
                "file {} is not open for {}",
                file.ino(),
                if writable { "writing" } else { "reading" }
            )));
        }
        // small files may be stored inline with the inode
        if !writable && file.size() < PAGE_SIZE as u64 {
            tracing::error!(ino = file.ino(), size = file.size(), "file size too small");
            return Err(Error::NotSupported(format!(
                "file {} is smaller than one page",
                file.ino()
            )));
        }

        let device = self.filesystem.probe(file)?;
        let bs = device.block_size;
        if !bs.is_power_of_two() || bs < 512 || bs as usize > PAGE_SIZE {
            tracing::error!(device = %device.name, block_size = bs, "unsupported block size");
            return Err(Error::NotSupported(format!(
                "block size {} of {} is not supported",
                bs, device.name
            )));
        }
        Ok(device)
    }

    /// Pin `length` bytes of GPU memory at `vaddress` for `owner`.
    pub fn map_gpu_memory(&self, owner: Principal, vaddress: u64, length: u64) -> Result<MapResult> {
        self.mappings.pin(owner, vaddress, length)
    }

    /// Detach a mapping; the page table is freed once in-flight DMA drains.
    pub fn unmap_gpu_memory(&self, handle: MemoryHandle, requester: Principal) -> Result<()> {
        self.mappings.unmap(handle, requester)
    }

    /// List up to `capacity` live handles, optionally only those `filter`
    /// may access.
    pub fn list_gpu_memory(&self, filter: Option<Principal>, capacity: usize) -> MappingList {
        self.mappings.list(filter, capacity)
    }

    /// Describe a mapping, including its physical page addresses.
    pub fn info_gpu_memory(&self, handle: MemoryHandle, requester: Principal) -> Result<MappingInfo> {
        self.mappings.describe(handle, requester)
    }

    /// Take a reference that keeps a mapping's page table alive.
    pub fn acquire_gpu_memory(&self, handle: MemoryHandle, requester: Principal) -> Result<MemoryRef> {
        self.mappings.acquire(handle, requester)
    }

    /// Outstanding references on a live mapping, `None` once detached.
    pub fn gpu_memory_refcount(&self, handle: MemoryHandle) -> Option<u32> {
        self.mappings.refcount(handle)
    }

    /// Open a context to issue DMA requests through.
    pub fn open_session(&self) -> Arc<Session> {
        let session = self.tasks.open_session();
        tracing::debug!(session = session.id(), "session opened");
        session
    }

    /// Drop the caller's reference on `session`. Failed tasks nobody waited
    /// for are discarded once the session's last task finishes.
    pub fn close_session(&self, session: Arc<Session>) {
        tracing::debug!(session = session.id(), "session closed");
        drop(session);
    }

    fn create_task(
        &self,
        handle: MemoryHandle,
        requester: Principal,
        file: &Arc<dyn SourceFile>,
        session: &Arc<Session>,
    ) -> Result<DmaTask> {
        let device = self.check_file(file.as_ref(), false)?;
        let memory = self.mappings.acquire(handle, requester)?;
        Ok(self
            .tasks
            .create(memory, Arc::clone(file), device, session, &self.config))
    }

    /// Load a batch of chunks of `req.file` into GPU memory.
    ///
    /// Chunks mostly present in the host page cache are copied into
    /// `req.wb_buffer` instead; the result tells which. SSD2GPU transfers
    /// run asynchronously; pass the returned task id to
    /// [`memcpy_ssd2gpu_wait`](Self::memcpy_ssd2gpu_wait).
    ///
    /// On error no result is returned, and any transfer the batch already
    /// started has finished by the time this returns.
    pub fn memcpy_ssd2gpu_writeback(
        &self,
        requester: Principal,
        session: &Arc<Session>,
        req: WritebackRequest<'_>,
    ) -> Result<WritebackResult> {
        writeback::validate(&req, &self.config)?;
        let mut task = self.create_task(req.handle, requester, &req.file, session)?;

        let outcome = writeback::run_batch(
            &mut task,
            self.filesystem.as_ref(),
            self.submitter.as_ref(),
            &self.config,
            req,
        );
        let task_id = task.freeze();

        outcome.or_else(|err| {
            tracing::error!(%task_id, error = %err, "writeback batch failed");
            if let Err(status) = self.tasks.wait(task_id, WaitMode::Uninterruptible) {
                tracing::debug!(%task_id, error = %status, "discarding status of aborted batch");
            }
            Err(err)
        })
    }

    /// Block until task `id` finishes.
    ///
    /// # Errors
    ///
    /// - [`Error::Io`] with the task's first error if it failed
    /// - [`Error::Interrupted`] if an interruptible wait was interrupted
    ///
    /// A task that never existed or was already collected counts as done.
    pub fn memcpy_ssd2gpu_wait(&self, id: TaskId, mode: WaitMode<'_>) -> Result<()> {
        self.tasks.wait(id, mode)
    }

    /// Future form of [`memcpy_ssd2gpu_wait`](Self::memcpy_ssd2gpu_wait).
    pub fn memcpy_ssd2gpu_wait_async(&self, id: TaskId) -> TaskWait {
        TaskWait::new(Arc::clone(self.tasks.shared()), id)
    }

    /// Tasks still running.
    pub fn active_task_count(&self) -> usize {
        self.tasks.active_count()
    }

    /// Failed tasks awaiting collection.
    pub fn failed_task_count(&self) -> usize {
        self.tasks.failed_count()
    }

    /// Number of live mappings; the service must not be torn down while
    /// this is non-zero.
    pub fn busy_count(&self) -> usize {
        self.busy.load(Ordering::Acquire)
    }

    /// Plain-text build identity.
    pub fn signature(&self) -> String {
        format!(
            "version: {}\ntarget: {}-{}\nbuild: {}\n",
            env!("CARGO_PKG_VERSION"),
            std::env::consts::ARCH,
            std::env::consts::OS,
            if cfg!(debug_assertions) { "debug" } else { "release" }
        )
    }
}

/// Builder for a [`Strom`] service.
pub struct StromBuilder {
    config: Option<StromConfig>,
    filesystem: Option<Arc<dyn Filesystem>>,
    pinner: Option<Arc<dyn MemoryPinner>>,
    submitter: Option<Arc<dyn DmaSubmitter>>,
    policy: Option<Arc<dyn AccessPolicy>>,
}

impl StromBuilder {
    /// Create a new builder with default options.
    pub fn new() -> Self {
        Self {
            config: None,
            filesystem: None,
            pinner: None,
            submitter: None,
            policy: None,
        }
    }

    /// Use `config` instead of the defaults.
    pub fn config(mut self, config: StromConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the filesystem collaborator (required).
    pub fn filesystem(mut self, fs: Arc<dyn Filesystem>) -> Self {
        self.filesystem = Some(fs);
        self
    }

    /// Set the GPU memory pinning collaborator (required).
    pub fn pinner(mut self, pinner: Arc<dyn MemoryPinner>) -> Self {
        self.pinner = Some(pinner);
        self
    }

    /// Set the hardware submission collaborator (required).
    pub fn submitter(mut self, submitter: Arc<dyn DmaSubmitter>) -> Self {
        self.submitter = Some(submitter);
        self
    }

    /// Replace the default [`SameOwner`] access policy.
    pub fn access_policy(mut self, policy: Arc<dyn AccessPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Build the service.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if a required collaborator is missing.
    pub fn build(self) -> Result<Strom> {
        let filesystem = self
            .filesystem
            .ok_or_else(|| Error::InvalidArgument("filesystem is required".to_string()))?;
        let pinner = self
            .pinner
            .ok_or_else(|| Error::InvalidArgument("pinner is required".to_string()))?;
        let submitter = self
            .submitter
            .ok_or_else(|| Error::InvalidArgument("submitter is required".to_string()))?;
        let policy = self.policy.unwrap_or_else(|| Arc::new(SameOwner));
        let config = self.config.unwrap_or_default();

        let busy = Arc::new(AtomicUsize::new(0));
        let strom = Strom {
            mappings: MappingRegistry::new(&config, pinner, policy, Arc::clone(&busy)),
            tasks: TaskRegistry::new(&config),
            config,
            filesystem,
            submitter,
            busy,
        };
        tracing::info!(
            mapping_slots = strom.config.mapping_slots(),
            task_slots = strom.config.task_slots(),
            dma_max_len = strom.config.dma_max_len(),
            "strom service initialized"
        );
        Ok(strom)
    }
}

impl Default for StromBuilder {
    fn default() -> Self {
        Self::new()
    }
}
