//! SSD-to-GPU peer-to-peer DMA orchestration.
//!
//! This crate moves file contents from NVMe SSDs straight into pinned GPU
//! memory, bypassing host bounce buffers. It owns the hard parts: the
//! registry of pinned GPU memory with asynchronous revocation, and the
//! lifecycle of DMA tasks that coalesce file blocks into bounded hardware
//! requests and report deferred errors to whoever waits for them.
//!
//! Filesystem knowledge, GPU memory pinning and NVMe command submission
//! are collaborators supplied by the embedder through the traits in
//! [`backend`], [`mapping`] and [`dma`].
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use strom_io::{Principal, Strom, WaitMode, WritebackRequest};
//! # fn collaborators() -> (Arc<dyn strom_io::Filesystem>, Arc<dyn strom_io::MemoryPinner>, Arc<dyn strom_io::DmaSubmitter>) { unimplemented!() }
//! # fn open_file() -> Arc<dyn strom_io::SourceFile> { unimplemented!() }
//!
//! fn main() -> strom_io::Result<()> {
//!     let (fs, pinner, submitter) = collaborators();
//!     let strom = Strom::builder()
//!         .filesystem(fs)
//!         .pinner(pinner)
//!         .submitter(submitter)
//!         .build()?;
//!
//!     let me = Principal(1000);
//!     let mapped = strom.map_gpu_memory(me, 0x7f00_0000_0000, 1 << 20)?;
//!     let session = strom.open_session();
//!     let mut wb_buffer = vec![0u8; 4 * 32768];
//!     let result = strom.memcpy_ssd2gpu_writeback(
//!         me,
//!         &session,
//!         WritebackRequest {
//!             handle: mapped.handle,
//!             offset: 0,
//!             file: open_file(),
//!             chunk_size: 32768,
//!             relseg_size: 0,
//!             chunk_ids: &[0, 1, 2, 3],
//!             wb_buffer: &mut wb_buffer,
//!         },
//!     )?;
//!     strom.memcpy_ssd2gpu_wait(result.dma_task_id, WaitMode::Uninterruptible)?;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`strom`] - The service object and its builder
//! - [`mapping`] - Pinned GPU memory registry
//! - [`task`] - DMA task registry and waits
//! - [`writeback`] - Chunk classification and coalescing
//! - [`dma`] - Hardware request construction
//! - [`complete`] - Completion handles and async waits
//! - [`session`] - Owning contexts for tasks
//! - [`backend`] - Filesystem and page cache collaborators
//! - [`access`] - Mapping access policy
//! - [`config`] - Tunables
//! - [`error`] - Error types

pub mod access;
pub mod backend;
pub mod complete;
pub mod config;
pub mod dma;
pub mod error;
pub mod mapping;
pub mod session;
mod slot;
pub mod strom;
pub mod task;
pub mod writeback;

// Re-exports
pub use access::{AccessPolicy, Principal, SameOwner};
pub use backend::{AccessMode, BlockDevice, CachedPage, Filesystem, SourceFile};
pub use complete::{DmaCompletion, TaskWait};
pub use config::{PAGE_SIZE, StromConfig, StromConfigBuilder};
pub use dma::{DmaSubmitter, ScatterEntry, ScatterRequest};
pub use error::{Error, Result};
pub use mapping::{
    GpuPageSize, GpuPages, MapResult, MappingInfo, MappingList, MemoryHandle, MemoryPinner,
    MemoryRef, PageTable, ReleaseHook,
};
pub use session::Session;
pub use strom::{Strom, StromBuilder};
pub use task::{InterruptToken, TaskId, WaitMode};
pub use writeback::{WritebackRequest, WritebackResult};
