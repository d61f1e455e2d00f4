//! Hardware request construction and submission.
//!
//! A pending request covers a run of device blocks that land contiguously
//! in GPU memory. Flushing it builds a scatter list over the GPU page
//! table and hands the request to the [`DmaSubmitter`], together with a
//! [`DmaCompletion`] owning one task reference.
//!
//! ```text
//!   dest_offset (from map_address)
//!        │
//!  GPU:  ├──── page base ────┼──── page base+1 ────┼── …
//!        └─ offset ─▶[ entry 0 ][      entry 1      ][ entry 2 ]
//! ```

use crate::backend::BlockDevice;
use crate::complete::DmaCompletion;
use crate::error::{Error, Result};
use crate::mapping::GpuPages;
use crate::task::{DmaTask, TaskId};

/// Sector size the device addresses requests in.
const SECTOR_SHIFT: u32 = 9;

/// One contiguous bus-address range of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScatterEntry {
    /// Bus address of the range
    pub dma_addr: u64,
    /// Length in bytes
    pub len: u32,
}

/// An asynchronous read of device blocks straight into GPU memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScatterRequest {
    /// Task the request belongs to
    pub task_id: TaskId,
    /// Namespace to read from, as reported by the filesystem probe
    pub device_id: u64,
    /// First 512-byte sector on the namespace
    pub slba: u64,
    /// Number of 512-byte sectors
    pub nr_sectors: u64,
    /// First device block (filesystem block units)
    pub src_block: u64,
    /// Number of device blocks
    pub nr_blocks: u32,
    /// Filesystem block size in bytes
    pub block_size: u32,
    /// Destination ranges, in order
    pub sgl: Vec<ScatterEntry>,
}

impl ScatterRequest {
    /// Total bytes transferred.
    pub fn len(&self) -> u64 {
        self.sgl.iter().map(|e| e.len as u64).sum()
    }

    /// True for a zero-length request.
    pub fn is_empty(&self) -> bool {
        self.sgl.is_empty()
    }
}

/// Issues read commands to the NVMe queues.
///
/// `submit` must not block on completion. The submitter fires `done`
/// when the command finishes, from any thread. If `submit` returns an
/// error the request was not queued; the submitter may either drop `done`
/// or fire it with the error.
pub trait DmaSubmitter: Send + Sync {
    /// Queue `req` for asynchronous execution.
    fn submit(&self, req: ScatterRequest, done: DmaCompletion) -> Result<()>;
}

/// Build the scatter list for `total` bytes starting `dest_offset` bytes
/// past the mapping's aligned base address.
pub(crate) fn build_sgl(
    pages: &GpuPages,
    map_offset: u64,
    map_length: u64,
    dest_offset: u64,
    total: u64,
) -> Result<Vec<ScatterEntry>> {
    if dest_offset < map_offset || dest_offset + total > map_length {
        return Err(Error::Range(format!(
            "destination {:#x}+{:#x} outside mapped range {:#x}..{:#x}",
            dest_offset, total, map_offset, map_length
        )));
    }

    let page_size = pages.page_size().bytes();
    let base = (dest_offset >> pages.page_size().shift()) as usize;
    let mut offset = dest_offset & (page_size - 1);
    let mut remaining = total;
    let mut sgl = Vec::new();
    for &paddr in pages.addresses().iter().skip(base) {
        if remaining == 0 {
            break;
        }
        let len = remaining.min(page_size - offset);
        sgl.push(ScatterEntry {
            dma_addr: paddr + offset,
            len: len as u32,
        });
        offset = 0;
        remaining -= len;
    }

    if remaining != 0 {
        return Err(Error::InvalidArgument(format!(
            "page table ends {:#x} bytes short of the request",
            remaining
        )));
    }
    Ok(sgl)
}

/// Translate a device block run into a partition-relative sector range.
fn sector_range(device: &BlockDevice, block_shift: u32, src_block: u64, nr_blocks: u32) -> Result<(u64, u64)> {
    let shift = block_shift - SECTOR_SHIFT;
    let first = src_block << shift;
    let count = (nr_blocks as u64) << shift;
    if first + count > device.nr_sects {
        return Err(Error::Range(format!(
            "blocks {}+{} beyond the end of {}",
            src_block, nr_blocks, device.name
        )));
    }
    Ok((device.start_sect + first, count))
}

/// Flush the pending request of `task`, if any.
///
/// On success the pending request is cleared; on failure it is left as is
/// and the task's in-flight count is unchanged.
pub(crate) fn submit_pending(task: &mut DmaTask, submitter: &dyn DmaSubmitter) -> Result<()> {
    let pending = task.pending;
    if pending.nr_blocks == 0 {
        return Ok(());
    }

    let block_shift = task.block_shift();
    let total = (pending.nr_blocks as u64) << block_shift;
    if total > (task.max_nblocks() as u64) << block_shift {
        return Err(Error::InvalidArgument(format!(
            "request of {} bytes exceeds the per-request limit",
            total
        )));
    }

    let sgl = build_sgl(
        task.pages(),
        task.map_offset(),
        task.map_length(),
        pending.dest_offset,
        total,
    )?;
    let (slba, nr_sectors) = sector_range(task.device(), block_shift, pending.src_block, pending.nr_blocks)?;

    let req = ScatterRequest {
        task_id: task.id(),
        device_id: task.device().device_id,
        slba,
        nr_sectors,
        src_block: pending.src_block,
        nr_blocks: pending.nr_blocks,
        block_size: 1 << block_shift,
        sgl,
    };
    tracing::trace!(
        task_id = %req.task_id,
        slba = req.slba,
        nr_sectors = req.nr_sectors,
        nents = req.sgl.len(),
        "submit SSD2GPU DMA"
    );
    submitter.submit(req, DmaCompletion::new(task.acquire()))?;
    task.pending.nr_blocks = 0;
    Ok(())
}
