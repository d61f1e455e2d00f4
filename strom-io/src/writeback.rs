//! Chunk classification and request coalescing for a writeback batch.
//!
//! Each chunk of the batch is either read from the SSD straight into GPU
//! memory (SSD2GPU) or, when most of it already sits in the host page
//! cache, copied into the caller's write-back buffer so the caller can
//! move it with an ordinary host-to-device copy (RAM2GPU). Dirty pages
//! always force RAM2GPU since the on-device copy may be stale.
//!
//! ```text
//!  chunk_ids   [ c0  c1  c2  c3  c4 ]
//!                │   │   │   │   │      c1, c3 mostly cached
//!  result ids  [ c0  c2  c4 │ c3  c1 ]
//!                SSD2GPU ──▶│◀── RAM2GPU
//!  wb_buffer   [  -   -   - │ c3  c1 ]  same slot as in result ids
//! ```

use std::sync::Arc;

use crate::backend::{Filesystem, SourceFile};
use crate::config::{PAGE_SHIFT, PAGE_SIZE, StromConfig};
use crate::dma::{DmaSubmitter, submit_pending};
use crate::error::{Error, Result};
use crate::mapping::MemoryHandle;
use crate::task::{DmaTask, PendingRequest, TaskId};

/// Arguments of [`Strom::memcpy_ssd2gpu_writeback`](crate::Strom::memcpy_ssd2gpu_writeback).
pub struct WritebackRequest<'a> {
    /// Destination GPU mapping
    pub handle: MemoryHandle,
    /// Destination offset, relative to the address the mapping was requested at
    pub offset: u64,
    /// Source file
    pub file: Arc<dyn SourceFile>,
    /// Bytes per chunk; a power of two between one host page and the request limit
    pub chunk_size: u32,
    /// Chunks per segment file, or 0 when chunk ids are absolute
    pub relseg_size: u32,
    /// Chunks to load, in order
    pub chunk_ids: &'a [u32],
    /// Receives RAM2GPU chunks; at least `chunk_ids.len() * chunk_size` bytes
    pub wb_buffer: &'a mut [u8],
}

/// Outcome of a writeback batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WritebackResult {
    /// Task to wait on for the SSD2GPU part
    pub dma_task_id: TaskId,
    /// Chunks copied into the write-back buffer
    pub nr_ram2gpu: u32,
    /// Chunks submitted as SSD-to-GPU DMA
    pub nr_ssd2gpu: u32,
    /// Hardware requests issued
    pub nr_dma_submit: u32,
    /// Device blocks covered by those requests
    pub nr_dma_blocks: u32,
    /// SSD2GPU ids from the front, RAM2GPU ids from the back
    pub chunk_ids: Vec<u32>,
}

impl WritebackResult {
    fn new(dma_task_id: TaskId, nr_chunks: usize) -> Self {
        Self {
            dma_task_id,
            nr_ram2gpu: 0,
            nr_ssd2gpu: 0,
            nr_dma_submit: 0,
            nr_dma_blocks: 0,
            chunk_ids: vec![0; nr_chunks],
        }
    }

    /// Chunks loaded directly into GPU memory, in input order. The `i`-th
    /// one lands at `offset + i * chunk_size`.
    pub fn ssd2gpu_chunks(&self) -> &[u32] {
        &self.chunk_ids[..self.nr_ssd2gpu as usize]
    }

    /// Chunks left in the write-back buffer. Entry `i` of this slice sits
    /// in buffer slot `nr_ssd2gpu + i`.
    pub fn ram2gpu_chunks(&self) -> &[u32] {
        &self.chunk_ids[self.nr_ssd2gpu as usize..]
    }
}

/// Check the batch geometry that does not depend on the mapping.
pub(crate) fn validate(req: &WritebackRequest<'_>, config: &StromConfig) -> Result<()> {
    let chunk_size = req.chunk_size as usize;
    if chunk_size & (PAGE_SIZE - 1) != 0
        || chunk_size < PAGE_SIZE
        || chunk_size > config.dma_max_len()
        || !chunk_size.is_power_of_two()
    {
        return Err(Error::InvalidArgument(format!(
            "chunk size {} must be a power of two between {} and {}",
            chunk_size,
            PAGE_SIZE,
            config.dma_max_len()
        )));
    }
    let needed = req.chunk_ids.len() as u64 * chunk_size as u64;
    if (req.wb_buffer.len() as u64) < needed {
        return Err(Error::InvalidArgument(format!(
            "write-back buffer of {} bytes cannot hold {} chunks",
            req.wb_buffer.len(),
            req.chunk_ids.len()
        )));
    }
    Ok(())
}

/// Classify and process every chunk of `req` on behalf of `task`.
///
/// On error, chunks already handled stay handled; requests already
/// submitted keep running and report through the task.
pub(crate) fn run_batch(
    task: &mut DmaTask,
    fs: &dyn Filesystem,
    submitter: &dyn DmaSubmitter,
    config: &StromConfig,
    mut req: WritebackRequest<'_>,
) -> Result<WritebackResult> {
    let nr_chunks = req.chunk_ids.len();
    let chunk_size = req.chunk_size as u64;
    let nr_pages = (chunk_size >> PAGE_SHIFT) as usize;
    let threshold = config.cache_threshold(nr_pages);
    let file = req.file.as_ref();
    let mut out = WritebackResult::new(task.id(), nr_chunks);

    let range_error = || {
        Error::Range(format!(
            "{} chunks at offset {:#x} exceed the mapped region",
            nr_chunks, req.offset
        ))
    };
    let mut dest_offset = task
        .map_offset()
        .checked_add(req.offset)
        .ok_or_else(range_error)?;
    let dest_end = (nr_chunks as u64)
        .checked_mul(chunk_size)
        .and_then(|len| dest_offset.checked_add(len));
    if dest_end.is_none_or(|end| end > task.map_length()) {
        return Err(range_error());
    }

    let i_size = task.file().size();
    for &chunk_id in req.chunk_ids {
        let fpos = if req.relseg_size == 0 {
            chunk_id as u64 * chunk_size
        } else {
            (chunk_id % req.relseg_size) as u64 * chunk_size
        };
        if fpos > i_size {
            return Err(Error::Range(format!(
                "chunk {} at {:#x} is beyond the end of file ({} bytes)",
                chunk_id, fpos, i_size
            )));
        }

        let index = fpos >> PAGE_SHIFT;
        let mut score = 0;
        for j in 0..nr_pages {
            let page = fs.find_lock_page(file, index + j as u64);
            if let Some(page) = &page {
                score += if page.is_dirty() { threshold + 1 } else { 1 };
            }
            task.file_pages[j] = page;
        }

        let result = if score > threshold {
            out.nr_ram2gpu += 1;
            let slot = nr_chunks - out.nr_ram2gpu as usize;
            out.chunk_ids[slot] = chunk_id;
            let start = slot * chunk_size as usize;
            let dst = &mut req.wb_buffer[start..start + chunk_size as usize];
            copy_cached_chunk(task, fs, file, index, dst)
        } else {
            let result = load_chunk(task, fs, file, submitter, nr_pages, fpos, dest_offset, &mut out);
            out.chunk_ids[out.nr_ssd2gpu as usize] = chunk_id;
            out.nr_ssd2gpu += 1;
            dest_offset += chunk_size;
            result
        };

        if score > 0 {
            task.release_pages();
        }
        result?;
    }

    if task.pending.nr_blocks > 0 {
        out.nr_dma_submit += 1;
        out.nr_dma_blocks += task.pending.nr_blocks;
        submit_pending(task, submitter)?;
    }
    assert_eq!(
        (out.nr_ram2gpu + out.nr_ssd2gpu) as usize,
        nr_chunks,
        "writeback lost track of a chunk"
    );

    tracing::debug!(
        task_id = %out.dma_task_id,
        nr_ram2gpu = out.nr_ram2gpu,
        nr_ssd2gpu = out.nr_ssd2gpu,
        nr_dma_submit = out.nr_dma_submit,
        nr_dma_blocks = out.nr_dma_blocks,
        "writeback batch processed"
    );
    Ok(out)
}

/// Copy a mostly cached chunk into its write-back buffer slot, reading
/// the missing pages through the page cache.
fn copy_cached_chunk(
    task: &mut DmaTask,
    fs: &dyn Filesystem,
    file: &dyn SourceFile,
    index: u64,
    dst: &mut [u8],
) -> Result<()> {
    for (j, page_dst) in dst.chunks_exact_mut(PAGE_SIZE).enumerate() {
        let page = match task.file_pages[j].take() {
            Some(page) => page,
            None => fs.read_page(file, index + j as u64)?,
        };
        if !page.try_copy_to(page_dst) {
            page.copy_to(page_dst)?;
        }
        task.file_pages[j] = Some(page);
    }
    Ok(())
}

/// Resolve the device blocks of a chunk and fold them into the pending
/// request, flushing it whenever the run breaks.
#[allow(clippy::too_many_arguments)]
fn load_chunk(
    task: &mut DmaTask,
    fs: &dyn Filesystem,
    file: &dyn SourceFile,
    submitter: &dyn DmaSubmitter,
    nr_pages: usize,
    fpos: u64,
    dest_offset: u64,
    out: &mut WritebackResult,
) -> Result<()> {
    let block_shift = task.block_shift();
    let block_size = 1u64 << block_shift;
    let nr_blocks = (PAGE_SIZE >> block_shift) as u32;
    let mut curr_offset = dest_offset;

    for j in 0..nr_pages {
        let pos = fpos + (j * PAGE_SIZE) as u64;
        let blocknr = fs.resolve_block(file, pos >> block_shift).inspect_err(|err| {
            tracing::error!(pos, error = %err, "failed to resolve file block");
        })?;

        let pending = task.pending;
        if pending.nr_blocks > 0
            && pending.nr_blocks + nr_blocks <= task.max_nblocks()
            && pending.src_block + pending.nr_blocks as u64 == blocknr
            && pending.dest_offset + pending.nr_blocks as u64 * block_size == curr_offset
        {
            task.pending.nr_blocks += nr_blocks;
        } else {
            if pending.nr_blocks > 0 {
                out.nr_dma_submit += 1;
                out.nr_dma_blocks += pending.nr_blocks;
                submit_pending(task, submitter).inspect_err(|err| {
                    tracing::error!(error = %err, "failed to submit SSD2GPU DMA");
                })?;
            }
            task.pending = PendingRequest {
                dest_offset: curr_offset,
                src_block: blocknr,
                nr_blocks,
            };
        }
        curr_offset += PAGE_SIZE as u64;
    }
    Ok(())
}
