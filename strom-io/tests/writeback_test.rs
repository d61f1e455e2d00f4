//! Integration tests for chunk classification and request coalescing.

mod common;

use std::sync::Arc;

use common::{BLOCK_BASE, Fixture, MockFile, MockSubmitter, START_SECT, fixture};
use strom_io::{
    Error, MemoryHandle, Principal, Result, SourceFile, WaitMode, WritebackRequest, WritebackResult,
};

const OWNER: Principal = Principal(1000);
const VADDR: u64 = 0x7f00_0000_0000;
const CHUNK: usize = 32 * 1024;
const FILE_SIZE: u64 = 1 << 20;

struct Setup {
    fx: Fixture,
    handle: MemoryHandle,
    file: Arc<dyn SourceFile>,
}

fn setup(submitter: Arc<MockSubmitter>) -> Result<Setup> {
    setup_at(submitter, VADDR)
}

fn setup_at(submitter: Arc<MockSubmitter>, vaddr: u64) -> Result<Setup> {
    let fx = fixture(submitter);
    let mapped = fx.strom.map_gpu_memory(OWNER, vaddr, 1 << 20)?;
    Ok(Setup {
        fx,
        handle: mapped.handle,
        file: MockFile::new(FILE_SIZE),
    })
}

impl Setup {
    fn request<'a>(&self, chunk_ids: &'a [u32], wb_buffer: &'a mut [u8]) -> WritebackRequest<'a> {
        WritebackRequest {
            handle: self.handle,
            offset: 0,
            file: Arc::clone(&self.file),
            chunk_size: CHUNK as u32,
            relseg_size: 0,
            chunk_ids,
            wb_buffer,
        }
    }

    fn run(&self, req: WritebackRequest<'_>) -> Result<WritebackResult> {
        let session = self.fx.strom.open_session();
        self.fx.strom.memcpy_ssd2gpu_writeback(OWNER, &session, req)
    }

    fn wait(&self, result: &WritebackResult) -> Result<()> {
        self.fx
            .strom
            .memcpy_ssd2gpu_wait(result.dma_task_id, WaitMode::Uninterruptible)
    }
}

#[test]
fn test_uncached_chunks_go_ssd2gpu() -> Result<()> {
    let t = setup(MockSubmitter::auto())?;
    let ids = [0, 1, 2, 3];
    let mut wb = vec![0u8; ids.len() * CHUNK];
    let result = t.run(t.request(&ids, &mut wb))?;

    assert_eq!(result.nr_ssd2gpu, 4);
    assert_eq!(result.nr_ram2gpu, 0);
    assert_eq!(result.ssd2gpu_chunks(), &ids);
    // 4 x 8 contiguous blocks fit one 128KiB request
    assert_eq!(result.nr_dma_submit, 1);
    assert_eq!(result.nr_dma_blocks, 32);

    let reqs = t.fx.submitter.requests();
    assert_eq!(reqs.len(), 1);
    assert_eq!(reqs[0].device_id, 7);
    assert_eq!(reqs[0].src_block, BLOCK_BASE);
    assert_eq!(reqs[0].slba, START_SECT + BLOCK_BASE * 8);
    assert_eq!(reqs[0].nr_sectors, 256);
    assert_eq!(reqs[0].len(), 128 * 1024);
    // split at the 64KiB GPU page boundary
    assert_eq!(reqs[0].sgl.len(), 2);
    assert_eq!(reqs[0].sgl[0].dma_addr, VADDR);
    assert_eq!(reqs[0].sgl[1].dma_addr, VADDR + 0x10000);
    assert_eq!(t.fx.fs.reads(), 0);
    t.wait(&result)
}

#[test]
fn test_dirty_chunks_go_ram2gpu() -> Result<()> {
    let t = setup(MockSubmitter::recording())?;
    t.fx.fs.cache_pages(0..32, true);
    let ids = [0, 1, 2, 3];
    let mut wb = vec![0xffu8; ids.len() * CHUNK];
    let result = t.run(t.request(&ids, &mut wb))?;

    assert_eq!(result.nr_ram2gpu, 4);
    assert_eq!(result.nr_ssd2gpu, 0);
    assert_eq!(result.nr_dma_submit, 0);
    // filled from the back
    assert_eq!(result.ram2gpu_chunks(), &[3, 2, 1, 0]);
    assert!(t.fx.submitter.requests().is_empty());

    // chunk 0 sits in the last slot, page by page
    let slot3 = &wb[3 * CHUNK..];
    assert!(slot3[..4096].iter().all(|b| *b == 0));
    assert!(slot3[4096..8192].iter().all(|b| *b == 1));
    // chunk 3 (pages 24..32) sits in the first slot
    assert!(wb[..4096].iter().all(|b| *b == 24));
    assert!(wb[CHUNK - 4096..CHUNK].iter().all(|b| *b == 31));

    // nothing was submitted, so the task is already gone
    assert_eq!(t.fx.strom.active_task_count(), 0);
    t.wait(&result)
}

#[test]
fn test_mixed_batch_layout() -> Result<()> {
    let t = setup(MockSubmitter::auto())?;
    // 5 of 8 clean pages of chunk 1 cached: over the threshold
    t.fx.fs.cache_pages(8..13, false);
    let ids = [0, 1, 2];
    let mut wb = vec![0u8; ids.len() * CHUNK];
    let result = t.run(t.request(&ids, &mut wb))?;

    assert_eq!(result.chunk_ids, vec![0, 2, 1]);
    assert_eq!(result.ssd2gpu_chunks(), &[0, 2]);
    assert_eq!(result.ram2gpu_chunks(), &[1]);
    assert_eq!(t.fx.fs.reads(), 3);
    assert!(wb[2 * CHUNK..2 * CHUNK + 4096].iter().all(|b| *b == 8));

    // chunk 2 lands right after chunk 0 in GPU memory
    let reqs = t.fx.submitter.requests();
    assert_eq!(reqs.len(), 2);
    assert_eq!(reqs[0].sgl[0].dma_addr, VADDR);
    assert_eq!(reqs[1].sgl[0].dma_addr, VADDR + CHUNK as u64);
    assert_eq!(reqs[1].src_block, BLOCK_BASE + 16);
    t.wait(&result)
}

#[test]
fn test_threshold_boundary() -> Result<()> {
    let t = setup(MockSubmitter::auto())?;
    // exactly half cached stays SSD2GPU
    t.fx.fs.cache_pages(0..4, false);
    // a single dirty page forces RAM2GPU
    t.fx.fs.cache_pages([8], true);
    let ids = [0, 1];
    let mut wb = vec![0u8; ids.len() * CHUNK];
    let result = t.run(t.request(&ids, &mut wb))?;

    assert_eq!(result.ssd2gpu_chunks(), &[0]);
    assert_eq!(result.ram2gpu_chunks(), &[1]);
    assert_eq!(result.nr_ram2gpu + result.nr_ssd2gpu, 2);
    t.wait(&result)
}

#[test]
fn test_one_gap_splits_request() -> Result<()> {
    let contiguous = setup(MockSubmitter::auto())?;
    let ids = [0, 1, 2];
    let mut wb = vec![0u8; ids.len() * CHUNK];
    let result = contiguous.run(contiguous.request(&ids, &mut wb))?;
    assert_eq!(result.nr_dma_submit, 1);
    assert_eq!(result.nr_dma_blocks, 24);

    let gapped = setup(MockSubmitter::auto())?;
    gapped.fx.fs.remap_block(23, 9000);
    let result = gapped.run(gapped.request(&ids, &mut wb))?;
    assert_eq!(result.nr_dma_submit, 2);
    assert_eq!(result.nr_dma_blocks, 24);
    let reqs = gapped.fx.submitter.requests();
    assert_eq!(reqs[0].nr_blocks, 23);
    assert_eq!(reqs[1].src_block, 9000);
    assert_eq!(reqs[1].sgl[0].dma_addr, VADDR + 23 * 4096);
    Ok(())
}

#[test]
fn test_request_size_limit() -> Result<()> {
    let t = setup(MockSubmitter::auto())?;
    let ids = [0, 1];
    let mut wb = vec![0u8; 2 * 128 * 1024];
    let req = WritebackRequest {
        chunk_size: 128 * 1024,
        ..t.request(&ids, &mut wb)
    };
    let result = t.run(req)?;
    // contiguous, but a request never exceeds 32 blocks
    assert_eq!(result.nr_dma_submit, 2);
    assert_eq!(result.nr_dma_blocks, 64);
    assert!(t.fx.submitter.requests().iter().all(|r| r.nr_blocks == 32));
    Ok(())
}

#[test]
fn test_chunk_offsets() -> Result<()> {
    let t = setup(MockSubmitter::auto())?;
    let ids = [3, 0, 7, 1];
    let mut wb = vec![0u8; ids.len() * CHUNK];
    let result = t.run(t.request(&ids, &mut wb))?;
    assert_eq!(result.nr_ssd2gpu, 4);

    // offsets are chunk_id * 32768, i.e. 8 pages per chunk
    let firsts: Vec<u64> = t.fx.fs.probed().chunks(8).map(|c| c[0]).collect();
    assert_eq!(firsts, vec![24, 0, 56, 8]);

    // destinations advance one chunk per SSD2GPU chunk
    let reqs = t.fx.submitter.requests();
    assert_eq!(reqs.len(), 4);
    for (i, req) in reqs.iter().enumerate() {
        assert_eq!(req.sgl[0].dma_addr, VADDR + (i * CHUNK) as u64);
        assert_eq!(req.src_block, BLOCK_BASE + ids[i] as u64 * 8);
    }
    Ok(())
}

#[test]
fn test_relative_segment_offsets() -> Result<()> {
    let t = setup(MockSubmitter::auto())?;
    let ids = [5, 6, 12];
    let mut wb = vec![0u8; ids.len() * CHUNK];
    let req = WritebackRequest {
        relseg_size: 4,
        ..t.request(&ids, &mut wb)
    };
    let result = t.run(req)?;
    assert_eq!(result.nr_ssd2gpu, 3);

    let firsts: Vec<u64> = t.fx.fs.probed().chunks(8).map(|c| c[0]).collect();
    assert_eq!(firsts, vec![8, 16, 0]);
    Ok(())
}

#[test]
fn test_chunk_beyond_eof_is_range_error() -> Result<()> {
    let t = setup(MockSubmitter::recording())?;
    // chunk 40 starts at 1.25MiB, past the end of the 1MiB file
    let ids = [0, 40, 1];
    let mut wb = vec![0u8; ids.len() * CHUNK];
    let err = t.run(t.request(&ids, &mut wb)).unwrap_err();

    assert!(matches!(err, Error::Range(_)));
    // chunk 1 was never classified
    assert_eq!(t.fx.fs.probed(), (0..8).collect::<Vec<u64>>());
    assert!(t.fx.submitter.requests().is_empty());
    assert_eq!(t.fx.strom.active_task_count(), 0);
    assert_eq!(t.fx.strom.failed_task_count(), 0);
    Ok(())
}

#[test]
fn test_mapping_offset_applied() -> Result<()> {
    let t = setup_at(MockSubmitter::auto(), VADDR + 0x1000)?;
    let ids = [0];
    let mut wb = vec![0u8; CHUNK];
    let req = WritebackRequest {
        offset: 0x2000,
        ..t.request(&ids, &mut wb)
    };
    let result = t.run(req)?;
    let reqs = t.fx.submitter.requests();
    assert_eq!(reqs[0].sgl[0].dma_addr, VADDR + 0x1000 + 0x2000);
    t.wait(&result)
}

#[test]
fn test_invalid_geometry() -> Result<()> {
    let t = setup(MockSubmitter::recording())?;
    let ids = [0];
    let mut wb = vec![0u8; 512 * 1024];
    for chunk_size in [2048, 12 * 1024, 256 * 1024] {
        let req = WritebackRequest {
            chunk_size,
            ..t.request(&ids, &mut wb)
        };
        assert!(matches!(t.run(req), Err(Error::InvalidArgument(_))));
    }

    let mut small = vec![0u8; CHUNK - 1];
    assert!(matches!(
        t.run(t.request(&ids, &mut small)),
        Err(Error::InvalidArgument(_))
    ));

    // last chunk would end 4KiB past the 1MiB mapping
    let req = WritebackRequest {
        offset: (1 << 20) - CHUNK as u64 + 4096,
        ..t.request(&ids, &mut wb)
    };
    assert!(matches!(t.run(req), Err(Error::Range(_))));
    assert_eq!(t.fx.strom.active_task_count(), 0);
    assert_eq!(t.fx.strom.gpu_memory_refcount(t.handle), Some(0));
    Ok(())
}

#[test]
fn test_offset_overflow_is_range_error() -> Result<()> {
    let t = setup_at(MockSubmitter::recording(), VADDR + 0x500)?;
    let ids = [0];
    let mut wb = vec![0u8; CHUNK];
    let req = WritebackRequest {
        offset: u64::MAX - 0x100,
        ..t.request(&ids, &mut wb)
    };
    assert!(matches!(t.run(req), Err(Error::Range(_))));
    assert!(t.fx.fs.probed().is_empty());
    assert!(t.fx.submitter.requests().is_empty());
    assert_eq!(t.fx.strom.active_task_count(), 0);
    assert_eq!(t.fx.strom.gpu_memory_refcount(t.handle), Some(0));
    Ok(())
}

#[test]
fn test_submit_failure_aborts_batch() -> Result<()> {
    let t = setup(MockSubmitter::failing_on(1))?;
    // breaks the block run twice inside chunk 1
    t.fx.fs.remap_block(8, 5000);
    let ids = [0, 1, 2];
    let mut wb = vec![0u8; ids.len() * CHUNK];
    let err = t.run(t.request(&ids, &mut wb)).unwrap_err();

    assert!(matches!(err, Error::Os(e) if e == libc::EIO));
    assert_eq!(t.fx.submitter.requests().len(), 1);
    // the batch waited out and collected its own task
    assert_eq!(t.fx.strom.active_task_count(), 0);
    assert_eq!(t.fx.strom.failed_task_count(), 0);
    assert_eq!(t.fx.strom.gpu_memory_refcount(t.handle), Some(0));
    Ok(())
}
