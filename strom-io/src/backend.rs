//! Filesystem and page-cache collaborators.
//!
//! The core never interprets on-disk structures itself. A [`Filesystem`]
//! implementation tells it which device backs a file, where a file block
//! lives on that device, and which file pages are resident in the host
//! page cache.
//!
//! ```text
//!  SourceFile ──probe──▶ BlockDevice (id, block size, partition extent)
//!      │
//!      ├──resolve_block(iblock)──▶ device block number
//!      │
//!      └──find_lock_page(index)──▶ CachedPage (dirty?, copy)
//! ```

use std::fmt;

use crate::error::Result;

/// Mode a source file was opened with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Opened for reading only
    ReadOnly,
    /// Opened for writing only
    WriteOnly,
    /// Opened for reading and writing
    ReadWrite,
}

impl AccessMode {
    /// True if the file may be read.
    pub fn can_read(self) -> bool {
        matches!(self, AccessMode::ReadOnly | AccessMode::ReadWrite)
    }

    /// True if the file may be written.
    pub fn can_write(self) -> bool {
        matches!(self, AccessMode::WriteOnly | AccessMode::ReadWrite)
    }
}

/// An open file that DMA may be sourced from.
///
/// Tasks keep an `Arc<dyn SourceFile>` until their last reference drops,
/// the same way an open file reference pins the inode.
pub trait SourceFile: Send + Sync {
    /// Inode number (for messages).
    fn ino(&self) -> u64;

    /// Current file size in bytes.
    fn size(&self) -> u64;

    /// Mode the file was opened with.
    fn mode(&self) -> AccessMode;
}

impl fmt::Debug for dyn SourceFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceFile")
            .field("ino", &self.ino())
            .field("size", &self.size())
            .finish()
    }
}

/// Block device (NVMe namespace partition) backing a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDevice {
    /// Identity of the namespace, passed through to the submitter
    pub device_id: u64,
    /// Device name, e.g. `nvme0n1`
    pub name: String,
    /// Filesystem block size in bytes
    pub block_size: u32,
    /// First 512-byte sector of the partition
    pub start_sect: u64,
    /// Number of 512-byte sectors in the partition
    pub nr_sects: u64,
}

/// A locked page of the host page cache.
///
/// Dropping the page unlocks it and releases the cache reference.
pub trait CachedPage: Send {
    /// The cached copy is newer than the on-device copy.
    fn is_dirty(&self) -> bool;

    /// Copy the page without sleeping; returns false when the page cannot
    /// be mapped atomically and the caller must use [`copy_to`](Self::copy_to).
    fn try_copy_to(&self, dst: &mut [u8]) -> bool {
        let _ = dst;
        false
    }

    /// Copy the page, mapping it with whatever locking is needed.
    ///
    /// Fails with [`Error::BadAddress`](crate::Error::BadAddress) if `dst`
    /// cannot be written.
    fn copy_to(&self, dst: &mut [u8]) -> Result<()>;
}

/// Filesystem-specific knowledge the DMA core depends on.
pub trait Filesystem: Send + Sync {
    /// Check that the file lives on a supported filesystem backed directly by
    /// an NVMe namespace, and describe that device.
    ///
    /// Fails with [`Error::NotSupported`](crate::Error::NotSupported) otherwise.
    fn probe(&self, file: &dyn SourceFile) -> Result<BlockDevice>;

    /// Resolve a file-relative block index into a device block number.
    fn resolve_block(&self, file: &dyn SourceFile, iblock: u64) -> Result<u64>;

    /// Look up and lock a page of the file in the page cache without
    /// starting any I/O.
    fn find_lock_page(&self, file: &dyn SourceFile, index: u64) -> Option<Box<dyn CachedPage>>;

    /// Read a page through the page cache, blocking until it is resident,
    /// and return it locked.
    fn read_page(&self, file: &dyn SourceFile, index: u64) -> Result<Box<dyn CachedPage>>;
}
