//! Error types for strom-io

/// Result type for strom-io operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for strom-io operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid argument provided (malformed geometry, chunk size, etc.)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Unknown handle, or a handle owned by another principal
    #[error("Not found: {0}")]
    NotFound(String),

    /// Filesystem, device or page granularity is not supported
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Memory allocation failed; returned by collaborators such as
    /// [`MemoryPinner::get_pages`](crate::MemoryPinner::get_pages) when they
    /// run out of memory
    #[error("Memory allocation failed")]
    MemoryAlloc,

    /// Offset or length outside of the permitted bounds
    #[error("Out of range: {0}")]
    Range(String),

    /// File was not opened with the required access mode
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Wait was cancelled by an interrupt
    #[error("Operation interrupted")]
    Interrupted,

    /// Caller supplied buffer could not be written; the error
    /// [`CachedPage::copy_to`](crate::CachedPage::copy_to) implementations
    /// return when the destination faults
    #[error("Bad address")]
    BadAddress,

    /// Asynchronous DMA failed; `status` is the first error the task recorded
    #[error("Asynchronous DMA failed (status={status})")]
    Io {
        /// Sticky status of the failed task
        status: i64,
    },

    /// Completion was dropped before the request finished
    #[error("Operation cancelled")]
    Cancelled,

    /// OS error with errno, as reported by a collaborator
    #[error("OS error: {0}")]
    Os(i32),
}

impl Error {
    /// Create an OS error from errno
    pub fn from_errno(errno: i32) -> Self {
        Error::Os(errno)
    }

    /// Create from a collaborator return code (negative errno)
    pub fn from_rc(rc: i32) -> Self {
        if rc < 0 {
            Error::Os(-rc)
        } else {
            Error::Os(rc)
        }
    }

    /// The errno reported to the control surface for this error.
    pub fn errno(&self) -> i32 {
        match self {
            Error::InvalidArgument(_) => libc::EINVAL,
            Error::NotFound(_) => libc::ENOENT,
            Error::NotSupported(_) => libc::EOPNOTSUPP,
            Error::MemoryAlloc => libc::ENOMEM,
            Error::Range(_) => libc::ERANGE,
            Error::PermissionDenied(_) => libc::EACCES,
            Error::Interrupted => libc::EINTR,
            Error::BadAddress => libc::EFAULT,
            Error::Io { .. } => libc::EIO,
            Error::Cancelled => libc::ECANCELED,
            Error::Os(errno) => *errno,
        }
    }

    /// Status value recorded on a task when a request fails with this error.
    ///
    /// Always non-zero; zero is reserved for "no error".
    pub fn status(&self) -> i64 {
        match self {
            Error::Io { status } if *status != 0 => *status,
            other => -(other.errno() as i64),
        }
    }
}
