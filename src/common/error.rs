use thiserror::Error;

use super::types::{FileId, PageId};

/// Storage layer error types
#[derive(Error, Debug)]
pub enum StrataError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("File {0} is not open")]
    FileNotOpen(FileId),

    #[error("File {0} is already open")]
    FileAlreadyOpen(String),

    #[error("File {0} not found")]
    FileNotFound(String),

    #[error("File {0} already exists")]
    FileAlreadyExists(String),

    #[error("Buffer pool is full, no evictable frames available")]
    CacheExhausted,

    #[error("Page {0} is still pinned")]
    PageBusy(PageId),

    #[error("Page {0} unpinned more times than it was pinned")]
    DoubleUnpin(PageId),

    #[error("Page {0} is not resident in the buffer pool")]
    PageNotResident(PageId),

    #[error("Invalid page ID: {0}")]
    InvalidPageId(PageId),

    #[error("Duplicate key")]
    DuplicateKey,

    #[error("Key size mismatch: expected {expected} bytes, got {actual}")]
    KeySizeMismatch { expected: usize, actual: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Index corrupted: {0}")]
    IndexCorrupted(String),

    #[error("Disk scheduler error: {0}")]
    DiskScheduler(String),
}

pub type Result<T> = std::result::Result<T, StrataError>;
