use std::path::{Path, PathBuf};

use super::error::{Result, StrataError};
use super::types::PageNo;

/// Size of a page in bytes (4 KB)
pub const PAGE_SIZE: usize = 4096;

/// Page number marking "no page" inside on-disk structures
pub const INVALID_PAGE_NO: PageNo = u32::MAX;

/// Default K value for LRU-K replacement policy
pub const DEFAULT_LRUK_K: usize = 2;

/// Default buffer pool size (number of frames)
pub const DEFAULT_BUFFER_POOL_SIZE: usize = 64;

/// Name of the write-ahead log file inside the data directory
pub const LOG_FILE_NAME: &str = "db.log";

/// Page of an index file holding the index header
pub const INDEX_HEADER_PAGE_NO: PageNo = 0;

/// Runtime configuration for the storage layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    /// Directory holding data files and the log file
    pub data_dir: PathBuf,
    /// Number of frames in the buffer pool
    pub pool_size: usize,
    /// Access count after which a frame is considered hot
    pub lru_k: usize,
}

impl StorageConfig {
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn with_lru_k(mut self, k: usize) -> Self {
        self.lru_k = k;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(StrataError::InvalidConfig(
                "buffer pool needs at least one frame".to_string(),
            ));
        }
        if self.lru_k == 0 {
            return Err(StrataError::InvalidConfig("lru_k must be positive".to_string()));
        }
        Ok(())
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            pool_size: DEFAULT_BUFFER_POOL_SIZE,
            lru_k: DEFAULT_LRUK_K,
        }
    }
}
