//! Strata - the storage kernel of a disk-oriented RDBMS
//!
//! Everything above this crate (catalog, executor, transaction manager) sees
//! data as fixed-size pages addressed by [`PageId`]. This crate moves those
//! pages between disk and memory and keeps ordered indexes on top of them.
//!
//! # Architecture
//!
//! - **Storage Layer** (`storage`): Files and raw page I/O
//!   - `DiskManager`: Creates, opens and deletes files in the data directory,
//!     reads and writes pages, appends to the log file
//!   - `DiskScheduler`: Background worker that serializes page I/O requests
//!
//! - **Buffer Pool** (`buffer`): Memory management for database pages
//!   - `BufferPoolManager`: Caches pages in a fixed set of frames, with pinning
//!     and dirty write-back
//!   - `LruKReplacer`: LRU-K page replacement policy
//!   - `PageGuard`/`ReadPageGuard`/`WritePageGuard`: RAII pins and latches
//!
//! - **Index** (`index`): B+Tree over fixed-width keys
//!   - `BTreeIndex`: Point lookups, inserts, deletes and range scans with
//!     latch crabbing for concurrent access
//!   - `BTreeIterator`: Lazy ordered scans across the leaf chain
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use strata::buffer::BufferPoolManager;
//! use strata::index::{BTreeConfig, BTreeIndex, IntegerComparator};
//! use strata::storage::disk::DiskManager;
//! use strata::{RecordId, SlotId};
//!
//! let disk_manager = Arc::new(DiskManager::new("data").unwrap());
//! disk_manager.create_file("orders.idx").unwrap();
//! let fd = disk_manager.open_file("orders.idx").unwrap();
//!
//! // 64 frames, LRU-2 replacement
//! let bpm = Arc::new(BufferPoolManager::new(64, 2, disk_manager));
//!
//! let config = BTreeConfig::new(4, Arc::new(IntegerComparator));
//! let index = BTreeIndex::create(bpm.clone(), fd, config).unwrap();
//! index
//!     .insert(&42i32.to_le_bytes(), RecordId::new(7, SlotId::new(3)), None)
//!     .unwrap();
//! assert!(index.search(&42i32.to_le_bytes()).unwrap().is_some());
//!
//! bpm.flush_all_pages().unwrap();
//! ```

pub mod buffer;
pub mod common;
pub mod index;
pub mod storage;

// Re-export commonly used types at the crate root
pub use common::{FileId, PageId, RecordId, Result, SlotId, StrataError};
