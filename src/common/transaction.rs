//! Opaque transaction context handed to index mutations.
//!
//! The storage layer does not interpret transactions. It only appends a record
//! of every index change so the transaction manager can undo it on abort.

use parking_lot::Mutex;

use super::types::{FileId, RecordId};

pub type TxnId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexWriteKind {
    Insert,
    Delete,
}

/// One index mutation performed on behalf of a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexWriteRecord {
    pub kind: IndexWriteKind,
    /// File holding the index that was modified
    pub index_fd: FileId,
    pub key: Vec<u8>,
    pub rid: RecordId,
}

#[derive(Debug)]
pub struct Transaction {
    id: TxnId,
    index_writes: Mutex<Vec<IndexWriteRecord>>,
}

impl Transaction {
    pub fn new(id: TxnId) -> Self {
        Self {
            id,
            index_writes: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn append_index_write(&self, record: IndexWriteRecord) {
        self.index_writes.lock().push(record);
    }

    /// Snapshot of the index writes recorded so far, oldest first.
    pub fn index_writes(&self) -> Vec<IndexWriteRecord> {
        self.index_writes.lock().clone()
    }

    /// Removes and returns all recorded index writes.
    pub fn take_index_writes(&self) -> Vec<IndexWriteRecord> {
        std::mem::take(&mut *self.index_writes.lock())
    }
}
