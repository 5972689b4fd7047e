use std::cmp::Ordering;
use std::sync::Arc;

use crate::common::RecordId;

pub trait KeyComparator: Send + Sync {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
}

/// Orders keys holding a little-endian `i32` in their first four bytes.
pub struct IntegerComparator;

impl KeyComparator for IntegerComparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        match (a.get(..4), b.get(..4)) {
            (Some(a4), Some(b4)) => {
                let a_val = i32::from_le_bytes([a4[0], a4[1], a4[2], a4[3]]);
                let b_val = i32::from_le_bytes([b4[0], b4[1], b4[2], b4[3]]);
                a_val.cmp(&b_val)
            }
            _ => a.len().cmp(&b.len()),
        }
    }
}

pub struct BytewiseComparator;

impl KeyComparator for BytewiseComparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}

/// Total order over index entries.
///
/// Unique indexes order by key alone. Non-unique indexes break ties between
/// equal keys by record id, so every stored entry is distinct.
#[derive(Clone)]
pub struct EntryOrder {
    comparator: Arc<dyn KeyComparator>,
    unique: bool,
}

impl EntryOrder {
    pub fn new(comparator: Arc<dyn KeyComparator>, unique: bool) -> Self {
        Self { comparator, unique }
    }

    pub fn is_unique(&self) -> bool {
        self.unique
    }

    pub fn compare_keys(&self, a: &[u8], b: &[u8]) -> Ordering {
        self.comparator.compare(a, b)
    }

    pub fn compare(&self, a_key: &[u8], a_rid: RecordId, b_key: &[u8], b_rid: RecordId) -> Ordering {
        self.comparator.compare(a_key, b_key).then_with(|| {
            if self.unique {
                Ordering::Equal
            } else {
                a_rid.cmp(&b_rid)
            }
        })
    }
}
