use std::cmp::Ordering;
use std::ops::Bound;

use crate::buffer::ReadPageGuard;
use crate::common::{PageId, PageNo, RecordId, Result};

use super::btree_index::BTreeIndex;
use super::btree_page::{node_type, BTreeLeafPage, NodeType};

/// Where to reposition after losing the leaf latch.
enum Seek {
    First,
    AtOrAfter(Vec<u8>, RecordId),
    After(Vec<u8>, RecordId),
}

/// Ordered scan over a key range of a [`BTreeIndex`].
///
/// Holds a read latch on the current leaf between calls to `next`, so the
/// owning thread must not modify the index while the iterator is alive.
/// Moving to the next leaf never blocks: if the sibling is busy or has been
/// merged away, the iterator lets go of everything and re-descends from the
/// root to just after the last entry it returned.
pub struct BTreeIterator<'a> {
    index: &'a BTreeIndex,
    leaf: Option<ReadPageGuard>,
    slot: usize,
    upper: Bound<Vec<u8>>,
    resume: Seek,
    done: bool,
}

impl<'a> BTreeIterator<'a> {
    pub(crate) fn new(index: &'a BTreeIndex, lower: Bound<&[u8]>, upper: Bound<&[u8]>) -> Result<Self> {
        let resume = match lower {
            Bound::Unbounded => Seek::First,
            Bound::Included(key) => Seek::AtOrAfter(key.to_vec(), RecordId::MIN),
            Bound::Excluded(key) => Seek::After(key.to_vec(), RecordId::MAX),
        };

        let mut iter = Self {
            index,
            leaf: None,
            slot: 0,
            upper: match upper {
                Bound::Unbounded => Bound::Unbounded,
                Bound::Included(key) => Bound::Included(key.to_vec()),
                Bound::Excluded(key) => Bound::Excluded(key.to_vec()),
            },
            resume,
            done: false,
        };
        iter.seek()?;
        Ok(iter)
    }

    /// Descends to the leaf holding the resume position.
    fn seek(&mut self) -> Result<()> {
        let target = match &self.resume {
            Seek::First => None,
            Seek::AtOrAfter(key, rid) | Seek::After(key, rid) => Some((key.as_slice(), *rid)),
        };

        let Some(guard) = self.index.find_leaf_read(target)? else {
            self.done = true;
            return Ok(());
        };

        let order = self.index.order();
        let leaf = BTreeLeafPage::new(guard.data());
        self.slot = match &self.resume {
            Seek::First => 0,
            Seek::AtOrAfter(key, rid) => leaf.lower_bound(key, *rid, order),
            Seek::After(key, rid) => leaf.upper_bound(key, *rid, order),
        };
        self.leaf = Some(guard);
        Ok(())
    }

    fn within_upper(&self, key: &[u8]) -> bool {
        let order = self.index.order();
        match &self.upper {
            Bound::Unbounded => true,
            Bound::Included(hi) => order.compare_keys(key, hi) != Ordering::Greater,
            Bound::Excluded(hi) => order.compare_keys(key, hi) == Ordering::Less,
        }
    }

    fn advance(&mut self) -> Result<Option<(Vec<u8>, RecordId)>> {
        loop {
            let Some(guard) = self.leaf.as_ref() else {
                return Ok(None);
            };
            let leaf = BTreeLeafPage::new(guard.data());

            if self.slot < leaf.size() {
                let key = leaf.key_at(self.slot).to_vec();
                let rid = leaf.rid_at(self.slot);
                if !self.within_upper(&key) {
                    return Ok(None);
                }
                self.slot += 1;
                self.resume = Seek::After(key.clone(), rid);
                return Ok(Some((key, rid)));
            }

            match leaf.next_page_no() {
                Some(next) => self.step_to(next)?,
                None => return Ok(None),
            }
        }
    }

    /// Moves onto the right sibling while still holding the current leaf.
    fn step_to(&mut self, next: PageNo) -> Result<()> {
        let page_id = PageId::new(self.index.fd(), next);
        let attempt = self.index.bpm().fetch_page(page_id)?.try_read();

        match attempt {
            Ok(guard) if node_type(guard.data()) == NodeType::Leaf => {
                self.leaf = Some(guard);
                self.slot = 0;
            }
            other => {
                drop(other);
                self.leaf = None;
                std::thread::yield_now();
                self.seek()?;
            }
        }
        Ok(())
    }

    fn finish(&mut self) {
        self.done = true;
        self.leaf = None;
    }
}

impl Iterator for BTreeIterator<'_> {
    type Item = Result<(Vec<u8>, RecordId)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.advance() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.finish();
                None
            }
            Err(e) => {
                self.finish();
                Some(Err(e))
            }
        }
    }
}
