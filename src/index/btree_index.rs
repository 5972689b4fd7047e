use std::cmp::Ordering;
use std::ops::Bound;
use std::sync::Arc;

use log::{debug, info, warn};

use crate::buffer::{BufferPoolManager, ReadPageGuard, WritePageGuard};
use crate::common::{
    FileId, IndexWriteKind, IndexWriteRecord, PageId, PageNo, RecordId, Result, StrataError,
    Transaction, INDEX_HEADER_PAGE_NO, INVALID_PAGE_NO,
};

use super::btree_iterator::BTreeIterator;
use super::btree_page::{
    internal_capacity, leaf_capacity, mark_invalid, node_type, BTreeInternalPage, BTreeLeafPage,
    IndexHeader, NodeType,
};
use super::key_comparator::{EntryOrder, KeyComparator};
use super::latch_crab::{ReadCrab, WriteCrab};

/// Shape of a B+Tree index. Fixed when the index is created and persisted in
/// its header page.
#[derive(Clone)]
pub struct BTreeConfig {
    /// Width of every key in bytes
    pub key_size: usize,
    /// Maximum entries per leaf
    pub leaf_max_size: usize,
    /// Maximum children per internal node
    pub internal_max_size: usize,
    /// Reject equal keys; otherwise equal keys are ordered by record id
    pub unique: bool,
    pub comparator: Arc<dyn KeyComparator>,
}

impl BTreeConfig {
    /// A unique index with the largest fan-out that fits a page.
    pub fn new(key_size: usize, comparator: Arc<dyn KeyComparator>) -> Self {
        // One spare slot per node holds the overflowing entry before a split.
        Self {
            key_size,
            leaf_max_size: leaf_capacity(key_size).saturating_sub(1),
            internal_max_size: internal_capacity(key_size).saturating_sub(1),
            unique: true,
            comparator,
        }
    }

    /// Overrides both fan-outs.
    pub fn with_fanout(mut self, max_size: usize) -> Self {
        self.leaf_max_size = max_size;
        self.internal_max_size = max_size;
        self
    }

    pub fn with_unique(mut self, unique: bool) -> Self {
        self.unique = unique;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.key_size == 0 {
            return Err(StrataError::InvalidConfig("key size must be positive".to_string()));
        }
        if self.leaf_max_size < 2 {
            return Err(StrataError::InvalidConfig(format!(
                "leaf fan-out {} is below 2",
                self.leaf_max_size
            )));
        }
        if self.internal_max_size < 3 {
            return Err(StrataError::InvalidConfig(format!(
                "internal fan-out {} is below 3",
                self.internal_max_size
            )));
        }
        if self.leaf_max_size + 1 > leaf_capacity(self.key_size)
            || self.internal_max_size + 1 > internal_capacity(self.key_size)
        {
            return Err(StrataError::InvalidConfig(format!(
                "fan-out {}/{} does not fit a page with {} byte keys",
                self.leaf_max_size, self.internal_max_size, self.key_size
            )));
        }
        Ok(())
    }
}

/// Shape summary returned by [`BTreeIndex::check_integrity`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeStats {
    /// Number of levels; 0 for an empty tree
    pub height: usize,
    pub num_entries: usize,
    /// Entry counts of the leaves, left to right
    pub leaf_sizes: Vec<usize>,
    /// Whether every separator equals the first entry of its right subtree
    pub separators_match_subtrees: bool,
}

/// A B+Tree over fixed-width keys, stored in its own file.
///
/// Page 0 of the file is the index header; every other page is a node. All
/// node access goes through the buffer pool, and concurrent operations
/// coordinate through page latches using latch crabbing.
pub struct BTreeIndex {
    bpm: Arc<BufferPoolManager>,
    fd: FileId,
    key_size: usize,
    leaf_max_size: usize,
    internal_max_size: usize,
    order: EntryOrder,
}

impl BTreeIndex {
    /// Initializes an empty index in the empty, open file `fd`.
    pub fn create(bpm: Arc<BufferPoolManager>, fd: FileId, config: BTreeConfig) -> Result<Self> {
        config.validate()?;

        if bpm.disk_manager().num_pages(fd)? != 0 {
            return Err(StrataError::InvalidConfig(format!(
                "index file {} is not empty",
                fd
            )));
        }

        let mut header_guard = bpm.new_page(fd)?.write();
        if header_guard.page_id().page_no != INDEX_HEADER_PAGE_NO {
            return Err(StrataError::IndexCorrupted(format!(
                "header of index {} landed on {}",
                fd,
                header_guard.page_id()
            )));
        }

        IndexHeader {
            root_page_no: INVALID_PAGE_NO,
            key_size: config.key_size as u16,
            leaf_max_size: config.leaf_max_size as u16,
            internal_max_size: config.internal_max_size as u16,
            unique: config.unique,
        }
        .encode(header_guard.data_mut());

        info!(
            "created index in {} (key size {}, fan-out {}/{})",
            fd, config.key_size, config.leaf_max_size, config.internal_max_size
        );

        Ok(Self {
            bpm,
            fd,
            key_size: config.key_size,
            leaf_max_size: config.leaf_max_size,
            internal_max_size: config.internal_max_size,
            order: EntryOrder::new(config.comparator, config.unique),
        })
    }

    /// Opens an index previously created in `fd`.
    pub fn open(
        bpm: Arc<BufferPoolManager>,
        fd: FileId,
        comparator: Arc<dyn KeyComparator>,
    ) -> Result<Self> {
        let header = {
            let guard = bpm.fetch_page_read(PageId::new(fd, INDEX_HEADER_PAGE_NO))?;
            IndexHeader::decode(guard.data())?
        };

        Ok(Self {
            bpm,
            fd,
            key_size: header.key_size as usize,
            leaf_max_size: header.leaf_max_size as usize,
            internal_max_size: header.internal_max_size as usize,
            order: EntryOrder::new(comparator, header.unique),
        })
    }

    pub fn fd(&self) -> FileId {
        self.fd
    }

    pub fn key_size(&self) -> usize {
        self.key_size
    }

    pub fn is_unique(&self) -> bool {
        self.order.is_unique()
    }

    pub fn leaf_max_size(&self) -> usize {
        self.leaf_max_size
    }

    pub fn internal_max_size(&self) -> usize {
        self.internal_max_size
    }

    fn leaf_min_size(&self) -> usize {
        self.leaf_max_size.div_ceil(2)
    }

    fn internal_min_size(&self) -> usize {
        self.internal_max_size.div_ceil(2)
    }

    /// Current root page, None for an empty tree.
    pub fn root_page_no(&self) -> Result<Option<PageNo>> {
        let guard = self.bpm.fetch_page_read(self.header_page_id())?;
        Ok(IndexHeader::decode(guard.data())?.root())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.iter()?.next().is_none())
    }

    /// Slices the key out of a record laid out with the key at `offset`.
    pub fn key_of<'r>(&self, record: &'r [u8], offset: usize) -> Result<&'r [u8]> {
        offset
            .checked_add(self.key_size)
            .and_then(|end| record.get(offset..end))
            .ok_or(StrataError::KeySizeMismatch {
                expected: self.key_size,
                actual: record.len().saturating_sub(offset),
            })
    }

    /// Looks up a key. For non-unique indexes returns the smallest record id
    /// stored under the key.
    pub fn search(&self, key: &[u8]) -> Result<Option<RecordId>> {
        self.check_key(key)?;
        let mut scan = self.scan(Bound::Included(key), Bound::Included(key))?;
        Ok(scan.next().transpose()?.map(|(_, rid)| rid))
    }

    /// Lazy ordered scan over the keys between `lower` and `upper`.
    pub fn scan(&self, lower: Bound<&[u8]>, upper: Bound<&[u8]>) -> Result<BTreeIterator<'_>> {
        for key in [&lower, &upper] {
            if let Bound::Included(key) | Bound::Excluded(key) = key {
                self.check_key(key)?;
            }
        }
        BTreeIterator::new(self, lower, upper)
    }

    /// Collects every entry with `lo <= key <= hi`.
    pub fn range_scan(&self, lo: &[u8], hi: &[u8]) -> Result<Vec<(Vec<u8>, RecordId)>> {
        self.scan(Bound::Included(lo), Bound::Included(hi))?
            .collect()
    }

    /// Scans the whole index in order.
    pub fn iter(&self) -> Result<BTreeIterator<'_>> {
        BTreeIterator::new(self, Bound::Unbounded, Bound::Unbounded)
    }

    /// Inserts `(key, rid)`. Fails with `DuplicateKey` if a unique index
    /// already holds the key, or a non-unique one holds the exact pair.
    pub fn insert(&self, key: &[u8], rid: RecordId, txn: Option<&Transaction>) -> Result<()> {
        self.check_key(key)?;
        self.insert_entry(key, rid)?;
        self.record_write(txn, IndexWriteKind::Insert, key, rid);
        Ok(())
    }

    /// Removes `key`. On a non-unique index this removes the entry with the
    /// smallest record id. Returns false if the key is absent.
    pub fn remove(&self, key: &[u8], txn: Option<&Transaction>) -> Result<bool> {
        self.check_key(key)?;
        if self.order.is_unique() {
            return self.remove_impl(key, None, txn);
        }

        loop {
            let rid = match self.search(key)? {
                Some(rid) => rid,
                None => return Ok(false),
            };
            if self.remove_impl(key, Some(rid), txn)? {
                return Ok(true);
            }
            // A concurrent remove took that entry; look for the next one.
        }
    }

    /// Removes the exact entry `(key, rid)`. Returns false if it is absent.
    pub fn remove_entry(&self, key: &[u8], rid: RecordId, txn: Option<&Transaction>) -> Result<bool> {
        self.check_key(key)?;
        self.remove_impl(key, Some(rid), txn)
    }

    fn remove_impl(&self, key: &[u8], rid: Option<RecordId>, txn: Option<&Transaction>) -> Result<bool> {
        match self.delete_entry(key, rid)? {
            Some(removed) => {
                self.record_write(txn, IndexWriteKind::Delete, key, removed);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn record_write(&self, txn: Option<&Transaction>, kind: IndexWriteKind, key: &[u8], rid: RecordId) {
        if let Some(txn) = txn {
            txn.append_index_write(IndexWriteRecord {
                kind,
                index_fd: self.fd,
                key: key.to_vec(),
                rid,
            });
        }
    }

    fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.len() != self.key_size {
            return Err(StrataError::KeySizeMismatch {
                expected: self.key_size,
                actual: key.len(),
            });
        }
        Ok(())
    }

    fn header_page_id(&self) -> PageId {
        PageId::new(self.fd, INDEX_HEADER_PAGE_NO)
    }

    fn page_id(&self, page_no: PageNo) -> PageId {
        PageId::new(self.fd, page_no)
    }

    pub(crate) fn order(&self) -> &EntryOrder {
        &self.order
    }

    pub(crate) fn bpm(&self) -> &BufferPoolManager {
        &self.bpm
    }

    /// Read-crabs from the root to the leaf covering `target`, or to the
    /// leftmost leaf when `target` is None. Returns None for an empty tree.
    pub(crate) fn find_leaf_read(
        &self,
        target: Option<(&[u8], RecordId)>,
    ) -> Result<Option<ReadPageGuard>> {
        let header = self.bpm.fetch_page_read(self.header_page_id())?;
        let root = match IndexHeader::decode(header.data())?.root() {
            Some(root) => root,
            None => return Ok(None),
        };

        let mut crab = ReadCrab::new(header);
        crab.step(self.bpm.fetch_page_read(self.page_id(root))?);

        loop {
            let child = {
                let data = crab.current().data();
                match node_type(data) {
                    NodeType::Leaf => break,
                    NodeType::Internal => {
                        let node = BTreeInternalPage::new(data);
                        let index = match target {
                            Some((key, rid)) => node.child_index_for(key, rid, &self.order),
                            None => 0,
                        };
                        node.child_at(index)
                    }
                    NodeType::Invalid => {
                        return Err(self.corrupted(crab.current().page_id(), "invalid node on search path"))
                    }
                }
            };
            crab.step(self.bpm.fetch_page_read(self.page_id(child))?);
        }

        Ok(Some(crab.into_current()))
    }

    fn corrupted(&self, page_id: PageId, what: &str) -> StrataError {
        StrataError::IndexCorrupted(format!("{}: {}", page_id, what))
    }

    fn set_root(&self, header: &mut WritePageGuard, root: Option<PageNo>) -> Result<()> {
        let mut meta = IndexHeader::decode(header.data())?;
        meta.root_page_no = root.unwrap_or(INVALID_PAGE_NO);
        meta.encode(header.data_mut());
        debug!("index {} root is now {:?}", self.fd, root);
        Ok(())
    }

    fn is_full(&self, data: &[u8]) -> bool {
        match node_type(data) {
            NodeType::Leaf => BTreeLeafPage::new(data).size() >= self.leaf_max_size,
            NodeType::Internal => BTreeInternalPage::new(data).size() >= self.internal_max_size,
            NodeType::Invalid => false,
        }
    }

    /// Allocates `count` zeroed, write-latched pages for splits. Called
    /// before any node on the path is modified.
    fn allocate_nodes(&self, count: usize) -> Result<Vec<WritePageGuard>> {
        let mut pages = Vec::with_capacity(count);
        for _ in 0..count {
            match self.bpm.new_page(self.fd) {
                Ok(guard) => pages.push(guard.write()),
                Err(e) => {
                    self.discard_pages(pages.iter().map(|g| g.page_id()).collect(), pages);
                    return Err(e);
                }
            }
        }
        Ok(pages)
    }

    /// Unlatches `guards` and drops `pages` from the buffer pool.
    fn discard_pages(&self, pages: Vec<PageId>, guards: Vec<WritePageGuard>) {
        drop(guards);
        for page_id in pages {
            match self.bpm.delete_page(page_id) {
                Ok(_) => {}
                // Someone still has it pinned; it stays marked invalid on disk.
                Err(StrataError::PageBusy(_)) => debug!("page {} still pinned, not freed", page_id),
                Err(e) => warn!("failed to free index page {}: {}", page_id, e),
            }
        }
    }

    fn insert_entry(&self, key: &[u8], rid: RecordId) -> Result<()> {
        let mut header = self.bpm.fetch_page_write(self.header_page_id())?;

        let root = match IndexHeader::decode(header.data())?.root() {
            Some(root) => root,
            None => {
                let mut guard = self.bpm.new_page(self.fd)?.write();
                let page_no = guard.page_id().page_no;
                let mut leaf = BTreeLeafPage::new(guard.data_mut());
                leaf.init(page_no, self.key_size);
                leaf.insert_at(0, key, rid);
                return self.set_root(&mut header, Some(page_no));
            }
        };

        let mut crab = WriteCrab::new(header);
        let mut page_no = root;
        loop {
            let guard = self.bpm.fetch_page_write(self.page_id(page_no))?;
            let next = match node_type(guard.data()) {
                NodeType::Leaf => None,
                NodeType::Internal => {
                    let node = BTreeInternalPage::new(guard.data());
                    Some(node.child_at(node.child_index_for(key, rid, &self.order)))
                }
                NodeType::Invalid => {
                    return Err(self.corrupted(guard.page_id(), "invalid node on insert path"))
                }
            };
            let safe = !self.is_full(guard.data());

            crab.push(guard);
            if safe {
                crab.release_ancestors();
            }

            match next {
                Some(child) => page_no = child,
                None => break,
            }
        }

        let mut leaf_guard = crab
            .pop()
            .ok_or_else(|| StrataError::IndexCorrupted("empty insert path".to_string()))?;

        let pos = {
            let leaf = BTreeLeafPage::new(leaf_guard.data());
            let pos = leaf.lower_bound(key, rid, &self.order);
            if pos < leaf.size()
                && self.order.compare(leaf.key_at(pos), leaf.rid_at(pos), key, rid) == Ordering::Equal
            {
                return Err(StrataError::DuplicateKey);
            }
            pos
        };

        // Every node still held below the header is full and will split; a
        // held header means the root splits too.
        let splits = usize::from(self.is_full(leaf_guard.data()))
            + crab.path().iter().filter(|g| self.is_full(g.data())).count();
        let new_root = usize::from(crab.holds_header() && splits > 0);
        let mut spare = self.allocate_nodes(splits + new_root)?;

        let mut leaf = BTreeLeafPage::new(leaf_guard.data_mut());
        leaf.insert_at(pos, key, rid);
        if leaf.size() <= self.leaf_max_size {
            return Ok(());
        }

        let mut right_guard = self.take_spare(&mut spare)?;
        let right_no = right_guard.page_id().page_no;
        let mut right = BTreeLeafPage::new(right_guard.data_mut());
        right.init(right_no, self.key_size);
        leaf.split_into(&mut right);

        let left_no = leaf.page_no();
        let separator = (right.key_at(0).to_vec(), right.rid_at(0));
        debug!("split leaf {} into {} of index {}", left_no, right_no, self.fd);

        // Parent stays latched until the separator is in.
        drop(leaf_guard);
        drop(right_guard);

        self.insert_into_parent(&mut crab, &mut spare, left_no, separator, right_no)
    }

    fn take_spare(&self, spare: &mut Vec<WritePageGuard>) -> Result<WritePageGuard> {
        spare
            .pop()
            .ok_or_else(|| StrataError::IndexCorrupted("split needed an unreserved page".to_string()))
    }

    /// Pushes a separator up the held path, splitting internal nodes as
    /// needed and growing a new root when the old one splits.
    fn insert_into_parent(
        &self,
        crab: &mut WriteCrab,
        spare: &mut Vec<WritePageGuard>,
        mut left_no: PageNo,
        mut separator: (Vec<u8>, RecordId),
        mut right_no: PageNo,
    ) -> Result<()> {
        loop {
            let Some(mut parent_guard) = crab.pop() else {
                let mut root_guard = self.take_spare(spare)?;
                let root_no = root_guard.page_id().page_no;
                let mut root = BTreeInternalPage::new(root_guard.data_mut());
                root.init(root_no, self.key_size);
                root.populate_new_root(left_no, &separator.0, separator.1, right_no);

                let header = crab
                    .header_mut()
                    .ok_or_else(|| StrataError::IndexCorrupted("root split without header".to_string()))?;
                return self.set_root(header, Some(root_no));
            };

            let parent_id = parent_guard.page_id();
            let mut parent = BTreeInternalPage::new(parent_guard.data_mut());
            let index = parent
                .child_index_of(left_no)
                .ok_or_else(|| self.corrupted(parent_id, "split child missing from parent"))?;
            parent.insert_at(index + 1, &separator.0, separator.1, right_no);
            if parent.size() <= self.internal_max_size {
                return Ok(());
            }

            let mut sibling_guard = self.take_spare(spare)?;
            let sibling_no = sibling_guard.page_id().page_no;
            let mut sibling = BTreeInternalPage::new(sibling_guard.data_mut());
            sibling.init(sibling_no, self.key_size);

            separator = parent.split_into(&mut sibling);
            left_no = parent.page_no();
            right_no = sibling_no;
            debug!("split internal {} into {} of index {}", left_no, right_no, self.fd);
        }
    }

    /// Removes the entry matching `key` (and `rid`, if given). Returns the
    /// record id of the removed entry.
    fn delete_entry(&self, key: &[u8], rid: Option<RecordId>) -> Result<Option<RecordId>> {
        let target_rid = rid.unwrap_or(RecordId::MIN);
        let header = self.bpm.fetch_page_write(self.header_page_id())?;
        let root = match IndexHeader::decode(header.data())?.root() {
            Some(root) => root,
            None => return Ok(None),
        };

        let mut crab = WriteCrab::new(header);
        let mut page_no = root;
        let mut is_root = true;
        loop {
            let guard = self.bpm.fetch_page_write(self.page_id(page_no))?;
            let (safe, next) = match node_type(guard.data()) {
                NodeType::Leaf => {
                    let size = BTreeLeafPage::new(guard.data()).size();
                    (is_root || size > self.leaf_min_size(), None)
                }
                NodeType::Internal => {
                    let node = BTreeInternalPage::new(guard.data());
                    let safe = if is_root {
                        node.size() > 2
                    } else {
                        node.size() > self.internal_min_size()
                    };
                    let child = node.child_at(node.child_index_for(key, target_rid, &self.order));
                    (safe, Some(child))
                }
                NodeType::Invalid => {
                    return Err(self.corrupted(guard.page_id(), "invalid node on delete path"))
                }
            };

            crab.push(guard);
            if safe {
                crab.release_ancestors();
            }
            is_root = false;

            match next {
                Some(child) => page_no = child,
                None => break,
            }
        }

        let mut leaf_guard = crab
            .pop()
            .ok_or_else(|| StrataError::IndexCorrupted("empty delete path".to_string()))?;

        let (pos, removed) = {
            let leaf = BTreeLeafPage::new(leaf_guard.data());
            let pos = leaf.lower_bound(key, target_rid, &self.order);
            if pos >= leaf.size() || self.order.compare_keys(leaf.key_at(pos), key) != Ordering::Equal {
                return Ok(None);
            }
            let found = leaf.rid_at(pos);
            if rid.is_some_and(|rid| rid != found) {
                return Ok(None);
            }
            (pos, found)
        };
        BTreeLeafPage::new(leaf_guard.data_mut()).remove_at(pos);

        let mut garbage = Vec::new();
        self.rebalance(&mut crab, leaf_guard, &mut garbage)?;
        drop(crab);

        if !garbage.is_empty() {
            self.discard_pages(garbage, Vec::new());
        }
        Ok(Some(removed))
    }

    /// Fixes underflow from `node_guard` upwards by borrowing from or merging
    /// with a sibling. Pages unlinked by merges are collected in `garbage`.
    fn rebalance(
        &self,
        crab: &mut WriteCrab,
        mut node_guard: WritePageGuard,
        garbage: &mut Vec<PageId>,
    ) -> Result<()> {
        loop {
            let Some(mut parent_guard) = crab.pop() else {
                if crab.holds_header() {
                    self.adjust_root(crab, node_guard, garbage)?;
                }
                return Ok(());
            };

            let is_leaf = match node_type(node_guard.data()) {
                NodeType::Leaf => true,
                NodeType::Internal => false,
                NodeType::Invalid => {
                    return Err(self.corrupted(node_guard.page_id(), "invalid node while rebalancing"))
                }
            };
            let (size, min) = if is_leaf {
                (BTreeLeafPage::new(node_guard.data()).size(), self.leaf_min_size())
            } else {
                (BTreeInternalPage::new(node_guard.data()).size(), self.internal_min_size())
            };
            if size >= min {
                return Ok(());
            }

            let node_no = node_guard.page_id().page_no;
            let index = BTreeInternalPage::new(parent_guard.data())
                .child_index_of(node_no)
                .ok_or_else(|| self.corrupted(parent_guard.page_id(), "child missing from parent"))?;
            // Prefer the left sibling; the leftmost child pairs with its right one.
            let (sibling_index, separator_index) = if index == 0 { (1, 1) } else { (index - 1, index) };
            let (sibling_no, separator) = {
                let parent = BTreeInternalPage::new(parent_guard.data());
                (
                    parent.child_at(sibling_index),
                    (parent.key_at(separator_index).to_vec(), parent.rid_at(separator_index)),
                )
            };

            let mut sibling_guard = self.bpm.fetch_page_write(self.page_id(sibling_no))?;
            let mut parent = BTreeInternalPage::new(parent_guard.data_mut());

            if is_leaf {
                let mut node = BTreeLeafPage::from_page(node_guard.data_mut())?;
                let mut sibling = BTreeLeafPage::from_page(sibling_guard.data_mut())?;

                if sibling.size() > self.leaf_min_size() {
                    if index == 0 {
                        sibling.move_first_to_end_of(&mut node);
                        parent.set_key_at(separator_index, sibling.key_at(0), sibling.rid_at(0));
                    } else {
                        sibling.move_last_to_front_of(&mut node);
                        parent.set_key_at(separator_index, node.key_at(0), node.rid_at(0));
                    }
                    debug!("leaf {} borrowed from {}", node_no, sibling_no);
                    return Ok(());
                }

                let (mut left, mut right) = if index == 0 { (node, sibling) } else { (sibling, node) };
                let right_no = right.page_no();
                right.merge_into(&mut left);
                debug!("merged leaf {} into {}", right_no, left.page_no());
                garbage.push(self.page_id(right_no));
            } else {
                let mut node = BTreeInternalPage::from_page(node_guard.data_mut())?;
                let mut sibling = BTreeInternalPage::from_page(sibling_guard.data_mut())?;

                if sibling.size() > self.internal_min_size() {
                    let (key, rid) = if index == 0 {
                        sibling.move_first_to_end_of(&mut node, &separator.0, separator.1)
                    } else {
                        sibling.move_last_to_front_of(&mut node, &separator.0, separator.1)
                    };
                    parent.set_key_at(separator_index, &key, rid);
                    debug!("internal {} borrowed from {}", node_no, sibling_no);
                    return Ok(());
                }

                let (mut left, mut right) = if index == 0 { (node, sibling) } else { (sibling, node) };
                let right_no = right.page_no();
                right.merge_into(&mut left, &separator.0, separator.1);
                debug!("merged internal {} into {}", right_no, left.page_no());
                garbage.push(self.page_id(right_no));
            }

            parent.remove_at(separator_index);
            let merged_away = if index == 0 { &mut sibling_guard } else { &mut node_guard };
            mark_invalid(merged_away.data_mut());

            node_guard = parent_guard;
        }
    }

    /// Shrinks the tree when the root is an internal node left with a single
    /// child. An empty root leaf is kept as is.
    fn adjust_root(
        &self,
        crab: &mut WriteCrab,
        mut root_guard: WritePageGuard,
        garbage: &mut Vec<PageId>,
    ) -> Result<()> {
        if node_type(root_guard.data()) != NodeType::Internal {
            return Ok(());
        }

        let only_child = {
            let root = BTreeInternalPage::new(root_guard.data());
            if root.size() != 1 {
                return Ok(());
            }
            root.child_at(0)
        };

        if let Some(header) = crab.header_mut() {
            self.set_root(header, Some(only_child))?;
        }
        mark_invalid(root_guard.data_mut());
        garbage.push(root_guard.page_id());
        Ok(())
    }

    /// Walks the whole tree and verifies ordering, fan-out, uniform leaf depth
    /// and the leaf chain. Intended for quiescent indexes; concurrent writers
    /// can make it report spurious corruption.
    pub fn check_integrity(&self) -> Result<TreeStats> {
        let mut stats = TreeStats {
            height: 0,
            num_entries: 0,
            leaf_sizes: Vec::new(),
            separators_match_subtrees: true,
        };

        let root = match self.root_page_no()? {
            Some(root) => root,
            None => return Ok(stats),
        };

        let mut walk = IntegrityWalk {
            leaf_depth: None,
            leaves: Vec::new(),
            stats: &mut stats,
        };
        self.check_node(root, 1, None, None, true, &mut walk)?;
        let height = walk.leaf_depth.unwrap_or(0);
        let leaves = std::mem::take(&mut walk.leaves);

        for pair in leaves.windows(2) {
            if pair[0].1 != Some(pair[1].0) {
                return Err(self.corrupted(self.page_id(pair[0].0), "broken leaf chain"));
            }
        }
        if let Some(&(last, next)) = leaves.last() {
            if next.is_some() {
                return Err(self.corrupted(self.page_id(last), "last leaf has a successor"));
            }
        }
        stats.height = height;

        Ok(stats)
    }

    /// Checks the subtree at `page_no` against the bounds inherited from its
    /// ancestors and returns its smallest entry.
    fn check_node(
        &self,
        page_no: PageNo,
        depth: usize,
        lower: Option<&(Vec<u8>, RecordId)>,
        upper: Option<&(Vec<u8>, RecordId)>,
        is_root: bool,
        walk: &mut IntegrityWalk<'_>,
    ) -> Result<Option<(Vec<u8>, RecordId)>> {
        let page_id = self.page_id(page_no);
        let guard = self.bpm.fetch_page_read(page_id)?;
        let in_bounds = |key: &[u8], rid: RecordId| {
            lower.map_or(true, |(k, r)| self.order.compare(key, rid, k, *r) != Ordering::Less)
                && upper.map_or(true, |(k, r)| self.order.compare(key, rid, k, *r) == Ordering::Less)
        };

        match node_type(guard.data()) {
            NodeType::Leaf => {
                let leaf = BTreeLeafPage::new(guard.data());
                let size = leaf.size();
                if size > self.leaf_max_size || (!is_root && size < self.leaf_min_size()) {
                    return Err(self.corrupted(page_id, &format!("leaf holds {} entries", size)));
                }
                for i in 0..size {
                    if !in_bounds(leaf.key_at(i), leaf.rid_at(i)) {
                        return Err(self.corrupted(page_id, "leaf entry outside parent bounds"));
                    }
                    if i > 0
                        && self.order.compare(leaf.key_at(i - 1), leaf.rid_at(i - 1), leaf.key_at(i), leaf.rid_at(i))
                            != Ordering::Less
                    {
                        return Err(self.corrupted(page_id, "leaf entries out of order"));
                    }
                }

                match walk.leaf_depth {
                    Some(d) if d != depth => {
                        return Err(self.corrupted(page_id, "leaves at different depths"))
                    }
                    _ => walk.leaf_depth = Some(depth),
                }
                walk.leaves.push((page_no, leaf.next_page_no()));
                walk.stats.leaf_sizes.push(size);
                walk.stats.num_entries += size;

                Ok((size > 0).then(|| (leaf.key_at(0).to_vec(), leaf.rid_at(0))))
            }
            NodeType::Internal => {
                let (children, separators) = {
                    let node = BTreeInternalPage::new(guard.data());
                    let size = node.size();
                    let too_small = if is_root { size < 2 } else { size < self.internal_min_size() };
                    if size > self.internal_max_size || too_small {
                        return Err(self.corrupted(page_id, &format!("internal node has {} children", size)));
                    }
                    let children: Vec<PageNo> = (0..size).map(|i| node.child_at(i)).collect();
                    let separators: Vec<(Vec<u8>, RecordId)> =
                        (1..size).map(|i| (node.key_at(i).to_vec(), node.rid_at(i))).collect();
                    (children, separators)
                };
                drop(guard);

                for (i, (key, rid)) in separators.iter().enumerate() {
                    if !in_bounds(key, *rid) {
                        return Err(self.corrupted(page_id, "separator outside parent bounds"));
                    }
                    if i > 0 {
                        let (prev_key, prev_rid) = &separators[i - 1];
                        if self.order.compare(prev_key, *prev_rid, key, *rid) != Ordering::Less {
                            return Err(self.corrupted(page_id, "separators out of order"));
                        }
                    }
                }

                let mut first = None;
                for (i, &child) in children.iter().enumerate() {
                    let child_lower = if i == 0 { lower } else { separators.get(i - 1) };
                    let child_upper = separators.get(i).or(upper);
                    let child_first = self.check_node(child, depth + 1, child_lower, child_upper, false, walk)?;

                    if i == 0 {
                        first = child_first;
                    } else if child_first.as_ref() != separators.get(i - 1) {
                        walk.stats.separators_match_subtrees = false;
                    }
                }
                Ok(first)
            }
            NodeType::Invalid => Err(self.corrupted(page_id, "reachable node is marked invalid")),
        }
    }
}

struct IntegrityWalk<'s> {
    leaf_depth: Option<usize>,
    /// (page, next pointer) of every leaf in key order
    leaves: Vec<(PageNo, Option<PageNo>)>,
    stats: &'s mut TreeStats,
}
