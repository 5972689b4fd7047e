//! On-page layouts of the index header page and of B+Tree nodes.
//!
//! Every node starts with a 16 byte header:
//!
//! | offset | size | field                                         |
//! |--------|------|-----------------------------------------------|
//! | 0      | 1    | node type (0 invalid, 1 leaf, 2 internal)     |
//! | 2      | 2    | size (leaf: entries, internal: children)      |
//! | 4      | 2    | key size                                      |
//! | 8      | 4    | own page number                               |
//! | 12     | 4    | next leaf page number (leaves only)           |
//!
//! followed by a packed entry array. Leaf entries are `key | rid`, internal
//! entries are `key | rid | child`. The key of internal entry 0 is unused:
//! child `i` holds entries `>= (key_i, rid_i)` and `< (key_i+1, rid_i+1)`.
//! All integers are little-endian.

use std::cmp::Ordering;

use bytes::{Buf, BufMut};

use crate::common::{PageNo, RecordId, Result, SlotId, StrataError, INVALID_PAGE_NO, PAGE_SIZE};

use super::key_comparator::EntryOrder;

pub const NODE_HEADER_SIZE: usize = 16;

const PAGE_TYPE_OFFSET: usize = 0;
const SIZE_OFFSET: usize = 2;
const KEY_SIZE_OFFSET: usize = 4;
const PAGE_NO_OFFSET: usize = 8;
const NEXT_PAGE_OFFSET: usize = 12;

const RID_SIZE: usize = 6;
const CHILD_SIZE: usize = 4;

/// Identifies an index file ("STBT")
pub const INDEX_MAGIC: u32 = 0x5354_4254;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    Invalid,
    Leaf,
    Internal,
}

impl NodeType {
    fn as_u8(self) -> u8 {
        match self {
            NodeType::Invalid => 0,
            NodeType::Leaf => 1,
            NodeType::Internal => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => NodeType::Leaf,
            2 => NodeType::Internal,
            _ => NodeType::Invalid,
        }
    }
}

pub fn node_type(data: &[u8]) -> NodeType {
    NodeType::from_u8(data[PAGE_TYPE_OFFSET])
}

/// Marks a node page as detached from the tree. Readers that still reach it
/// through a stale sibling pointer see an invalid node and restart.
pub fn mark_invalid(data: &mut [u8]) {
    data[PAGE_TYPE_OFFSET] = NodeType::Invalid.as_u8();
    write_u16(data, SIZE_OFFSET, 0);
}

/// Number of leaf entries that fit in one page.
pub fn leaf_capacity(key_size: usize) -> usize {
    (PAGE_SIZE - NODE_HEADER_SIZE) / (key_size + RID_SIZE)
}

/// Number of internal entries (children) that fit in one page.
pub fn internal_capacity(key_size: usize) -> usize {
    (PAGE_SIZE - NODE_HEADER_SIZE) / (key_size + RID_SIZE + CHILD_SIZE)
}

fn read_u16(data: &[u8], offset: usize) -> u16 {
    (&data[offset..]).get_u16_le()
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    (&data[offset..]).get_u32_le()
}

fn write_u16(data: &mut [u8], offset: usize, value: u16) {
    (&mut data[offset..]).put_u16_le(value);
}

fn write_u32(data: &mut [u8], offset: usize, value: u32) {
    (&mut data[offset..]).put_u32_le(value);
}

fn read_rid(data: &[u8], offset: usize) -> RecordId {
    let mut src = &data[offset..offset + RID_SIZE];
    let page_no = src.get_u32_le();
    let slot = src.get_u16_le();
    RecordId::new(page_no, SlotId::new(slot))
}

fn write_rid(data: &mut [u8], offset: usize, rid: RecordId) {
    let mut dst = &mut data[offset..offset + RID_SIZE];
    dst.put_u32_le(rid.page_no);
    dst.put_u16_le(rid.slot_id.as_u16());
}

fn page_link(value: u32) -> Option<PageNo> {
    (value != INVALID_PAGE_NO).then_some(value)
}

fn entry_offset(index: usize, entry_size: usize) -> usize {
    NODE_HEADER_SIZE + index * entry_size
}

fn init_node(data: &mut [u8], node_type: NodeType, page_no: PageNo, key_size: usize) {
    data.fill(0);
    data[PAGE_TYPE_OFFSET] = node_type.as_u8();
    write_u16(data, KEY_SIZE_OFFSET, key_size as u16);
    write_u32(data, PAGE_NO_OFFSET, page_no);
    write_u32(data, NEXT_PAGE_OFFSET, INVALID_PAGE_NO);
}

fn expect_type(data: &[u8], expected: NodeType) -> Result<()> {
    let actual = node_type(data);
    if actual != expected {
        return Err(StrataError::IndexCorrupted(format!(
            "page {} is {:?}, expected {:?}",
            read_u32(data, PAGE_NO_OFFSET),
            actual,
            expected
        )));
    }
    Ok(())
}

/// Binary search for the first index in `0..size` where `pred` is false.
fn partition_point<F>(mut left: usize, mut right: usize, pred: F) -> usize
where
    F: Fn(usize) -> bool,
{
    while left < right {
        let mid = left + (right - left) / 2;
        if pred(mid) {
            left = mid + 1;
        } else {
            right = mid;
        }
    }
    left
}

/// Contents of page 0 of an index file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexHeader {
    pub root_page_no: PageNo,
    pub key_size: u16,
    pub leaf_max_size: u16,
    pub internal_max_size: u16,
    pub unique: bool,
}

impl IndexHeader {
    pub fn root(&self) -> Option<PageNo> {
        page_link(self.root_page_no)
    }

    pub fn encode(&self, data: &mut [u8]) {
        let mut dst = &mut data[..];
        dst.put_u32_le(INDEX_MAGIC);
        dst.put_u32_le(self.root_page_no);
        dst.put_u16_le(self.key_size);
        dst.put_u16_le(self.leaf_max_size);
        dst.put_u16_le(self.internal_max_size);
        dst.put_u8(self.unique as u8);
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut src = data;
        if src.get_u32_le() != INDEX_MAGIC {
            return Err(StrataError::IndexCorrupted(
                "missing index header magic".to_string(),
            ));
        }
        Ok(Self {
            root_page_no: src.get_u32_le(),
            key_size: src.get_u16_le(),
            leaf_max_size: src.get_u16_le(),
            internal_max_size: src.get_u16_le(),
            unique: src.get_u8() != 0,
        })
    }
}

/// View of a leaf node over any page buffer.
pub struct BTreeLeafPage<B> {
    data: B,
}

impl<B: AsRef<[u8]>> BTreeLeafPage<B> {
    /// Wraps a buffer without checking its node type.
    pub fn new(data: B) -> Self {
        Self { data }
    }

    /// Wraps a buffer that must hold a leaf.
    pub fn from_page(data: B) -> Result<Self> {
        expect_type(data.as_ref(), NodeType::Leaf)?;
        Ok(Self { data })
    }

    fn bytes(&self) -> &[u8] {
        self.data.as_ref()
    }

    pub fn size(&self) -> usize {
        read_u16(self.bytes(), SIZE_OFFSET) as usize
    }

    pub fn key_size(&self) -> usize {
        read_u16(self.bytes(), KEY_SIZE_OFFSET) as usize
    }

    pub fn page_no(&self) -> PageNo {
        read_u32(self.bytes(), PAGE_NO_OFFSET)
    }

    pub fn next_page_no(&self) -> Option<PageNo> {
        page_link(read_u32(self.bytes(), NEXT_PAGE_OFFSET))
    }

    fn entry_size(&self) -> usize {
        self.key_size() + RID_SIZE
    }

    fn entry(&self, index: usize) -> &[u8] {
        let entry_size = self.entry_size();
        let offset = entry_offset(index, entry_size);
        &self.bytes()[offset..offset + entry_size]
    }

    pub fn key_at(&self, index: usize) -> &[u8] {
        let offset = entry_offset(index, self.entry_size());
        &self.bytes()[offset..offset + self.key_size()]
    }

    pub fn rid_at(&self, index: usize) -> RecordId {
        let offset = entry_offset(index, self.entry_size()) + self.key_size();
        read_rid(self.bytes(), offset)
    }

    /// First position whose entry is `>= (key, rid)`.
    pub fn lower_bound(&self, key: &[u8], rid: RecordId, order: &EntryOrder) -> usize {
        partition_point(0, self.size(), |i| {
            order.compare(self.key_at(i), self.rid_at(i), key, rid) == Ordering::Less
        })
    }

    /// First position whose entry is `> (key, rid)`.
    pub fn upper_bound(&self, key: &[u8], rid: RecordId, order: &EntryOrder) -> usize {
        partition_point(0, self.size(), |i| {
            order.compare(self.key_at(i), self.rid_at(i), key, rid) != Ordering::Greater
        })
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> BTreeLeafPage<B> {
    fn bytes_mut(&mut self) -> &mut [u8] {
        self.data.as_mut()
    }

    pub fn init(&mut self, page_no: PageNo, key_size: usize) {
        init_node(self.bytes_mut(), NodeType::Leaf, page_no, key_size);
    }

    fn set_size(&mut self, size: usize) {
        write_u16(self.bytes_mut(), SIZE_OFFSET, size as u16);
    }

    pub fn set_next_page_no(&mut self, next: Option<PageNo>) {
        write_u32(
            self.bytes_mut(),
            NEXT_PAGE_OFFSET,
            next.unwrap_or(INVALID_PAGE_NO),
        );
    }

    fn insert_raw(&mut self, index: usize, entry: &[u8]) {
        let size = self.size();
        let entry_size = self.entry_size();
        let start = entry_offset(index, entry_size);
        let end = entry_offset(size, entry_size);
        let data = self.bytes_mut();
        data.copy_within(start..end, start + entry_size);
        data[start..start + entry_size].copy_from_slice(entry);
        self.set_size(size + 1);
    }

    pub fn insert_at(&mut self, index: usize, key: &[u8], rid: RecordId) {
        debug_assert_eq!(key.len(), self.key_size());
        let mut entry = Vec::with_capacity(self.entry_size());
        entry.extend_from_slice(key);
        entry.put_u32_le(rid.page_no);
        entry.put_u16_le(rid.slot_id.as_u16());
        self.insert_raw(index, &entry);
    }

    pub fn remove_at(&mut self, index: usize) {
        let size = self.size();
        let entry_size = self.entry_size();
        let start = entry_offset(index + 1, entry_size);
        let end = entry_offset(size, entry_size);
        self.bytes_mut()
            .copy_within(start..end, start - entry_size);
        self.set_size(size - 1);
    }

    /// Moves the upper half of the entries into the empty leaf `right` and
    /// links `right` in after this leaf. This leaf keeps `size / 2` entries.
    pub fn split_into<C>(&mut self, right: &mut BTreeLeafPage<C>)
    where
        C: AsRef<[u8]> + AsMut<[u8]>,
    {
        let size = self.size();
        let keep = size / 2;
        let entry_size = self.entry_size();

        let src = entry_offset(keep, entry_size)..entry_offset(size, entry_size);
        let dst = entry_offset(0, entry_size);
        right.bytes_mut()[dst..dst + src.len()].copy_from_slice(&self.bytes()[src]);
        right.set_size(size - keep);
        right.set_next_page_no(self.next_page_no());

        self.set_size(keep);
        self.set_next_page_no(Some(right.page_no()));
    }

    /// Appends every entry of this leaf to its left neighbour and unlinks it.
    pub fn merge_into<C>(&mut self, left: &mut BTreeLeafPage<C>)
    where
        C: AsRef<[u8]> + AsMut<[u8]>,
    {
        let size = self.size();
        let left_size = left.size();
        let entry_size = self.entry_size();

        let src = entry_offset(0, entry_size)..entry_offset(size, entry_size);
        let dst = entry_offset(left_size, entry_size);
        left.bytes_mut()[dst..dst + src.len()].copy_from_slice(&self.bytes()[src]);
        left.set_size(left_size + size);
        left.set_next_page_no(self.next_page_no());

        self.set_size(0);
    }

    /// Moves this leaf's first entry to the end of its left neighbour.
    pub fn move_first_to_end_of<C>(&mut self, left: &mut BTreeLeafPage<C>)
    where
        C: AsRef<[u8]> + AsMut<[u8]>,
    {
        let index = left.size();
        left.insert_raw(index, self.entry(0));
        self.remove_at(0);
    }

    /// Moves this leaf's last entry to the front of its right neighbour.
    pub fn move_last_to_front_of<C>(&mut self, right: &mut BTreeLeafPage<C>)
    where
        C: AsRef<[u8]> + AsMut<[u8]>,
    {
        let last = self.size() - 1;
        right.insert_raw(0, self.entry(last));
        self.remove_at(last);
    }
}

/// View of an internal node over any page buffer.
pub struct BTreeInternalPage<B> {
    data: B,
}

impl<B: AsRef<[u8]>> BTreeInternalPage<B> {
    pub fn new(data: B) -> Self {
        Self { data }
    }

    /// Wraps a buffer that must hold an internal node.
    pub fn from_page(data: B) -> Result<Self> {
        expect_type(data.as_ref(), NodeType::Internal)?;
        Ok(Self { data })
    }

    fn bytes(&self) -> &[u8] {
        self.data.as_ref()
    }

    /// Number of children.
    pub fn size(&self) -> usize {
        read_u16(self.bytes(), SIZE_OFFSET) as usize
    }

    pub fn key_size(&self) -> usize {
        read_u16(self.bytes(), KEY_SIZE_OFFSET) as usize
    }

    pub fn page_no(&self) -> PageNo {
        read_u32(self.bytes(), PAGE_NO_OFFSET)
    }

    fn entry_size(&self) -> usize {
        self.key_size() + RID_SIZE + CHILD_SIZE
    }

    fn entry(&self, index: usize) -> &[u8] {
        let entry_size = self.entry_size();
        let offset = entry_offset(index, entry_size);
        &self.bytes()[offset..offset + entry_size]
    }

    pub fn key_at(&self, index: usize) -> &[u8] {
        let offset = entry_offset(index, self.entry_size());
        &self.bytes()[offset..offset + self.key_size()]
    }

    pub fn rid_at(&self, index: usize) -> RecordId {
        let offset = entry_offset(index, self.entry_size()) + self.key_size();
        read_rid(self.bytes(), offset)
    }

    pub fn child_at(&self, index: usize) -> PageNo {
        let offset = entry_offset(index, self.entry_size()) + self.key_size() + RID_SIZE;
        read_u32(self.bytes(), offset)
    }

    /// Index of the child whose range covers `(key, rid)`: the largest
    /// `i >= 1` with separator `i <= (key, rid)`, or 0.
    pub fn child_index_for(&self, key: &[u8], rid: RecordId, order: &EntryOrder) -> usize {
        let upper = partition_point(1, self.size(), |i| {
            order.compare(self.key_at(i), self.rid_at(i), key, rid) != Ordering::Greater
        });
        upper - 1
    }

    pub fn child_index_of(&self, page_no: PageNo) -> Option<usize> {
        (0..self.size()).find(|&i| self.child_at(i) == page_no)
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> BTreeInternalPage<B> {
    fn bytes_mut(&mut self) -> &mut [u8] {
        self.data.as_mut()
    }

    pub fn init(&mut self, page_no: PageNo, key_size: usize) {
        init_node(self.bytes_mut(), NodeType::Internal, page_no, key_size);
    }

    fn set_size(&mut self, size: usize) {
        write_u16(self.bytes_mut(), SIZE_OFFSET, size as u16);
    }

    fn insert_raw(&mut self, index: usize, entry: &[u8]) {
        let size = self.size();
        let entry_size = self.entry_size();
        let start = entry_offset(index, entry_size);
        let end = entry_offset(size, entry_size);
        let data = self.bytes_mut();
        data.copy_within(start..end, start + entry_size);
        data[start..start + entry_size].copy_from_slice(entry);
        self.set_size(size + 1);
    }

    pub fn insert_at(&mut self, index: usize, key: &[u8], rid: RecordId, child: PageNo) {
        debug_assert_eq!(key.len(), self.key_size());
        let mut entry = Vec::with_capacity(self.entry_size());
        entry.extend_from_slice(key);
        entry.put_u32_le(rid.page_no);
        entry.put_u16_le(rid.slot_id.as_u16());
        entry.put_u32_le(child);
        self.insert_raw(index, &entry);
    }

    pub fn remove_at(&mut self, index: usize) {
        let size = self.size();
        let entry_size = self.entry_size();
        let start = entry_offset(index + 1, entry_size);
        let end = entry_offset(size, entry_size);
        self.bytes_mut()
            .copy_within(start..end, start - entry_size);
        self.set_size(size - 1);
    }

    pub fn set_key_at(&mut self, index: usize, key: &[u8], rid: RecordId) {
        let key_size = self.key_size();
        let offset = entry_offset(index, self.entry_size());
        let data = self.bytes_mut();
        data[offset..offset + key_size].copy_from_slice(key);
        write_rid(data, offset + key_size, rid);
    }

    /// Turns an empty node into a root with two children.
    pub fn populate_new_root(
        &mut self,
        left: PageNo,
        key: &[u8],
        rid: RecordId,
        right: PageNo,
    ) {
        self.set_size(0);
        let unused = vec![0u8; self.key_size()];
        self.insert_at(0, &unused, RecordId::MIN, left);
        self.insert_at(1, key, rid, right);
    }

    /// Moves the upper half of the children into the empty node `right`.
    /// Returns the separator to push into the parent; it stays behind as the
    /// unused key of `right`'s entry 0.
    pub fn split_into<C>(&mut self, right: &mut BTreeInternalPage<C>) -> (Vec<u8>, RecordId)
    where
        C: AsRef<[u8]> + AsMut<[u8]>,
    {
        let size = self.size();
        let keep = size / 2;
        let entry_size = self.entry_size();

        let src = entry_offset(keep, entry_size)..entry_offset(size, entry_size);
        let dst = entry_offset(0, entry_size);
        right.bytes_mut()[dst..dst + src.len()].copy_from_slice(&self.bytes()[src]);
        right.set_size(size - keep);
        self.set_size(keep);

        (right.key_at(0).to_vec(), right.rid_at(0))
    }

    /// Appends every child of this node to its left neighbour. The parent's
    /// separator for this node comes down as the key of the first moved entry.
    pub fn merge_into<C>(&mut self, left: &mut BTreeInternalPage<C>, key: &[u8], rid: RecordId)
    where
        C: AsRef<[u8]> + AsMut<[u8]>,
    {
        self.set_key_at(0, key, rid);

        let size = self.size();
        let left_size = left.size();
        let entry_size = self.entry_size();

        let src = entry_offset(0, entry_size)..entry_offset(size, entry_size);
        let dst = entry_offset(left_size, entry_size);
        left.bytes_mut()[dst..dst + src.len()].copy_from_slice(&self.bytes()[src]);
        left.set_size(left_size + size);

        self.set_size(0);
    }

    /// Rotates this node's last child into the front of its right neighbour
    /// through the parent separator `(key, rid)`. Returns the new separator.
    pub fn move_last_to_front_of<C>(
        &mut self,
        right: &mut BTreeInternalPage<C>,
        key: &[u8],
        rid: RecordId,
    ) -> (Vec<u8>, RecordId)
    where
        C: AsRef<[u8]> + AsMut<[u8]>,
    {
        let last = self.size() - 1;
        let separator = (self.key_at(last).to_vec(), self.rid_at(last));

        right.set_key_at(0, key, rid);
        right.insert_raw(0, self.entry(last));
        self.remove_at(last);

        separator
    }

    /// Rotates this node's first child onto the end of its left neighbour
    /// through the parent separator `(key, rid)`. Returns the new separator.
    pub fn move_first_to_end_of<C>(
        &mut self,
        left: &mut BTreeInternalPage<C>,
        key: &[u8],
        rid: RecordId,
    ) -> (Vec<u8>, RecordId)
    where
        C: AsRef<[u8]> + AsMut<[u8]>,
    {
        let index = left.size();
        left.insert_at(index, key, rid, self.child_at(0));

        let separator = (self.key_at(1).to_vec(), self.rid_at(1));
        self.remove_at(0);

        separator
    }
}
