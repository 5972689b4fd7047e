pub mod btree_page;
pub mod btree_index;
pub mod btree_iterator;
pub mod key_comparator;
mod latch_crab;

pub use btree_index::{BTreeConfig, BTreeIndex, TreeStats};
pub use btree_iterator::BTreeIterator;
pub use btree_page::{BTreeInternalPage, BTreeLeafPage, IndexHeader, NodeType};
pub use key_comparator::{BytewiseComparator, EntryOrder, IntegerComparator, KeyComparator};
