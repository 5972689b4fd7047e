use std::fmt;

/// Page number within a single file
pub type PageNo = u32;

/// Handle of a file opened through the disk manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(pub u32);

impl FileId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileId({})", self.0)
    }
}

/// Page identifier - a page number qualified by the file it lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageId {
    pub fd: FileId,
    pub page_no: PageNo,
}

impl PageId {
    pub fn new(fd: FileId, page_no: PageNo) -> Self {
        Self { fd, page_no }
    }

    /// Byte offset of this page inside its file
    pub fn file_offset(&self, page_size: usize) -> u64 {
        self.page_no as u64 * page_size as u64
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PageId({}:{})", self.fd.0, self.page_no)
    }
}

/// Frame identifier type - identifies a buffer frame in the buffer pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameId(pub u32);

impl FrameId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn as_usize(&self) -> usize {
        self.0 as usize
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FrameId({})", self.0)
    }
}

/// Slot identifier within a record page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(pub u16);

impl SlotId {
    pub fn new(id: u16) -> Self {
        Self(id)
    }

    pub fn as_u16(&self) -> u16 {
        self.0
    }
}

/// Record identifier - locates a tuple by page number and slot.
///
/// Ordered by page number, then slot; non-unique indexes use this order
/// to break ties between equal keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId {
    pub page_no: PageNo,
    pub slot_id: SlotId,
}

impl RecordId {
    pub const MIN: RecordId = RecordId {
        page_no: 0,
        slot_id: SlotId(0),
    };

    pub const MAX: RecordId = RecordId {
        page_no: u32::MAX,
        slot_id: SlotId(u16::MAX),
    };

    pub fn new(page_no: PageNo, slot_id: SlotId) -> Self {
        Self { page_no, slot_id }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Rid({}, {})", self.page_no, self.slot_id.0)
    }
}

/// Logical clock value used by the replacer
pub type Timestamp = u64;
