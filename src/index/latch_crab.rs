//! Coupled-latch cursors for tree descent.
//!
//! Both cursors follow the same rule: the next node is latched before the
//! previous one is let go. Readers only ever hold two latches for the length
//! of a step. Writers keep every ancestor that a change below could still
//! reach, and drop them all at once when they land on a safe node.

use crate::buffer::{ReadPageGuard, WritePageGuard};

/// Shared-latch cursor used by lookups and scans.
pub(crate) struct ReadCrab {
    current: ReadPageGuard,
}

impl ReadCrab {
    pub(crate) fn new(start: ReadPageGuard) -> Self {
        Self { current: start }
    }

    /// Moves onto `next`, which the caller latched while still holding the
    /// current node. The previous latch is released here.
    pub(crate) fn step(&mut self, next: ReadPageGuard) {
        let _previous = std::mem::replace(&mut self.current, next);
    }

    pub(crate) fn current(&self) -> &ReadPageGuard {
        &self.current
    }

    pub(crate) fn into_current(self) -> ReadPageGuard {
        self.current
    }
}

/// Exclusive-latch path used by insert and delete.
///
/// Holds the index header page while the root may still change, and the
/// chain of write-latched nodes from the highest unsafe ancestor down to the
/// node most recently reached.
pub(crate) struct WriteCrab {
    header: Option<WritePageGuard>,
    path: Vec<WritePageGuard>,
}

impl WriteCrab {
    pub(crate) fn new(header: WritePageGuard) -> Self {
        Self {
            header: Some(header),
            path: Vec::new(),
        }
    }

    /// Appends a freshly latched child to the path.
    pub(crate) fn push(&mut self, node: WritePageGuard) {
        self.path.push(node);
    }

    /// Releases the header and every ancestor of the last node. Called once
    /// the last node is known to absorb the change without splitting or
    /// underflowing.
    pub(crate) fn release_ancestors(&mut self) {
        self.header = None;
        if self.path.len() > 1 {
            let keep = self.path.split_off(self.path.len() - 1);
            self.path = keep;
        }
    }

    /// Takes the deepest held node off the path.
    pub(crate) fn pop(&mut self) -> Option<WritePageGuard> {
        self.path.pop()
    }

    /// Whether the header page is still latched, i.e. the root may change.
    pub(crate) fn holds_header(&self) -> bool {
        self.header.is_some()
    }

    pub(crate) fn header_mut(&mut self) -> Option<&mut WritePageGuard> {
        self.header.as_mut()
    }

    /// Nodes currently held, root side first.
    pub(crate) fn path(&self) -> &[WritePageGuard] {
        &self.path
    }
}
