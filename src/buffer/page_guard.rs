use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::RawRwLock;

use crate::common::{PageId, PAGE_SIZE};

use super::FrameHeader;

/// Callback type for releasing a pin; receives the page and whether the
/// holder dirtied it.
pub(crate) type ReleaseCallback = Box<dyn FnOnce(PageId, bool) + Send + Sync>;

type ReadLatch = ArcRwLockReadGuard<RawRwLock, [u8; PAGE_SIZE]>;
type WriteLatch = ArcRwLockWriteGuard<RawRwLock, [u8; PAGE_SIZE]>;

/// A pinned page without a latch on its content.
///
/// The pin keeps the page resident; it is released exactly once when the
/// guard drops. Turn it into a [`ReadPageGuard`] or [`WritePageGuard`] to
/// look at the bytes.
pub struct PageGuard {
    page_id: PageId,
    frame: Arc<FrameHeader>,
    release_callback: Option<ReleaseCallback>,
    is_dirty: bool,
}

impl PageGuard {
    pub(crate) fn new(
        page_id: PageId,
        frame: Arc<FrameHeader>,
        release_callback: ReleaseCallback,
    ) -> Self {
        Self {
            page_id,
            frame,
            release_callback: Some(release_callback),
            is_dirty: false,
        }
    }

    /// Returns the page ID.
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Marks the page dirty; the flag reaches the frame when the pin is released.
    pub fn mark_dirty(&mut self) {
        self.is_dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.is_dirty
    }

    /// Waits for a shared latch on the page content.
    pub fn read(self) -> ReadPageGuard {
        let latch = self.frame.data.read_arc();
        ReadPageGuard { latch, pin: self }
    }

    /// Waits for an exclusive latch on the page content.
    pub fn write(self) -> WritePageGuard {
        let latch = self.frame.data.write_arc();
        WritePageGuard { latch, pin: self }
    }

    /// Takes a shared latch if nobody holds it exclusively, otherwise hands
    /// the pin back.
    pub fn try_read(self) -> Result<ReadPageGuard, PageGuard> {
        match self.frame.data.try_read_arc() {
            Some(latch) => Ok(ReadPageGuard { latch, pin: self }),
            None => Err(self),
        }
    }

    /// Gives up automatic unpinning. The caller now owns the pin and must
    /// release it with `BufferPoolManager::unpin_page`.
    pub fn detach(mut self) -> PageId {
        self.release_callback = None;
        if self.is_dirty {
            self.frame.set_dirty(true);
        }
        self.page_id
    }

    pub(crate) fn frame(&self) -> &FrameHeader {
        &self.frame
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        if let Some(callback) = self.release_callback.take() {
            callback(self.page_id, self.is_dirty);
        }
    }
}

/// RAII guard for read-only access to a page.
/// Releases the latch, then the pin, when dropped.
pub struct ReadPageGuard {
    // Declared first so the latch is released before the pin.
    latch: ReadLatch,
    pin: PageGuard,
}

impl ReadPageGuard {
    /// Returns the page ID.
    pub fn page_id(&self) -> PageId {
        self.pin.page_id
    }

    /// Returns a reference to the page data.
    pub fn data(&self) -> &[u8] {
        &self.latch[..]
    }

    pub(crate) fn frame(&self) -> &FrameHeader {
        self.pin.frame()
    }
}

impl Deref for ReadPageGuard {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.data()
    }
}

/// RAII guard for read-write access to a page.
/// Any mutable access marks the page dirty.
pub struct WritePageGuard {
    latch: WriteLatch,
    pin: PageGuard,
}

impl WritePageGuard {
    /// Returns the page ID.
    pub fn page_id(&self) -> PageId {
        self.pin.page_id
    }

    /// Returns a reference to the page data.
    pub fn data(&self) -> &[u8] {
        &self.latch[..]
    }

    /// Returns a mutable reference to the page data.
    /// Automatically marks the page as dirty.
    pub fn data_mut(&mut self) -> &mut [u8] {
        self.pin.is_dirty = true;
        &mut self.latch[..]
    }

    pub fn mark_dirty(&mut self) {
        self.pin.is_dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.pin.is_dirty
    }
}

impl Deref for WritePageGuard {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.data()
    }
}

impl DerefMut for WritePageGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.data_mut()
    }
}

impl Drop for WritePageGuard {
    fn drop(&mut self) {
        // Publish the dirty bit while the latch is still held, so a flusher
        // that takes the latch next always sees it.
        if self.pin.is_dirty {
            self.pin.frame.set_dirty(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{FileId, FrameId};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn page(n: u32) -> PageId {
        PageId::new(FileId::new(1), n)
    }

    fn tracking_callback() -> (ReleaseCallback, Arc<AtomicBool>, Arc<AtomicBool>) {
        let released = Arc::new(AtomicBool::new(false));
        let dirty = Arc::new(AtomicBool::new(false));
        let released_clone = released.clone();
        let dirty_clone = dirty.clone();
        let callback: ReleaseCallback = Box::new(move |_, is_dirty| {
            released_clone.store(true, Ordering::SeqCst);
            dirty_clone.store(is_dirty, Ordering::SeqCst);
        });
        (callback, released, dirty)
    }

    #[test]
    fn test_read_page_guard() {
        let frame = Arc::new(FrameHeader::new(FrameId::new(0)));
        frame.set_page_id(Some(page(1)));

        let mut data = [0u8; PAGE_SIZE];
        data[0] = 42;
        frame.copy_from(&data);

        let (callback, released, dirty) = tracking_callback();
        let guard = PageGuard::new(page(1), frame.clone(), callback).read();

        assert_eq!(guard.page_id(), page(1));
        assert_eq!(guard.data()[0], 42);
        assert!(!released.load(Ordering::SeqCst));

        drop(guard);
        assert!(released.load(Ordering::SeqCst));
        assert!(!dirty.load(Ordering::SeqCst));
    }

    #[test]
    fn test_write_page_guard() {
        let frame = Arc::new(FrameHeader::new(FrameId::new(0)));
        frame.set_page_id(Some(page(1)));

        let (callback, released, dirty) = tracking_callback();
        let mut guard = PageGuard::new(page(1), frame.clone(), callback).write();

        guard.data_mut()[0] = 42;
        assert!(!released.load(Ordering::SeqCst));

        drop(guard);
        assert!(released.load(Ordering::SeqCst));
        assert!(dirty.load(Ordering::SeqCst));
        assert!(frame.is_dirty());

        let mut read_data = [0u8; PAGE_SIZE];
        frame.copy_to(&mut read_data);
        assert_eq!(read_data[0], 42);
    }

    #[test]
    fn test_try_read_fails_under_writer() {
        let frame = Arc::new(FrameHeader::new(FrameId::new(0)));

        let (cb1, _, _) = tracking_callback();
        let writer = PageGuard::new(page(1), frame.clone(), cb1).write();

        let (cb2, released, _) = tracking_callback();
        let pin = PageGuard::new(page(1), frame.clone(), cb2);
        let pin = match pin.try_read() {
            Ok(_) => panic!("latch should be held exclusively"),
            Err(pin) => pin,
        };
        assert!(!released.load(Ordering::SeqCst));

        drop(writer);
        assert!(pin.try_read().is_ok());
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn test_detach_skips_release() {
        let frame = Arc::new(FrameHeader::new(FrameId::new(0)));
        let (callback, released, _) = tracking_callback();

        let mut guard = PageGuard::new(page(3), frame.clone(), callback);
        guard.mark_dirty();
        assert_eq!(guard.detach(), page(3));

        assert!(!released.load(Ordering::SeqCst));
        assert!(frame.is_dirty());
    }
}
