use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use log::{debug, error, info, warn};
use parking_lot::{Mutex, MutexGuard};

use crate::common::{
    FileId, FrameId, PageId, Result, StorageConfig, StrataError, INVALID_PAGE_NO, PAGE_SIZE,
};
use crate::storage::disk::{DiskManager, DiskScheduler};

use super::{FrameHeader, LruKReplacer, PageGuard, ReadPageGuard, WritePageGuard};

/// Held by the thread moving a page in or out of a frame. Others wanting
/// either page wait on it and then look the page up again.
type IoLatch = Arc<Mutex<()>>;

/// Internal state that can be shared across threads.
///
/// Lock order: `page_table`, then `in_flight`, then `free_list`, then the
/// replacer's own lock. No disk I/O happens while `page_table` is held, and
/// an `IoLatch` is never waited on while holding it.
struct BufferPoolState {
    /// The buffer pool frames
    frames: Vec<Arc<FrameHeader>>,
    /// Page table: maps page IDs to frame IDs
    page_table: Mutex<HashMap<PageId, FrameId>>,
    /// Pages being read in or written back, outside the page table
    in_flight: Mutex<HashMap<PageId, IoLatch>>,
    /// Free list: frames that are not currently in use
    free_list: Mutex<VecDeque<FrameId>>,
    /// LRU-K replacer for eviction decisions
    replacer: LruKReplacer,
}

/// What goes into a frame once its old page is gone.
#[derive(Clone, Copy)]
enum Fill {
    /// An existing page, read from disk if it is there
    Disk(PageId),
    /// A page newly allocated in the file
    Fresh(FileId),
}

impl BufferPoolState {
    fn unpin(&self, page_id: PageId, is_dirty: bool) -> Result<()> {
        let page_table = self.page_table.lock();
        let frame_id = *page_table
            .get(&page_id)
            .ok_or(StrataError::PageNotResident(page_id))?;
        let frame = &self.frames[frame_id.as_usize()];

        if is_dirty {
            frame.set_dirty(true);
        }

        match frame.unpin() {
            None => Err(StrataError::DoubleUnpin(page_id)),
            Some(0) => {
                self.replacer.set_evictable(frame_id, true);
                Ok(())
            }
            Some(_) => Ok(()),
        }
    }
}

/// BufferPoolManager is responsible for fetching database pages from disk
/// and storing them in memory. It manages a fixed number of frames and uses
/// the LRU-K replacement policy to decide which pages to evict.
///
/// Every successful fetch pins the page. Pins are released by dropping the
/// returned guard, or by `unpin_page` for a guard that was detached.
pub struct BufferPoolManager {
    /// Number of frames in the buffer pool
    pool_size: usize,
    /// Shared state
    state: Arc<BufferPoolState>,
    /// Disk scheduler for page I/O
    disk_scheduler: DiskScheduler,
}

impl BufferPoolManager {
    /// Creates a new BufferPoolManager with the given pool size, k value for LRU-K,
    /// and disk manager.
    pub fn new(pool_size: usize, k: usize, disk_manager: Arc<DiskManager>) -> Self {
        let mut frames = Vec::with_capacity(pool_size);
        let mut free_list = VecDeque::with_capacity(pool_size);

        for i in 0..pool_size {
            let frame_id = FrameId::new(i as u32);
            frames.push(Arc::new(FrameHeader::new(frame_id)));
            free_list.push_back(frame_id);
        }

        let state = Arc::new(BufferPoolState {
            frames,
            page_table: Mutex::new(HashMap::with_capacity(pool_size)),
            in_flight: Mutex::new(HashMap::new()),
            free_list: Mutex::new(free_list),
            replacer: LruKReplacer::new(k, pool_size),
        });

        info!("buffer pool created with {} frames (k = {})", pool_size, k);

        Self {
            pool_size,
            state,
            disk_scheduler: DiskScheduler::new(disk_manager),
        }
    }

    /// Creates a BufferPoolManager sized by a validated `StorageConfig`.
    pub fn with_config(config: &StorageConfig, disk_manager: Arc<DiskManager>) -> Result<Self> {
        config.validate()?;
        Ok(Self::new(config.pool_size, config.lru_k, disk_manager))
    }

    /// Returns the disk manager backing this pool.
    pub fn disk_manager(&self) -> &Arc<DiskManager> {
        self.disk_scheduler.disk_manager()
    }

    /// Allocates a new page in `fd` and returns it pinned once.
    /// The frame starts zero-filled and dirty, so the page reaches disk even
    /// if the caller never writes to it.
    pub fn new_page(&self, fd: FileId) -> Result<PageGuard> {
        let page_table = self.state.page_table.lock();
        let (page_id, frame_id) = self.load_frame(page_table, Fill::Fresh(fd))?;

        debug!("new page {} in {}", page_id, frame_id);
        Ok(self.make_guard(page_id, frame_id))
    }

    /// Pins a page without latching its content.
    pub fn fetch_page(&self, page_id: PageId) -> Result<PageGuard> {
        let frame_id = self.pin_page(page_id)?;
        Ok(self.make_guard(page_id, frame_id))
    }

    /// Pins a page and waits for a shared latch on it.
    pub fn fetch_page_read(&self, page_id: PageId) -> Result<ReadPageGuard> {
        Ok(self.fetch_page(page_id)?.read())
    }

    /// Pins a page and waits for an exclusive latch on it.
    pub fn fetch_page_write(&self, page_id: PageId) -> Result<WritePageGuard> {
        Ok(self.fetch_page(page_id)?.write())
    }

    /// Releases one pin on a page; `is_dirty` is OR-ed into the frame's
    /// dirty flag. Only needed for pins handed out by `PageGuard::detach`.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> Result<()> {
        self.state.unpin(page_id, is_dirty)
    }

    /// Drops a page from the pool without writing it back, and releases its
    /// page number on disk. Returns whether the page was resident.
    pub fn delete_page(&self, page_id: PageId) -> Result<bool> {
        let mut page_table = self.state.page_table.lock();
        if self.state.in_flight.lock().contains_key(&page_id) {
            return Err(StrataError::PageBusy(page_id));
        }

        let resident = match page_table.get(&page_id) {
            Some(&frame_id) => {
                let frame = &self.state.frames[frame_id.as_usize()];
                if frame.pin_count() > 0 {
                    return Err(StrataError::PageBusy(page_id));
                }

                page_table.remove(&page_id);
                self.state.replacer.remove(frame_id);
                frame.reset();
                self.state.free_list.lock().push_back(frame_id);
                true
            }
            None => false,
        };
        drop(page_table);

        self.disk_manager().deallocate_page(page_id)?;
        debug!("deleted page {}", page_id);
        Ok(resident)
    }

    /// Writes a resident page to disk whether or not it is dirty.
    /// Returns false if the page is not in the pool.
    pub fn flush_page(&self, page_id: PageId) -> Result<bool> {
        let guard = {
            let page_table = self.state.page_table.lock();
            match page_table.get(&page_id) {
                Some(&frame_id) => {
                    self.pin_frame(frame_id);
                    self.make_guard(page_id, frame_id)
                }
                None => return Ok(false),
            }
        };

        // The shared latch keeps writers out while the copy goes to disk.
        let page = guard.read();
        page.frame().set_dirty(false);
        if let Err(e) = self.disk_scheduler.schedule_write_sync(page_id, page.data()) {
            page.frame().set_dirty(true);
            return Err(e);
        }

        Ok(true)
    }

    /// Flushes every dirty page in the pool.
    pub fn flush_all_pages(&self) -> Result<()> {
        self.flush_dirty(|_| true)
    }

    /// Flushes every dirty page belonging to `fd`.
    pub fn flush_file(&self, fd: FileId) -> Result<()> {
        self.flush_dirty(|page_id| page_id.fd == fd)
    }

    /// Writes back and evicts every cached page of `fd`, typically right
    /// before the file is closed. Fails with `PageBusy` if any of them is
    /// in use, in which case nothing is evicted.
    pub fn drop_file_pages(&self, fd: FileId) -> Result<()> {
        self.file_pages_idle(&self.state.page_table.lock(), fd)?;
        self.flush_file(fd)?;

        let mut page_table = self.state.page_table.lock();
        let victims = self.file_pages_idle(&page_table, fd)?;
        // Written to again since the flush
        if let Some((page_id, _)) = victims
            .iter()
            .find(|(_, frame_id)| self.state.frames[frame_id.as_usize()].is_dirty())
        {
            return Err(StrataError::PageBusy(*page_id));
        }

        for (page_id, frame_id) in victims {
            page_table.remove(&page_id);
            self.state.replacer.remove(frame_id);
            self.state.frames[frame_id.as_usize()].reset();
            self.state.free_list.lock().push_back(frame_id);
        }

        debug!("dropped cached pages of {}", fd);
        Ok(())
    }

    /// Lists the cached pages of `fd`, or fails with `PageBusy` if one of
    /// them is pinned or moving to or from disk.
    fn file_pages_idle(
        &self,
        page_table: &HashMap<PageId, FrameId>,
        fd: FileId,
    ) -> Result<Vec<(PageId, FrameId)>> {
        if let Some(page_id) = self.state.in_flight.lock().keys().find(|p| p.fd == fd) {
            return Err(StrataError::PageBusy(*page_id));
        }

        let pages: Vec<(PageId, FrameId)> = page_table
            .iter()
            .filter(|(page_id, _)| page_id.fd == fd)
            .map(|(&page_id, &frame_id)| (page_id, frame_id))
            .collect();

        for &(page_id, frame_id) in &pages {
            let frame = &self.state.frames[frame_id.as_usize()];
            if frame.pin_count() > 0 {
                return Err(StrataError::PageBusy(page_id));
            }
        }
        Ok(pages)
    }

    /// Returns the pin count for a page.
    pub fn pin_count(&self, page_id: PageId) -> Option<u32> {
        let page_table = self.state.page_table.lock();

        page_table
            .get(&page_id)
            .map(|&frame_id| self.state.frames[frame_id.as_usize()].pin_count())
    }

    /// Returns whether the page currently occupies a frame.
    pub fn is_resident(&self, page_id: PageId) -> bool {
        self.state.page_table.lock().contains_key(&page_id)
    }

    /// Returns the pool size.
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Returns the number of free frames.
    pub fn free_frame_count(&self) -> usize {
        self.state.free_list.lock().len()
    }

    fn flush_dirty<F>(&self, filter: F) -> Result<()>
    where
        F: Fn(PageId) -> bool,
    {
        let dirty: Vec<PageId> = {
            let page_table = self.state.page_table.lock();
            page_table
                .iter()
                .filter(|(page_id, frame_id)| {
                    filter(**page_id) && self.state.frames[frame_id.as_usize()].is_dirty()
                })
                .map(|(&page_id, _)| page_id)
                .collect()
        };

        for page_id in dirty {
            self.flush_page(page_id)?;
        }

        Ok(())
    }

    fn make_guard(&self, page_id: PageId, frame_id: FrameId) -> PageGuard {
        let frame = Arc::clone(&self.state.frames[frame_id.as_usize()]);
        let state = Arc::clone(&self.state);

        PageGuard::new(
            page_id,
            frame,
            Box::new(move |pid, is_dirty| {
                if let Err(e) = state.unpin(pid, is_dirty) {
                    error!("failed to release pin on {}: {}", pid, e);
                }
            }),
        )
    }

    /// Pins a resident frame. Caller holds the page table lock.
    fn pin_frame(&self, frame_id: FrameId) {
        self.state.frames[frame_id.as_usize()].pin();
        self.state.replacer.record_access(frame_id);
        self.state.replacer.set_evictable(frame_id, false);
    }

    /// Brings a page into the pool if needed and pins it.
    ///
    /// A fetch of a page that another thread is loading or writing back
    /// waits for that thread and retries, so a page is never loaded twice.
    fn pin_page(&self, page_id: PageId) -> Result<FrameId> {
        if page_id.page_no == INVALID_PAGE_NO {
            return Err(StrataError::InvalidPageId(page_id));
        }

        loop {
            let page_table = self.state.page_table.lock();

            if let Some(&frame_id) = page_table.get(&page_id) {
                self.pin_frame(frame_id);
                return Ok(frame_id);
            }

            let pending = self.state.in_flight.lock().get(&page_id).cloned();
            match pending {
                Some(io) => {
                    drop(page_table);
                    drop(io.lock());
                }
                None => {
                    let (_, frame_id) = self.load_frame(page_table, Fill::Disk(page_id))?;
                    debug!("cache miss: loaded {} into {}", page_id, frame_id);
                    return Ok(frame_id);
                }
            }
        }
    }

    /// Takes a frame, writes back whatever dirty page it held, fills it
    /// and maps it pinned. The disk work runs after `page_table` is
    /// released; both pages involved are parked in `in_flight` meanwhile.
    ///
    /// On failure the frame goes back where it came from: a victim whose
    /// write-back failed stays cached and evictable.
    fn load_frame(
        &self,
        mut page_table: MutexGuard<'_, HashMap<PageId, FrameId>>,
        fill: Fill,
    ) -> Result<(PageId, FrameId)> {
        let frame_id = self.acquire_frame(&mut page_table)?;
        let frame = &self.state.frames[frame_id.as_usize()];
        let victim = frame.page_id();

        let io: IoLatch = Arc::new(Mutex::new(()));
        let io_guard = io.lock_arc();
        {
            let mut in_flight = self.state.in_flight.lock();
            if let Some(old_page_id) = victim {
                in_flight.insert(old_page_id, Arc::clone(&io));
            }
            if let Fill::Disk(page_id) = fill {
                in_flight.insert(page_id, Arc::clone(&io));
            }
        }
        drop(page_table);

        let written = match victim {
            Some(old_page_id) => self.write_back(frame, old_page_id),
            None => Ok(()),
        };
        let filled = written.and_then(|()| {
            frame.reset();
            match fill {
                Fill::Disk(page_id) => self.read_in(frame, page_id),
                Fill::Fresh(_) => Ok(()),
            }
        });

        let mut page_table = self.state.page_table.lock();
        {
            let mut in_flight = self.state.in_flight.lock();
            if let Some(old_page_id) = victim {
                in_flight.remove(&old_page_id);
            }
            if let Fill::Disk(page_id) = fill {
                in_flight.remove(&page_id);
            }
        }

        let placed = filled.and_then(|()| match fill {
            Fill::Disk(page_id) => Ok((page_id, false)),
            Fill::Fresh(fd) => self.disk_manager().allocate_page(fd).map(|p| (p, true)),
        });
        let result = match placed {
            Ok((page_id, is_new)) => {
                frame.set_page_id(Some(page_id));
                frame.set_dirty(is_new);
                page_table.insert(page_id, frame_id);
                self.pin_frame(frame_id);
                Ok((page_id, frame_id))
            }
            Err(e) => {
                match frame.page_id() {
                    Some(old_page_id) => {
                        warn!("write-back of {} failed, keeping it cached: {}", old_page_id, e);
                        page_table.insert(old_page_id, frame_id);
                        self.state.replacer.record_access(frame_id);
                        self.state.replacer.set_evictable(frame_id, true);
                    }
                    None => {
                        frame.reset();
                        self.state.free_list.lock().push_back(frame_id);
                    }
                }
                Err(e)
            }
        };

        drop(page_table);
        drop(io_guard);
        result
    }

    /// Gets a frame from the free list or by evicting a page. A clean
    /// victim is dropped here; a dirty one keeps its page id and bytes
    /// for `load_frame` to write back. Either way it leaves the page table.
    fn acquire_frame(&self, page_table: &mut HashMap<PageId, FrameId>) -> Result<FrameId> {
        if let Some(frame_id) = self.state.free_list.lock().pop_front() {
            return Ok(frame_id);
        }

        let frame_id = self
            .state
            .replacer
            .evict()
            .ok_or(StrataError::CacheExhausted)?;
        let frame = &self.state.frames[frame_id.as_usize()];

        if let Some(old_page_id) = frame.page_id() {
            page_table.remove(&old_page_id);
            debug!("evicted {} from {}", old_page_id, frame_id);
            if frame.is_dirty() {
                return Ok(frame_id);
            }
        }

        frame.reset();
        Ok(frame_id)
    }

    /// Writes a victim's bytes to disk. The frame is unmapped and unpinned,
    /// so nobody else is touching it.
    fn write_back(&self, frame: &FrameHeader, page_id: PageId) -> Result<()> {
        let mut data = [0u8; PAGE_SIZE];
        frame.copy_to(&mut data);
        self.disk_scheduler.schedule_write_sync(page_id, &data)
    }

    /// Reads a page into a zeroed frame. A page that was allocated but
    /// never flushed stays zero-filled.
    fn read_in(&self, frame: &FrameHeader, page_id: PageId) -> Result<()> {
        if self.disk_manager().is_page_on_disk(page_id)? {
            let mut data = [0u8; PAGE_SIZE];
            self.disk_scheduler.schedule_read_sync(page_id, &mut data)?;
            frame.copy_from(&data);
        }
        Ok(())
    }
}

impl Drop for BufferPoolManager {
    fn drop(&mut self) {
        if let Err(e) = self.flush_all_pages() {
            error!("failed to flush buffer pool on shutdown: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::{self, JoinHandle};
    use std::time::Duration;
    use tempfile::TempDir;

    fn create_bpm(pool_size: usize) -> (BufferPoolManager, FileId, TempDir) {
        let dir = TempDir::new().unwrap();
        let dm = Arc::new(DiskManager::new(dir.path()).unwrap());
        dm.create_file("test.db").unwrap();
        let fd = dm.open_file("test.db").unwrap();
        let bpm = BufferPoolManager::new(pool_size, 2, dm);
        (bpm, fd, dir)
    }

    #[test]
    fn test_buffer_pool_manager_new() {
        let (bpm, _fd, _dir) = create_bpm(10);
        assert_eq!(bpm.pool_size(), 10);
        assert_eq!(bpm.free_frame_count(), 10);
    }

    #[test]
    fn test_buffer_pool_manager_new_page() {
        let (bpm, fd, _dir) = create_bpm(10);

        let guard = bpm.new_page(fd).unwrap();
        let page_id = guard.page_id();
        assert_eq!(page_id, PageId::new(fd, 0));
        assert_eq!(bpm.pin_count(page_id), Some(1));
        assert_eq!(bpm.free_frame_count(), 9);

        drop(guard);
        assert_eq!(bpm.pin_count(page_id), Some(0));
    }

    #[test]
    fn test_buffer_pool_manager_read_write() {
        let (bpm, fd, _dir) = create_bpm(10);

        let page_id = bpm.new_page(fd).unwrap().page_id();

        {
            let mut guard = bpm.fetch_page_write(page_id).unwrap();
            guard.data_mut()[0] = 42;
            guard.data_mut()[100] = 255;
        }

        assert_eq!(bpm.pin_count(page_id), Some(0));

        {
            let guard = bpm.fetch_page_read(page_id).unwrap();
            assert_eq!(guard.data()[0], 42);
            assert_eq!(guard.data()[100], 255);
        }
    }

    #[test]
    fn test_buffer_pool_manager_unallocated_page_reads_zero() {
        let (bpm, fd, _dir) = create_bpm(4);

        let page_id = bpm.disk_manager().allocate_page(fd).unwrap();
        let guard = bpm.fetch_page_read(page_id).unwrap();
        assert!(guard.data().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_buffer_pool_manager_invalid_page() {
        let (bpm, fd, _dir) = create_bpm(4);
        assert!(matches!(
            bpm.fetch_page(PageId::new(fd, INVALID_PAGE_NO)),
            Err(StrataError::InvalidPageId(_))
        ));
    }

    #[test]
    fn test_buffer_pool_manager_delete_page() {
        let (bpm, fd, _dir) = create_bpm(10);

        let page_id = bpm.new_page(fd).unwrap().page_id();

        {
            let _guard = bpm.fetch_page_read(page_id).unwrap();
            assert!(matches!(
                bpm.delete_page(page_id),
                Err(StrataError::PageBusy(_))
            ));
        }

        assert!(bpm.delete_page(page_id).unwrap());
        assert_eq!(bpm.pin_count(page_id), None);
        assert_eq!(bpm.free_frame_count(), 10);
    }

    #[test]
    fn test_buffer_pool_manager_double_unpin() {
        let (bpm, fd, _dir) = create_bpm(4);

        let page_id = bpm.new_page(fd).unwrap().detach();
        bpm.unpin_page(page_id, false).unwrap();
        assert!(matches!(
            bpm.unpin_page(page_id, false),
            Err(StrataError::DoubleUnpin(_))
        ));
    }

    #[test]
    fn test_buffer_pool_manager_cache_exhausted() {
        let (bpm, fd, _dir) = create_bpm(2);

        let _guard1 = bpm.new_page(fd).unwrap();
        let _guard2 = bpm.new_page(fd).unwrap();

        assert!(matches!(bpm.new_page(fd), Err(StrataError::CacheExhausted)));
    }

    #[test]
    fn test_buffer_pool_manager_drop_file_pages() {
        let (bpm, fd, _dir) = create_bpm(4);

        let page_id = {
            let mut guard = bpm.new_page(fd).unwrap().write();
            guard.data_mut()[7] = 7;
            guard.page_id()
        };

        bpm.drop_file_pages(fd).unwrap();
        assert!(!bpm.is_resident(page_id));
        assert_eq!(bpm.free_frame_count(), 4);

        let guard = bpm.fetch_page_read(page_id).unwrap();
        assert_eq!(guard.data()[7], 7);
    }

    fn wait_until_in_flight(bpm: &BufferPoolManager, page_id: PageId) {
        for _ in 0..2000 {
            if bpm.state.in_flight.lock().contains_key(&page_id) {
                return;
            }
            thread::sleep(Duration::from_millis(1));
        }
        panic!("{} never started loading", page_id);
    }

    fn spawn_reader(bpm: &Arc<BufferPoolManager>, page_id: PageId) -> JoinHandle<u8> {
        let bpm = Arc::clone(bpm);
        thread::spawn(move || {
            let guard = bpm.fetch_page_read(page_id).unwrap();
            let first = guard.data()[0];
            first
        })
    }

    #[test]
    fn test_buffer_pool_manager_miss_does_not_block_other_pages() {
        let (bpm, fd, _dir) = create_bpm(4);
        let dm = Arc::clone(bpm.disk_manager());

        let cold = dm.allocate_page(fd).unwrap();
        dm.write_page(cold, &[7u8; PAGE_SIZE]).unwrap();
        let hot = {
            let mut guard = bpm.new_page(fd).unwrap().write();
            guard.data_mut()[0] = 1;
            guard.page_id()
        };
        let bpm = Arc::new(bpm);

        let loader = dm
            .with_file_locked(fd, || {
                let loader = spawn_reader(&bpm, cold);
                wait_until_in_flight(&bpm, cold);

                // The load of `cold` is stuck on disk; everything else proceeds
                let guard = bpm.fetch_page_read(hot).unwrap();
                assert_eq!(guard.data()[0], 1);
                drop(guard);
                assert_eq!(bpm.pin_count(hot), Some(0));

                let fresh = bpm.new_page(fd).unwrap();
                assert_eq!(bpm.pin_count(fresh.page_id()), Some(1));
                drop(fresh);

                assert!(!bpm.is_resident(cold));
                assert!(matches!(bpm.delete_page(cold), Err(StrataError::PageBusy(_))));
                loader
            })
            .unwrap();

        assert_eq!(loader.join().unwrap(), 7);
        assert!(bpm.is_resident(cold));
        assert_eq!(bpm.pin_count(cold), Some(0));
    }

    #[test]
    fn test_buffer_pool_manager_concurrent_misses_load_once() {
        let (bpm, fd, _dir) = create_bpm(4);
        let dm = Arc::clone(bpm.disk_manager());

        let page_id = dm.allocate_page(fd).unwrap();
        dm.write_page(page_id, &[3u8; PAGE_SIZE]).unwrap();
        let reads = dm.get_num_reads();
        let bpm = Arc::new(bpm);

        let readers = dm
            .with_file_locked(fd, || {
                let first = spawn_reader(&bpm, page_id);
                wait_until_in_flight(&bpm, page_id);
                let second = spawn_reader(&bpm, page_id);
                [first, second]
            })
            .unwrap();

        for reader in readers {
            assert_eq!(reader.join().unwrap(), 3);
        }
        assert_eq!(dm.get_num_reads(), reads + 1);
        assert_eq!(bpm.free_frame_count(), 3);
        assert_eq!(bpm.pin_count(page_id), Some(0));
    }

    #[test]
    fn test_buffer_pool_manager_waits_for_write_back() {
        let (bpm, fd, _dir) = create_bpm(2);
        let dm = Arc::clone(bpm.disk_manager());

        let dirty = {
            let mut guard = bpm.new_page(fd).unwrap().write();
            guard.data_mut()[0] = 9;
            guard.page_id()
        };
        // A second access keeps this one cached while `dirty` is evicted
        let hot = bpm.new_page(fd).unwrap().page_id();
        drop(bpm.fetch_page(hot).unwrap());
        let bpm = Arc::new(bpm);

        let (evictor, reader) = dm
            .with_file_locked(fd, || {
                let evictor = {
                    let bpm = Arc::clone(&bpm);
                    thread::spawn(move || bpm.new_page(fd).map(|guard| guard.page_id()))
                };
                wait_until_in_flight(&bpm, dirty);

                // A fetch of the page being written back must not read stale bytes
                let reader = spawn_reader(&bpm, dirty);
                (evictor, reader)
            })
            .unwrap();

        evictor.join().unwrap().unwrap();
        assert_eq!(reader.join().unwrap(), 9);
    }
}
