//! Integration tests for the buffer pool manager

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use strata::buffer::{BufferPoolManager, PageGuard};
use strata::common::{FileId, PageId, StrataError, PAGE_SIZE};
use strata::storage::disk::DiskManager;
use tempfile::TempDir;

fn create_bpm(pool_size: usize) -> (BufferPoolManager, FileId, TempDir) {
    let dir = TempDir::new().unwrap();
    let dm = Arc::new(DiskManager::new(dir.path()).unwrap());
    dm.create_file("test.db").unwrap();
    let fd = dm.open_file("test.db").unwrap();
    let bpm = BufferPoolManager::new(pool_size, 2, dm);
    (bpm, fd, dir)
}

/// Writes `count` pages straight to disk, each filled with its page number.
fn seed_pages(bpm: &BufferPoolManager, fd: FileId, count: u32) -> Vec<PageId> {
    let dm = bpm.disk_manager();
    (0..count)
        .map(|_| {
            let page_id = dm.allocate_page(fd).unwrap();
            dm.write_page(page_id, &[page_id.page_no as u8; PAGE_SIZE]).unwrap();
            page_id
        })
        .collect()
}

#[test]
fn test_buffer_pool_basic_operations() {
    let (bpm, fd, _dir) = create_bpm(10);

    let page_id = bpm.new_page(fd).unwrap().detach();
    assert_eq!(page_id, PageId::new(fd, 0));
    bpm.unpin_page(page_id, false).unwrap();

    {
        let mut guard = bpm.fetch_page_write(page_id).unwrap();
        guard.data_mut()[..4].copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
    }

    {
        let guard = bpm.fetch_page_read(page_id).unwrap();
        assert_eq!(&guard.data()[..4], &[0xDE, 0xAD, 0xBE, 0xEF]);
    }
    assert_eq!(bpm.pin_count(page_id), Some(0));
}

#[test]
fn test_buffer_pool_cold_page_evicted_before_hot() {
    let (bpm, fd, _dir) = create_bpm(2);
    let pages = seed_pages(&bpm, fd, 3);
    let (a, b, c) = (pages[0], pages[1], pages[2]);

    drop(bpm.fetch_page(a).unwrap());
    drop(bpm.fetch_page(b).unwrap());
    // Second access makes A hot
    drop(bpm.fetch_page(a).unwrap());

    drop(bpm.fetch_page(c).unwrap());

    assert!(bpm.is_resident(a));
    assert!(!bpm.is_resident(b));
    assert!(bpm.is_resident(c));
}

#[test]
fn test_buffer_pool_eviction_round_trip() {
    let (bpm, fd, _dir) = create_bpm(3);

    let page_ids: Vec<PageId> = (0..10u8)
        .map(|i| {
            let guard = bpm.new_page(fd).unwrap();
            let page_id = guard.page_id();
            let mut guard = guard.write();
            guard.data_mut()[0] = i;
            guard.data_mut()[PAGE_SIZE - 1] = i;
            page_id
        })
        .collect();

    // Most of them were written back on eviction
    for (i, &page_id) in page_ids.iter().enumerate() {
        let guard = bpm.fetch_page_read(page_id).unwrap();
        assert_eq!(guard.data()[0], i as u8);
        assert_eq!(guard.data()[PAGE_SIZE - 1], i as u8);
    }
}

#[test]
fn test_buffer_pool_cache_exhausted() {
    let (bpm, fd, _dir) = create_bpm(2);

    let g1 = bpm.new_page(fd).unwrap();
    let _g2 = bpm.new_page(fd).unwrap();

    assert!(matches!(bpm.new_page(fd), Err(StrataError::CacheExhausted)));

    let spare = PageId::new(fd, 40);
    assert!(matches!(bpm.fetch_page(spare), Err(StrataError::CacheExhausted)));

    // Releasing one pin makes room
    drop(g1);
    assert!(bpm.fetch_page(spare).is_ok());
}

#[test]
fn test_buffer_pool_pinned_page_is_busy() {
    let (bpm, fd, _dir) = create_bpm(4);

    let guard = bpm.new_page(fd).unwrap();
    let page_id = guard.page_id();

    assert!(matches!(bpm.delete_page(page_id), Err(StrataError::PageBusy(_))));
    assert!(matches!(bpm.drop_file_pages(fd), Err(StrataError::PageBusy(_))));
    assert!(bpm.is_resident(page_id));

    drop(guard);
    assert!(bpm.delete_page(page_id).unwrap());
    assert!(!bpm.is_resident(page_id));
    assert_eq!(bpm.free_frame_count(), 4);

    // Deleting a page that is not cached is not an error
    assert!(!bpm.delete_page(page_id).unwrap());
}

#[test]
fn test_buffer_pool_unpin_errors() {
    let (bpm, fd, _dir) = create_bpm(4);

    let page_id = bpm.new_page(fd).unwrap().detach();
    assert_eq!(bpm.pin_count(page_id), Some(1));

    bpm.unpin_page(page_id, true).unwrap();
    assert!(matches!(
        bpm.unpin_page(page_id, false),
        Err(StrataError::DoubleUnpin(_))
    ));
    assert!(matches!(
        bpm.unpin_page(PageId::new(fd, 99), false),
        Err(StrataError::PageNotResident(_))
    ));
}

#[test]
fn test_buffer_pool_flush() {
    let (bpm, fd, _dir) = create_bpm(4);

    let page_id = {
        let mut guard = bpm.new_page(fd).unwrap().write();
        guard.data_mut()[..5].copy_from_slice(b"flush");
        guard.page_id()
    };

    assert!(bpm.flush_page(page_id).unwrap());
    assert!(!bpm.flush_page(PageId::new(fd, 7)).unwrap());

    let mut data = [0u8; PAGE_SIZE];
    bpm.disk_manager().read_page(page_id, &mut data).unwrap();
    assert_eq!(&data[..5], b"flush");

    // Clean pages are not written again by flush_all
    let writes = bpm.disk_manager().get_num_writes();
    bpm.flush_all_pages().unwrap();
    assert_eq!(bpm.disk_manager().get_num_writes(), writes);
}

#[test]
fn test_buffer_pool_drop_file_pages() {
    let (bpm, fd, _dir) = create_bpm(4);

    let page_id = {
        let mut guard = bpm.new_page(fd).unwrap().write();
        guard.data_mut()[0] = 9;
        guard.page_id()
    };

    bpm.drop_file_pages(fd).unwrap();
    assert!(!bpm.is_resident(page_id));
    assert_eq!(bpm.free_frame_count(), 4);

    let guard = bpm.fetch_page_read(page_id).unwrap();
    assert_eq!(guard.data()[0], 9);
}

#[test]
fn test_buffer_pool_persistence() {
    let dir = TempDir::new().unwrap();
    let page_id;

    {
        let dm = Arc::new(DiskManager::new(dir.path()).unwrap());
        dm.create_file("p.db").unwrap();
        let fd = dm.open_file("p.db").unwrap();
        let bpm = BufferPoolManager::new(4, 2, dm);

        let mut guard = bpm.new_page(fd).unwrap().write();
        guard.data_mut()[..12].copy_from_slice(b"still there");
        page_id = guard.page_id();
        // Dropping the pool flushes dirty pages
    }

    {
        let dm = Arc::new(DiskManager::new(dir.path()).unwrap());
        let fd = dm.open_file("p.db").unwrap();
        let bpm = BufferPoolManager::new(4, 2, dm);

        let guard = bpm.fetch_page_read(PageId::new(fd, page_id.page_no)).unwrap();
        assert_eq!(&guard.data()[..12], b"still there");
    }
}

#[test]
fn test_buffer_pool_concurrent_access() {
    let (bpm, fd, _dir) = create_bpm(8);
    let bpm = Arc::new(bpm);

    let handles: Vec<_> = (0..4u8)
        .map(|t| {
            let bpm = Arc::clone(&bpm);
            thread::spawn(move || {
                let mut mine = Vec::new();
                for i in 0..20u8 {
                    let mut guard = bpm.new_page(fd).unwrap().write();
                    guard.data_mut()[0] = t;
                    guard.data_mut()[1] = i;
                    mine.push(guard.page_id());
                }
                for (i, page_id) in mine.into_iter().enumerate() {
                    let guard = bpm.fetch_page_read(page_id).unwrap();
                    assert_eq!(guard.data()[0], t);
                    assert_eq!(guard.data()[1], i as u8);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(bpm.disk_manager().num_pages(fd).unwrap(), 80);
}

#[test]
fn test_buffer_pool_shared_page_across_threads() {
    let (bpm, fd, _dir) = create_bpm(4);
    let bpm = Arc::new(bpm);
    let page_id = bpm.new_page(fd).unwrap().page_id();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let bpm = Arc::clone(&bpm);
            thread::spawn(move || {
                for _ in 0..100 {
                    let mut guard = bpm.fetch_page_write(page_id).unwrap();
                    let count = u32::from_le_bytes(guard.data()[..4].try_into().unwrap());
                    guard.data_mut()[..4].copy_from_slice(&(count + 1).to_le_bytes());
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let guard = bpm.fetch_page_read(page_id).unwrap();
    assert_eq!(u32::from_le_bytes(guard.data()[..4].try_into().unwrap()), 800);
}

#[test]
fn test_buffer_pool_random_pins_never_exceed_pool() {
    const POOL: usize = 4;
    let (bpm, fd, _dir) = create_bpm(POOL);
    let pages = seed_pages(&bpm, fd, 12);
    let mut rng = StdRng::seed_from_u64(0x5eed);

    let mut held: Vec<PageGuard> = Vec::new();
    for _ in 0..2000 {
        if !held.is_empty() && rng.gen_bool(0.5) {
            let victim = rng.gen_range(0..held.len());
            held.swap_remove(victim);
            continue;
        }

        let page_id = pages[rng.gen_range(0..pages.len())];
        let mut distinct: HashMap<PageId, usize> = HashMap::new();
        for guard in &held {
            *distinct.entry(guard.page_id()).or_default() += 1;
        }

        match bpm.fetch_page(page_id) {
            Ok(guard) => {
                assert!(distinct.len() < POOL || distinct.contains_key(&page_id));
                let expected = page_id.page_no as u8;
                let guard = guard.read();
                assert!(guard.data().iter().all(|&b| b == expected));
                // Keep the pin, drop the latch
                held.push(bpm.fetch_page(page_id).unwrap());
            }
            Err(StrataError::CacheExhausted) => {
                assert_eq!(distinct.len(), POOL);
                assert!(!distinct.contains_key(&page_id));
            }
            Err(e) => panic!("unexpected error: {}", e),
        }

        for (&page_id, &pins) in &distinct {
            assert!(bpm.pin_count(page_id).unwrap() as usize >= pins);
        }
    }
}

#[test]
fn test_buffer_pool_failed_write_back_keeps_victim() {
    let dir = TempDir::new().unwrap();
    let dm = Arc::new(DiskManager::new(dir.path()).unwrap());
    dm.create_file("a.db").unwrap();
    dm.create_file("b.db").unwrap();
    let fd_a = dm.open_file("a.db").unwrap();
    let fd_b = dm.open_file("b.db").unwrap();
    let bpm = BufferPoolManager::new(1, 2, Arc::clone(&dm));

    let victim = {
        let mut guard = bpm.new_page(fd_a).unwrap().write();
        guard.data_mut()[0] = 5;
        guard.page_id()
    };
    dm.close_file(fd_a).unwrap();

    // The only frame holds a dirty page whose file is gone
    assert!(matches!(bpm.new_page(fd_b), Err(StrataError::FileNotOpen(_))));
    assert!(bpm.is_resident(victim));
    assert_eq!(bpm.pin_count(victim), Some(0));
    assert_eq!(bpm.free_frame_count(), 0);
    // No page number was handed out for the failed allocation
    assert_eq!(dm.num_pages(fd_b).unwrap(), 0);

    {
        let guard = bpm.fetch_page_read(victim).unwrap();
        assert_eq!(guard.data()[0], 5);
    }
    assert!(matches!(bpm.flush_page(victim), Err(StrataError::FileNotOpen(_))));

    // Reopening hands out a new file id, so the stranded page is discarded
    let fd_a = dm.open_file("a.db").unwrap();
    assert_ne!(fd_a, victim.fd);
    assert!(bpm.delete_page(victim).unwrap());

    let page_id = bpm.new_page(fd_b).unwrap().page_id();
    assert_eq!(page_id, PageId::new(fd_b, 0));
    assert_eq!(bpm.pin_count(page_id), Some(0));
    assert_eq!(bpm.free_frame_count(), 0);
}

#[test]
fn test_buffer_pool_failed_read_releases_frame() {
    let dir = TempDir::new().unwrap();
    let dm = Arc::new(DiskManager::new(dir.path()).unwrap());
    dm.create_file("a.db").unwrap();
    dm.create_file("b.db").unwrap();
    let fd_a = dm.open_file("a.db").unwrap();
    let fd_b = dm.open_file("b.db").unwrap();
    let bpm = BufferPoolManager::new(1, 2, Arc::clone(&dm));

    let page_no = {
        let page_id = dm.allocate_page(fd_a).unwrap();
        dm.write_page(page_id, &[8u8; PAGE_SIZE]).unwrap();
        page_id.page_no
    };
    let clean = seed_pages(&bpm, fd_b, 1)[0];
    drop(bpm.fetch_page(clean).unwrap());
    dm.close_file(fd_a).unwrap();

    let missing = PageId::new(fd_a, page_no);
    assert!(matches!(bpm.fetch_page(missing), Err(StrataError::FileNotOpen(_))));
    assert!(!bpm.is_resident(missing));
    assert_eq!(bpm.pin_count(missing), None);
    // The clean page was evicted for the attempt; its frame is free again
    assert!(!bpm.is_resident(clean));
    assert_eq!(bpm.free_frame_count(), 1);

    let fd_a = dm.open_file("a.db").unwrap();
    let page_id = PageId::new(fd_a, page_no);
    {
        let guard = bpm.fetch_page_read(page_id).unwrap();
        assert!(guard.data().iter().all(|&b| b == 8));
    }
    assert_eq!(bpm.pin_count(page_id), Some(0));
    assert_eq!(bpm.free_frame_count(), 0);
}
