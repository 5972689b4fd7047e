use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use log::{debug, info};
use parking_lot::{Mutex, RwLock};

use crate::common::{FileId, PageId, PageNo, Result, StrataError, LOG_FILE_NAME, PAGE_SIZE};

/// An open data file and its page allocation counter.
struct OpenFile {
    path: PathBuf,
    file: Mutex<File>,
    /// Next page number handed out by `allocate_page`. Rebuilt from the
    /// file length when the file is opened.
    next_page_no: AtomicU32,
}

#[derive(Default)]
struct FileTable {
    by_fd: HashMap<FileId, Arc<OpenFile>>,
    by_path: HashMap<PathBuf, FileId>,
}

/// DiskManager is responsible for reading and writing pages to/from disk.
/// It owns every data file opened under its data directory, hands out page
/// numbers per file, and appends to the write-ahead log file.
///
/// All operations are synchronous. There is no buffering or write coalescing
/// here; that is the buffer pool's job.
pub struct DiskManager {
    /// Directory relative paths are resolved against
    data_dir: PathBuf,
    files: RwLock<FileTable>,
    next_fd: AtomicU32,
    /// Log file, opened on first use
    log_file: Mutex<Option<File>>,
    /// Number of page reads performed
    num_reads: AtomicU32,
    /// Number of page writes performed
    num_writes: AtomicU32,
}

impl DiskManager {
    /// Creates a DiskManager rooted at `data_dir`, creating the directory if
    /// it doesn't exist.
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        fs::create_dir_all(&data_dir)?;
        info!("disk manager rooted at {}", data_dir.display());

        Ok(Self {
            data_dir,
            files: RwLock::new(FileTable::default()),
            next_fd: AtomicU32::new(0),
            log_file: Mutex::new(None),
            num_reads: AtomicU32::new(0),
            num_writes: AtomicU32::new(0),
        })
    }

    /// Returns the data directory.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn resolve<P: AsRef<Path>>(&self, path: P) -> PathBuf {
        self.data_dir.join(path)
    }

    pub fn is_dir<P: AsRef<Path>>(&self, path: P) -> bool {
        self.resolve(path).is_dir()
    }

    pub fn create_dir<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = self.resolve(path);
        if path.exists() {
            return Err(StrataError::FileAlreadyExists(path.display().to_string()));
        }
        fs::create_dir_all(&path)?;
        Ok(())
    }

    /// Removes a directory and everything below it.
    pub fn destroy_dir<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = self.resolve(path);
        if !path.is_dir() {
            return Err(StrataError::FileNotFound(path.display().to_string()));
        }
        fs::remove_dir_all(&path)?;
        Ok(())
    }

    pub fn is_file<P: AsRef<Path>>(&self, path: P) -> bool {
        self.resolve(path).is_file()
    }

    /// Returns the size in bytes of the file at `path`, or None if it
    /// doesn't exist.
    pub fn file_size<P: AsRef<Path>>(&self, path: P) -> Option<u64> {
        fs::metadata(self.resolve(path)).ok().map(|m| m.len())
    }

    /// Creates an empty file. Fails if the file already exists.
    pub fn create_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = self.resolve(path);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => {
                debug!("created file {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                Err(StrataError::FileAlreadyExists(path.display().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Deletes a file. The file must exist and must not be open.
    pub fn destroy_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = self.resolve(path);
        if self.files.read().by_path.contains_key(&path) {
            return Err(StrataError::FileAlreadyOpen(path.display().to_string()));
        }
        if !path.is_file() {
            return Err(StrataError::FileNotFound(path.display().to_string()));
        }
        fs::remove_file(&path)?;
        debug!("destroyed file {}", path.display());
        Ok(())
    }

    /// Opens an existing file and returns its handle. Opening a file that is
    /// already open returns the existing handle.
    pub fn open_file<P: AsRef<Path>>(&self, path: P) -> Result<FileId> {
        let path = self.resolve(path);
        let mut files = self.files.write();

        if let Some(&fd) = files.by_path.get(&path) {
            return Ok(fd);
        }
        if !path.is_file() {
            return Err(StrataError::FileNotFound(path.display().to_string()));
        }

        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let file_size = file.metadata()?.len();
        let num_pages = file_size.div_ceil(PAGE_SIZE as u64) as PageNo;

        let fd = FileId::new(self.next_fd.fetch_add(1, Ordering::SeqCst));
        files.by_fd.insert(
            fd,
            Arc::new(OpenFile {
                path: path.clone(),
                file: Mutex::new(file),
                next_page_no: AtomicU32::new(num_pages),
            }),
        );
        files.by_path.insert(path.clone(), fd);

        info!("opened {} as {} ({} pages)", path.display(), fd, num_pages);
        Ok(fd)
    }

    /// Closes an open file. Fails with FileNotOpen for an unknown handle.
    pub fn close_file(&self, fd: FileId) -> Result<()> {
        let open_file = {
            let mut files = self.files.write();
            let open_file = files
                .by_fd
                .remove(&fd)
                .ok_or(StrataError::FileNotOpen(fd))?;
            files.by_path.remove(&open_file.path);
            open_file
        };

        open_file.file.lock().sync_all()?;
        info!("closed {}", fd);
        Ok(())
    }

    /// Returns the path of an open file.
    pub fn file_name(&self, fd: FileId) -> Result<PathBuf> {
        Ok(self.get_file(fd)?.path.clone())
    }

    /// Returns the handle of the file at `path`, opening it if needed.
    pub fn file_id<P: AsRef<Path>>(&self, path: P) -> Result<FileId> {
        if let Some(&fd) = self.files.read().by_path.get(&self.resolve(&path)) {
            return Ok(fd);
        }
        self.open_file(path)
    }

    fn get_file(&self, fd: FileId) -> Result<Arc<OpenFile>> {
        self.files
            .read()
            .by_fd
            .get(&fd)
            .cloned()
            .ok_or(StrataError::FileNotOpen(fd))
    }

    /// Reads a page from disk into the provided buffer.
    /// The buffer must be exactly PAGE_SIZE bytes. A short read is an error.
    pub fn read_page(&self, page_id: PageId, data: &mut [u8]) -> Result<()> {
        assert_eq!(data.len(), PAGE_SIZE, "Buffer must be PAGE_SIZE bytes");

        let open_file = self.get_file(page_id.fd)?;
        let mut file = open_file.file.lock();
        file.seek(SeekFrom::Start(page_id.file_offset(PAGE_SIZE)))?;
        file.read_exact(data)?;

        self.num_reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Writes up to PAGE_SIZE bytes at the start of the given page.
    pub fn write_page(&self, page_id: PageId, data: &[u8]) -> Result<()> {
        assert!(data.len() <= PAGE_SIZE, "Cannot write more than PAGE_SIZE bytes");

        let open_file = self.get_file(page_id.fd)?;
        let mut file = open_file.file.lock();
        file.seek(SeekFrom::Start(page_id.file_offset(PAGE_SIZE)))?;
        file.write_all(data)?;

        self.num_writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Returns the next unused page number of `fd`. Nothing is written; the
    /// page reaches the file the first time it is flushed.
    pub fn allocate_page(&self, fd: FileId) -> Result<PageId> {
        let open_file = self.get_file(fd)?;
        let page_no = open_file.next_page_no.fetch_add(1, Ordering::SeqCst);
        Ok(PageId::new(fd, page_no))
    }

    /// Deallocates a page. Page numbers are never reused, so this is a
    /// no-op: the index relies on a page number keeping its identity.
    /// Reclaiming space needs a free-page bitmap in the file header.
    pub fn deallocate_page(&self, _page_id: PageId) -> Result<()> {
        Ok(())
    }

    /// Returns the number of pages allocated in `fd`.
    pub fn num_pages(&self, fd: FileId) -> Result<u32> {
        Ok(self.get_file(fd)?.next_page_no.load(Ordering::SeqCst))
    }

    /// Returns whether the page's full PAGE_SIZE bytes exist in the file.
    /// Allocated pages that were never flushed are not on disk.
    pub fn is_page_on_disk(&self, page_id: PageId) -> Result<bool> {
        let open_file = self.get_file(page_id.fd)?;
        let file_size = open_file.file.lock().metadata()?.len();
        Ok(page_id.file_offset(PAGE_SIZE) + PAGE_SIZE as u64 <= file_size)
    }

    /// Flushes any OS-buffered writes of `fd` to durable storage.
    pub fn sync(&self, fd: FileId) -> Result<()> {
        self.get_file(fd)?.file.lock().sync_all()?;
        Ok(())
    }

    /// Runs `f` while holding the handle lock of `fd`, which stalls every
    /// read and write of that file until `f` returns.
    #[cfg(test)]
    pub(crate) fn with_file_locked<T>(&self, fd: FileId, f: impl FnOnce() -> T) -> Result<T> {
        let open_file = self.get_file(fd)?;
        let _file = open_file.file.lock();
        Ok(f())
    }

    /// Syncs every open file and the log.
    pub fn sync_all(&self) -> Result<()> {
        let files: Vec<_> = self.files.read().by_fd.values().cloned().collect();
        for open_file in files {
            open_file.file.lock().sync_all()?;
        }
        if let Some(log) = self.log_file.lock().as_ref() {
            log.sync_all()?;
        }
        Ok(())
    }

    /// Returns the number of page reads performed.
    pub fn get_num_reads(&self) -> u32 {
        self.num_reads.load(Ordering::Relaxed)
    }

    /// Returns the number of page writes performed.
    pub fn get_num_writes(&self) -> u32 {
        self.num_writes.load(Ordering::Relaxed)
    }

    fn with_log<T>(&self, f: impl FnOnce(&mut File) -> Result<T>) -> Result<T> {
        let mut log = self.log_file.lock();
        if let Some(file) = log.as_mut() {
            return f(file);
        }

        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(self.data_dir.join(LOG_FILE_NAME))?;
        f(log.insert(file))
    }

    /// Appends `data` at the end of the log file.
    pub fn write_log(&self, data: &[u8]) -> Result<()> {
        self.with_log(|file| {
            file.seek(SeekFrom::End(0))?;
            file.write_all(data)?;
            Ok(())
        })
    }

    /// Reads log bytes starting at `prev_log_end + offset`.
    ///
    /// Returns None when that position is at or past the end of the log,
    /// otherwise the number of bytes read, which is less than `data.len()`
    /// when the log ends first.
    pub fn read_log(&self, data: &mut [u8], offset: u64, prev_log_end: u64) -> Result<Option<usize>> {
        self.with_log(|file| {
            let start = prev_log_end + offset;
            let file_size = file.metadata()?.len();
            if start >= file_size {
                return Ok(None);
            }

            let len = data.len().min((file_size - start) as usize);
            file.seek(SeekFrom::Start(start))?;
            file.read_exact(&mut data[..len])?;
            Ok(Some(len))
        })
    }
}

impl Drop for DiskManager {
    fn drop(&mut self) {
        let files = self.files.get_mut();
        for open_file in files.by_fd.values() {
            let _ = open_file.file.lock().sync_all();
        }
        if let Some(log) = self.log_file.get_mut() {
            let _ = log.sync_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_dm() -> (DiskManager, FileId, TempDir) {
        let dir = TempDir::new().unwrap();
        let dm = DiskManager::new(dir.path()).unwrap();
        dm.create_file("test.db").unwrap();
        let fd = dm.open_file("test.db").unwrap();
        (dm, fd, dir)
    }

    #[test]
    fn test_disk_manager_new_file() {
        let (dm, fd, _dir) = create_dm();
        assert_eq!(dm.num_pages(fd).unwrap(), 0);
        assert_eq!(dm.get_num_writes(), 0);
    }

    #[test]
    fn test_disk_manager_allocate_page() {
        let (dm, fd, _dir) = create_dm();

        let page_id = dm.allocate_page(fd).unwrap();
        assert_eq!(page_id, PageId::new(fd, 0));
        assert_eq!(dm.num_pages(fd).unwrap(), 1);

        let page_id2 = dm.allocate_page(fd).unwrap();
        assert_eq!(page_id2, PageId::new(fd, 1));
        assert_eq!(dm.num_pages(fd).unwrap(), 2);

        // Allocation alone never touches the file
        assert!(!dm.is_page_on_disk(page_id).unwrap());
    }

    #[test]
    fn test_disk_manager_read_write() {
        let (dm, fd, _dir) = create_dm();

        let page_id = dm.allocate_page(fd).unwrap();

        let mut write_data = [0u8; PAGE_SIZE];
        write_data[0] = 42;
        write_data[100] = 255;
        write_data[PAGE_SIZE - 1] = 128;
        dm.write_page(page_id, &write_data).unwrap();
        assert!(dm.is_page_on_disk(page_id).unwrap());

        let mut read_data = [0u8; PAGE_SIZE];
        dm.read_page(page_id, &mut read_data).unwrap();

        assert_eq!(read_data[0], 42);
        assert_eq!(read_data[100], 255);
        assert_eq!(read_data[PAGE_SIZE - 1], 128);
    }

    #[test]
    fn test_disk_manager_short_read_fails() {
        let (dm, fd, _dir) = create_dm();
        let page_id = dm.allocate_page(fd).unwrap();

        let mut data = [0u8; PAGE_SIZE];
        assert!(matches!(
            dm.read_page(page_id, &mut data),
            Err(StrataError::Io(_))
        ));
    }

    #[test]
    fn test_disk_manager_persistence() {
        let dir = TempDir::new().unwrap();

        {
            let dm = DiskManager::new(dir.path()).unwrap();
            dm.create_file("test.db").unwrap();
            let fd = dm.open_file("test.db").unwrap();
            let page_id = dm.allocate_page(fd).unwrap();
            let mut data = [0u8; PAGE_SIZE];
            data[0] = 123;
            dm.write_page(page_id, &data).unwrap();
            dm.close_file(fd).unwrap();
        }

        {
            let dm = DiskManager::new(dir.path()).unwrap();
            let fd = dm.open_file("test.db").unwrap();
            // The allocation counter is rebuilt from the file length
            assert_eq!(dm.num_pages(fd).unwrap(), 1);

            let mut data = [0u8; PAGE_SIZE];
            dm.read_page(PageId::new(fd, 0), &mut data).unwrap();
            assert_eq!(data[0], 123);
            assert_eq!(dm.allocate_page(fd).unwrap().page_no, 1);
        }
    }

    #[test]
    fn test_disk_manager_partial_write() {
        let (dm, fd, _dir) = create_dm();
        let page_id = dm.allocate_page(fd).unwrap();

        dm.write_page(page_id, b"header").unwrap();
        assert_eq!(dm.file_size("test.db"), Some(6));
        assert!(!dm.is_page_on_disk(page_id).unwrap());
    }
}
