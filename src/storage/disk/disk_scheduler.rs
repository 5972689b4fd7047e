use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bytes::{Bytes, BytesMut};
use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, error};

use crate::common::{PageId, Result, StrataError, PAGE_SIZE};

use super::DiskManager;

/// Capacity of the request queue
const REQUEST_QUEUE_DEPTH: usize = 128;

/// A disk I/O request. Requests own their buffers, and the worker answers on
/// the reply channel once the I/O has completed.
pub enum DiskRequest {
    Read {
        page_id: PageId,
        reply: Sender<Result<BytesMut>>,
    },
    Write {
        page_id: PageId,
        data: Bytes,
        reply: Sender<Result<()>>,
    },
}

/// DiskScheduler runs a background worker thread that processes disk I/O
/// requests. The `*_sync` entry points block the caller until the worker has
/// finished the request, so callers see the same synchronous behaviour as
/// calling the DiskManager directly.
pub struct DiskScheduler {
    /// The disk manager for actual I/O operations
    disk_manager: Arc<DiskManager>,
    /// Channel sender for queuing requests; dropped on shutdown
    request_sender: Option<Sender<DiskRequest>>,
    /// Handle to the background worker thread
    worker_handle: Option<JoinHandle<()>>,
}

impl DiskScheduler {
    /// Creates a new DiskScheduler with the given DiskManager.
    /// Spawns a background worker thread to process requests.
    pub fn new(disk_manager: Arc<DiskManager>) -> Self {
        let (sender, receiver) = bounded::<DiskRequest>(REQUEST_QUEUE_DEPTH);

        let dm_clone = Arc::clone(&disk_manager);
        let worker_handle = thread::Builder::new()
            .name("disk-scheduler".to_string())
            .spawn(move || Self::start_worker_thread(dm_clone, receiver))
            .ok();

        if worker_handle.is_none() {
            error!("failed to spawn disk scheduler worker");
        }

        Self {
            disk_manager,
            request_sender: Some(sender),
            worker_handle,
        }
    }

    /// Queues a request for the background worker.
    pub fn schedule(&self, request: DiskRequest) -> Result<()> {
        let sender = self
            .request_sender
            .as_ref()
            .ok_or_else(|| StrataError::DiskScheduler("scheduler is shut down".to_string()))?;
        if self.worker_handle.is_none() {
            return Err(StrataError::DiskScheduler("no worker thread".to_string()));
        }

        sender
            .send(request)
            .map_err(|e| StrataError::DiskScheduler(format!("Failed to schedule request: {}", e)))
    }

    /// Schedules a read request and waits for completion.
    pub fn schedule_read_sync(&self, page_id: PageId, data: &mut [u8]) -> Result<()> {
        assert_eq!(data.len(), PAGE_SIZE);

        let (reply, rx) = bounded(1);
        self.schedule(DiskRequest::Read { page_id, reply })?;

        let page = rx.recv().map_err(|e| {
            StrataError::DiskScheduler(format!("Failed to receive completion: {}", e))
        })??;
        data.copy_from_slice(&page);
        Ok(())
    }

    /// Schedules a write request and waits for completion.
    pub fn schedule_write_sync(&self, page_id: PageId, data: &[u8]) -> Result<()> {
        assert!(data.len() <= PAGE_SIZE);

        let (reply, rx) = bounded(1);
        self.schedule(DiskRequest::Write {
            page_id,
            data: Bytes::copy_from_slice(data),
            reply,
        })?;

        rx.recv().map_err(|e| {
            StrataError::DiskScheduler(format!("Failed to receive completion: {}", e))
        })?
    }

    /// The background worker thread function.
    /// Processes requests until every sender has been dropped.
    fn start_worker_thread(disk_manager: Arc<DiskManager>, receiver: Receiver<DiskRequest>) {
        for request in receiver.iter() {
            Self::process_request(&disk_manager, request);
        }
        debug!("disk scheduler worker exiting");
    }

    fn process_request(disk_manager: &DiskManager, request: DiskRequest) {
        match request {
            DiskRequest::Read { page_id, reply } => {
                let mut buf = BytesMut::zeroed(PAGE_SIZE);
                let result = disk_manager.read_page(page_id, &mut buf).map(|_| buf);
                // The requester may have given up; nothing to do then.
                let _ = reply.send(result);
            }
            DiskRequest::Write {
                page_id,
                data,
                reply,
            } => {
                let _ = reply.send(disk_manager.write_page(page_id, &data));
            }
        }
    }

    /// Returns a reference to the underlying DiskManager.
    pub fn disk_manager(&self) -> &Arc<DiskManager> {
        &self.disk_manager
    }
}

impl Drop for DiskScheduler {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain the queue and exit
        self.request_sender.take();

        if let Some(handle) = self.worker_handle.take() {
            let _ = handle.join();
        }
    }
}
