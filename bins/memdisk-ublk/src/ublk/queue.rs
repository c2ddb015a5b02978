//! Per-queue ublk workers
//!
//! Each hardware queue gets its own io_uring and a dedicated thread that
//! runs the fetch/commit cycle:
//!
//! ```text
//! [FETCH all tags] -> [wait CQE] -> [decode IOD] -> [service] -> [COMMIT_AND_FETCH]
//!                         ^                                             |
//!                         +---------------------------------------------+
//! ```
//!
//! Data moves in USER_COPY mode: writes are pread from the char device
//! before servicing, reads are pwritten to it afterwards. STOP_DEV aborts
//! every outstanding fetch with -ENODEV, which ends the loop.

use crate::ublk::io::{IoOp, IoRequest};
use crate::ublk::shim::{IoUringOps, MmapResult, QueueShim};
use crate::ublk::sys::*;
use memdisk_core::{BlockOps, Request};
use nix::libc;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Failed to create io_uring for queue {queue_id}: {source}")]
    IoUring { queue_id: u16, source: io::Error },

    #[error("Failed to mmap descriptors for queue {queue_id}: {source}")]
    Mmap { queue_id: u16, source: io::Error },

    #[error("io_uring submit failed on queue {queue_id}: {source}")]
    Submit { queue_id: u16, source: io::Error },

    #[error("Failed to spawn worker for queue {queue_id}: {source}")]
    Spawn { queue_id: u16, source: io::Error },

    #[error("Queue {queue_id} worker did not become ready")]
    NotReady { queue_id: u16 },
}

impl QueueError {
    pub fn queue_id(&self) -> u16 {
        match self {
            Self::IoUring { queue_id, .. }
            | Self::Mmap { queue_id, .. }
            | Self::Submit { queue_id, .. }
            | Self::Spawn { queue_id, .. }
            | Self::NotReady { queue_id } => *queue_id,
        }
    }

    /// Convert to negative errno.
    pub fn to_errno(&self) -> i32 {
        match self {
            Self::IoUring { source, .. } | Self::Mmap { source, .. } => {
                -source.raw_os_error().unwrap_or(libc::ENOMEM)
            }
            Self::Submit { source, .. } | Self::Spawn { source, .. } => {
                -source.raw_os_error().unwrap_or(libc::EIO)
            }
            Self::NotReady { .. } => -libc::ETIMEDOUT,
        }
    }
}

/// Geometry shared by every queue of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueGeometry {
    pub nr_hw_queues: u16,
    pub queue_depth: u16,
    pub max_io_bytes: u32,
}

/// A queue's mmap'd descriptor area
struct IodArea<S: QueueShim> {
    shim: Arc<S>,
    region: MmapResult,
    queue_id: u16,
    depth: u16,
}

impl<S: QueueShim> IodArea<S> {
    fn map(shim: Arc<S>, char_fd: &OwnedFd, queue_id: u16, depth: u16) -> Result<Self, QueueError> {
        let size = cmd_buf_size(depth);
        let offset = iod_mmap_offset(queue_id);
        debug!(queue_id, size, offset, "Mapping IOD buffer");
        let region = shim
            .mmap_iod_buffer(char_fd, offset, size)
            .map_err(|source| QueueError::Mmap { queue_id, source })?;
        Ok(Self {
            shim,
            region,
            queue_id,
            depth,
        })
    }

    /// Snapshot of the descriptor for `tag`, `None` for an out-of-range tag
    fn desc(&self, tag: u16) -> Option<UblkIoDesc> {
        if tag >= self.depth {
            return None;
        }
        let offset = tag as usize * std::mem::size_of::<UblkIoDesc>();
        // SAFETY: the region covers `depth` descriptors and stays mapped for
        // the lifetime of self; the kernel only rewrites a slot after the
        // tag is committed.
        Some(unsafe { std::ptr::read_volatile(self.region.ptr.add(offset) as *const UblkIoDesc) })
    }
}

impl<S: QueueShim> Drop for IodArea<S> {
    fn drop(&mut self) {
        match self.shim.munmap(&self.region) {
            Ok(()) => debug!(queue_id = self.queue_id, "IOD buffer unmapped"),
            Err(e) => warn!(queue_id = self.queue_id, error = %e, "IOD munmap failed"),
        }
    }
}

/// One queue's fetch/commit loop
pub struct QueueWorker<S: QueueShim> {
    queue_id: u16,
    depth: u16,
    shim: Arc<S>,
    char_fd: Arc<OwnedFd>,
    iod: IodArea<S>,
    ring: Box<dyn IoUringOps>,
    ops: Arc<dyn BlockOps>,
    buf: Vec<u8>,
    stop: Arc<AtomicBool>,
}

impl<S: QueueShim> QueueWorker<S> {
    pub fn new(
        shim: Arc<S>,
        char_fd: Arc<OwnedFd>,
        queue_id: u16,
        geometry: &QueueGeometry,
        ops: Arc<dyn BlockOps>,
        stop: Arc<AtomicBool>,
    ) -> Result<Self, QueueError> {
        let depth = geometry.queue_depth;
        let iod = IodArea::map(Arc::clone(&shim), &char_fd, queue_id, depth)?;
        let ring = shim
            .create_io_uring(depth as u32)
            .map_err(|source| QueueError::IoUring { queue_id, source })?;

        Ok(Self {
            queue_id,
            depth,
            shim,
            char_fd,
            iod,
            ring,
            ops,
            buf: vec![0u8; geometry.max_io_bytes as usize],
            stop,
        })
    }

    #[inline]
    fn submit_err(&self, source: io::Error) -> QueueError {
        QueueError::Submit {
            queue_id: self.queue_id,
            source,
        }
    }

    /// Run until the device stops. Returns the number of requests handled.
    ///
    /// `ready` is signalled once every tag has an outstanding fetch.
    pub fn run(mut self, ready: mpsc::Sender<u16>) -> Result<u64, QueueError> {
        let fd = self.char_fd.as_raw_fd();
        info!(queue_id = self.queue_id, depth = self.depth, "Queue worker starting I/O loop");

        for tag in 0..self.depth {
            self.ring
                .submit_fetch(fd, self.queue_id, tag)
                .map_err(|e| self.submit_err(e))?;
        }
        self.ring.submit_and_wait(0).map_err(|e| self.submit_err(e))?;
        let _ = ready.send(self.queue_id);

        let mut total_ios = 0u64;
        loop {
            if self.stop.load(Ordering::Acquire) {
                info!(queue_id = self.queue_id, total_ios, "Queue worker stopping");
                return Ok(total_ios);
            }

            match self.ring.submit_and_wait(1) {
                Ok(_) => {}
                Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                Err(e) => return Err(self.submit_err(e)),
            }

            for cqe in self.ring.get_completions() {
                let tag = cqe.tag();
                if cqe.result < 0 {
                    if cqe.result == -libc::ENODEV {
                        info!(queue_id = self.queue_id, total_ios, "Device stopped");
                        return Ok(total_ios);
                    }
                    warn!(queue_id = self.queue_id, tag, result = cqe.result, "Fetch failed");
                    self.ring
                        .submit_fetch(fd, self.queue_id, tag)
                        .map_err(|e| self.submit_err(e))?;
                    continue;
                }

                let Some(desc) = self.iod.desc(tag) else {
                    warn!(queue_id = self.queue_id, tag, "Completion for unknown tag");
                    continue;
                };
                let req = IoRequest::from_desc(&desc, tag, self.queue_id);
                let result = self.handle(&req);

                self.ring
                    .submit_commit_fetch(fd, self.queue_id, tag, result)
                    .map_err(|e| self.submit_err(e))?;
                total_ios += 1;
            }
        }
    }

    fn handle(&mut self, req: &IoRequest) -> i32 {
        if req.op.direction().is_none() {
            debug!(queue_id = self.queue_id, tag = req.tag, op = ?req.op, "Dataless op");
            return req.op.dataless_result();
        }

        let len = req.byte_len();
        if len > self.buf.len() {
            warn!(
                queue_id = self.queue_id,
                tag = req.tag,
                len,
                max = self.buf.len(),
                "Request exceeds max I/O size"
            );
            return -libc::EINVAL;
        }

        match req.op {
            IoOp::Read => self.handle_read(req, len),
            _ => self.handle_write(req, len),
        }
    }

    /// Service into the staging buffer, then pwrite it for the kernel
    fn handle_read(&mut self, req: &IoRequest, len: usize) -> i32 {
        let completion = self
            .ops
            .service(&mut Request::read(req.start_sector, vec![&mut self.buf[..len]]));
        if !completion.is_ok() {
            return completion.to_kernel_result();
        }

        let n = completion.transferred as usize;
        if n == 0 {
            return 0;
        }
        match self.shim.pwrite(&self.char_fd, &self.buf[..n], req.user_copy_offset()) {
            Ok(written) => {
                if written < n {
                    warn!(
                        queue_id = self.queue_id,
                        tag = req.tag,
                        written,
                        len = n,
                        "Short read copy-out"
                    );
                }
                written as i32
            }
            Err(e) => {
                warn!(queue_id = self.queue_id, tag = req.tag, error = %e, "Read copy-out failed");
                -e.raw_os_error().unwrap_or(libc::EIO)
            }
        }
    }

    /// pread the payload from the kernel, then service it
    fn handle_write(&mut self, req: &IoRequest, len: usize) -> i32 {
        let n = match self
            .shim
            .pread(&self.char_fd, &mut self.buf[..len], req.user_copy_offset())
        {
            Ok(n) => n,
            Err(e) => {
                warn!(queue_id = self.queue_id, tag = req.tag, error = %e, "Write copy-in failed");
                return -e.raw_os_error().unwrap_or(libc::EIO);
            }
        };

        self.ops
            .service(&mut Request::write(req.start_sector, vec![&self.buf[..n]]))
            .to_kernel_result()
    }
}

/// Running worker thread
#[derive(Debug)]
pub struct QueueHandle {
    queue_id: u16,
    thread: JoinHandle<Result<u64, QueueError>>,
}

impl QueueHandle {
    pub fn queue_id(&self) -> u16 {
        self.queue_id
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Wait for the worker to exit
    pub fn join(self) -> Result<u64, QueueError> {
        match self.thread.join() {
            Ok(result) => result,
            Err(_) => Err(QueueError::Submit {
                queue_id: self.queue_id,
                source: io::Error::other("queue worker panicked"),
            }),
        }
    }
}

/// Spawn one worker per queue and wait until all of them fetched their tags
///
/// On error the workers already running are returned alongside it; they
/// exit once the device is stopped.
pub fn spawn_queue_workers<S: QueueShim + 'static>(
    shim: &Arc<S>,
    char_fd: &Arc<OwnedFd>,
    geometry: &QueueGeometry,
    ops: &Arc<dyn BlockOps>,
    stop: &Arc<AtomicBool>,
    ready_timeout: Duration,
) -> Result<Vec<QueueHandle>, (QueueError, Vec<QueueHandle>)> {
    let (tx, rx) = mpsc::channel();
    let mut handles = Vec::with_capacity(geometry.nr_hw_queues as usize);

    for queue_id in 0..geometry.nr_hw_queues {
        let worker = match QueueWorker::new(
            Arc::clone(shim),
            Arc::clone(char_fd),
            queue_id,
            geometry,
            Arc::clone(ops),
            Arc::clone(stop),
        ) {
            Ok(w) => w,
            Err(e) => return Err((e, handles)),
        };

        let ready = tx.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("memdisk-q{queue_id}"))
            .spawn(move || worker.run(ready));
        match spawned {
            Ok(thread) => handles.push(QueueHandle { queue_id, thread }),
            Err(source) => return Err((QueueError::Spawn { queue_id, source }, handles)),
        }
    }
    drop(tx);

    for _ in 0..geometry.nr_hw_queues {
        match rx.recv_timeout(ready_timeout) {
            Ok(queue_id) => debug!(queue_id, "Queue ready"),
            Err(_) => {
                let queue_id = handles
                    .iter()
                    .find(|h| h.is_finished())
                    .map_or(0, |h| h.queue_id);
                return Err((QueueError::NotReady { queue_id }, handles));
            }
        }
    }

    info!(nr_hw_queues = geometry.nr_hw_queues, "All queues ready");
    Ok(handles)
}
