//! ublk-backed block host
//!
//! Maps the [`BlockHost`] steps onto ublk control commands:
//!
//! | BlockHost     | ublk                                        |
//! |---------------|---------------------------------------------|
//! | register      | ADD_DEV                                     |
//! | init_queue    | open /dev/ublkcN, spawn workers, FETCH tags |
//! | add_disk      | SET_PARAMS + START_DEV                      |
//! | del_disk      | STOP_DEV                                    |
//! | cleanup_queue | join workers (after STOP_DEV aborts fetches)|
//! | unregister    | DEL_DEV                                     |
//!
//! One host drives one device. Open, release and ioctl are handled by the
//! kernel's ublk driver and never reach userspace.

use crate::ublk::ctrl::{CtrlConfig, CtrlError, UblkCtrl};
use crate::ublk::queue::{spawn_queue_workers, QueueError, QueueGeometry, QueueHandle};
use crate::ublk::shim::{CtrlShim, QueueShim};
use crate::ublk::sys::{UBLK_F_CMD_IOCTL_ENCODE, UBLK_F_USER_COPY, UBLK_MAX_QUEUE_DEPTH};
use memdisk_core::{BlockHost, BlockOps, DiskSpec, Major, QueueId, QueueParams};
use nix::libc;
use parking_lot::Mutex;
use std::io;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long `init_queue` waits for every queue to fetch its tags
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(5);

/// Device shape requested with ADD_DEV
#[derive(Debug, Clone)]
pub struct UblkHostConfig {
    /// Requested device id, `None` lets the kernel pick
    pub dev_id: Option<u32>,
    pub params: QueueParams,
    pub ready_timeout: Duration,
}

impl Default for UblkHostConfig {
    fn default() -> Self {
        Self {
            dev_id: None,
            params: QueueParams::default(),
            ready_timeout: DEFAULT_READY_TIMEOUT,
        }
    }
}

fn errno(e: i32) -> io::Error {
    io::Error::from_raw_os_error(e)
}

fn ctrl_err(e: CtrlError) -> io::Error {
    warn!(error = %e, "ublk control command failed");
    errno(-e.to_errno())
}

fn queue_err(e: QueueError) -> io::Error {
    warn!(error = %e, "ublk queue setup failed");
    errno(-e.to_errno())
}

struct RunningQueues {
    id: QueueId,
    stop: Arc<AtomicBool>,
    handles: Vec<QueueHandle>,
    _char_fd: Arc<OwnedFd>,
}

struct Registered<S: CtrlShim> {
    name: String,
    ctrl: UblkCtrl<S>,
    queues: Option<RunningQueues>,
    started: bool,
    /// STOP_DEV issued since the workers were spawned
    stopped: bool,
}

impl<S: CtrlShim> Registered<S> {
    fn major(&self) -> Major {
        Major(self.ctrl.dev_id() as u32)
    }

    /// Stop the device if needed and join every worker
    fn shutdown_queues(&mut self, queues: RunningQueues) -> io::Result<u64> {
        queues.stop.store(true, Ordering::Release);
        if !self.stopped {
            // Aborts the outstanding fetches so the workers wake up.
            if let Err(e) = self.ctrl.stop() {
                warn!(dev_id = self.ctrl.dev_id(), error = %e, "STOP_DEV before join failed");
            }
            self.stopped = true;
        }

        let mut total = 0u64;
        let mut first: Option<io::Error> = None;
        for handle in queues.handles {
            let queue_id = handle.queue_id();
            match handle.join() {
                Ok(ios) => {
                    debug!(queue_id, ios, "Queue worker joined");
                    total += ios;
                }
                Err(e) => {
                    let e = queue_err(e);
                    first.get_or_insert(e);
                }
            }
        }
        match first {
            Some(e) => Err(e),
            None => Ok(total),
        }
    }
}

/// [`BlockHost`] backed by the Linux ublk driver
pub struct UblkHost<S: CtrlShim + QueueShim + 'static> {
    shim: Arc<S>,
    config: UblkHostConfig,
    state: Mutex<Option<Registered<S>>>,
}

impl<S: CtrlShim + QueueShim + 'static> UblkHost<S> {
    pub fn new(shim: Arc<S>, config: UblkHostConfig) -> Self {
        Self {
            shim,
            config,
            state: Mutex::new(None),
        }
    }

    /// /dev/ublkbN of the registered device
    pub fn block_dev_path(&self) -> Option<String> {
        self.state.lock().as_ref().map(|r| r.ctrl.block_dev_path())
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().as_ref().is_some_and(|r| r.started)
    }

    fn geometry(&self, params: &QueueParams) -> QueueGeometry {
        QueueGeometry {
            nr_hw_queues: params.nr_hw_queues,
            queue_depth: params.queue_depth,
            max_io_bytes: params.max_io_bytes,
        }
    }
}

impl<S: CtrlShim + QueueShim + 'static> BlockHost for UblkHost<S> {
    fn register(&self, name: &str) -> io::Result<Major> {
        let mut state = self.state.lock();
        if let Some(existing) = state.as_ref() {
            warn!(device = name, existing = %existing.name, "Host already drives a device");
            return Err(errno(libc::EBUSY));
        }

        let params = &self.config.params;
        if params.queue_depth == 0 || params.queue_depth > UBLK_MAX_QUEUE_DEPTH {
            return Err(errno(libc::EINVAL));
        }
        let ctrl_config = CtrlConfig {
            dev_id: self.config.dev_id,
            nr_hw_queues: params.nr_hw_queues,
            queue_depth: params.queue_depth,
            max_io_buf_bytes: params.max_io_bytes,
            flags: UBLK_F_USER_COPY | UBLK_F_CMD_IOCTL_ENCODE,
        };
        let ctrl = UblkCtrl::add(Arc::clone(&self.shim), &ctrl_config).map_err(ctrl_err)?;

        let registered = Registered {
            name: name.to_string(),
            ctrl,
            queues: None,
            started: false,
            stopped: false,
        };
        let major = registered.major();
        info!(device = name, dev_id = major.0, "ublk device added");
        *state = Some(registered);
        Ok(major)
    }

    fn unregister(&self, major: Major, name: &str) -> io::Result<()> {
        let mut state = self.state.lock();
        match state.as_ref() {
            Some(r) if r.major() == major && r.name == name => {}
            _ => return Err(errno(libc::EINVAL)),
        }
        if state.as_ref().is_some_and(|r| r.queues.is_some()) {
            return Err(errno(libc::EBUSY));
        }

        let Some(mut registered) = state.take() else {
            return Err(errno(libc::EINVAL));
        };
        registered.ctrl.delete().map_err(ctrl_err)?;
        info!(device = name, dev_id = major.0, "ublk device deleted");
        Ok(())
    }

    fn init_queue(&self, ops: Arc<dyn BlockOps>, params: &QueueParams) -> io::Result<QueueId> {
        let mut state = self.state.lock();
        let registered = state.as_mut().ok_or_else(|| errno(libc::ENODEV))?;
        if registered.queues.is_some() {
            return Err(errno(libc::EBUSY));
        }

        let info = registered.ctrl.dev_info();
        if params.nr_hw_queues != info.nr_hw_queues
            || params.queue_depth != info.queue_depth
            || params.max_io_bytes > info.max_io_buf_bytes
        {
            warn!(
                requested_queues = params.nr_hw_queues,
                requested_depth = params.queue_depth,
                device_queues = info.nr_hw_queues,
                device_depth = info.queue_depth,
                "Queue shape does not match the added device"
            );
            return Err(errno(libc::EINVAL));
        }

        let char_fd = Arc::new(registered.ctrl.open_char_dev().map_err(ctrl_err)?);
        let stop = Arc::new(AtomicBool::new(false));
        let geometry = self.geometry(params);
        registered.stopped = false;

        match spawn_queue_workers(
            &self.shim,
            &char_fd,
            &geometry,
            &ops,
            &stop,
            self.config.ready_timeout,
        ) {
            Ok(handles) => {
                let id = QueueId(registered.ctrl.dev_id() as u64);
                registered.queues = Some(RunningQueues {
                    id,
                    stop,
                    handles,
                    _char_fd: char_fd,
                });
                Ok(id)
            }
            Err((e, running)) => {
                if !running.is_empty() {
                    let partial = RunningQueues {
                        id: QueueId(registered.ctrl.dev_id() as u64),
                        stop,
                        handles: running,
                        _char_fd: char_fd,
                    };
                    if let Err(e) = registered.shutdown_queues(partial) {
                        warn!(error = %e, "Failed to join partially started queues");
                    }
                }
                Err(queue_err(e))
            }
        }
    }

    fn cleanup_queue(&self, queue: QueueId) -> io::Result<()> {
        let mut state = self.state.lock();
        let registered = state.as_mut().ok_or_else(|| errno(libc::ENOENT))?;
        match registered.queues.as_ref() {
            Some(q) if q.id == queue => {}
            _ => return Err(errno(libc::ENOENT)),
        }
        if registered.started {
            return Err(errno(libc::EBUSY));
        }

        let Some(queues) = registered.queues.take() else {
            return Err(errno(libc::ENOENT));
        };
        let total = registered.shutdown_queues(queues)?;
        info!(dev_id = registered.ctrl.dev_id(), total_ios = total, "Queues drained");
        Ok(())
    }

    fn add_disk(&self, spec: &DiskSpec, queue: QueueId) -> io::Result<()> {
        let mut state = self.state.lock();
        let registered = match state.as_mut() {
            Some(r) if r.name == spec.name && r.major() == spec.major => r,
            _ => return Err(errno(libc::ENXIO)),
        };
        match registered.queues.as_ref() {
            Some(q) if q.id == queue => {}
            _ => return Err(errno(libc::ENOENT)),
        }
        if registered.started {
            return Err(errno(libc::EEXIST));
        }

        registered
            .ctrl
            .set_params(spec.capacity_sectors)
            .map_err(ctrl_err)?;
        registered.ctrl.start().map_err(ctrl_err)?;
        registered.started = true;

        info!(
            device = %spec.name,
            path = %registered.ctrl.block_dev_path(),
            capacity = spec.capacity_sectors,
            "ublk device started"
        );
        Ok(())
    }

    fn del_disk(&self, spec: &DiskSpec) -> io::Result<()> {
        let mut state = self.state.lock();
        let registered = match state.as_mut() {
            Some(r) if r.name == spec.name && r.started => r,
            _ => return Err(errno(libc::ENOENT)),
        };

        registered.started = false;
        registered.ctrl.stop().map_err(ctrl_err)?;
        registered.stopped = true;
        info!(device = %spec.name, "ublk device stopped");
        Ok(())
    }
}

impl<S: CtrlShim + QueueShim + 'static> Drop for UblkHost<S> {
    fn drop(&mut self) {
        if let Some(mut registered) = self.state.get_mut().take() {
            if let Some(queues) = registered.queues.take() {
                if let Err(e) = registered.shutdown_queues(queues) {
                    warn!(
                        dev_id = registered.ctrl.dev_id(),
                        error = %e,
                        "Queue shutdown on drop failed"
                    );
                }
            }
            // UblkCtrl deletes the device on drop.
        }
    }
}
