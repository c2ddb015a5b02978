//! In-process block host.
//!
//! Keeps a namespace of registered names, queues and published disks in
//! memory and dispatches requests straight to the queue's [`BlockOps`].
//! Any step can be told to fail once, which is how rollback is exercised.

use crate::host::{BlockHost, DiskSpec, Major, QueueId, QueueParams};
use crate::ops::{BlockOps, OpenMode};
use crate::request::{Completion, Request};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Highest dynamic routing number; later registrations count down.
pub const FIRST_DYNAMIC_MAJOR: u32 = 254;

/// Host operation, for failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostStep {
    Register,
    Unregister,
    InitQueue,
    CleanupQueue,
    AddDisk,
    DelDisk,
}

/// Host call as recorded by the loopback host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCall {
    Register(String),
    Unregister(String),
    InitQueue(QueueId),
    CleanupQueue(QueueId),
    AddDisk(String),
    DelDisk(String),
}

struct Queue {
    ops: Arc<dyn BlockOps>,
    params: QueueParams,
}

#[derive(Default)]
struct State {
    next_major: Option<u32>,
    next_queue: u64,
    registered: HashMap<String, Major>,
    queues: HashMap<QueueId, Queue>,
    disks: HashMap<String, (DiskSpec, QueueId)>,
    failures: HashMap<HostStep, i32>,
    calls: Vec<HostCall>,
}

impl State {
    fn take_failure(&mut self, step: HostStep) -> io::Result<()> {
        match self.failures.remove(&step) {
            Some(errno) => Err(io::Error::from_raw_os_error(errno)),
            None => Ok(()),
        }
    }
}

/// Block host living entirely inside this process.
#[derive(Default)]
pub struct LoopbackHost {
    state: Mutex<State>,
    dispatches: AtomicU64,
}

impl LoopbackHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call to `step` fail with `errno`.
    pub fn fail_next(&self, step: HostStep, errno: i32) {
        self.state.lock().failures.insert(step, errno);
    }

    /// Calls made so far, oldest first.
    pub fn calls(&self) -> Vec<HostCall> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.state.lock().registered.contains_key(name)
    }

    pub fn is_published(&self, name: &str) -> bool {
        self.state.lock().disks.contains_key(name)
    }

    /// Capacity in sectors of a published disk.
    pub fn capacity_of(&self, name: &str) -> Option<u64> {
        self.state
            .lock()
            .disks
            .get(name)
            .map(|(spec, _)| spec.capacity_sectors)
    }

    /// Number of live queues.
    pub fn queue_count(&self) -> usize {
        self.state.lock().queues.len()
    }

    /// Requests dispatched so far.
    pub fn dispatch_count(&self) -> u64 {
        self.dispatches.load(Ordering::Relaxed)
    }

    /// Callbacks of the queue behind a published disk.
    fn ops_for(&self, name: &str) -> io::Result<(Arc<dyn BlockOps>, u32)> {
        let state = self.state.lock();
        let (_, queue) = state
            .disks
            .get(name)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENODEV))?;
        let queue = state
            .queues
            .get(queue)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENODEV))?;
        Ok((Arc::clone(&queue.ops), queue.params.max_io_bytes))
    }

    /// Hand a request to a published disk.
    ///
    /// The host lock is not held while the request is serviced, so
    /// dispatches from several threads run concurrently.
    pub fn dispatch(&self, name: &str, request: &mut Request<'_>) -> io::Result<Completion> {
        let (ops, max_io_bytes) = self.ops_for(name)?;
        if request.total_len() > max_io_bytes as u64 {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        self.dispatches.fetch_add(1, Ordering::Relaxed);
        Ok(ops.service(request))
    }

    pub fn open(&self, name: &str, mode: OpenMode) -> io::Result<()> {
        let (ops, _) = self.ops_for(name)?;
        ops.open(mode)
            .map_err(|e| io::Error::from_raw_os_error(-e.to_errno()))
    }

    pub fn release(&self, name: &str, mode: OpenMode) -> io::Result<()> {
        let (ops, _) = self.ops_for(name)?;
        ops.release(mode);
        Ok(())
    }

    pub fn ioctl(&self, name: &str, cmd: u32, arg: u64) -> io::Result<i64> {
        let (ops, _) = self.ops_for(name)?;
        ops.ioctl(cmd, arg)
            .map_err(|e| io::Error::from_raw_os_error(-e.to_errno()))
    }
}

impl BlockHost for LoopbackHost {
    fn register(&self, name: &str) -> io::Result<Major> {
        let mut state = self.state.lock();
        state.calls.push(HostCall::Register(name.to_string()));
        state.take_failure(HostStep::Register)?;

        if state.registered.contains_key(name) {
            return Err(io::Error::from_raw_os_error(libc::EBUSY));
        }
        let next = state.next_major.unwrap_or(FIRST_DYNAMIC_MAJOR);
        if next == 0 {
            return Err(io::Error::from_raw_os_error(libc::EBUSY));
        }
        state.next_major = Some(next - 1);

        let major = Major(next);
        state.registered.insert(name.to_string(), major);
        debug!(name, %major, "loopback: register");
        Ok(major)
    }

    fn unregister(&self, major: Major, name: &str) -> io::Result<()> {
        let mut state = self.state.lock();
        state.calls.push(HostCall::Unregister(name.to_string()));
        state.take_failure(HostStep::Unregister)?;

        match state.registered.get(name) {
            Some(m) if *m == major => {
                state.registered.remove(name);
                debug!(name, %major, "loopback: unregister");
                Ok(())
            }
            _ => Err(io::Error::from_raw_os_error(libc::EINVAL)),
        }
    }

    fn init_queue(&self, ops: Arc<dyn BlockOps>, params: &QueueParams) -> io::Result<QueueId> {
        let mut state = self.state.lock();
        let id = QueueId(state.next_queue);
        state.calls.push(HostCall::InitQueue(id));
        state.take_failure(HostStep::InitQueue)?;

        if params.nr_hw_queues == 0 || params.queue_depth == 0 {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        state.next_queue += 1;
        state.queues.insert(
            id,
            Queue {
                ops,
                params: params.clone(),
            },
        );
        debug!(queue = id.0, "loopback: init queue");
        Ok(id)
    }

    fn cleanup_queue(&self, queue: QueueId) -> io::Result<()> {
        let mut state = self.state.lock();
        state.calls.push(HostCall::CleanupQueue(queue));
        state.take_failure(HostStep::CleanupQueue)?;

        if state.disks.values().any(|(_, q)| *q == queue) {
            return Err(io::Error::from_raw_os_error(libc::EBUSY));
        }
        state
            .queues
            .remove(&queue)
            .map(|_| debug!(queue = queue.0, "loopback: cleanup queue"))
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))
    }

    fn add_disk(&self, spec: &DiskSpec, queue: QueueId) -> io::Result<()> {
        let mut state = self.state.lock();
        state.calls.push(HostCall::AddDisk(spec.name.clone()));
        state.take_failure(HostStep::AddDisk)?;

        if state.registered.get(&spec.name) != Some(&spec.major) {
            return Err(io::Error::from_raw_os_error(libc::ENXIO));
        }
        if !state.queues.contains_key(&queue) {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        }
        if state.disks.contains_key(&spec.name) {
            return Err(io::Error::from_raw_os_error(libc::EEXIST));
        }
        state.disks.insert(spec.name.clone(), (spec.clone(), queue));
        debug!(name = %spec.name, capacity = spec.capacity_sectors, "loopback: add disk");
        Ok(())
    }

    fn del_disk(&self, spec: &DiskSpec) -> io::Result<()> {
        let mut state = self.state.lock();
        state.calls.push(HostCall::DelDisk(spec.name.clone()));
        // A failed removal still unpublishes, as a kernel del_gendisk would.
        let failure = state.take_failure(HostStep::DelDisk);
        let removed = state.disks.remove(&spec.name);
        failure?;

        removed
            .map(|_| debug!(name = %spec.name, "loopback: del disk"))
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENODEV))
    }
}

impl std::fmt::Debug for LoopbackHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("LoopbackHost")
            .field("registered", &state.registered.len())
            .field("queues", &state.queues.len())
            .field("disks", &state.disks.len())
            .finish()
    }
}
