//! Host binding - the block layer a memory disk registers with.
//!
//! A `BlockHost` hands out routing numbers, builds dispatch queues around a
//! [`BlockOps`] implementation and publishes disks into its namespace.
//! Every method takes `&self`; hosts keep their own state behind locks.

use crate::config::DeviceConfig;
use crate::ops::BlockOps;
use crate::SECTOR_SIZE;
use std::fmt;
use std::io;
use std::sync::Arc;

/// Default largest single request, in bytes.
pub const DEFAULT_MAX_IO_BYTES: u32 = 512 * 1024;

/// Routing number assigned by the host at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Major(pub u32);

impl fmt::Display for Major {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque handle to a dispatch queue built by a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueId(pub u64);

/// Dispatch queue shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueParams {
    pub nr_hw_queues: u16,
    pub queue_depth: u16,
    pub max_io_bytes: u32,
}

impl Default for QueueParams {
    fn default() -> Self {
        Self {
            nr_hw_queues: 1,
            queue_depth: 128,
            max_io_bytes: DEFAULT_MAX_IO_BYTES,
        }
    }
}

impl QueueParams {
    pub fn from_config(config: &DeviceConfig) -> Self {
        Self {
            nr_hw_queues: config.nr_hw_queues,
            queue_depth: config.queue_depth,
            ..Default::default()
        }
    }
}

/// Everything a host needs to publish a disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskSpec {
    pub name: String,
    pub major: Major,
    pub first_minor: u32,
    pub minors: u32,
    pub capacity_sectors: u64,
    pub logical_block_size: u32,
    /// Do not scan the disk for a partition table.
    pub no_partition_scan: bool,
}

impl DiskSpec {
    /// Single-minor, unpartitioned disk with 512-byte sectors.
    pub fn new(name: impl Into<String>, major: Major, capacity_sectors: u64) -> Self {
        Self {
            name: name.into(),
            major,
            first_minor: 0,
            minors: 1,
            capacity_sectors,
            logical_block_size: SECTOR_SIZE as u32,
            no_partition_scan: true,
        }
    }

    /// Disk size in bytes.
    pub fn size_bytes(&self) -> u64 {
        self.capacity_sectors
            .saturating_mul(self.logical_block_size as u64)
    }
}

/// Block layer of the host platform.
///
/// Resources are acquired as `register`, `init_queue`, `add_disk` and must
/// be released in the opposite order.
pub trait BlockHost: Send + Sync {
    /// Bind `name` to a routing number.
    fn register(&self, name: &str) -> io::Result<Major>;

    /// Release a routing number obtained from `register`.
    fn unregister(&self, major: Major, name: &str) -> io::Result<()>;

    /// Build a dispatch queue whose requests are serviced by `ops`.
    fn init_queue(&self, ops: Arc<dyn BlockOps>, params: &QueueParams) -> io::Result<QueueId>;

    /// Tear down a queue. Returns once no request is in flight on it.
    fn cleanup_queue(&self, queue: QueueId) -> io::Result<()>;

    /// Publish a disk backed by `queue`; dispatch may begin immediately.
    fn add_disk(&self, spec: &DiskSpec, queue: QueueId) -> io::Result<()>;

    /// Remove a published disk so no new requests are dispatched.
    fn del_disk(&self, spec: &DiskSpec) -> io::Result<()>;
}

impl<H: BlockHost + ?Sized> BlockHost for Arc<H> {
    fn register(&self, name: &str) -> io::Result<Major> {
        (**self).register(name)
    }

    fn unregister(&self, major: Major, name: &str) -> io::Result<()> {
        (**self).unregister(major, name)
    }

    fn init_queue(&self, ops: Arc<dyn BlockOps>, params: &QueueParams) -> io::Result<QueueId> {
        (**self).init_queue(ops, params)
    }

    fn cleanup_queue(&self, queue: QueueId) -> io::Result<()> {
        (**self).cleanup_queue(queue)
    }

    fn add_disk(&self, spec: &DiskSpec, queue: QueueId) -> io::Result<()> {
        (**self).add_disk(spec, queue)
    }

    fn del_disk(&self, spec: &DiskSpec) -> io::Result<()> {
        (**self).del_disk(spec)
    }
}
