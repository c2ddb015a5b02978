//! Device lifecycle - create and destroy a memory disk on a host.
//!
//! `MemDisk::create` acquires host resources in order and arms a rollback
//! guard for each one; a failure at any step drops the guards, releasing
//! what was acquired in reverse. `destroy` runs the same releases for a
//! fully published disk.

use crate::config::DeviceConfig;
use crate::device::Device;
use crate::error::{Error, Result};
use crate::host::{BlockHost, DiskSpec, Major, QueueId, QueueParams};
use crate::ops::BlockOps;
use crate::stats::DeviceStats;
use std::io;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Undo action for one acquired resource; runs on drop unless disarmed.
struct Rollback<'a> {
    step: &'static str,
    undo: Option<Box<dyn FnOnce() -> io::Result<()> + 'a>>,
}

impl<'a> Rollback<'a> {
    fn new(step: &'static str, undo: impl FnOnce() -> io::Result<()> + 'a) -> Self {
        Self {
            step,
            undo: Some(Box::new(undo)),
        }
    }

    fn disarm(mut self) {
        self.undo = None;
    }
}

impl Drop for Rollback<'_> {
    fn drop(&mut self) {
        if let Some(undo) = self.undo.take() {
            match undo() {
                Ok(()) => info!(step = self.step, "Rolled back"),
                Err(e) => warn!(step = self.step, error = %e, "Rollback step failed"),
            }
        }
    }
}

/// A memory disk published on a host.
pub struct MemDisk<H: BlockHost> {
    host: Arc<H>,
    device: Arc<Device>,
    name: String,
    major: Option<Major>,
    queue: Option<QueueId>,
    disk: Option<DiskSpec>,
    destroyed: bool,
}

impl<H: BlockHost> MemDisk<H> {
    /// Register, allocate, build the queue and publish the disk.
    ///
    /// On error nothing stays acquired on the host.
    pub fn create(host: Arc<H>, config: &DeviceConfig) -> Result<Self> {
        config.validate()?;

        let h: &H = &host;
        let name = config.name.as_str();

        let major = h.register(name).map_err(|source| Error::Registration {
            name: name.to_string(),
            source,
        })?;
        info!(device = name, %major, "Registered block device");
        let registration = Rollback::new("unregister", move || h.unregister(major, name));

        let device = Arc::new(Device::new(config)?);
        let release = {
            let device = Arc::clone(&device);
            Rollback::new("release buffer", move || {
                device.release_buffer();
                Ok(())
            })
        };

        let params = QueueParams::from_config(config);
        let ops: Arc<dyn BlockOps> = device.clone();
        let queue = h.init_queue(ops, &params).map_err(Error::QueueInit)?;
        info!(
            device = name,
            queue = queue.0,
            nr_hw_queues = params.nr_hw_queues,
            queue_depth = params.queue_depth,
            "Dispatch queue ready"
        );
        let cleanup = Rollback::new("cleanup queue", move || h.cleanup_queue(queue));

        let spec = DiskSpec::new(name, major, device.capacity_sectors());
        h.add_disk(&spec, queue).map_err(|source| Error::Registration {
            name: name.to_string(),
            source,
        })?;
        info!(
            device = name,
            %major,
            capacity = spec.capacity_sectors,
            "Disk published"
        );

        cleanup.disarm();
        release.disarm();
        registration.disarm();

        Ok(Self {
            name: config.name.clone(),
            host,
            device,
            major: Some(major),
            queue: Some(queue),
            disk: Some(spec),
            destroyed: false,
        })
    }

    /// Unpublish, drain, free and unregister.
    ///
    /// Every step runs even if an earlier one fails; the first failure is
    /// returned. Calling again is a no-op.
    pub fn destroy(&mut self) -> Result<()> {
        if self.destroyed {
            debug!(device = %self.name, "Already destroyed");
            return Ok(());
        }
        self.destroyed = true;

        let mut first: Option<Error> = None;

        if let Some(spec) = self.disk.take() {
            match self.host.del_disk(&spec) {
                Ok(()) => info!(device = %self.name, "Disk removed"),
                Err(source) => {
                    warn!(device = %self.name, error = %source, "Failed to remove disk");
                    keep_first(
                        &mut first,
                        Error::Registration {
                            name: self.name.clone(),
                            source,
                        },
                    );
                }
            }
        }

        if let Some(queue) = self.queue.take() {
            match self.host.cleanup_queue(queue) {
                Ok(()) => info!(device = %self.name, queue = queue.0, "Queue cleaned up"),
                Err(e) => {
                    warn!(device = %self.name, error = %e, "Failed to clean up queue");
                    keep_first(&mut first, Error::QueueInit(e));
                }
            }
        }

        let freed = self.device.release_buffer();
        info!(device = %self.name, bytes = freed, "Backing buffer released");

        if let Some(major) = self.major.take() {
            match self.host.unregister(major, &self.name) {
                Ok(()) => info!(device = %self.name, %major, "Unregistered block device"),
                Err(source) => {
                    warn!(device = %self.name, error = %source, "Failed to unregister");
                    keep_first(
                        &mut first,
                        Error::Registration {
                            name: self.name.clone(),
                            source,
                        },
                    );
                }
            }
        }

        let stats = self.device.stats();
        info!(
            device = %self.name,
            requests = stats.total_requests(),
            reads = stats.reads,
            writes = stats.writes,
            bytes_read = stats.bytes_read,
            bytes_written = stats.bytes_written,
            clamped = stats.clamped,
            "Device destroyed"
        );

        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn host(&self) -> &Arc<H> {
        &self.host
    }

    /// Routing number, until unregistered.
    pub fn major(&self) -> Option<Major> {
        self.major
    }

    /// Published disk, until removed.
    pub fn disk_spec(&self) -> Option<&DiskSpec> {
        self.disk.as_ref()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn stats(&self) -> DeviceStats {
        self.device.stats()
    }
}

impl<H: BlockHost> Drop for MemDisk<H> {
    fn drop(&mut self) {
        if !self.destroyed {
            if let Err(e) = self.destroy() {
                warn!(device = %self.name, error = %e, "Teardown on drop failed");
            }
        }
    }
}

impl<H: BlockHost> std::fmt::Debug for MemDisk<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemDisk")
            .field("name", &self.name)
            .field("major", &self.major)
            .field("queue", &self.queue)
            .field("destroyed", &self.destroyed)
            .finish()
    }
}

fn keep_first(first: &mut Option<Error>, err: Error) {
    if first.is_none() {
        *first = Some(err);
    }
}
