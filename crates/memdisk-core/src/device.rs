//! Device module - the memory disk and its request servicer
//!
//! A `Device` owns the backing buffer and implements [`BlockOps`]. Hosts
//! hold it as `Arc<dyn BlockOps>` once the dispatch queue is built.

use crate::buffer::BackingBuffer;
use crate::config::{ClampPolicy, DeviceConfig};
use crate::error::{Error, Result};
use crate::ops::{BlockOps, OpenMode};
use crate::request::{Completion, Direction, Request, Segments};
use crate::stats::{DeviceStats, RuntimeStats};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Volatile, sector-addressed storage volume.
pub struct Device {
    name: String,
    sector_size: u64,
    capacity: AtomicU64,
    policy: ClampPolicy,
    buffer: RwLock<Option<BackingBuffer>>,
    stats: RuntimeStats,
}

impl Device {
    /// Allocate the device and its zero-filled buffer.
    pub fn new(config: &DeviceConfig) -> Result<Self> {
        config.validate()?;

        let sector_size = config.sector_size as u64;
        let capacity = config.capacity_sectors();
        let bytes = capacity.checked_mul(sector_size).ok_or(Error::Allocation {
            what: "backing buffer",
            bytes: u64::MAX,
        })?;

        let buffer = BackingBuffer::zeroed(bytes)?;
        info!(device = %config.name, bytes, capacity, "Backing buffer allocated");

        Ok(Self {
            name: config.name.clone(),
            sector_size,
            capacity: AtomicU64::new(capacity),
            policy: config.clamp_policy,
            buffer: RwLock::new(Some(buffer)),
            stats: RuntimeStats::default(),
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Capacity in sectors; zero once the buffer is released.
    #[inline]
    pub fn capacity_sectors(&self) -> u64 {
        self.capacity.load(Ordering::Acquire)
    }

    /// Device size in bytes; zero once the buffer is released.
    pub fn size_bytes(&self) -> u64 {
        self.capacity.load(Ordering::Acquire) * self.sector_size
    }

    /// True while the backing buffer is present.
    pub fn is_live(&self) -> bool {
        self.buffer.read().is_some()
    }

    /// Length of the backing buffer, if present.
    pub fn buffer_len(&self) -> Option<usize> {
        self.buffer.read().as_ref().map(BackingBuffer::len)
    }

    /// Copy `len` bytes at byte offset `pos` out of the buffer.
    ///
    /// Returns `None` if the buffer is gone or the range is out of bounds.
    pub fn read_raw(&self, pos: u64, len: usize) -> Option<Vec<u8>> {
        let guard = self.buffer.read();
        let buffer = guard.as_ref()?;
        let pos = usize::try_from(pos).ok()?;
        if pos.checked_add(len)? > buffer.len() {
            return None;
        }
        let mut out = vec![0u8; len];
        buffer.read_at(pos, &mut out);
        Some(out)
    }

    pub fn stats(&self) -> DeviceStats {
        self.stats.snapshot()
    }

    /// Free the backing buffer and zero the capacity.
    ///
    /// Waits for in-flight requests holding the buffer. Returns the number
    /// of bytes released, zero if already released.
    pub(crate) fn release_buffer(&self) -> u64 {
        let mut guard = self.buffer.write();
        let freed = guard.take().map_or(0, |b| b.len() as u64);
        self.capacity.store(0, Ordering::Release);
        freed
    }
}

/// Bytes of a `len`-byte segment that fit at `pos` on a `dev_size` device.
#[inline]
fn clamp_len(pos: u64, len: u64, dev_size: u64) -> u64 {
    if pos >= dev_size {
        0
    } else {
        len.min(dev_size - pos)
    }
}

impl BlockOps for Device {
    fn open(&self, mode: OpenMode) -> Result<()> {
        self.stats.record_open();
        info!(device = %self.name, mode = mode.0, "Disk open");
        Ok(())
    }

    fn release(&self, mode: OpenMode) {
        self.stats.record_release();
        info!(device = %self.name, mode = mode.0, "Disk close");
    }

    fn ioctl(&self, cmd: u32, arg: u64) -> Result<i64> {
        self.stats.record_ioctl();
        info!(device = %self.name, arg, "ioctl cmd 0x{:08x}", cmd);
        Err(Error::UnsupportedOperation { cmd })
    }

    fn service(&self, request: &mut Request<'_>) -> Completion {
        let guard = self.buffer.read();
        let Some(buffer) = guard.as_ref() else {
            self.stats.record_failed();
            warn!(device = %self.name, "Request on released device");
            return Completion::io_error(0);
        };

        let dev_size = buffer.len() as u64;
        let start_sector = request.start_sector();
        let direction = request.direction();
        let total = request.total_len();
        // An overflowing offset lies past any device.
        let start = start_sector.checked_mul(self.sector_size).unwrap_or(u64::MAX);

        debug!(
            device = %self.name,
            start_sector,
            pos = start,
            dev_size,
            ?direction,
            segments = request.segment_count(),
            "Request start"
        );

        let fits = start <= dev_size && total <= dev_size - start;
        if !fits {
            match self.policy {
                ClampPolicy::Strict => {
                    self.stats.record_rejected();
                    let err = Error::OutOfRange {
                        pos: start,
                        len: total,
                        dev_size,
                    };
                    warn!(device = %self.name, error = %err, "Request rejected");
                    return Completion::io_error(0);
                }
                ClampPolicy::Truncate => {
                    self.stats.record_clamped();
                    warn!(
                        device = %self.name,
                        pos = start,
                        len = total,
                        dev_size,
                        "Request truncated at end of device"
                    );
                }
            }
        }

        let mut pos = start;
        let mut transferred = 0u64;
        match request.segments_mut() {
            Segments::Write(segments) => {
                for segment in segments.iter() {
                    let len = clamp_len(pos, segment.len() as u64, dev_size);
                    if len > 0 {
                        buffer.write_at(pos as usize, &segment[..len as usize]);
                    }
                    pos += len;
                    transferred += len;
                }
            }
            Segments::Read(segments) => {
                for segment in segments.iter_mut() {
                    let len = clamp_len(pos, segment.len() as u64, dev_size);
                    if len > 0 {
                        buffer.read_at(pos as usize, &mut segment[..len as usize]);
                    }
                    pos += len;
                    transferred += len;
                }
            }
        }

        match direction {
            Direction::Read => self.stats.record_read(transferred),
            Direction::Write => self.stats.record_write(transferred),
        }
        Completion::ok(transferred)
    }

    fn capacity_sectors(&self) -> u64 {
        Device::capacity_sectors(self)
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("capacity", &self.capacity_sectors())
            .field("sector_size", &self.sector_size)
            .field("policy", &self.policy)
            .finish()
    }
}
