//! Device statistics - lock-free counters updated on the service path

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of the device counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeviceStats {
    pub reads: u64,
    pub writes: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    /// Requests shortened at the end of the device.
    pub clamped: u64,
    /// Requests refused in strict mode.
    pub rejected: u64,
    /// Requests that found no buffer (device torn down).
    pub failed: u64,
    pub opens: u64,
    pub releases: u64,
    pub ioctls: u64,
}

impl DeviceStats {
    /// Total requests seen by the servicer.
    pub fn total_requests(&self) -> u64 {
        self.reads + self.writes + self.rejected + self.failed
    }
}

#[derive(Default)]
pub(crate) struct RuntimeStats {
    reads: AtomicU64,
    writes: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    clamped: AtomicU64,
    rejected: AtomicU64,
    failed: AtomicU64,
    opens: AtomicU64,
    releases: AtomicU64,
    ioctls: AtomicU64,
}

impl RuntimeStats {
    pub fn record_read(&self, bytes: u64) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_write(&self, bytes: u64) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_clamped(&self) {
        self.clamped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_open(&self) {
        self.opens.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_release(&self) {
        self.releases.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ioctl(&self) {
        self.ioctls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DeviceStats {
        DeviceStats {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            clamped: self.clamped.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            opens: self.opens.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            ioctls: self.ioctls.load(Ordering::Relaxed),
        }
    }
}
