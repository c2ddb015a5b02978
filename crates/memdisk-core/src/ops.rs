//! Callback table a host invokes on a published disk.

use crate::error::Result;
use crate::request::{Completion, Request};

/// Open mode flags passed through from the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenMode(pub u32);

impl OpenMode {
    pub const READ: OpenMode = OpenMode(1 << 0);
    pub const WRITE: OpenMode = OpenMode(1 << 1);
    pub const EXCL: OpenMode = OpenMode(1 << 7);

    #[inline]
    pub fn contains(self, other: OpenMode) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for OpenMode {
    type Output = OpenMode;

    fn bitor(self, rhs: OpenMode) -> OpenMode {
        OpenMode(self.0 | rhs.0)
    }
}

/// Block device operations.
///
/// `service` may be called concurrently from several host workers; the
/// other entry points are called from whatever context opens the device.
pub trait BlockOps: Send + Sync {
    /// Device opened by a user of the host namespace.
    fn open(&self, mode: OpenMode) -> Result<()>;

    /// Last reference for `mode` released.
    fn release(&self, mode: OpenMode);

    /// Device-specific control command.
    fn ioctl(&self, cmd: u32, arg: u64) -> Result<i64>;

    /// Service one dispatched request.
    fn service(&self, request: &mut Request<'_>) -> Completion;

    /// Capacity in sectors as currently visible to the host.
    fn capacity_sectors(&self) -> u64;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_mode_flags() {
        let mode = OpenMode::READ | OpenMode::WRITE;
        assert!(mode.contains(OpenMode::READ));
        assert!(mode.contains(OpenMode::WRITE));
        assert!(!mode.contains(OpenMode::EXCL));
        assert!(OpenMode::default().contains(OpenMode(0)));
    }
}
