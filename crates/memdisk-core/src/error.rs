//! Error types for memdisk-core.

use thiserror::Error;

/// Errors produced while creating, servicing or tearing down a memory disk.
#[derive(Debug, Error)]
pub enum Error {
    /// The host refused to bind the device identity or to publish the disk.
    #[error("registration of {name} failed: {source}")]
    Registration {
        /// Device name that was being registered.
        name: String,
        /// Host-reported cause.
        source: std::io::Error,
    },

    /// Memory for the control structure or backing buffer is unavailable.
    #[error("allocation of {bytes} bytes for {what} failed")]
    Allocation {
        /// What was being allocated.
        what: &'static str,
        /// Requested size in bytes (saturated on overflow).
        bytes: u64,
    },

    /// The dispatch queue could not be constructed.
    #[error("queue initialization failed: {0}")]
    QueueInit(std::io::Error),

    /// A request could not be serviced.
    #[error("I/O error: {0}")]
    Io(String),

    /// Control operation not implemented by this device.
    #[error("unsupported control operation 0x{cmd:08x}")]
    UnsupportedOperation {
        /// Command code that was rejected.
        cmd: u32,
    },

    /// Request range does not fit inside the device (strict mode).
    #[error("request at byte {pos} for {len} bytes exceeds device size {dev_size}")]
    OutOfRange {
        /// Starting byte offset.
        pos: u64,
        /// Total request length in bytes.
        len: u64,
        /// Device size in bytes.
        dev_size: u64,
    },

    /// Configuration rejected before any resource was acquired.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Convert to negative errno for host bindings.
    pub fn to_errno(&self) -> i32 {
        match self {
            Self::Registration { source, .. } => -source.raw_os_error().unwrap_or(libc::EBUSY),
            Self::Allocation { .. } => -libc::ENOMEM,
            Self::QueueInit(e) => -e.raw_os_error().unwrap_or(libc::ENOMEM),
            Self::Io(_) | Self::OutOfRange { .. } => -libc::EIO,
            Self::UnsupportedOperation { .. } => -libc::ENOTTY,
            Self::InvalidConfig(_) => -libc::EINVAL,
        }
    }

    /// Returns true if this is a resource exhaustion error.
    #[inline]
    pub fn is_resource_error(&self) -> bool {
        match self {
            Self::Allocation { .. } => true,
            Self::Registration { source, .. } | Self::QueueInit(source) => matches!(
                source.raw_os_error(),
                Some(libc::ENOMEM) | Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::EBUSY)
            ),
            _ => false,
        }
    }
}

/// Result type for memdisk operations.
pub type Result<T> = std::result::Result<T, Error>;
