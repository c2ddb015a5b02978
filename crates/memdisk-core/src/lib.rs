//! memdisk-core - a block device backed entirely by memory
//!
//! The device holds its contents in one zero-filled buffer and services
//! read/write requests dispatched by a host block layer. The host is
//! reached through the [`BlockHost`] trait; [`LoopbackHost`] is an
//! in-process implementation.
//!
//! # Example
//!
//! ```
//! use memdisk_core::{DeviceConfig, LoopbackHost, MemDisk, Request};
//! use std::sync::Arc;
//!
//! let host = Arc::new(LoopbackHost::new());
//! let mut disk = MemDisk::create(host.clone(), &DeviceConfig::new("vdisk0", 1)).unwrap();
//!
//! let data = [0xAAu8; 512];
//! let done = host.dispatch("vdisk0", &mut Request::write(0, vec![&data[..]])).unwrap();
//! assert_eq!(done.transferred, 512);
//!
//! disk.destroy().unwrap();
//! ```

pub mod buffer;
pub mod config;
pub mod device;
pub mod error;
pub mod host;
pub mod lifecycle;
pub mod loopback;
pub mod ops;
pub mod request;
pub mod stats;

pub use config::{ClampPolicy, DeviceConfig};
pub use device::Device;
pub use error::{Error, Result};
pub use host::{BlockHost, DiskSpec, Major, QueueId, QueueParams};
pub use lifecycle::MemDisk;
pub use loopback::{HostCall, HostStep, LoopbackHost};
pub use ops::{BlockOps, OpenMode};
pub use request::{Completion, Direction, Request, Segments, Status};
pub use stats::DeviceStats;

/// Logical sector size in bytes.
pub const SECTOR_SIZE: u64 = 512;

/// log2 of [`SECTOR_SIZE`].
pub const SECTOR_SHIFT: u32 = 9;

/// Default device size in MiB.
pub const DEFAULT_CAPACITY_MB: u64 = 100;
