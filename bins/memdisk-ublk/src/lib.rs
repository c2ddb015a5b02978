//! memdisk-ublk - RAM-backed block device served through Linux ublk
//!
//! Binds the platform-independent `memdisk-core` device to the kernel's
//! ublk userspace block driver. Control commands and the per-queue
//! fetch/commit data path both run over io_uring `URING_CMD`.
//!
//! # Example
//!
//! ```no_run
//! use memdisk_core::{DeviceConfig, MemDisk, QueueParams};
//! use memdisk_ublk::host::{UblkHost, UblkHostConfig};
//! use memdisk_ublk::ublk::RealKernelShim;
//! use std::sync::Arc;
//!
//! let config = DeviceConfig::new("vdisk0", 100);
//! let host = Arc::new(UblkHost::new(
//!     Arc::new(RealKernelShim::new()),
//!     UblkHostConfig {
//!         params: QueueParams::from_config(&config),
//!         ..Default::default()
//!     },
//! ));
//!
//! let mut disk = MemDisk::create(host.clone(), &config).unwrap();
//! println!("{}", host.block_dev_path().unwrap());
//! disk.destroy().unwrap();
//! ```

pub mod host;
pub mod ublk;

pub use host::{UblkHost, UblkHostConfig};
