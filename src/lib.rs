//! # memdisk
//!
//! RAM-backed block device.
//!
//! This is the workspace root crate that re-exports core functionality.
//! For direct usage, depend on individual sub-crates:
//!
//! - [`memdisk-core`] - device, request servicer, lifecycle and host trait
//! - [`memdisk-ublk`] - Linux ublk binding and the `memdisk-ublk` binary

pub use memdisk_core::*;
