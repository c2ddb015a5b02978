//! Direct ublk kernel interface
//!
//! Uses only:
//! - nix::libc for mmap and errno values
//! - io-uring for control commands and the fetch/commit data path
//!
//! No libublk, no async runtime.

pub mod ctrl;
pub mod io;
pub mod queue;
pub mod shim;
pub mod sys;

pub use ctrl::{CtrlConfig, CtrlError, UblkCtrl};
pub use io::{IoOp, IoRequest};
pub use queue::{spawn_queue_workers, QueueError, QueueGeometry, QueueHandle, QueueWorker};
pub use shim::{CtrlShim, IoUringOps, QueueShim, RealKernelShim};
