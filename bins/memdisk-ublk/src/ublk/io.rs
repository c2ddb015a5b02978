//! ublk data plane request decoding
//!
//! Turns the per-tag descriptors the kernel writes into the mmap'd command
//! buffer into typed requests for the queue worker.

use crate::ublk::sys::*;
use memdisk_core::Direction;
use nix::libc;

/// I/O operation type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOp {
    Read,
    Write,
    Flush,
    Discard,
    WriteZeroes,
    WriteSame,
    Unknown(u8),
}

impl From<u8> for IoOp {
    fn from(op: u8) -> Self {
        match op {
            UBLK_IO_OP_READ => IoOp::Read,
            UBLK_IO_OP_WRITE => IoOp::Write,
            UBLK_IO_OP_FLUSH => IoOp::Flush,
            UBLK_IO_OP_DISCARD => IoOp::Discard,
            UBLK_IO_OP_WRITE_ZEROES => IoOp::WriteZeroes,
            UBLK_IO_OP_WRITE_SAME => IoOp::WriteSame,
            _ => IoOp::Unknown(op),
        }
    }
}

impl IoOp {
    /// Transfer direction for ops the memory disk services
    #[inline]
    pub fn direction(&self) -> Option<Direction> {
        match self {
            IoOp::Read => Some(Direction::Read),
            IoOp::Write => Some(Direction::Write),
            _ => None,
        }
    }

    /// Result for ops without a data transfer
    ///
    /// Flush succeeds since nothing is cached; everything else is refused.
    #[inline]
    pub fn dataless_result(&self) -> i32 {
        match self {
            IoOp::Flush => 0,
            _ => -libc::EOPNOTSUPP,
        }
    }
}

/// I/O request descriptor (parsed from UblkIoDesc)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoRequest {
    pub op: IoOp,
    pub start_sector: u64,
    pub nr_sectors: u32,
    pub tag: u16,
    pub queue_id: u16,
}

impl IoRequest {
    /// Parse from UblkIoDesc; the low byte of `op_flags` carries the op
    pub fn from_desc(desc: &UblkIoDesc, tag: u16, queue_id: u16) -> Self {
        Self {
            op: IoOp::from((desc.op_flags & 0xff) as u8),
            start_sector: desc.start_sector,
            nr_sectors: desc.nr_sectors,
            tag,
            queue_id,
        }
    }

    /// Byte length for this request
    #[inline]
    pub fn byte_len(&self) -> usize {
        (self.nr_sectors as usize) << SECTOR_SHIFT
    }

    /// pread/pwrite offset of this request's data
    #[inline]
    pub fn user_copy_offset(&self) -> i64 {
        ublk_user_copy_offset(self.queue_id, self.tag, 0)
    }
}
