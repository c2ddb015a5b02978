//! Raw ublk kernel interface definitions
//!
//! Mirrors Linux include/uapi/linux/ublk_cmd.h. Linux 6.0+ takes control
//! commands as io_uring URING_CMD with ioctl-encoded opcodes (UBLK_U_CMD_*).

use nix::libc;
use std::mem::size_of;

// ============================================================================
// ioctl encoding helpers
// ============================================================================

const UBLK_MAGIC: u32 = b'u' as u32;

const fn _ior(ty: u32, nr: u32, sz: usize) -> u32 {
    (2 << 30) | ((sz as u32) << 16) | (ty << 8) | nr
}

const fn _iowr(ty: u32, nr: u32, sz: usize) -> u32 {
    (3 << 30) | ((sz as u32) << 16) | (ty << 8) | nr
}

// ============================================================================
// Control Command Opcodes
// ============================================================================

const UBLK_CMD_GET_DEV_INFO: u32 = 0x02;
const UBLK_CMD_ADD_DEV: u32 = 0x04;
const UBLK_CMD_DEL_DEV: u32 = 0x05;
const UBLK_CMD_START_DEV: u32 = 0x06;
const UBLK_CMD_STOP_DEV: u32 = 0x07;
const UBLK_CMD_SET_PARAMS: u32 = 0x08;

pub const UBLK_U_CMD_GET_DEV_INFO: u32 =
    _ior(UBLK_MAGIC, UBLK_CMD_GET_DEV_INFO, size_of::<UblkCtrlCmd>());
pub const UBLK_U_CMD_ADD_DEV: u32 = _iowr(UBLK_MAGIC, UBLK_CMD_ADD_DEV, size_of::<UblkCtrlCmd>());
pub const UBLK_U_CMD_DEL_DEV: u32 = _iowr(UBLK_MAGIC, UBLK_CMD_DEL_DEV, size_of::<UblkCtrlCmd>());
pub const UBLK_U_CMD_START_DEV: u32 =
    _iowr(UBLK_MAGIC, UBLK_CMD_START_DEV, size_of::<UblkCtrlCmd>());
pub const UBLK_U_CMD_STOP_DEV: u32 = _iowr(UBLK_MAGIC, UBLK_CMD_STOP_DEV, size_of::<UblkCtrlCmd>());
pub const UBLK_U_CMD_SET_PARAMS: u32 =
    _iowr(UBLK_MAGIC, UBLK_CMD_SET_PARAMS, size_of::<UblkCtrlCmd>());

// I/O commands on /dev/ublkcN
const UBLK_IO_FETCH_REQ: u32 = 0x20;
const UBLK_IO_COMMIT_AND_FETCH_REQ: u32 = 0x21;

pub const UBLK_U_IO_FETCH_REQ: u32 = _iowr(UBLK_MAGIC, UBLK_IO_FETCH_REQ, size_of::<UblkIoCmd>());
pub const UBLK_U_IO_COMMIT_AND_FETCH_REQ: u32 = _iowr(
    UBLK_MAGIC,
    UBLK_IO_COMMIT_AND_FETCH_REQ,
    size_of::<UblkIoCmd>(),
);

// I/O operation types
pub const UBLK_IO_OP_READ: u8 = 0;
pub const UBLK_IO_OP_WRITE: u8 = 1;
pub const UBLK_IO_OP_FLUSH: u8 = 2;
pub const UBLK_IO_OP_DISCARD: u8 = 3;
pub const UBLK_IO_OP_WRITE_SAME: u8 = 4;
pub const UBLK_IO_OP_WRITE_ZEROES: u8 = 5;

// Device flags
pub const UBLK_F_CMD_IOCTL_ENCODE: u64 = 1 << 6;
pub const UBLK_F_USER_COPY: u64 = 1 << 7;

// Parameter types
pub const UBLK_PARAM_TYPE_BASIC: u32 = 1 << 0;

// ============================================================================
// Kernel Structures
// ============================================================================

/// Control command payload (32 bytes) - ublksrv_ctrl_cmd
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UblkCtrlCmd {
    pub dev_id: u32,
    pub queue_id: u16,
    pub len: u16,
    pub addr: u64,
    pub data: [u64; 1],
    pub dev_path_len: u16,
    pub pad: u16,
    pub reserved: u32,
}

impl Default for UblkCtrlCmd {
    fn default() -> Self {
        Self {
            dev_id: u32::MAX,
            queue_id: u16::MAX, // not queue-specific
            len: 0,
            addr: 0,
            data: [0; 1],
            dev_path_len: 0,
            pad: 0,
            reserved: 0,
        }
    }
}

/// Control command padded to the 80-byte URING_CMD area of a 128-byte SQE
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct UblkCtrlCmdExt {
    pub cmd: UblkCtrlCmd,
    pub padding: [u8; 48],
}

impl UblkCtrlCmdExt {
    pub fn new(cmd: UblkCtrlCmd) -> Self {
        Self {
            cmd,
            padding: [0; 48],
        }
    }

    pub fn to_bytes(self) -> [u8; 80] {
        // SAFETY: repr(C), 80 bytes, no padding holes (checked in tests).
        unsafe { std::mem::transmute(self) }
    }
}

/// I/O command (16 bytes) - ublksrv_io_cmd
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UblkIoCmd {
    pub q_id: u16,
    pub tag: u16,
    pub result: i32,
    pub addr: u64,
}

impl UblkIoCmd {
    pub fn to_bytes(self) -> [u8; 16] {
        // SAFETY: repr(C), 16 bytes, no padding holes (checked in tests).
        unsafe { std::mem::transmute(self) }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct UblkCtrlDevInfo {
    pub nr_hw_queues: u16,
    pub queue_depth: u16,
    pub state: u16,
    pub pad0: u16,
    pub max_io_buf_bytes: u32,
    pub dev_id: u32,
    pub ublksrv_pid: i32,
    pub pad1: u32,
    pub flags: u64,
    pub ublksrv_flags: u64,
    pub owner_uid: u32,
    pub owner_gid: u32,
    pub reserved1: u64,
    pub reserved2: u64,
}

/// Per-tag I/O descriptor the kernel writes into the mmap'd command buffer
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UblkIoDesc {
    pub op_flags: u32,
    pub nr_sectors: u32,
    pub start_sector: u64,
    pub addr: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct UblkParamBasic {
    pub attrs: u32,
    pub logical_bs_shift: u8,
    pub physical_bs_shift: u8,
    pub io_opt_shift: u8,
    pub io_min_shift: u8,
    pub max_sectors: u32,
    pub chunk_sectors: u32,
    pub dev_sectors: u64,
    pub virt_boundary_mask: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct UblkParamDiscard {
    pub discard_alignment: u32,
    pub discard_granularity: u32,
    pub max_discard_sectors: u32,
    pub max_write_zeroes_sectors: u32,
    pub max_discard_segments: u16,
    pub reserved0: u16,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct UblkParamDevt {
    pub char_major: u32,
    pub char_minor: u32,
    pub disk_major: u32,
    pub disk_minor: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct UblkParams {
    pub len: u32,
    pub types: u32,
    pub basic: UblkParamBasic,
    pub discard: UblkParamDiscard,
    pub devt: UblkParamDevt,
}

// ============================================================================
// Constants
// ============================================================================

pub const UBLK_CTRL_DEV: &str = "/dev/ublk-control";
pub const UBLK_CHAR_DEV_FMT: &str = "/dev/ublkc";
pub const UBLK_BLOCK_DEV_FMT: &str = "/dev/ublkb";
pub const UBLK_MAX_QUEUE_DEPTH: u16 = 4096;
pub const UBLK_MAX_IO_BUF_BYTES: u32 = 512 * 1024;
pub const SECTOR_SHIFT: u8 = 9;

// USER_COPY mode: pread/pwrite offset encoding
pub const UBLKSRV_CMD_BUF_OFFSET: i64 = 0;
pub const UBLKSRV_IO_BUF_OFFSET: u64 = 0x8000_0000;
pub const UBLK_IO_BUF_BITS: u32 = 25;
pub const UBLK_TAG_OFF: u32 = UBLK_IO_BUF_BITS;
pub const UBLK_TAG_BITS: u32 = 16;
pub const UBLK_QID_OFF: u32 = UBLK_TAG_OFF + UBLK_TAG_BITS;

/// pread/pwrite offset of a tag's data in USER_COPY mode
#[inline]
pub const fn ublk_user_copy_offset(q_id: u16, tag: u16, buf_off: u32) -> i64 {
    (UBLKSRV_IO_BUF_OFFSET
        + (buf_off as u64)
        + ((tag as u64) << UBLK_TAG_OFF)
        + ((q_id as u64) << UBLK_QID_OFF)) as i64
}

// ============================================================================
// Helper functions
// ============================================================================

fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz > 0 {
        sz as usize
    } else {
        4096
    }
}

/// Page-aligned size of a queue's descriptor area
pub fn cmd_buf_size(queue_depth: u16) -> usize {
    let size = (queue_depth as usize) * size_of::<UblkIoDesc>();
    let page = page_size();
    (size + page - 1) & !(page - 1)
}

/// mmap offset of a queue's descriptor area on /dev/ublkcN
///
/// The kernel strides queues by the area of a maximum-depth queue.
pub fn iod_mmap_offset(queue_id: u16) -> i64 {
    UBLKSRV_CMD_BUF_OFFSET + (queue_id as i64) * cmd_buf_size(UBLK_MAX_QUEUE_DEPTH) as i64
}
