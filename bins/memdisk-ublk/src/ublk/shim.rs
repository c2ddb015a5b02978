//! Kernel interaction shims for testability
//!
//! Traits abstracting the kernel operations the control and data planes
//! need, so the ublk logic can be exercised without a kernel:
//! - `CtrlShim`: /dev/ublk-control and URING_CMD control commands
//! - `QueueShim`: per-queue io_uring, descriptor mmap, user-copy pread/pwrite
//! - `RealKernelShim`: production implementation using actual syscalls
//! - `MockKernelShim` (tests): simulates a ublk driver in memory

use crate::ublk::sys::*;
use nix::libc;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

// ============================================================================
// Shim Traits
// ============================================================================

/// Result of a control command submission
#[derive(Debug, Clone)]
pub struct CtrlCmdResult {
    pub retval: i32,
    /// Device info written back by ADD_DEV / GET_DEV_INFO
    pub dev_info: Option<UblkCtrlDevInfo>,
}

/// Result of mmap operation
#[derive(Debug)]
pub struct MmapResult {
    pub ptr: *mut u8,
    pub len: usize,
}

// SAFETY: the mapping is owned by whoever holds the MmapResult; the daemon
// only reads from it.
unsafe impl Send for MmapResult {}

/// Trait abstracting kernel operations for the control plane
pub trait CtrlShim: Send + Sync {
    /// Open the ublk control device
    fn open_ctrl_device(&self) -> io::Result<OwnedFd>;

    /// Submit a control command and wait for its completion
    fn submit_ctrl_cmd(
        &self,
        ctrl_fd: &OwnedFd,
        cmd_op: u32,
        cmd: &UblkCtrlCmd,
    ) -> io::Result<CtrlCmdResult>;

    /// Open /dev/ublkcN for a device
    fn open_char_device(&self, dev_id: u32) -> io::Result<OwnedFd>;
}

/// Trait abstracting kernel operations for a queue's data plane
pub trait QueueShim: Send + Sync {
    /// Create an io_uring instance for one queue
    fn create_io_uring(&self, entries: u32) -> io::Result<Box<dyn IoUringOps>>;

    /// Map a queue's descriptor area from the char device (read-only)
    fn mmap_iod_buffer(&self, char_fd: &OwnedFd, offset: i64, size: usize)
        -> io::Result<MmapResult>;

    /// Unmap a region returned by `mmap_iod_buffer`
    fn munmap(&self, region: &MmapResult) -> io::Result<()>;

    /// Copy request data from the kernel (USER_COPY mode)
    fn pread(&self, fd: &OwnedFd, buf: &mut [u8], offset: i64) -> io::Result<usize>;

    /// Copy request data to the kernel (USER_COPY mode)
    fn pwrite(&self, fd: &OwnedFd, buf: &[u8], offset: i64) -> io::Result<usize>;
}

/// Trait abstracting io_uring operations
pub trait IoUringOps: Send {
    /// Queue a FETCH_REQ command
    fn submit_fetch(&mut self, char_fd: RawFd, queue_id: u16, tag: u16) -> io::Result<()>;

    /// Queue a COMMIT_AND_FETCH_REQ command
    fn submit_commit_fetch(
        &mut self,
        char_fd: RawFd,
        queue_id: u16,
        tag: u16,
        result: i32,
    ) -> io::Result<()>;

    /// Submit pending entries and wait for completions
    fn submit_and_wait(&mut self, wait_nr: u32) -> io::Result<u32>;

    /// Drain completed entries
    fn get_completions(&mut self) -> Vec<IoCompletion>;
}

/// Completion entry from io_uring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoCompletion {
    pub user_data: u64,
    pub result: i32,
}

impl IoCompletion {
    #[inline]
    pub fn tag(&self) -> u16 {
        self.user_data as u16
    }

    #[inline]
    pub fn queue_id(&self) -> u16 {
        (self.user_data >> 16) as u16
    }
}

#[inline]
pub fn encode_user_data(queue_id: u16, tag: u16) -> u64 {
    (tag as u64) | ((queue_id as u64) << 16)
}

// ============================================================================
// Real Kernel Shim Implementation
// ============================================================================

/// Production implementation using actual kernel syscalls
#[derive(Debug, Default, Clone, Copy)]
pub struct RealKernelShim;

impl RealKernelShim {
    pub fn new() -> Self {
        Self
    }
}

fn open_rdwr(path: &str) -> io::Result<OwnedFd> {
    let file = std::fs::OpenOptions::new().read(true).write(true).open(path)?;
    Ok(OwnedFd::from(file))
}

impl CtrlShim for RealKernelShim {
    fn open_ctrl_device(&self) -> io::Result<OwnedFd> {
        open_rdwr(UBLK_CTRL_DEV)
    }

    fn submit_ctrl_cmd(
        &self,
        ctrl_fd: &OwnedFd,
        cmd_op: u32,
        cmd: &UblkCtrlCmd,
    ) -> io::Result<CtrlCmdResult> {
        use io_uring::{cqueue, opcode, squeue, types, IoUring};
        type IoUring128 = IoUring<squeue::Entry128, cqueue::Entry>;

        let mut ring: IoUring128 = IoUring128::builder().build(4)?;

        let sqe = opcode::UringCmd80::new(types::Fd(ctrl_fd.as_raw_fd()), cmd_op)
            .cmd(UblkCtrlCmdExt::new(*cmd).to_bytes())
            .build()
            .user_data(0x100);

        // SAFETY: the SQE references only `cmd.addr`, which the caller keeps
        // alive until this function returns.
        unsafe {
            ring.submission()
                .push(&sqe)
                .map_err(|_| io::Error::other("SQ full"))?;
        }

        ring.submit_and_wait(1)?;

        let cqe = ring
            .completion()
            .next()
            .ok_or_else(|| io::Error::other("No CQE"))?;

        let result = cqe.result();
        if result < 0 {
            return Err(io::Error::from_raw_os_error(-result));
        }

        let dev_info = if cmd.addr != 0 && cmd.len as usize == std::mem::size_of::<UblkCtrlDevInfo>()
        {
            // SAFETY: the caller passed a UblkCtrlDevInfo of exactly this size.
            Some(unsafe { *(cmd.addr as *const UblkCtrlDevInfo) })
        } else {
            None
        };

        Ok(CtrlCmdResult {
            retval: result,
            dev_info,
        })
    }

    fn open_char_device(&self, dev_id: u32) -> io::Result<OwnedFd> {
        open_rdwr(&format!("{}{}", UBLK_CHAR_DEV_FMT, dev_id))
    }
}

impl QueueShim for RealKernelShim {
    fn create_io_uring(&self, entries: u32) -> io::Result<Box<dyn IoUringOps>> {
        Ok(Box::new(RealIoUring::new(entries)?))
    }

    fn mmap_iod_buffer(
        &self,
        char_fd: &OwnedFd,
        offset: i64,
        size: usize,
    ) -> io::Result<MmapResult> {
        // SAFETY: fresh read-only shared mapping of the char device.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ,
                libc::MAP_SHARED | libc::MAP_POPULATE,
                char_fd.as_raw_fd(),
                offset,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(MmapResult {
            ptr: ptr as *mut u8,
            len: size,
        })
    }

    fn munmap(&self, region: &MmapResult) -> io::Result<()> {
        // SAFETY: region came from mmap_iod_buffer and is unmapped once.
        let result = unsafe { libc::munmap(region.ptr as *mut libc::c_void, region.len) };
        if result < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn pread(&self, fd: &OwnedFd, buf: &mut [u8], offset: i64) -> io::Result<usize> {
        nix::sys::uio::pread(fd, buf, offset).map_err(io::Error::from)
    }

    fn pwrite(&self, fd: &OwnedFd, buf: &[u8], offset: i64) -> io::Result<usize> {
        nix::sys::uio::pwrite(fd, buf, offset).map_err(io::Error::from)
    }
}

/// Real io_uring implementation
struct RealIoUring {
    ring: io_uring::IoUring,
}

impl RealIoUring {
    fn new(entries: u32) -> io::Result<Self> {
        let ring = io_uring::IoUring::builder()
            .setup_coop_taskrun()
            .build(entries)?;
        Ok(Self { ring })
    }

    fn push_io_cmd(&mut self, char_fd: RawFd, cmd_op: u32, cmd: UblkIoCmd) -> io::Result<()> {
        use io_uring::{opcode, types};

        let sqe = opcode::UringCmd16::new(types::Fd(char_fd), cmd_op)
            .cmd(cmd.to_bytes())
            .build()
            .user_data(encode_user_data(cmd.q_id, cmd.tag));

        // SAFETY: USER_COPY mode, the command carries no buffer address.
        unsafe {
            self.ring
                .submission()
                .push(&sqe)
                .map_err(|_| io::Error::other("SQ full"))
        }
    }
}

impl IoUringOps for RealIoUring {
    fn submit_fetch(&mut self, char_fd: RawFd, queue_id: u16, tag: u16) -> io::Result<()> {
        let cmd = UblkIoCmd {
            q_id: queue_id,
            tag,
            result: -1,
            addr: 0,
        };
        self.push_io_cmd(char_fd, UBLK_U_IO_FETCH_REQ, cmd)
    }

    fn submit_commit_fetch(
        &mut self,
        char_fd: RawFd,
        queue_id: u16,
        tag: u16,
        result: i32,
    ) -> io::Result<()> {
        let cmd = UblkIoCmd {
            q_id: queue_id,
            tag,
            result,
            addr: 0,
        };
        self.push_io_cmd(char_fd, UBLK_U_IO_COMMIT_AND_FETCH_REQ, cmd)
    }

    fn submit_and_wait(&mut self, wait_nr: u32) -> io::Result<u32> {
        self.ring
            .submit_and_wait(wait_nr as usize)
            .map(|n| n as u32)
    }

    fn get_completions(&mut self) -> Vec<IoCompletion> {
        self.ring
            .completion()
            .map(|cqe| IoCompletion {
                user_data: cqe.user_data(),
                result: cqe.result(),
            })
            .collect()
    }
}

#[cfg(test)]
fn open_null() -> io::Result<OwnedFd> {
    open_rdwr("/dev/null")
}

// ============================================================================
// Mock Kernel Shim Implementation (for testing)
// ============================================================================

#[cfg(test)]
pub use mock::{MockCommit, MockIo, MockKernelShim};

#[cfg(test)]
mod mock {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    /// A request the simulated driver hands to a queue
    #[derive(Debug, Clone)]
    pub struct MockIo {
        pub queue_id: u16,
        pub op: u8,
        pub start_sector: u64,
        pub nr_sectors: u32,
        /// Payload offered to the daemon for writes
        pub data: Vec<u8>,
    }

    /// A COMMIT_AND_FETCH seen by the simulated driver
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MockCommit {
        pub queue_id: u16,
        pub tag: u16,
        pub result: i32,
    }

    #[derive(Default)]
    struct MockState {
        commands: Vec<(u32, UblkCtrlCmd)>,
        next_dev_id: u32,
        failures: HashMap<u32, i32>,
        fail_mmap: bool,
        params: Option<UblkParams>,
        iod_areas: HashMap<u16, usize>,
        free_tags: HashMap<u16, VecDeque<u16>>,
        pending: VecDeque<MockIo>,
        copy_in: HashMap<i64, Vec<u8>>,
        copy_out: HashMap<i64, Vec<u8>>,
        copy_out_limit: Option<usize>,
        commits: Vec<MockCommit>,
        fetches: usize,
        stopped: bool,
    }

    /// Simulated ublk driver
    #[derive(Clone, Default)]
    pub struct MockKernelShim {
        state: Arc<Mutex<MockState>>,
    }

    impl MockKernelShim {
        pub fn new() -> Self {
            Self::default()
        }

        /// Fail the next control command `cmd_op` with `errno`
        pub fn fail_next_cmd(&self, cmd_op: u32, errno: i32) {
            self.state.lock().failures.insert(cmd_op, errno);
        }

        pub fn set_fail_mmap(&self, fail: bool) {
            self.state.lock().fail_mmap = fail;
        }

        /// Cap the bytes each pwrite accepts
        pub fn set_copy_out_limit(&self, limit: Option<usize>) {
            self.state.lock().copy_out_limit = limit;
        }

        pub fn commands(&self) -> Vec<u32> {
            self.state.lock().commands.iter().map(|(op, _)| *op).collect()
        }

        pub fn last_command(&self) -> Option<UblkCtrlCmd> {
            self.state.lock().commands.last().map(|(_, cmd)| *cmd)
        }

        /// Parameters received by SET_PARAMS
        pub fn params(&self) -> Option<UblkParams> {
            self.state.lock().params
        }

        pub fn fetch_count(&self) -> usize {
            self.state.lock().fetches
        }

        pub fn mapped_queues(&self) -> usize {
            self.state.lock().iod_areas.len()
        }

        /// Queue a request for delivery to a worker
        pub fn push_io(&self, io: MockIo) {
            self.state.lock().pending.push_back(io);
        }

        pub fn commits(&self) -> Vec<MockCommit> {
            self.state.lock().commits.clone()
        }

        /// Data the daemon copied out for a read on `(queue_id, tag)`
        pub fn copied_out(&self, queue_id: u16, tag: u16) -> Option<Vec<u8>> {
            let offset = ublk_user_copy_offset(queue_id, tag, 0);
            self.state.lock().copy_out.get(&offset).cloned()
        }

        /// Wait until at least `n` commits were seen
        pub fn wait_for_commits(&self, n: usize, timeout: Duration) -> bool {
            let deadline = Instant::now() + timeout;
            while Instant::now() < deadline {
                if self.state.lock().commits.len() >= n {
                    return true;
                }
                std::thread::sleep(Duration::from_millis(1));
            }
            false
        }
    }

    impl CtrlShim for MockKernelShim {
        fn open_ctrl_device(&self) -> io::Result<OwnedFd> {
            open_null()
        }

        fn submit_ctrl_cmd(
            &self,
            _ctrl_fd: &OwnedFd,
            cmd_op: u32,
            cmd: &UblkCtrlCmd,
        ) -> io::Result<CtrlCmdResult> {
            let mut state = self.state.lock();
            state.commands.push((cmd_op, *cmd));
            if let Some(errno) = state.failures.remove(&cmd_op) {
                return Err(io::Error::from_raw_os_error(errno));
            }

            let mut result = CtrlCmdResult {
                retval: 0,
                dev_info: None,
            };
            match cmd_op {
                UBLK_U_CMD_ADD_DEV => {
                    // SAFETY: ADD_DEV always carries a UblkCtrlDevInfo.
                    let mut info = unsafe { *(cmd.addr as *const UblkCtrlDevInfo) };
                    info.dev_id = if cmd.dev_id == u32::MAX {
                        let id = state.next_dev_id;
                        state.next_dev_id += 1;
                        id
                    } else {
                        cmd.dev_id
                    };
                    result.dev_info = Some(info);
                    state.stopped = false;
                }
                UBLK_U_CMD_SET_PARAMS => {
                    // SAFETY: SET_PARAMS always carries a UblkParams.
                    state.params = Some(unsafe { *(cmd.addr as *const UblkParams) });
                }
                UBLK_U_CMD_START_DEV | UBLK_U_CMD_DEL_DEV => {}
                UBLK_U_CMD_STOP_DEV => state.stopped = true,
                _ => return Err(io::Error::from_raw_os_error(libc::EINVAL)),
            }
            Ok(result)
        }

        fn open_char_device(&self, _dev_id: u32) -> io::Result<OwnedFd> {
            open_null()
        }
    }

    impl QueueShim for MockKernelShim {
        fn create_io_uring(&self, _entries: u32) -> io::Result<Box<dyn IoUringOps>> {
            Ok(Box::new(MockIoUring {
                state: Arc::clone(&self.state),
                queue_id: 0,
                ready: Vec::new(),
            }))
        }

        fn mmap_iod_buffer(
            &self,
            _char_fd: &OwnedFd,
            offset: i64,
            size: usize,
        ) -> io::Result<MmapResult> {
            let mut state = self.state.lock();
            if state.fail_mmap {
                return Err(io::Error::from_raw_os_error(libc::ENOMEM));
            }
            let layout = std::alloc::Layout::from_size_align(size, 4096)
                .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
            // SAFETY: non-zero size checked by the layout of a queue area.
            let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
            if ptr.is_null() {
                return Err(io::Error::from_raw_os_error(libc::ENOMEM));
            }
            let queue_id = (offset / cmd_buf_size(UBLK_MAX_QUEUE_DEPTH) as i64) as u16;
            state.iod_areas.insert(queue_id, ptr as usize);
            Ok(MmapResult { ptr, len: size })
        }

        fn munmap(&self, region: &MmapResult) -> io::Result<()> {
            let mut state = self.state.lock();
            state.iod_areas.retain(|_, p| *p != region.ptr as usize);
            let layout = std::alloc::Layout::from_size_align(region.len, 4096)
                .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
            // SAFETY: allocated in mmap_iod_buffer with the same layout.
            unsafe { std::alloc::dealloc(region.ptr, layout) };
            Ok(())
        }

        fn pread(&self, _fd: &OwnedFd, buf: &mut [u8], offset: i64) -> io::Result<usize> {
            let state = self.state.lock();
            let data = state
                .copy_in
                .get(&offset)
                .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))?;
            let n = data.len().min(buf.len());
            buf[..n].copy_from_slice(&data[..n]);
            Ok(n)
        }

        fn pwrite(&self, _fd: &OwnedFd, buf: &[u8], offset: i64) -> io::Result<usize> {
            let mut state = self.state.lock();
            let n = state.copy_out_limit.map_or(buf.len(), |limit| limit.min(buf.len()));
            state.copy_out.insert(offset, buf[..n].to_vec());
            Ok(n)
        }
    }

    struct MockIoUring {
        state: Arc<Mutex<MockState>>,
        queue_id: u16,
        ready: Vec<IoCompletion>,
    }

    impl MockIoUring {
        /// Deliver whatever the simulated driver has for this queue.
        fn poll(&mut self) {
            let mut state = self.state.lock();
            let q = self.queue_id;

            if state.stopped {
                let tags: Vec<u16> = state.free_tags.entry(q).or_default().drain(..).collect();
                for tag in tags {
                    self.ready.push(IoCompletion {
                        user_data: encode_user_data(q, tag),
                        result: -libc::ENODEV,
                    });
                }
                return;
            }

            let Some(&base) = state.iod_areas.get(&q) else {
                return;
            };
            let Some(idx) = state.pending.iter().position(|io| io.queue_id == q) else {
                return;
            };
            let Some(tag) = state.free_tags.entry(q).or_default().pop_front() else {
                return;
            };
            let Some(io) = state.pending.remove(idx) else {
                return;
            };

            let desc = UblkIoDesc {
                op_flags: io.op as u32,
                nr_sectors: io.nr_sectors,
                start_sector: io.start_sector,
                addr: 0,
            };
            // SAFETY: base is a live allocation sized for the queue depth and
            // tag came from a FETCH on this queue.
            unsafe {
                let slot = (base as *mut u8).add(tag as usize * std::mem::size_of::<UblkIoDesc>());
                std::ptr::write(slot as *mut UblkIoDesc, desc);
            }
            if io.op == UBLK_IO_OP_WRITE {
                state
                    .copy_in
                    .insert(ublk_user_copy_offset(q, tag, 0), io.data);
            }
            self.ready.push(IoCompletion {
                user_data: encode_user_data(q, tag),
                result: 0,
            });
        }
    }

    impl IoUringOps for MockIoUring {
        fn submit_fetch(&mut self, _char_fd: RawFd, queue_id: u16, tag: u16) -> io::Result<()> {
            self.queue_id = queue_id;
            let mut state = self.state.lock();
            state.fetches += 1;
            state.free_tags.entry(queue_id).or_default().push_back(tag);
            Ok(())
        }

        fn submit_commit_fetch(
            &mut self,
            _char_fd: RawFd,
            queue_id: u16,
            tag: u16,
            result: i32,
        ) -> io::Result<()> {
            let mut state = self.state.lock();
            state.commits.push(MockCommit {
                queue_id,
                tag,
                result,
            });
            state.free_tags.entry(queue_id).or_default().push_back(tag);
            Ok(())
        }

        fn submit_and_wait(&mut self, wait_nr: u32) -> io::Result<u32> {
            // Returns early like a spurious wakeup so callers recheck stop flags.
            let deadline = Instant::now() + Duration::from_millis(50);
            loop {
                self.poll();
                if self.ready.len() >= wait_nr as usize || Instant::now() >= deadline {
                    return Ok(self.ready.len() as u32);
                }
                std::thread::sleep(Duration::from_millis(1));
            }
        }

        fn get_completions(&mut self) -> Vec<IoCompletion> {
            std::mem::take(&mut self.ready)
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
