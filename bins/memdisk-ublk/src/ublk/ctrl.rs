//! ublk control device operations via io_uring
//!
//! Linux 6.0+ requires io_uring URING_CMD for ublk control commands. The
//! commands themselves go through a [`CtrlShim`], so the same code drives
//! the kernel and the in-memory mock.

use crate::ublk::shim::CtrlShim;
use crate::ublk::sys::*;
use nix::libc;
use std::os::fd::OwnedFd;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CtrlError {
    #[error("Failed to open control device: {0}")]
    OpenCtrl(std::io::Error),

    #[error("Failed to add device {dev_id}: {source}")]
    AddDev { dev_id: i32, source: std::io::Error },

    #[error("Failed to set params for device {dev_id}: {source}")]
    SetParams { dev_id: i32, source: std::io::Error },

    #[error("Failed to start device {dev_id}: {source}")]
    StartDev { dev_id: i32, source: std::io::Error },

    #[error("Failed to stop device {dev_id}: {source}")]
    StopDev { dev_id: i32, source: std::io::Error },

    #[error("Failed to delete device {dev_id}: {source}")]
    DelDev { dev_id: i32, source: std::io::Error },

    #[error("Failed to open char device /dev/ublkc{dev_id}: {source}")]
    OpenChar { dev_id: i32, source: std::io::Error },
}

impl CtrlError {
    fn source_io(&self) -> &std::io::Error {
        match self {
            Self::OpenCtrl(e) => e,
            Self::AddDev { source, .. }
            | Self::SetParams { source, .. }
            | Self::StartDev { source, .. }
            | Self::StopDev { source, .. }
            | Self::DelDev { source, .. }
            | Self::OpenChar { source, .. } => source,
        }
    }

    /// Convert to negative errno.
    pub fn to_errno(&self) -> i32 {
        let fallback = match self {
            Self::OpenCtrl(_) | Self::AddDev { .. } | Self::OpenChar { .. } => libc::ENODEV,
            Self::SetParams { .. } => libc::EINVAL,
            Self::StartDev { .. } | Self::StopDev { .. } | Self::DelDev { .. } => libc::EIO,
        };
        -self.source_io().raw_os_error().unwrap_or(fallback)
    }
}

/// Geometry requested with ADD_DEV
#[derive(Debug, Clone)]
pub struct CtrlConfig {
    /// Requested device id, `None` lets the kernel pick
    pub dev_id: Option<u32>,
    pub nr_hw_queues: u16,
    pub queue_depth: u16,
    pub max_io_buf_bytes: u32,
    pub flags: u64,
}

impl Default for CtrlConfig {
    fn default() -> Self {
        Self {
            dev_id: None,
            nr_hw_queues: 1,
            queue_depth: 128,
            max_io_buf_bytes: UBLK_MAX_IO_BUF_BYTES,
            flags: UBLK_F_USER_COPY | UBLK_F_CMD_IOCTL_ENCODE,
        }
    }
}

/// Handle on one ublk device
///
/// Dropping a handle whose device was added but not deleted stops and
/// deletes it.
pub struct UblkCtrl<S: CtrlShim> {
    shim: Arc<S>,
    ctrl_fd: OwnedFd,
    dev_id: i32,
    dev_info: UblkCtrlDevInfo,
    deleted: bool,
}

impl<S: CtrlShim> UblkCtrl<S> {
    /// Open the control device and add a new ublk device
    pub fn add(shim: Arc<S>, config: &CtrlConfig) -> Result<Self, CtrlError> {
        let ctrl_fd = shim.open_ctrl_device().map_err(CtrlError::OpenCtrl)?;
        let requested = config.dev_id.map_or(-1, |id| id as i32);

        let mut dev_info = UblkCtrlDevInfo {
            nr_hw_queues: config.nr_hw_queues,
            queue_depth: config.queue_depth,
            max_io_buf_bytes: config.max_io_buf_bytes,
            dev_id: config.dev_id.unwrap_or(u32::MAX),
            ublksrv_pid: std::process::id() as i32,
            flags: config.flags,
            ..Default::default()
        };

        let cmd = UblkCtrlCmd {
            dev_id: dev_info.dev_id,
            addr: &mut dev_info as *mut _ as u64,
            len: std::mem::size_of::<UblkCtrlDevInfo>() as u16,
            ..Default::default()
        };

        let result = shim
            .submit_ctrl_cmd(&ctrl_fd, UBLK_U_CMD_ADD_DEV, &cmd)
            .map_err(|e| CtrlError::AddDev {
                dev_id: requested,
                source: e,
            })?;
        if let Some(info) = result.dev_info {
            dev_info = info;
        }

        tracing::debug!(
            dev_id = dev_info.dev_id,
            nr_hw_queues = dev_info.nr_hw_queues,
            queue_depth = dev_info.queue_depth,
            max_io_buf_bytes = dev_info.max_io_buf_bytes,
            flags = dev_info.flags,
            "Device info after ADD_DEV"
        );

        Ok(Self {
            shim,
            ctrl_fd,
            dev_id: dev_info.dev_id as i32,
            dev_info,
            deleted: false,
        })
    }

    fn cmd(&self) -> UblkCtrlCmd {
        UblkCtrlCmd {
            dev_id: self.dev_id as u32,
            ..Default::default()
        }
    }

    fn submit(&self, cmd_op: u32, cmd: &UblkCtrlCmd) -> std::io::Result<i32> {
        tracing::debug!(dev_id = self.dev_id, cmd_op, "Submitting control command");
        let result = self.shim.submit_ctrl_cmd(&self.ctrl_fd, cmd_op, cmd)?;
        Ok(result.retval)
    }

    /// Publish geometry: capacity in 512-byte sectors and block sizes
    pub fn set_params(&self, dev_sectors: u64) -> Result<(), CtrlError> {
        let params = UblkParams {
            len: std::mem::size_of::<UblkParams>() as u32,
            types: UBLK_PARAM_TYPE_BASIC,
            basic: UblkParamBasic {
                logical_bs_shift: SECTOR_SHIFT,
                physical_bs_shift: 12,
                io_opt_shift: 12,
                io_min_shift: SECTOR_SHIFT,
                max_sectors: self.dev_info.max_io_buf_bytes >> SECTOR_SHIFT,
                dev_sectors,
                ..Default::default()
            },
            ..Default::default()
        };
        let cmd = UblkCtrlCmd {
            addr: &params as *const _ as u64,
            len: std::mem::size_of::<UblkParams>() as u16,
            ..self.cmd()
        };

        self.submit(UBLK_U_CMD_SET_PARAMS, &cmd)
            .map_err(|e| CtrlError::SetParams {
                dev_id: self.dev_id,
                source: e,
            })?;
        Ok(())
    }

    /// Start the device; every queue must already have fetched its tags
    pub fn start(&self) -> Result<(), CtrlError> {
        let mut cmd = self.cmd();
        cmd.data[0] = self.dev_info.ublksrv_pid as u64;

        self.submit(UBLK_U_CMD_START_DEV, &cmd)
            .map_err(|e| CtrlError::StartDev {
                dev_id: self.dev_id,
                source: e,
            })?;
        Ok(())
    }

    /// Stop the device; outstanding fetches complete with -ENODEV
    pub fn stop(&self) -> Result<(), CtrlError> {
        self.submit(UBLK_U_CMD_STOP_DEV, &self.cmd())
            .map_err(|e| CtrlError::StopDev {
                dev_id: self.dev_id,
                source: e,
            })?;
        Ok(())
    }

    pub fn delete(&mut self) -> Result<(), CtrlError> {
        self.submit(UBLK_U_CMD_DEL_DEV, &self.cmd())
            .map_err(|e| CtrlError::DelDev {
                dev_id: self.dev_id,
                source: e,
            })?;
        self.deleted = true;
        Ok(())
    }

    pub fn open_char_dev(&self) -> Result<OwnedFd, CtrlError> {
        self.shim
            .open_char_device(self.dev_id as u32)
            .map_err(|e| CtrlError::OpenChar {
                dev_id: self.dev_id,
                source: e,
            })
    }

    #[inline]
    pub fn dev_id(&self) -> i32 {
        self.dev_id
    }

    #[inline]
    pub fn dev_info(&self) -> &UblkCtrlDevInfo {
        &self.dev_info
    }

    pub fn block_dev_path(&self) -> String {
        format!("{}{}", UBLK_BLOCK_DEV_FMT, self.dev_id)
    }
}

impl<S: CtrlShim> Drop for UblkCtrl<S> {
    fn drop(&mut self) {
        if !self.deleted {
            if let Err(e) = self.stop() {
                tracing::warn!(dev_id = self.dev_id, error = %e, "Stop on drop failed");
            }
            if let Err(e) = self.delete() {
                tracing::warn!(dev_id = self.dev_id, error = %e, "Delete on drop failed");
            }
        }
    }
}

impl<S: CtrlShim> std::fmt::Debug for UblkCtrl<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UblkCtrl")
            .field("dev_id", &self.dev_id)
            .field("nr_hw_queues", &self.dev_info.nr_hw_queues)
            .field("queue_depth", &self.dev_info.queue_depth)
            .field("deleted", &self.deleted)
            .finish()
    }
}
