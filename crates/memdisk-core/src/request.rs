//! Block requests as handed to the servicer by a host dispatcher.
//!
//! A request borrows the caller's scatter/gather segments for the duration
//! of one `service` call and is never stored.

use crate::error::Error;

/// Transfer direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Device to host memory.
    Read,
    /// Host memory to device.
    Write,
}

/// Caller-side segments, typed by direction.
#[derive(Debug)]
pub enum Segments<'a> {
    /// Destinations filled from the device.
    Read(Vec<&'a mut [u8]>),
    /// Sources copied into the device.
    Write(Vec<&'a [u8]>),
}

/// One dispatched block request.
#[derive(Debug)]
pub struct Request<'a> {
    start_sector: u64,
    segments: Segments<'a>,
}

impl<'a> Request<'a> {
    /// Read request filling `segments` in order, starting at `start_sector`.
    pub fn read(start_sector: u64, segments: Vec<&'a mut [u8]>) -> Self {
        Self {
            start_sector,
            segments: Segments::Read(segments),
        }
    }

    /// Write request draining `segments` in order, starting at `start_sector`.
    pub fn write(start_sector: u64, segments: Vec<&'a [u8]>) -> Self {
        Self {
            start_sector,
            segments: Segments::Write(segments),
        }
    }

    #[inline]
    pub fn direction(&self) -> Direction {
        match self.segments {
            Segments::Read(_) => Direction::Read,
            Segments::Write(_) => Direction::Write,
        }
    }

    #[inline]
    pub fn start_sector(&self) -> u64 {
        self.start_sector
    }

    pub fn segment_count(&self) -> usize {
        match &self.segments {
            Segments::Read(s) => s.len(),
            Segments::Write(s) => s.len(),
        }
    }

    /// Sum of all segment lengths in bytes.
    pub fn total_len(&self) -> u64 {
        match &self.segments {
            Segments::Read(s) => s.iter().map(|b| b.len() as u64).sum(),
            Segments::Write(s) => s.iter().map(|b| b.len() as u64).sum(),
        }
    }

    pub(crate) fn segments_mut(&mut self) -> &mut Segments<'a> {
        &mut self.segments
    }
}

/// Outcome reported back to the host dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    IoError,
}

/// Bytes transferred plus status for one serviced request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub transferred: u64,
    pub status: Status,
}

impl Completion {
    #[inline]
    pub fn ok(transferred: u64) -> Self {
        Self {
            transferred,
            status: Status::Ok,
        }
    }

    #[inline]
    pub fn io_error(transferred: u64) -> Self {
        Self {
            transferred,
            status: Status::IoError,
        }
    }

    #[inline]
    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }

    /// Kernel-style result: byte count on success, `-EIO` on failure.
    pub fn to_kernel_result(self) -> i32 {
        match self.status {
            Status::Ok => i32::try_from(self.transferred).unwrap_or(i32::MAX),
            Status::IoError => -libc::EIO,
        }
    }

    /// Byte count on success, `Error::Io` otherwise.
    pub fn into_result(self) -> crate::Result<u64> {
        match self.status {
            Status::Ok => Ok(self.transferred),
            Status::IoError => Err(Error::Io(format!(
                "request failed after {} bytes",
                self.transferred
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_request() {
        let mut a = [0u8; 512];
        let mut b = [0u8; 1024];
        let req = Request::read(8, vec![&mut a[..], &mut b[..]]);
        assert_eq!(req.direction(), Direction::Read);
        assert_eq!(req.start_sector(), 8);
        assert_eq!(req.segment_count(), 2);
        assert_eq!(req.total_len(), 1536);
    }

    #[test]
    fn test_write_request() {
        let a = [0xAAu8; 4096];
        let req = Request::write(0, vec![&a[..]]);
        assert_eq!(req.direction(), Direction::Write);
        assert_eq!(req.total_len(), 4096);
    }

    #[test]
    fn test_empty_request() {
        let req = Request::write(0, Vec::new());
        assert_eq!(req.segment_count(), 0);
        assert_eq!(req.total_len(), 0);
    }

    #[test]
    fn test_completion_kernel_result() {
        assert_eq!(Completion::ok(4096).to_kernel_result(), 4096);
        assert_eq!(Completion::io_error(0).to_kernel_result(), -libc::EIO);
        assert_eq!(Completion::ok(u64::MAX).to_kernel_result(), i32::MAX);
    }

    #[test]
    fn test_completion_into_result() {
        assert_eq!(Completion::ok(512).into_result().unwrap(), 512);
        let err = Completion::io_error(0).into_result().unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
