use std::{error::Error as StdError, fmt, time::Duration};

use bitflags::bitflags;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

use crate::device::{DeviceError, LayoutError};

/// page size is 4KB.
pub const PAGE_SIZE: usize = 4096;

/// The synchronization word at the head of every descriptor.
///
/// Software writes `Issued` before submission, the device writes `Completed`
/// when it is done and software writes `Issued` again on reclaim.
#[derive(TryFromPrimitive, IntoPrimitive, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DescStatus {
    /// Never written
    Undefined = 0xFFFF_FFFF,

    /// Owned by the device, or ready to be handed to it
    Issued = 0x0,

    /// Retired by the device
    Completed = 0x1,
}

bitflags! {
    /// Error word reported by the accelerator
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FaErrorFlag: u32 {
        /// A descriptor address arrived while the descriptor FIFO was full
        const DESC_FIFO_OVERRUN = 0x1;
        /// A descriptor could not be fetched or decoded
        const DESC_DECERR = 0x2;
        /// The retired task counter faulted
        const TASKCOUNT_DECERR = 0x4;
    }
}

/// One argument binding of a descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescEntry {
    /// Destination offset in the accelerator's argument aperture
    pub arg_offset: u32,
    /// Payload length in bytes
    pub arg_size: u32,
    /// Payload bytes, packed in 4-byte words
    pub payload: Vec<u8>,
}

impl DescEntry {
    /// Create an entry whose `arg_size` is the payload length.
    #[must_use]
    pub fn new(arg_offset: u32, payload: Vec<u8>) -> Self {
        let arg_size = u32::try_from(payload.len()).unwrap_or(u32::MAX);
        Self {
            arg_offset,
            arg_size,
            payload,
        }
    }

    /// Create an 8-byte entry carrying a device address, little endian.
    #[must_use]
    pub fn new_addr(arg_offset: u32, addr: u64) -> Self {
        Self::new(arg_offset, addr.to_le_bytes().to_vec())
    }

    /// Interpret the payload as 32-bit little endian words.
    #[must_use]
    pub fn payload_words(&self) -> Vec<u32> {
        self.payload
            .chunks_exact(4)
            .filter_map(|w| w.try_into().ok().map(u32::from_le_bytes))
            .collect()
    }
}

/// Result of one timed submit/poll run.
#[non_exhaustive]
#[derive(Debug, Clone, Copy)]
pub struct RunReport {
    /// Requested task count
    pub target: u64,
    /// Completions observed by the poller
    pub completed: u64,
    /// Submissions issued before the first completion was polled
    pub initial_submissions: u64,
    /// Submissions issued in place of a reclaimed slot
    pub resubmissions: u64,
    /// Highest number of tasks in flight at any moment of the run
    pub max_in_flight: usize,
    /// Wall-clock time from the first submission to the last completion
    pub elapsed: Duration,
}

impl RunReport {
    /// Completed tasks per second.
    ///
    /// Returns `None` when the run was too short for the clock to register.
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::float_arithmetic)]
    pub fn tasks_per_sec(&self) -> Option<f64> {
        let secs = self.elapsed.as_secs_f64();
        if self.elapsed.is_zero() {
            None
        } else {
            Some(self.target as f64 / secs)
        }
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.tasks_per_sec() {
            Some(rate) => write!(f, "Commands: {:>7} iops: {rate:.1}", self.target),
            None => write!(f, "Commands: {:>7} iops: n/a", self.target),
        }
    }
}

/// Error type for the task dispatcher
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum Error {
    /// Fatal failure while opening or preparing the device
    #[error("setup failed: {0}")]
    Setup(String),

    /// Some error occurred in the device
    #[error(transparent)]
    Device(Box<dyn StdError + Send + Sync>),

    /// A descriptor could not be laid out consistently
    #[error("descriptor layout error: {0}")]
    Layout(#[from] LayoutError),

    /// The configuration is not usable
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// The accelerator reported an error after a run
    #[error("device reported fault {0:?}")]
    DeviceFault(FaErrorFlag),

    /// No completion was observed within the configured poll timeout
    #[error("poll timeout")]
    Timeout,

    /// The slot pool is empty
    #[error("no task slot could be allocated")]
    NoSlots,

    /// No task slot has this index
    #[error("task slot {0} does not exist")]
    SlotIndex(usize),
}

impl From<DeviceError> for Error {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::Layout(e) => Error::Layout(e),
            DeviceError::Timeout => Error::Timeout,
            DeviceError::Device(_)
            | DeviceError::OutOfMemory
            | DeviceError::InvalidHandle(_)
            | DeviceError::DepthExceeded(_) => Error::Device(Box::new(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{DescEntry, DescStatus, RunReport};

    #[test]
    fn test_desc_status_raw_values() {
        assert_eq!(u32::from(DescStatus::Undefined), 0xFFFF_FFFF);
        assert_eq!(DescStatus::try_from(0).unwrap(), DescStatus::Issued);
        assert_eq!(DescStatus::try_from(1).unwrap(), DescStatus::Completed);
        assert!(DescStatus::try_from(2).is_err());
    }

    #[test]
    fn test_desc_entry_addr() {
        let entry = DescEntry::new_addr(0x10, 0x0000_0004_1234_5678);
        assert_eq!(entry.arg_size, 8);
        assert_eq!(entry.payload_words(), vec![0x1234_5678, 0x4]);
    }

    #[test]
    fn test_run_report_rate() {
        let report = RunReport {
            target: 1000,
            completed: 1000,
            initial_submissions: 12,
            resubmissions: 988,
            max_in_flight: 12,
            elapsed: Duration::from_millis(500),
        };
        assert_eq!(report.tasks_per_sec(), Some(2000.0));
        assert_eq!(report.to_string(), "Commands:    1000 iops: 2000.0");

        let zero = RunReport {
            elapsed: Duration::ZERO,
            ..report
        };
        assert_eq!(zero.tasks_per_sec(), None);
    }
}
