use thiserror::Error;

/// Errors raised while laying out or walking a descriptor.
#[non_exhaustive]
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LayoutError {
    /// The encoded region did not consume exactly the precomputed size
    #[error("descriptor size mismatch: expected {expected} bytes, encoded {encoded} bytes")]
    SizeMismatch {
        /// size computed from the entry list
        expected: usize,
        /// bytes actually written or walked
        encoded: usize,
    },

    /// An entry's payload does not match its declared size
    #[error("entry declares {arg_size} bytes but carries {payload} payload bytes")]
    PayloadLength {
        /// declared `argSize`
        arg_size: u32,
        /// payload length in bytes
        payload: usize,
    },

    /// A read or write ran past the end of the buffer
    #[error("descriptor truncated: need {len} bytes at offset {offset}")]
    Truncated {
        /// byte offset of the access
        offset: usize,
        /// bytes required from that offset
        len: usize,
    },

    /// The word stride is not a power of two of at least 4 bytes
    #[error("invalid word stride {0}")]
    BadStride(usize),
}

#[derive(Debug, Error)]
pub(crate) enum DeviceError {
    /// Device related error
    #[error("device error : {0}")]
    Device(String),

    /// Device memory is exhausted
    #[error("device memory exhausted")]
    OutOfMemory,

    /// The buffer handle is unknown to the device
    #[error("invalid buffer handle : {0}")]
    InvalidHandle(u32),

    /// The descriptor layout is inconsistent
    #[error("descriptor layout : {0}")]
    Layout(#[from] LayoutError),

    /// A submission would exceed the in-flight depth bound
    #[error("in-flight depth {0} exceeded")]
    DepthExceeded(usize),

    /// Polling timeout
    #[error("Operation timeout")]
    Timeout,
}

pub(crate) type DeviceResult<T> = Result<T, DeviceError>;
