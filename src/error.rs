//! Error types shared by every device in the stack.

use std::io;
use thiserror::Error;

/// Error type for block device operations.
///
/// Out-of-range block indices and byte ranges that extend past the end of a
/// device are caller bugs and are asserted, not surfaced here.
#[derive(Error, Debug)]
pub enum DeviceError {
    /// Read, write or sync failed at the OS boundary.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Stored CRC differs from the recomputed CRC of a data block.
    #[error("CRC mismatch on block {block}")]
    VerifyMismatch {
        /// Logical index of the block that failed verification.
        block: u64,
    },

    /// Key verification mismatch: wrong key, or a corrupted header.
    #[error("key verification failed")]
    AuthFailure,

    /// An on-disk header did not carry the expected magic number.
    #[error("bad magic number in {layer} header")]
    BadMagic {
        /// Name of the layer whose header was rejected.
        layer: &'static str,
    },

    /// Block size or block count below a layer's minimum, or a persisted
    /// geometry that disagrees with the physical device.
    #[error("bad device geometry: {0}")]
    BadGeometry(String),

    /// Two or more member failures within one xor slice.
    #[error("redundancy lost on slice {slice}")]
    RedundancyLost {
        /// Index of the slice that could not be read or written.
        slice: u64,
    },

    /// No free physical blocks remain for an allocation.
    #[error("device is out of space")]
    OutOfSpace,

    /// The device handle was already closed.
    #[error("device is already closed")]
    Closed,
}

/// Result type for block device operations.
pub type Result<T> = std::result::Result<T, DeviceError>;
