//! strata - a composable block-device stack.
//!
//! This crate provides a family of uniform block-addressable virtual
//! devices ("layers") that stack on top of one another and of physical
//! storage. A concrete backend (memory, a file, a shared mapping) sits at
//! the bottom; each layer above it transforms offsets, sizes, contents or
//! failure behavior of the device beneath it:
//!
//! - [`layers::VerifyDevice`] detects silent corruption with per-block CRCs
//! - [`layers::LazyZeroDevice`] presents a zero-initialized view, zeroing
//!   chunks lazily on first write
//! - [`layers::EncryptDevice`] encrypts block contents with a per-block IV
//! - [`layers::XorDevice`] spreads single-parity redundancy over N devices
//! - [`layers::StripeDevice`] / [`layers::ConcatDevice`] compose several
//!   devices into one
//! - [`layers::SliceDevice`] exposes a sub-range of a device
//! - [`layers::PartitionDevice`] carves a device into remapped partitions
//!
//! All of them speak the same [`BlockDevice`] contract, so a stack like
//! `file → encrypt → verify → stripe` is just nested constructors.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![warn(rust_2018_idioms)]

// Core modules
pub mod bits;
pub mod blockdev;
pub mod cache;
pub mod error;
pub mod layers;

// Re-export block device types
pub use blockdev::{BlockDevice, FileBlockDevice, MemBlockDevice};
#[cfg(unix)]
pub use blockdev::MmapBlockDevice;

// Re-export the error types
pub use error::{DeviceError, Result};

/// Re-export common types and traits
pub mod prelude {
    pub use crate::cache::BlockCache;
    pub use crate::error::{DeviceError, Result};
    pub use crate::layers::{
        ConcatDevice, EncryptDevice, LazyZeroDevice, PartitionDevice, SliceDevice, StripeDevice,
        VerifyDevice, XorDevice,
    };
    pub use crate::BlockDevice;
    pub use crate::FileBlockDevice;
    pub use crate::MemBlockDevice;
    #[cfg(unix)]
    pub use crate::MmapBlockDevice;
}
