//! Stackable device layers.
//!
//! Every layer is itself a [`BlockDevice`](crate::BlockDevice) over one or
//! more base devices, so layers compose freely: a typical stack is
//! `file → encrypt → verify → stripe → lazyzero → partition`.

pub mod concat;
pub mod encrypt;
pub mod lazyzero;
pub mod partition;
pub mod slice;
pub mod stripe;
pub mod verify;
pub mod xor;

pub use concat::ConcatDevice;
pub use encrypt::EncryptDevice;
pub use lazyzero::LazyZeroDevice;
pub use partition::PartitionDevice;
pub use slice::SliceDevice;
pub use stripe::StripeDevice;
pub use verify::VerifyDevice;
pub use xor::XorDevice;
