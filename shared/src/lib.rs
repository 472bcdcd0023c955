//! Sandbridge Shared Library
//!
//! Wire codec, framing, error model and request data types shared by the
//! sandbox-side bridge and whatever host services it.

pub mod error;
pub mod events;
pub mod ioctl;
pub mod protocol;
pub mod spawn;

pub use error::{Errno, Error, Result};
