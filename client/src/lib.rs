//! Sandbridge
//!
//! Lets a sandboxed program ask its host for OS-level operations (working
//! directory, environment, terminal control, process spawning with
//! redirects, signals, mounts, descriptor control) by funnelling structured
//! requests through a single gateway primitive.

pub mod bridge;
pub mod config;
pub mod env;
pub mod fdctl;
pub mod gateway;

#[cfg(test)]
mod fake_host;

pub use bridge::{Bridge, Pid};
pub use config::BridgeConfig;
pub use env::{EnvWrite, Environment};
pub use fdctl::{DescriptorControl, DescriptorTable, FcntlCommand};
pub use gateway::{Gateway, StreamGateway};
pub use sandbridge_shared::{Errno, Error, Result};
