//! Tether Core Library
//!
//! Device identity, the per-process device registry and session
//! configuration shared by the owner and member roles.

pub mod config;
pub mod device;
pub mod error;
pub mod registry;

pub use config::{SessionConfig, DEFAULT_OWNER_PORT, DEFAULT_SERVICE_KIND};
pub use device::{Device, DeviceKey};
pub use error::{Error, Result};
pub use registry::Registry;
