//! Shared types for the HAL4 NFC controller session manager.
//!
//! This crate holds the vocabulary used by both the transport contract
//! (`nfchal-transport`) and the session manager (`nfchal-hal4`): the
//! [`HalError`] taxonomy, protocol constants, remote device identities and
//! request types.

pub mod constants;
pub mod device;
pub mod error;
pub mod types;

pub use device::{DeviceInfo, DeviceKind, RemoteDevice, Route};
pub use error::{HalError, Result};
pub use types::*;

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
