//! Transport contract for the HAL4 session manager.
//!
//! This crate defines what the session manager consumes from below: the
//! [`Transport`] and [`TimerService`] traits, the typed [`Command`]s it
//! issues, and the [`TransportEvent`]s that come back. Wire framing is the
//! implementation's concern.
//!
//! # Mock Implementations
//!
//! With the `mock` feature (on by default), [`mock::MockTransport`] records
//! calls and returns scripted statuses, and [`mock::ManualTimers`] arms
//! timers that only fire when the test says so.

pub mod command;
pub mod error;
pub mod event;
#[cfg(feature = "mock")]
pub mod mock;
pub mod traits;

pub use command::{
    Command, ConfigTlv, DataPacket, DeactivationKind, FirmwareInfo, NotificationKind, Opcode,
    Response, RouteTarget, RoutingEntry, TechMask,
};
pub use error::{TransportError, TransportStatus};
pub use event::{
    ActivationInfo, ActivationParams, NfceeInfo, NfceeProtocol, OpenInfo, SeNotification,
    TechParams, TransportEvent,
};
#[cfg(feature = "mock")]
pub use mock::TransportCall;
pub use traits::{TimerId, TimerService, Transport};
