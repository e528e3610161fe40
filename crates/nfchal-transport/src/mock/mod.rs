//! Mock transport and timers for testing and development.
//!
//! These stand in for the NCI transport and the OS timer facility, letting
//! the session manager run without a controller.

pub mod timer;
pub mod transport;

pub use timer::{ArmedTimer, ManualTimers};
pub use transport::{CallClass, MockTransport, MockTransportHandle, TransportCall};
