//! Contracts between the session manager and its external collaborators.
//!
//! The session manager never blocks. Each [`Transport`] call returns a
//! [`TransportStatus`] immediately. When the status is
//! [`TransportStatus::Pending`], exactly one matching
//! [`TransportEvent`](crate::TransportEvent) follows. Timers work the same
//! way: [`TimerService::start`] arms a timer, and its expiry is fed back
//! with the owning [`ContextId`] and the returned [`TimerId`].

use nfchal_core::{CloseMode, ContextId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::command::{Command, DataPacket, NotificationKind};
use crate::error::TransportStatus;

/// Lower-layer NCI transport.
///
/// Implementations own framing, retransmission and the link to the
/// controller. They report completions out of band.
///
/// # Examples
///
/// ```
/// use nfchal_transport::mock::MockTransport;
/// use nfchal_transport::{Command, Transport, TransportCall};
///
/// let (mut transport, handle) = MockTransport::new();
/// assert!(transport.open().is_pending());
/// assert!(transport.send_command(Command::GetFirmwareInfo).is_pending());
/// assert_eq!(handle.last_command(), Some(Command::GetFirmwareInfo));
/// assert_eq!(handle.calls()[0], TransportCall::Open);
/// ```
pub trait Transport {
    /// Open the link and power up the controller.
    fn open(&mut self) -> TransportStatus;

    /// Shut the link down.
    fn close(&mut self, mode: CloseMode) -> TransportStatus;

    /// Issue a control command.
    fn send_command(&mut self, command: Command) -> TransportStatus;

    /// Send one data packet on a logical connection.
    fn send_data(&mut self, packet: DataPacket) -> TransportStatus;

    /// Subscribe to an unsolicited notification kind.
    fn register_notification(&mut self, kind: NotificationKind) -> TransportStatus;

    /// Drop a notification subscription.
    fn unregister_notification(&mut self, kind: NotificationKind) -> TransportStatus;
}

/// Identity of one armed timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimerId(u64);

impl TimerId {
    /// Wrap a raw timer id.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw timer id.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

/// Single-shot timer facility.
///
/// Stopping an already-expired or unknown timer is a no-op.
pub trait TimerService {
    /// Arm a timer that expires once after `timeout`.
    fn start(&mut self, owner: ContextId, timeout: Duration) -> TimerId;

    /// Disarm a timer.
    fn stop(&mut self, id: TimerId);
}
