//! Transport-level status codes.
//!
//! These are distinct from the session manager's [`HalError`]: every
//! transport call reports a [`TransportStatus`], and asynchronous completions
//! carry a `Result<_, TransportError>`. The `From` conversion maps them into
//! the HAL taxonomy at the boundary.

use nfchal_core::HalError;

/// Failure reported by the transport or the controller behind it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The remote device did not answer in time.
    #[error("RF timeout")]
    RfTimeout,

    /// Radio-level protocol error.
    #[error("RF error")]
    RfError,

    /// The frame arrived corrupted.
    #[error("RF frame corrupted")]
    FrameCorrupted,

    /// The controller could not activate the selected target.
    #[error("Discovery target activation failed")]
    TargetActivationFailed,

    /// The controller reported a core interface error.
    #[error("Core interface error")]
    CoreInterfaceError,

    /// The transport session is not open.
    #[error("Transport not open")]
    NotOpen,

    /// Any other controller status.
    #[error("Transport failed with status 0x{0:02X}")]
    Status(u8),
}

impl From<TransportError> for HalError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::RfTimeout => HalError::RfTimeout,
            TransportError::RfError => HalError::RfError,
            TransportError::FrameCorrupted => HalError::FrameCorrupted,
            TransportError::TargetActivationFailed => HalError::TargetActivationFailed,
            TransportError::CoreInterfaceError => HalError::CoreInterfaceError,
            TransportError::NotOpen => HalError::NotInitialised,
            TransportError::Status(status) => HalError::Failed { status },
        }
    }
}

/// Immediate status returned by every transport call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStatus {
    /// Done; no completion event follows.
    Ok,
    /// Accepted; a completion event follows.
    Pending,
    /// Rejected; no completion event follows.
    Failed(TransportError),
}

impl TransportStatus {
    /// Convert into a `Result`, treating `Ok` and `Pending` as accepted.
    ///
    /// ```
    /// use nfchal_transport::{TransportError, TransportStatus};
    /// use nfchal_core::HalError;
    ///
    /// assert!(TransportStatus::Pending.accepted().is_ok());
    /// assert_eq!(
    ///     TransportStatus::Failed(TransportError::RfError).accepted(),
    ///     Err(HalError::RfError)
    /// );
    /// ```
    pub fn accepted(self) -> nfchal_core::Result<()> {
        match self {
            Self::Ok | Self::Pending => Ok(()),
            Self::Failed(error) => Err(error.into()),
        }
    }

    /// Check whether a completion event will follow.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }
}
