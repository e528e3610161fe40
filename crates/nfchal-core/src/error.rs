//! Error taxonomy for the HAL4 session manager.
//!
//! Errors fall into four groups:
//!
//! - **Preconditions** (`NotInitialised`, `AlreadyInitialised`, `InvalidState`,
//!   `InvalidParameter`, `InvalidRemoteDevice`, `Busy`, ...) are returned
//!   synchronously and never reach a completion target.
//! - **Resources** (`CapacityExceeded`) are reported on the channel of the
//!   operation that triggered them.
//! - **Radio and transport** failures (`RfTimeout`, `RfError`, `FrameCorrupted`,
//!   `TargetActivationFailed`, `CoreInterfaceError`, `Failed`) are reported
//!   when they hit a caller-visible exchange.
//! - **Lifecycle** (`Shutdown`, `TargetDeactivated`) is delivered to
//!   completions that were cut short.

/// Result type alias for HAL operations.
pub type Result<T> = std::result::Result<T, HalError>;

/// Errors produced by the HAL4 session manager.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HalError {
    /// A controller context is already open.
    #[error("Controller already initialised")]
    AlreadyInitialised,

    /// No controller context is open, or it is closing.
    #[error("Controller not initialised")]
    NotInitialised,

    /// The request is not valid in the current controller state.
    #[error("Operation {operation} not allowed in state {state}")]
    InvalidState { state: String, operation: String },

    /// Another state-changing request is still in flight.
    #[error("Controller busy")]
    Busy,

    /// Invalid argument supplied by the caller.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// The device handle is not part of the current candidate list.
    #[error("Invalid remote device")]
    InvalidRemoteDevice,

    /// The requested feature is not available on this controller.
    #[error("Feature not supported: {0}")]
    FeatureNotSupported(String),

    /// A listener of this kind is already registered.
    #[error("Listener already registered: {0}")]
    AlreadyRegistered(String),

    /// No listener of this kind is registered.
    #[error("Listener not registered: {0}")]
    NotRegistered(String),

    /// The candidate list is full.
    #[error("Candidate list capacity of {capacity} exceeded")]
    CapacityExceeded { capacity: usize },

    /// The remote device did not answer in time.
    #[error("RF timeout")]
    RfTimeout,

    /// Radio-level protocol error.
    #[error("RF error")]
    RfError,

    /// The controller flagged the frame as corrupted.
    #[error("RF frame corrupted")]
    FrameCorrupted,

    /// The controller could not activate the selected target.
    #[error("Target activation failed")]
    TargetActivationFailed,

    /// The controller reported a core interface error.
    #[error("Core interface error")]
    CoreInterfaceError,

    /// The remote device left the field during the operation.
    #[error("Target deactivated")]
    TargetDeactivated,

    /// The transport rejected the request with a raw status.
    #[error("Transport failed with status 0x{status:02X}")]
    Failed { status: u8 },

    /// The controller was closed before the operation completed.
    #[error("Controller shut down")]
    Shutdown,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl HalError {
    /// Create a new invalid state error.
    pub fn invalid_state(state: impl ToString, operation: impl Into<String>) -> Self {
        Self::InvalidState {
            state: state.to_string(),
            operation: operation.into(),
        }
    }

    /// Create a new invalid parameter error.
    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::InvalidParameter(message.into())
    }

    /// Create a new feature-not-supported error.
    pub fn unsupported(feature: impl Into<String>) -> Self {
        Self::FeatureNotSupported(feature.into())
    }

    /// Create a new configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Check whether this error is a synchronous precondition failure.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::AlreadyInitialised
                | Self::NotInitialised
                | Self::InvalidState { .. }
                | Self::Busy
                | Self::InvalidParameter(_)
                | Self::InvalidRemoteDevice
                | Self::AlreadyRegistered(_)
                | Self::NotRegistered(_)
        )
    }
}
