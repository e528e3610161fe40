//! Controller state machine.
//!
//! The controller is always in one [`ControllerState`] and has at most one
//! pending target. A request calls [`ControllerFsm::begin`] to claim the
//! pending slot. The matching completion calls [`ControllerFsm::commit`].
//! While the slot is taken, every other request is rejected with
//! [`HalError::Busy`].
//!
//! # Valid Transitions
//!
//! | from | to |
//! |---|---|
//! | Closed | OpenAndReady, SelfTest |
//! | SelfTest | OpenAndReady, Closed |
//! | OpenAndReady | OpenAndReady, Configuring, TargetDiscovered, Closed |
//! | Configuring | Configuring, OpenAndReady, TargetActivating, TargetDiscovered, Emulation, Closed |
//! | TargetActivating | TargetActivating, TargetDiscovered, Configuring, Closed |
//! | TargetDiscovered | TargetDiscovered, TargetConnected, Configuring, OpenAndReady, Closed |
//! | Emulation | Emulation, Configuring, OpenAndReady, Closed |
//! | TargetConnected | TargetConnected, Transaction, PresenceCheck, OpenAndReady, Configuring, Closed |
//! | Transaction | TargetConnected, Closed |
//! | PresenceCheck | TargetConnected, Closed |
//!
//! `Transaction` and `PresenceCheck` mark an exchange in flight. Committing
//! them leaves the controller in `TargetConnected`.
//!
//! # Examples
//!
//! ```
//! use nfchal_hal4::{ControllerFsm, ControllerState};
//!
//! let mut fsm = ControllerFsm::new();
//! fsm.begin(ControllerState::OpenAndReady).unwrap();
//! assert!(fsm.is_busy());
//! assert!(fsm.begin(ControllerState::Configuring).is_err());
//!
//! fsm.commit();
//! assert_eq!(fsm.current(), ControllerState::OpenAndReady);
//! assert_eq!(fsm.next(), None);
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use nfchal_core::{HalError, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Maximum number of state transitions to keep in history.
const MAX_HISTORY_SIZE: usize = 100;

/// Controller states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControllerState {
    /// No controller session. Initial and terminal.
    Closed,

    /// Open for self-test only.
    SelfTest,

    /// Open with the discovery wheel stopped.
    OpenAndReady,

    /// The discovery wheel is being configured or is running.
    Configuring,

    /// A multi-device round is collecting further candidates.
    TargetActivating,

    /// A round finished and its candidates await a connect.
    TargetDiscovered,

    /// A remote reader is talking to an emulated card.
    Emulation,

    /// One device is connected.
    TargetConnected,

    /// A transceive, send or receive is in flight.
    Transaction,

    /// A presence probe is in flight.
    PresenceCheck,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Closed => "Closed",
            Self::SelfTest => "SelfTest",
            Self::OpenAndReady => "OpenAndReady",
            Self::Configuring => "Configuring",
            Self::TargetActivating => "TargetActivating",
            Self::TargetDiscovered => "TargetDiscovered",
            Self::Emulation => "Emulation",
            Self::TargetConnected => "TargetConnected",
            Self::Transaction => "Transaction",
            Self::PresenceCheck => "PresenceCheck",
        };
        write!(f, "{name}")
    }
}

impl ControllerState {
    /// Check if transition to target state is valid from this state.
    ///
    /// ```
    /// use nfchal_hal4::ControllerState;
    ///
    /// assert!(ControllerState::Closed.can_transition_to(ControllerState::OpenAndReady));
    /// assert!(!ControllerState::Closed.can_transition_to(ControllerState::TargetConnected));
    /// ```
    pub fn can_transition_to(self, target: ControllerState) -> bool {
        use ControllerState::*;

        matches!(
            (self, target),
            (Closed, OpenAndReady | SelfTest)
                | (SelfTest, OpenAndReady | Closed)
                | (OpenAndReady, OpenAndReady | Configuring | TargetDiscovered | Closed)
                | (
                    Configuring,
                    Configuring
                        | OpenAndReady
                        | TargetActivating
                        | TargetDiscovered
                        | Emulation
                        | Closed
                )
                | (
                    TargetActivating,
                    TargetActivating | TargetDiscovered | Configuring | Closed
                )
                | (
                    TargetDiscovered,
                    TargetDiscovered | TargetConnected | Configuring | OpenAndReady | Closed
                )
                | (Emulation, Emulation | Configuring | OpenAndReady | Closed)
                | (
                    TargetConnected,
                    TargetConnected
                        | Transaction
                        | PresenceCheck
                        | OpenAndReady
                        | Configuring
                        | Closed
                )
                | (Transaction | PresenceCheck, TargetConnected | Closed)
        )
    }

    /// Check whether this state only marks an exchange in flight.
    pub fn is_exchange(self) -> bool {
        matches!(self, Self::Transaction | Self::PresenceCheck)
    }

    /// Check whether the controller is open far enough to serve requests.
    pub fn is_operational(self) -> bool {
        !matches!(self, Self::Closed | Self::SelfTest)
    }
}

/// One committed state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: ControllerState,
    pub to: ControllerState,

    /// Not serialized; set to the time of deserialization.
    #[serde(skip, default = "Instant::now")]
    pub timestamp: Instant,
}

impl StateTransition {
    pub fn new(from: ControllerState, to: ControllerState) -> Self {
        Self {
            from,
            to,
            timestamp: Instant::now(),
        }
    }

    /// Get the duration since this transition occurred.
    pub fn elapsed(&self) -> Duration {
        self.timestamp.elapsed()
    }
}

/// Current state, pending target and bounded history.
#[derive(Debug)]
pub struct ControllerFsm {
    current: ControllerState,
    next: Option<ControllerState>,
    entered_at: Instant,
    history: VecDeque<StateTransition>,
}

impl ControllerFsm {
    /// Create a machine in `Closed` with nothing pending.
    pub fn new() -> Self {
        Self {
            current: ControllerState::Closed,
            next: None,
            entered_at: Instant::now(),
            history: VecDeque::with_capacity(MAX_HISTORY_SIZE),
        }
    }

    pub fn current(&self) -> ControllerState {
        self.current
    }

    /// Get the pending target. `None` means no transition is in flight.
    pub fn next(&self) -> Option<ControllerState> {
        self.next
    }

    pub fn is_busy(&self) -> bool {
        self.next.is_some()
    }

    /// Validate a request toward `target` without claiming the pending slot.
    ///
    /// # Errors
    ///
    /// Returns [`HalError::Busy`] if a transition is already pending, or
    /// [`HalError::InvalidState`] if `target` is not reachable.
    pub fn check(&self, target: ControllerState) -> Result<()> {
        if self.next.is_some() {
            return Err(HalError::Busy);
        }
        if !self.current.can_transition_to(target) {
            return Err(HalError::invalid_state(self.current, target.to_string()));
        }
        Ok(())
    }

    /// Claim the pending slot for a transition toward `target`.
    pub fn begin(&mut self, target: ControllerState) -> Result<()> {
        self.check(target)?;
        debug!(from = %self.current, to = %target, "transition pending");
        self.next = Some(target);
        Ok(())
    }

    /// Claim the pending slot for `Closed`, overriding anything pending.
    pub fn begin_close(&mut self) {
        self.next = Some(ControllerState::Closed);
    }

    /// Move to the pending target and release the slot.
    ///
    /// Exchange markers release the slot without leaving `TargetConnected`.
    /// Returns the committed target, if one was pending.
    pub fn commit(&mut self) -> Option<ControllerState> {
        let target = self.next.take()?;
        if target.is_exchange() {
            debug!(state = %target, "exchange finished");
        } else {
            self.enter(target);
        }
        Some(target)
    }

    /// Release the pending slot without changing state.
    pub fn clear_pending(&mut self) -> Option<ControllerState> {
        self.next.take()
    }

    /// Apply an unsolicited transition reported by the controller.
    ///
    /// The pending slot is left alone.
    ///
    /// # Errors
    ///
    /// Returns [`HalError::InvalidState`] if `target` is not reachable.
    pub fn advance(&mut self, target: ControllerState) -> Result<()> {
        if !self.current.can_transition_to(target) {
            return Err(HalError::invalid_state(self.current, target.to_string()));
        }
        self.enter(target);
        Ok(())
    }

    /// Get the time elapsed in the current state.
    pub fn time_in_current_state(&self) -> Duration {
        self.entered_at.elapsed()
    }

    /// Get the transition history, oldest first.
    pub fn history(&self) -> &VecDeque<StateTransition> {
        &self.history
    }

    /// Get the last N state transitions.
    pub fn last_transitions(&self, count: usize) -> Vec<StateTransition> {
        self.history
            .iter()
            .rev()
            .take(count)
            .rev()
            .cloned()
            .collect()
    }

    fn enter(&mut self, target: ControllerState) {
        debug!(from = %self.current, to = %target, "state changed");
        self.history
            .push_back(StateTransition::new(self.current, target));
        if self.history.len() > MAX_HISTORY_SIZE {
            self.history.pop_front();
        }
        self.current = target;
        self.entered_at = Instant::now();
    }
}

impl Default for ControllerFsm {
    fn default() -> Self {
        Self::new()
    }
}
