//! Manually driven timers.

use nfchal_core::ContextId;
use std::time::Duration;

use crate::traits::{TimerId, TimerService};

/// A timer armed through [`ManualTimers`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArmedTimer {
    pub id: TimerId,
    pub owner: ContextId,
    pub timeout: Duration,
}

/// Timer service that never fires on its own.
///
/// Tests pull an armed timer out with [`ManualTimers::expire_latest`] and
/// hand it to the session manager as an expiry.
///
/// ```
/// use nfchal_core::ContextId;
/// use nfchal_transport::mock::ManualTimers;
/// use nfchal_transport::TimerService;
/// use std::time::Duration;
///
/// let mut timers = ManualTimers::new();
/// let id = timers.start(ContextId::new(1), Duration::from_millis(50));
/// assert!(timers.is_active(id));
///
/// timers.stop(id);
/// assert!(!timers.is_active(id));
/// assert_eq!(timers.stopped(), &[id]);
/// ```
#[derive(Debug, Default)]
pub struct ManualTimers {
    next_id: u64,
    active: Vec<ArmedTimer>,
    stopped: Vec<TimerId>,
    started: usize,
}

impl ManualTimers {
    /// Create a timer service with nothing armed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the armed timers, oldest first.
    pub fn active(&self) -> &[ArmedTimer] {
        &self.active
    }

    /// Get the most recently armed timer that is still active.
    pub fn latest(&self) -> Option<ArmedTimer> {
        self.active.last().copied()
    }

    /// Check whether a timer is still armed.
    pub fn is_active(&self, id: TimerId) -> bool {
        self.active.iter().any(|t| t.id == id)
    }

    /// Get every id passed to `stop`, in order.
    pub fn stopped(&self) -> &[TimerId] {
        &self.stopped
    }

    /// Get the number of timers ever started.
    pub fn started_count(&self) -> usize {
        self.started
    }

    /// Disarm the most recent timer and return it so the caller can
    /// deliver the expiry.
    pub fn expire_latest(&mut self) -> Option<ArmedTimer> {
        self.active.pop()
    }
}

impl TimerService for ManualTimers {
    fn start(&mut self, owner: ContextId, timeout: Duration) -> TimerId {
        self.next_id += 1;
        self.started += 1;
        let id = TimerId::new(self.next_id);
        self.active.push(ArmedTimer { id, owner, timeout });
        id
    }

    fn stop(&mut self, id: TimerId) {
        self.active.retain(|t| t.id != id);
        self.stopped.push(id);
    }
}
