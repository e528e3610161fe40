//! Mock NCI transport for testing and development.
//!
//! The mock never talks to a controller. It records every call and answers
//! with a scripted [`TransportStatus`]. The test then plays the
//! controller's part by feeding the matching
//! [`TransportEvent`](crate::TransportEvent)s to the session manager.

use nfchal_core::CloseMode;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::command::{Command, DataPacket, NotificationKind};
use crate::error::{TransportError, TransportStatus};
use crate::traits::Transport;

/// One recorded transport call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    Open,
    Close(CloseMode),
    Command(Command),
    Data(DataPacket),
    Register(NotificationKind),
    Unregister(NotificationKind),
}

/// Class of call a scripted status applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallClass {
    Open,
    Close,
    Command,
    Data,
    Register,
}

impl CallClass {
    fn default_status(&self) -> TransportStatus {
        match self {
            Self::Register => TransportStatus::Ok,
            _ => TransportStatus::Pending,
        }
    }
}

#[derive(Debug, Default)]
struct MockState {
    calls: Vec<TransportCall>,
    scripted: HashMap<CallClass, VecDeque<TransportStatus>>,
    registered: HashSet<NotificationKind>,
}

impl MockState {
    fn next_status(&mut self, class: CallClass) -> TransportStatus {
        self.scripted
            .get_mut(&class)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| class.default_status())
    }
}

fn lock(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Mock transport.
///
/// By default every open, close, command and data call is accepted as
/// pending, and notification registration completes synchronously.
///
/// # Examples
///
/// ```
/// use nfchal_transport::mock::MockTransport;
/// use nfchal_transport::{Command, Transport, TransportError, TransportStatus};
///
/// let (mut transport, handle) = MockTransport::new();
/// handle.fail_next_command(TransportError::RfError);
///
/// assert_eq!(
///     transport.send_command(Command::StopDiscovery),
///     TransportStatus::Failed(TransportError::RfError)
/// );
/// assert!(transport.send_command(Command::StopDiscovery).is_pending());
/// assert_eq!(handle.commands().len(), 2);
/// ```
#[derive(Debug)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    /// Create a new mock transport.
    ///
    /// Returns a tuple of (MockTransport, MockTransportHandle) where the
    /// handle inspects calls and scripts statuses.
    pub fn new() -> (Self, MockTransportHandle) {
        let state = Arc::new(Mutex::new(MockState::default()));
        let transport = Self {
            state: Arc::clone(&state),
        };
        (transport, MockTransportHandle { state })
    }

    fn record(&self, call: TransportCall, class: CallClass) -> TransportStatus {
        let mut state = lock(&self.state);
        state.calls.push(call);
        state.next_status(class)
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new().0
    }
}

impl Transport for MockTransport {
    fn open(&mut self) -> TransportStatus {
        self.record(TransportCall::Open, CallClass::Open)
    }

    fn close(&mut self, mode: CloseMode) -> TransportStatus {
        let status = self.record(TransportCall::Close(mode), CallClass::Close);
        lock(&self.state).registered.clear();
        status
    }

    fn send_command(&mut self, command: Command) -> TransportStatus {
        self.record(TransportCall::Command(command), CallClass::Command)
    }

    fn send_data(&mut self, packet: DataPacket) -> TransportStatus {
        self.record(TransportCall::Data(packet), CallClass::Data)
    }

    fn register_notification(&mut self, kind: NotificationKind) -> TransportStatus {
        let status = self.record(TransportCall::Register(kind), CallClass::Register);
        if !matches!(status, TransportStatus::Failed(_)) {
            lock(&self.state).registered.insert(kind);
        }
        status
    }

    fn unregister_notification(&mut self, kind: NotificationKind) -> TransportStatus {
        let mut state = lock(&self.state);
        state.calls.push(TransportCall::Unregister(kind));
        state.registered.remove(&kind);
        TransportStatus::Ok
    }
}

/// Handle for inspecting and scripting a [`MockTransport`].
///
/// Clones share the same recorded state.
#[derive(Debug, Clone)]
pub struct MockTransportHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockTransportHandle {
    /// Queue the status returned by the next call of the given class.
    pub fn script(&self, class: CallClass, status: TransportStatus) {
        lock(&self.state)
            .scripted
            .entry(class)
            .or_default()
            .push_back(status);
    }

    /// Make the next `open` fail synchronously.
    pub fn fail_next_open(&self, error: TransportError) {
        self.script(CallClass::Open, TransportStatus::Failed(error));
    }

    /// Make the next `send_command` fail synchronously.
    pub fn fail_next_command(&self, error: TransportError) {
        self.script(CallClass::Command, TransportStatus::Failed(error));
    }

    /// Make the next `send_data` fail synchronously.
    pub fn fail_next_data(&self, error: TransportError) {
        self.script(CallClass::Data, TransportStatus::Failed(error));
    }

    /// Make the next `register_notification` fail synchronously.
    pub fn fail_next_register(&self, error: TransportError) {
        self.script(CallClass::Register, TransportStatus::Failed(error));
    }

    /// Get every recorded call, oldest first.
    pub fn calls(&self) -> Vec<TransportCall> {
        lock(&self.state).calls.clone()
    }

    /// Take and clear the recorded calls.
    pub fn take_calls(&self) -> Vec<TransportCall> {
        std::mem::take(&mut lock(&self.state).calls)
    }

    /// Get the number of recorded calls.
    pub fn call_count(&self) -> usize {
        lock(&self.state).calls.len()
    }

    /// Get every recorded command.
    pub fn commands(&self) -> Vec<Command> {
        lock(&self.state)
            .calls
            .iter()
            .filter_map(|call| match call {
                TransportCall::Command(command) => Some(command.clone()),
                _ => None,
            })
            .collect()
    }

    /// Get the most recent command.
    pub fn last_command(&self) -> Option<Command> {
        self.commands().pop()
    }

    /// Get every recorded data packet.
    pub fn data_packets(&self) -> Vec<DataPacket> {
        lock(&self.state)
            .calls
            .iter()
            .filter_map(|call| match call {
                TransportCall::Data(packet) => Some(packet.clone()),
                _ => None,
            })
            .collect()
    }

    /// Get the most recent data packet.
    pub fn last_data(&self) -> Option<DataPacket> {
        self.data_packets().pop()
    }

    /// Check whether a notification kind is currently registered.
    pub fn is_registered(&self, kind: NotificationKind) -> bool {
        lock(&self.state).registered.contains(&kind)
    }

    /// Check whether `close` was called.
    pub fn was_closed(&self) -> bool {
        lock(&self.state)
            .calls
            .iter()
            .any(|call| matches!(call, TransportCall::Close(_)))
    }
}
