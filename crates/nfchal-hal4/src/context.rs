//! Per-controller context and in-flight request bookkeeping.

use std::collections::VecDeque;

use nfchal_core::{
    ContextId, DeviceHandle, DiscoveryStatus, HalError, InitType, ReleaseType, RemoteDevice,
    Result, RfProtocol, SeTarget,
};
use nfchal_transport::{Command, FirmwareInfo, NfceeInfo, Opcode, TimerId, TransportEvent};
use tokio::sync::oneshot;
use tracing::debug;

use crate::discovery::DiscoveryConfig;
use crate::fsm::ControllerFsm;
use crate::notification::Listeners;
use crate::transceive::TransceiveSession;

/// Completion target of one asynchronous request.
pub type Completion<T> = oneshot::Sender<Result<T>>;

/// Deliver a result to its completion target.
pub(crate) fn complete<T>(completion: Completion<T>, result: Result<T>) {
    if completion.send(result).is_err() {
        debug!("completion receiver dropped");
    }
}

/// Steps of the open sequence that wait on the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpenPhase {
    Transport,
    Firmware,
    Routing,
}

#[derive(Debug)]
pub(crate) struct DisconnectOp {
    pub handle: DeviceHandle,
    pub release: ReleaseType,
    pub steps: VecDeque<Command>,
    pub completion: Completion<()>,
}

#[derive(Debug)]
pub(crate) struct SeSwitchOp {
    pub target: SeTarget,
    pub nfcee_id: u8,
    pub steps: VecDeque<Command>,
    /// Expose an SE-backed candidate once the steps finish.
    pub wired: bool,
    pub completion: Completion<()>,
}

/// The control request currently claiming the pending state.
///
/// Exchanges with a connected device live in the [`TransceiveSession`]
/// instead.
#[derive(Debug)]
pub(crate) enum PendingOp {
    Open {
        completion: Completion<()>,
        phase: OpenPhase,
    },
    Close(Completion<()>),
    /// Start or stop of the wheel. Internal restarts carry no completion.
    Discovery {
        completion: Option<Completion<()>>,
        opcode: Opcode,
        /// Restore the previous configuration if the controller rejects it.
        rollback: bool,
    },
    DiscoverNext,
    Connect {
        handle: DeviceHandle,
        completion: Completion<RemoteDevice>,
    },
    Disconnect(DisconnectOp),
    Parameters {
        completion: Completion<()>,
        /// `None` when completed through the deferred queue.
        opcode: Option<Opcode>,
    },
    SeSwitch(SeSwitchOp),
}

impl PendingOp {
    /// Opcode of the command completion this request waits for.
    pub fn expected_opcode(&self) -> Option<Opcode> {
        match self {
            Self::Open { phase, .. } => match phase {
                OpenPhase::Transport => None,
                OpenPhase::Firmware => Some(Opcode::GetFirmwareInfo),
                OpenPhase::Routing => Some(Opcode::SetRoutingPriority),
            },
            Self::Close(_) => None,
            Self::Discovery { opcode, .. } => Some(*opcode),
            Self::DiscoverNext => Some(Opcode::DiscoverNext),
            Self::Connect { .. } => Some(Opcode::ActivateTarget),
            Self::Disconnect(op) => op.steps.front().map(Command::opcode),
            Self::Parameters { opcode, .. } => *opcode,
            Self::SeSwitch(op) => op.steps.front().map(Command::opcode),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Open { .. } => "open",
            Self::Close(_) => "close",
            Self::Discovery { .. } => "discovery",
            Self::DiscoverNext => "discover next",
            Self::Connect { .. } => "connect",
            Self::Disconnect(_) => "disconnect",
            Self::Parameters { .. } => "configure parameters",
            Self::SeSwitch(_) => "secure element switch",
        }
    }

    /// Fail the request's completion target.
    pub fn fail(self, error: HalError) {
        match self {
            Self::Open { completion, .. }
            | Self::Close(completion)
            | Self::Parameters { completion, .. } => complete(completion, Err(error)),
            Self::Discovery { completion, .. } => {
                if let Some(completion) = completion {
                    complete(completion, Err(error));
                }
            }
            Self::DiscoverNext => {}
            Self::Connect { completion, .. } => complete(completion, Err(error)),
            Self::Disconnect(op) => complete(op.completion, Err(error)),
            Self::SeSwitch(op) => complete(op.completion, Err(error)),
        }
    }
}

/// Work queued to run after the current call returns.
#[derive(Debug)]
pub(crate) enum DeferredCall {
    /// A transport call that completed synchronously, replayed as its event.
    Replay(TransportEvent),
    ConnectComplete,
    /// Serve buffered response bytes.
    Drain,
    ParametersStored,
}

#[derive(Debug)]
pub(crate) struct Deferred {
    pub context: ContextId,
    pub call: DeferredCall,
}

/// Bookkeeping for the discovery round being built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DiscoveryRound {
    pub notifications: usize,
    pub status: DiscoveryStatus,
}

impl Default for DiscoveryRound {
    fn default() -> Self {
        Self {
            notifications: 0,
            status: DiscoveryStatus::Success,
        }
    }
}

/// One open controller.
#[derive(Debug)]
pub(crate) struct ControllerContext {
    pub id: ContextId,
    pub fsm: ControllerFsm,
    pub init_type: InitType,
    pub firmware: FirmwareInfo,

    /// NFCEEs reported at transport open.
    pub nfcees: Vec<NfceeInfo>,
    pub smx_id: Option<u8>,
    pub uicc_id: Option<u8>,
    pub is_hci: bool,

    /// Logical connection of the wired-mode SMX.
    pub se_conn_id: Option<u8>,
    pub se_protection: bool,

    pub discovery: Option<DiscoveryConfig>,
    /// Configuration to restore if the pending one is rejected.
    pub previous_discovery: Option<DiscoveryConfig>,

    pub round: DiscoveryRound,
    pub candidates: Vec<RemoteDevice>,
    pub connected: Option<RemoteDevice>,

    /// Discovery id and protocol the controller has active on the RF side.
    pub activated: Option<(u8, RfProtocol)>,

    pub session: Option<TransceiveSession>,
    pub listeners: Listeners,
    pub pending: Option<PendingOp>,
    next_handle: u32,
}

impl ControllerContext {
    pub fn new(id: ContextId, init_type: InitType) -> Self {
        Self {
            id,
            fsm: ControllerFsm::new(),
            init_type,
            firmware: FirmwareInfo::default(),
            nfcees: Vec::new(),
            smx_id: None,
            uicc_id: None,
            is_hci: false,
            se_conn_id: None,
            se_protection: false,
            discovery: None,
            previous_discovery: None,
            round: DiscoveryRound::default(),
            candidates: Vec::new(),
            connected: None,
            activated: None,
            session: None,
            listeners: Listeners::default(),
            pending: None,
            next_handle: 0,
        }
    }

    /// Allocate a handle that is never reused within this context.
    pub fn allocate_handle(&mut self) -> DeviceHandle {
        self.next_handle = self.next_handle.wrapping_add(1);
        DeviceHandle::new(self.next_handle)
    }

    /// Drop the candidate list and reset the round.
    pub fn clear_round(&mut self) {
        self.candidates.clear();
        self.round = DiscoveryRound::default();
    }

    /// Drop every device, the session and the round.
    ///
    /// Returns the session timer, if one was armed, so the caller can stop it.
    pub fn release_devices(&mut self) -> Option<TimerId> {
        self.clear_round();
        self.connected = None;
        self.activated = None;
        self.session.take().and_then(|mut session| session.timer.take())
    }

    /// Fail every pending completion with `error`.
    ///
    /// Returns the session timer, if one was armed.
    pub fn fail_all(&mut self, error: HalError) -> Option<TimerId> {
        if let Some(op) = self.pending.take() {
            debug!(op = op.name(), %error, "failing pending request");
            op.fail(error.clone());
        }
        self.session.as_mut().and_then(|session| session.fail(error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_are_unique() {
        let mut ctx = ControllerContext::new(ContextId::new(1), InitType::Normal);
        let a = ctx.allocate_handle();
        let b = ctx.allocate_handle();
        assert_ne!(a, b);
    }

    #[test]
    fn test_fail_all_reaches_pending_request() {
        let mut ctx = ControllerContext::new(ContextId::new(1), InitType::Normal);
        let (tx, mut rx) = oneshot::channel();
        ctx.pending = Some(PendingOp::Parameters {
            completion: tx,
            opcode: Some(Opcode::SetConfig),
        });

        assert!(ctx.fail_all(HalError::Shutdown).is_none());
        assert_eq!(rx.try_recv().unwrap(), Err(HalError::Shutdown));
        assert!(ctx.pending.is_none());
    }

    #[test]
    fn test_expected_opcode_follows_steps() {
        let (tx, _rx) = oneshot::channel();
        let op = PendingOp::Disconnect(DisconnectOp {
            handle: DeviceHandle::new(1),
            release: ReleaseType::Release,
            steps: VecDeque::from([
                Command::CloseConnection { conn_id: 1 },
                Command::NfceeModeSet {
                    nfcee_id: 2,
                    enable: false,
                },
            ]),
            completion: tx,
        });
        assert_eq!(op.expected_opcode(), Some(Opcode::CloseConnection));
    }
}
