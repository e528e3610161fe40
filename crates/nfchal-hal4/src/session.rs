//! Controller session: lifecycle, listener registry and event dispatch.
//!
//! [`Hal4`] is synchronous and never blocks. Each request validates its
//! preconditions, claims the pending state and issues transport calls. It
//! then returns `Ok(())`, which means the request is pending. The result
//! arrives on the request's [`Completion`] once the driver has fed the
//! matching events back through [`Hal4::handle_transport_event`],
//! [`Hal4::handle_timer_expired`] and [`Hal4::run_deferred`].
//!
//! A request that fails its preconditions returns `Err` and drops its
//! completion unused.

use std::collections::VecDeque;

use nfchal_core::constants::HAL4_VERSION;
use nfchal_core::{
    Capabilities, CloseMode, ContextId, DeviceHandle, HalError, InitType, ListenerKind,
    ProtocolMask, RemoteDevice, Result,
};
use nfchal_transport::{
    Command, DataPacket, DeactivationKind, NotificationKind, OpenInfo, Opcode, Response,
    TimerId, TimerService, Transport, TransportError, TransportEvent, TransportStatus,
};
use tracing::{debug, info, trace, warn};

use crate::config::Hal4Config;
use crate::context::{
    complete, Completion, ControllerContext, Deferred, DeferredCall, OpenPhase, PendingOp,
};
use crate::discovery::DiscoveryConfig;
use crate::fsm::{ControllerFsm, ControllerState};
use crate::notification::{DefaultEvent, Listener, P2pNotification, SecureElementEvent};
use crate::secure_element::{detect_secure_elements, routing_priority};

/// HAL4 session manager for one NFC controller.
///
/// # Examples
///
/// ```
/// use nfchal_core::InitType;
/// use nfchal_hal4::{ControllerState, Hal4};
/// use nfchal_transport::mock::{ManualTimers, MockTransport};
/// use nfchal_transport::{Command, FirmwareInfo, OpenInfo, Opcode, Response, TransportEvent};
/// use tokio::sync::oneshot;
///
/// let (transport, mock) = MockTransport::new();
/// let mut hal = Hal4::new(transport, ManualTimers::new());
///
/// let (tx, mut rx) = oneshot::channel();
/// hal.open(InitType::Normal, tx).unwrap();
/// assert_eq!(hal.next_state(), Some(ControllerState::OpenAndReady));
///
/// hal.handle_transport_event(TransportEvent::OpenComplete(Ok(OpenInfo::default())));
/// assert_eq!(mock.last_command(), Some(Command::GetFirmwareInfo));
/// hal.handle_transport_event(TransportEvent::CommandComplete {
///     opcode: Opcode::GetFirmwareInfo,
///     result: Ok(Response::FirmwareInfo(FirmwareInfo::default())),
/// });
/// hal.handle_transport_event(TransportEvent::CommandComplete {
///     opcode: Opcode::SetRoutingPriority,
///     result: Ok(Response::None),
/// });
///
/// assert_eq!(rx.try_recv().unwrap(), Ok(()));
/// assert_eq!(hal.current_state(), ControllerState::OpenAndReady);
/// assert_eq!(hal.next_state(), None);
/// ```
#[derive(Debug)]
pub struct Hal4<T, M> {
    pub(crate) transport: T,
    pub(crate) timers: M,
    pub(crate) config: Hal4Config,
    pub(crate) context: Option<ControllerContext>,
    pub(crate) deferred: VecDeque<Deferred>,
    next_context_id: u64,
}

impl<T: Transport, M: TimerService> Hal4<T, M> {
    /// Create a session manager with the default configuration.
    pub fn new(transport: T, timers: M) -> Self {
        Self {
            transport,
            timers,
            config: Hal4Config::default(),
            context: None,
            deferred: VecDeque::new(),
            next_context_id: 0,
        }
    }

    /// Create a session manager with a validated configuration.
    pub fn with_config(config: Hal4Config, transport: T, timers: M) -> Result<Self> {
        config.validate()?;
        let mut hal = Self::new(transport, timers);
        hal.config = config;
        Ok(hal)
    }

    pub fn config(&self) -> &Hal4Config {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn timers(&self) -> &M {
        &self.timers
    }

    pub fn timers_mut(&mut self) -> &mut M {
        &mut self.timers
    }

    /// Check whether a controller context exists.
    pub fn is_open(&self) -> bool {
        self.context.is_some()
    }

    pub fn context_id(&self) -> Option<ContextId> {
        self.context.as_ref().map(|ctx| ctx.id)
    }

    /// Current state; `Closed` when no context exists.
    pub fn current_state(&self) -> ControllerState {
        self.context
            .as_ref()
            .map_or(ControllerState::Closed, |ctx| ctx.fsm.current())
    }

    /// Pending target; `None` when no transition is in flight.
    pub fn next_state(&self) -> Option<ControllerState> {
        self.context.as_ref().and_then(|ctx| ctx.fsm.next())
    }

    pub fn fsm(&self) -> Option<&ControllerFsm> {
        self.context.as_ref().map(|ctx| &ctx.fsm)
    }

    /// Candidates of the current discovery round.
    pub fn candidates(&self) -> &[RemoteDevice] {
        self.context
            .as_ref()
            .map_or(&[][..], |ctx| ctx.candidates.as_slice())
    }

    pub fn connected_device(&self) -> Option<&RemoteDevice> {
        self.context.as_ref().and_then(|ctx| ctx.connected.as_ref())
    }

    pub fn discovery_config(&self) -> Option<&DiscoveryConfig> {
        self.context.as_ref().and_then(|ctx| ctx.discovery.as_ref())
    }

    /// NFCEE id of the embedded secure chip, if one was found at open.
    pub fn smx_id(&self) -> Option<u8> {
        self.context.as_ref().and_then(|ctx| ctx.smx_id)
    }

    /// NFCEE id of the UICC, if one was found at open.
    pub fn uicc_id(&self) -> Option<u8> {
        self.context.as_ref().and_then(|ctx| ctx.uicc_id)
    }

    pub fn is_hci(&self) -> bool {
        self.context.as_ref().is_some_and(|ctx| ctx.is_hci)
    }

    pub fn se_protection(&self) -> bool {
        self.context.as_ref().is_some_and(|ctx| ctx.se_protection)
    }

    /// Check whether a transceive session exists.
    pub fn has_session(&self) -> bool {
        self.context.as_ref().is_some_and(|ctx| ctx.session.is_some())
    }

    /// Number of buffered response bytes not yet handed to the caller.
    pub fn surplus_len(&self) -> usize {
        self.context
            .as_ref()
            .and_then(|ctx| ctx.session.as_ref())
            .map_or(0, |session| session.surplus.len())
    }

    pub fn has_deferred(&self) -> bool {
        !self.deferred.is_empty()
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Open the controller.
    ///
    /// Open runs transport open, then a firmware probe, then secure-element
    /// detection and listen routing. `InitType::TestMode` stops after the
    /// firmware probe and lands in `SelfTest`.
    ///
    /// # Errors
    ///
    /// Returns [`HalError::AlreadyInitialised`] if a context exists, or the
    /// transport's error if it rejects the open synchronously.
    pub fn open(&mut self, init_type: InitType, completion: Completion<()>) -> Result<()> {
        if self.context.is_some() {
            return Err(HalError::AlreadyInitialised);
        }

        self.next_context_id += 1;
        let id = ContextId::new(self.next_context_id);
        let mut ctx = ControllerContext::new(id, init_type);
        let target = match init_type {
            InitType::Normal => ControllerState::OpenAndReady,
            InitType::TestMode => ControllerState::SelfTest,
        };
        ctx.fsm.begin(target)?;

        let status = self.transport.open();
        if let TransportStatus::Failed(error) = status {
            warn!(context = %id, %error, "transport open rejected");
            return Err(error.into());
        }
        for kind in NotificationKind::ALL {
            if let TransportStatus::Failed(error) = self.transport.register_notification(kind) {
                warn!(context = %id, ?kind, %error, "notification registration rejected");
                let _ = self.transport.close(CloseMode::Normal);
                return Err(error.into());
            }
        }

        ctx.pending = Some(PendingOp::Open {
            completion,
            phase: OpenPhase::Transport,
        });
        self.context = Some(ctx);
        info!(context = %id, ?init_type, "opening controller");

        if status == TransportStatus::Ok {
            self.defer(DeferredCall::Replay(TransportEvent::OpenComplete(Ok(
                OpenInfo::default(),
            ))));
        }
        Ok(())
    }

    /// Close the controller.
    ///
    /// Every pending completion fails with [`HalError::Shutdown`]. The
    /// context is dropped once the transport confirms.
    ///
    /// # Errors
    ///
    /// Returns [`HalError::NotInitialised`] if there is no context or a
    /// close is already pending. If the transport rejects the close
    /// synchronously, the context is dropped and its error returned.
    pub fn close(&mut self, mode: CloseMode, completion: Completion<()>) -> Result<()> {
        let ctx = self.context.as_mut().ok_or(HalError::NotInitialised)?;
        if ctx.fsm.next() == Some(ControllerState::Closed) {
            return Err(HalError::NotInitialised);
        }

        let id = ctx.id;
        info!(context = %id, ?mode, "closing controller");
        let timers = [ctx.fail_all(HalError::Shutdown), ctx.release_devices()];
        for timer in timers.into_iter().flatten() {
            self.timers.stop(timer);
        }
        ctx.fsm.begin_close();
        self.deferred.retain(|d| d.context != id);
        unregister_notifications(&mut self.transport);

        match self.transport.close(mode) {
            TransportStatus::Failed(error) => {
                warn!(context = %id, %error, "transport close rejected; dropping context");
                self.context = None;
                Err(error.into())
            }
            status => {
                ctx.pending = Some(PendingOp::Close(completion));
                if status == TransportStatus::Ok {
                    self.defer(DeferredCall::Replay(TransportEvent::CloseComplete));
                }
                Ok(())
            }
        }
    }

    /// Tear the controller down immediately.
    ///
    /// Pending completions are dropped without a result. Late transport
    /// events and timer expiries for the old context are ignored.
    pub fn reset(&mut self) {
        let Some(mut ctx) = self.context.take() else {
            return;
        };
        if let Some(timer) = ctx.release_devices() {
            self.timers.stop(timer);
        }
        unregister_notifications(&mut self.transport);
        if let TransportStatus::Failed(error) = self.transport.close(CloseMode::Normal) {
            debug!(%error, "transport close during reset failed");
        }
        self.deferred.retain(|d| d.context != ctx.id);
        info!(context = %ctx.id, "controller reset");
    }

    /// Get the static capability descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`HalError::NotInitialised`] below `OpenAndReady`.
    pub fn capabilities(&self) -> Result<Capabilities> {
        let ctx = self.context.as_ref().ok_or(HalError::NotInitialised)?;
        if !ctx.fsm.current().is_operational() {
            return Err(HalError::NotInitialised);
        }
        Ok(Capabilities {
            reader_protocols: ProtocolMask::ALL_READER,
            emulation_protocols: ProtocolMask::NFCIP_TARGET,
            hal_version: HAL4_VERSION,
            firmware_version: ctx.firmware.version,
        })
    }

    /// Register a notification listener.
    ///
    /// # Errors
    ///
    /// Returns [`HalError::NotInitialised`] without a context, or
    /// [`HalError::AlreadyRegistered`] if a listener of that kind exists.
    pub fn register_listener(&mut self, listener: Listener) -> Result<()> {
        let ctx = self.context.as_mut().ok_or(HalError::NotInitialised)?;
        let kind = listener.kind();
        ctx.listeners.register(listener)?;
        debug!(listener = %kind, "listener registered");
        Ok(())
    }

    /// Unregister a notification listener.
    ///
    /// # Errors
    ///
    /// Returns [`HalError::NotInitialised`] without a context, or
    /// [`HalError::NotRegistered`] if no listener of that kind exists.
    pub fn unregister_listener(&mut self, kind: ListenerKind) -> Result<()> {
        let ctx = self.context.as_mut().ok_or(HalError::NotInitialised)?;
        ctx.listeners.unregister(kind)?;
        debug!(listener = %kind, "listener unregistered");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Event entry points
    // ------------------------------------------------------------------

    /// Feed one transport completion or notification.
    pub fn handle_transport_event(&mut self, event: TransportEvent) {
        if self.context.is_none() {
            debug!(event = event.name(), "no controller context; event ignored");
            return;
        }
        trace!(event = event.name(), "transport event");

        match event {
            TransportEvent::OpenComplete(result) => self.on_open_complete(result),
            TransportEvent::CloseComplete => self.on_close_complete(),
            TransportEvent::CommandComplete { opcode, result } => {
                self.on_command_complete(opcode, result.map_err(HalError::from))
            }
            TransportEvent::DataReceived {
                conn_id,
                result,
                more,
            } => self.on_data_received(conn_id, result.map_err(HalError::from), more),
            TransportEvent::DataSent { conn_id, result } => {
                self.on_data_sent(conn_id, result.map_err(HalError::from))
            }
            TransportEvent::Activated(info) => self.on_activated(info),
            TransportEvent::Deactivated(kind) => self.on_deactivated(kind),
            TransportEvent::GenericError(error) | TransportEvent::InterfaceError(error) => {
                self.on_controller_error(error.into())
            }
            TransportEvent::SecureElement(notification) => self.on_se_notification(notification),
        }
    }

    /// Feed one timer expiry.
    ///
    /// Expiries for another context or for a timer that was already
    /// stopped are ignored.
    pub fn handle_timer_expired(&mut self, owner: ContextId, timer: TimerId) {
        match self.context.as_ref() {
            Some(ctx) if ctx.id == owner => self.on_exchange_timeout(timer),
            _ => debug!(context = %owner, %timer, "timer for stale context ignored"),
        }
    }

    /// Run queued deferred calls until the queue is empty.
    pub fn run_deferred(&mut self) {
        while let Some(Deferred { context, call }) = self.deferred.pop_front() {
            if self.context_id() != Some(context) {
                debug!(context = %context, "deferred call for stale context dropped");
                continue;
            }
            match call {
                DeferredCall::Replay(event) => self.handle_transport_event(event),
                DeferredCall::ConnectComplete => self.on_connect_deferred(),
                DeferredCall::Drain => self.on_drain(),
                DeferredCall::ParametersStored => self.on_parameters_stored(),
            }
        }
    }

    // ------------------------------------------------------------------
    // Shared helpers
    // ------------------------------------------------------------------

    pub(crate) fn ctx_mut(&mut self) -> Result<&mut ControllerContext> {
        self.context.as_mut().ok_or(HalError::NotInitialised)
    }

    pub(crate) fn defer(&mut self, call: DeferredCall) {
        if let Some(ctx) = self.context.as_ref() {
            self.deferred.push_back(Deferred {
                context: ctx.id,
                call,
            });
        }
    }

    /// Issue a command. A synchronous `Ok` is replayed as its completion.
    pub(crate) fn send_command(&mut self, command: Command) -> Result<()> {
        let opcode = command.opcode();
        trace!(%opcode, "sending command");
        match self.transport.send_command(command) {
            TransportStatus::Pending => Ok(()),
            TransportStatus::Ok => {
                self.defer(DeferredCall::Replay(TransportEvent::CommandComplete {
                    opcode,
                    result: Ok(Response::None),
                }));
                Ok(())
            }
            TransportStatus::Failed(error) => {
                warn!(%opcode, %error, "command rejected");
                Err(error.into())
            }
        }
    }

    /// Send a data packet. A synchronous `Ok` is replayed as `DataSent`.
    pub(crate) fn send_packet(&mut self, packet: DataPacket) -> Result<()> {
        let conn_id = packet.conn_id;
        trace!(conn_id, len = packet.payload.len(), more = packet.more, "sending data");
        match self.transport.send_data(packet) {
            TransportStatus::Pending => Ok(()),
            TransportStatus::Ok => {
                self.defer(DeferredCall::Replay(TransportEvent::DataSent {
                    conn_id,
                    result: Ok(()),
                }));
                Ok(())
            }
            TransportStatus::Failed(error) => {
                warn!(conn_id, %error, "data rejected");
                Err(error.into())
            }
        }
    }

    // ------------------------------------------------------------------
    // Open / close sequence
    // ------------------------------------------------------------------

    fn on_open_complete(&mut self, result: std::result::Result<OpenInfo, TransportError>) {
        let Some(ctx) = self.context.as_mut() else {
            return;
        };
        let Some(PendingOp::Open {
            completion,
            phase: OpenPhase::Transport,
        }) = ctx.pending.take()
        else {
            warn!("unexpected open completion ignored");
            return;
        };

        match result {
            Err(error) => self.abort_open(completion, error.into()),
            Ok(info) => {
                debug!(nfcees = info.nfcees.len(), "transport open");
                ctx.nfcees = info.nfcees;
                ctx.pending = Some(PendingOp::Open {
                    completion,
                    phase: OpenPhase::Firmware,
                });
                if let Err(error) = self.send_command(Command::GetFirmwareInfo) {
                    self.abort_pending_open(error);
                }
            }
        }
    }

    fn on_open_step(&mut self, completion: Completion<()>, phase: OpenPhase, result: Result<Response>) {
        let response = match result {
            Ok(response) => response,
            Err(error) => return self.abort_open(completion, error),
        };
        let Some(ctx) = self.context.as_mut() else {
            return;
        };

        match phase {
            OpenPhase::Transport => {}
            OpenPhase::Firmware => {
                if let Response::FirmwareInfo(firmware) = response {
                    ctx.is_hci = firmware.hci_network;
                    ctx.firmware = firmware;
                }
                debug!(version = ctx.firmware.version, hci = ctx.is_hci, "firmware info");

                if ctx.init_type == InitType::TestMode {
                    ctx.fsm.commit();
                    info!(context = %ctx.id, "controller open for self-test");
                    return complete(completion, Ok(()));
                }

                let (smx_id, uicc_id) = detect_secure_elements(&ctx.nfcees);
                ctx.smx_id = smx_id;
                ctx.uicc_id = uicc_id;
                debug!(?smx_id, ?uicc_id, "secure elements detected");

                ctx.pending = Some(PendingOp::Open {
                    completion,
                    phase: OpenPhase::Routing,
                });
                let routing = routing_priority(smx_id, uicc_id);
                if let Err(error) = self.send_command(Command::SetRoutingPriority(routing)) {
                    self.abort_pending_open(error);
                }
            }
            OpenPhase::Routing => {
                ctx.fsm.commit();
                info!(context = %ctx.id, "controller open and ready");
                complete(completion, Ok(()));
            }
        }
    }

    fn abort_pending_open(&mut self, error: HalError) {
        let pending = self.context.as_mut().and_then(|ctx| ctx.pending.take());
        if let Some(PendingOp::Open { completion, .. }) = pending {
            self.abort_open(completion, error);
        }
    }

    /// Tear down a failed open and report the original error.
    fn abort_open(&mut self, completion: Completion<()>, error: HalError) {
        warn!(%error, "controller open failed");
        if let Some(mut ctx) = self.context.take() {
            if let Some(timer) = ctx.release_devices() {
                self.timers.stop(timer);
            }
            self.deferred.retain(|d| d.context != ctx.id);
        }
        if let TransportStatus::Failed(close_error) = self.transport.close(CloseMode::Normal) {
            debug!(%close_error, "transport close after failed open");
        }
        complete(completion, Err(error));
    }

    fn on_close_complete(&mut self) {
        let closing = self
            .context
            .as_ref()
            .is_some_and(|ctx| matches!(ctx.pending, Some(PendingOp::Close(_))));
        if !closing {
            warn!("unexpected close completion ignored");
            return;
        }
        if let Some(mut ctx) = self.context.take() {
            ctx.fsm.commit();
            info!(context = %ctx.id, "controller closed");
            if let Some(PendingOp::Close(completion)) = ctx.pending.take() {
                complete(completion, Ok(()));
            }
        }
    }

    // ------------------------------------------------------------------
    // Command completion routing
    // ------------------------------------------------------------------

    fn on_command_complete(&mut self, opcode: Opcode, result: Result<Response>) {
        let Some(ctx) = self.context.as_mut() else {
            return;
        };
        let expected = ctx.pending.as_ref().and_then(PendingOp::expected_opcode);
        if expected != Some(opcode) {
            if opcode == Opcode::IsoDepPresenceCheck {
                self.on_iso_dep_presence(result.map(drop));
            } else {
                warn!(%opcode, ?expected, "unexpected command completion ignored");
            }
            return;
        }

        let Some(op) = ctx.pending.take() else {
            return;
        };
        match op {
            PendingOp::Open { completion, phase } => self.on_open_step(completion, phase, result),
            PendingOp::Discovery {
                completion,
                opcode,
                rollback,
            } => self.on_discovery_complete(completion, opcode, rollback, result.map(drop)),
            PendingOp::DiscoverNext => self.on_discover_next_complete(result.map(drop)),
            PendingOp::Connect { handle, completion } => {
                self.finish_connect(handle, completion, result.map(drop))
            }
            PendingOp::Disconnect(op) => self.on_disconnect_step(op, result.map(drop)),
            PendingOp::Parameters { completion, .. } => {
                self.on_parameters_complete(completion, result.map(drop))
            }
            PendingOp::SeSwitch(op) => self.on_se_switch_step(op, result),
            other @ PendingOp::Close(_) => ctx.pending = Some(other),
        }
    }

    // ------------------------------------------------------------------
    // Unsolicited notifications
    // ------------------------------------------------------------------

    fn on_deactivated(&mut self, kind: DeactivationKind) {
        let Some(ctx) = self.context.as_mut() else {
            return;
        };
        match ctx.pending {
            Some(PendingOp::Disconnect(_) | PendingOp::Close(_) | PendingOp::Open { .. }) => {
                debug!(?kind, "deactivation expected by pending request");
                return;
            }
            Some(PendingOp::Connect { .. }) if kind == DeactivationKind::Sleep => {
                debug!("sleep before target selection");
                return;
            }
            _ => {}
        }

        let resume = match kind {
            DeactivationKind::Discovery => ControllerState::Configuring,
            DeactivationKind::Idle | DeactivationKind::Sleep => ControllerState::OpenAndReady,
        };

        match ctx.fsm.current() {
            ControllerState::TargetConnected => {
                let Some(device) = ctx.connected.as_ref() else {
                    return;
                };
                let handle = device.handle;
                let is_p2p = device.info.is_p2p();
                let se_backed = device.is_se_backed();
                warn!(%handle, ?kind, "connected device deactivated");

                let deferred_disconnect = ctx
                    .session
                    .as_mut()
                    .and_then(|session| session.deferred_disconnect.take());
                let timers = [
                    ctx.fail_all(HalError::TargetDeactivated),
                    ctx.release_devices(),
                ];
                if se_backed {
                    ctx.se_conn_id = None;
                }
                ctx.fsm.clear_pending();
                if let Err(error) = ctx.fsm.advance(resume) {
                    warn!(%error, "cannot leave connected state");
                }
                ctx.listeners.notify_default(DefaultEvent::TargetLost(handle));
                if is_p2p {
                    ctx.listeners.notify_p2p(P2pNotification::Deactivated(handle));
                }
                for timer in timers.into_iter().flatten() {
                    self.timers.stop(timer);
                }
                if let Some(pending) = deferred_disconnect {
                    complete(pending.completion, Ok(()));
                }
            }
            ControllerState::TargetDiscovered | ControllerState::TargetActivating => {
                if let Some(op) = ctx.pending.take() {
                    op.fail(HalError::TargetDeactivated);
                }
                ctx.fsm.clear_pending();
                ctx.clear_round();
                ctx.activated = None;
                debug!(?kind, "candidates lost");

                if kind == DeactivationKind::Discovery {
                    if let Err(error) = ctx.fsm.advance(ControllerState::Configuring) {
                        warn!(%error, "cannot resume discovery");
                    }
                } else {
                    self.restart_discovery();
                }
            }
            ControllerState::Emulation => {
                if let Some(op) = ctx.pending.take() {
                    op.fail(HalError::TargetDeactivated);
                    ctx.fsm.clear_pending();
                }
                ctx.listeners
                    .notify_secure_element(SecureElementEvent::Deactivated);
                if let Err(error) = ctx.fsm.advance(resume) {
                    warn!(%error, "cannot leave emulation");
                }
                info!("emulation ended");
            }
            state => debug!(%state, ?kind, "deactivation ignored"),
        }
    }

    fn on_controller_error(&mut self, error: HalError) {
        let Some(ctx) = self.context.as_mut() else {
            return;
        };
        warn!(%error, "controller error");
        ctx.listeners
            .notify_default(DefaultEvent::ControllerError(error.clone()));

        if ctx
            .session
            .as_ref()
            .is_some_and(|session| session.exchange.is_some())
        {
            return self.fail_exchange(error);
        }

        match ctx.pending.take() {
            Some(op @ PendingOp::Connect { .. }) => {
                ctx.fsm.clear_pending();
                op.fail(error);
                return;
            }
            Some(PendingOp::DiscoverNext) => {
                ctx.fsm.clear_pending();
            }
            Some(other) => {
                ctx.pending = Some(other);
                return;
            }
            None => {}
        }

        match ctx.fsm.current() {
            ControllerState::Configuring
            | ControllerState::TargetActivating
            | ControllerState::TargetDiscovered => {
                ctx.clear_round();
                ctx.activated = None;
                self.restart_discovery();
            }
            state => debug!(%state, "controller error absorbed"),
        }
    }

    /// Look up the connected device for a request on `handle`.
    pub(crate) fn connected_for(&self, handle: DeviceHandle, operation: &str) -> Result<&RemoteDevice> {
        let ctx = self.context.as_ref().ok_or(HalError::NotInitialised)?;
        let device = ctx
            .connected
            .as_ref()
            .ok_or_else(|| HalError::invalid_state(ctx.fsm.current(), operation))?;
        if device.handle != handle {
            return Err(HalError::InvalidRemoteDevice);
        }
        Ok(device)
    }
}

fn unregister_notifications<T: Transport>(transport: &mut T) {
    for kind in NotificationKind::ALL {
        if let TransportStatus::Failed(error) = transport.unregister_notification(kind) {
            debug!(?kind, %error, "notification unregistration rejected");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nfchal_transport::mock::{ManualTimers, MockTransport, MockTransportHandle};
    use nfchal_transport::FirmwareInfo;
    use tokio::sync::oneshot;

    fn hal() -> (Hal4<MockTransport, ManualTimers>, MockTransportHandle) {
        let (transport, mock) = MockTransport::new();
        (Hal4::new(transport, ManualTimers::new()), mock)
    }

    #[test]
    fn test_open_registers_every_notification() {
        let (mut hal, mock) = hal();
        let (tx, _rx) = oneshot::channel();
        hal.open(InitType::Normal, tx).unwrap();

        for kind in NotificationKind::ALL {
            assert!(mock.is_registered(kind));
        }
    }

    #[test]
    fn test_open_sync_failure_leaves_no_context() {
        let (mut hal, mock) = hal();
        mock.fail_next_open(TransportError::CoreInterfaceError);

        let (tx, _rx) = oneshot::channel();
        assert_eq!(
            hal.open(InitType::Normal, tx),
            Err(HalError::CoreInterfaceError)
        );
        assert!(!hal.is_open());
    }

    #[test]
    fn test_register_failure_closes_transport() {
        let (mut hal, mock) = hal();
        mock.fail_next_register(TransportError::Status(0x06));

        let (tx, _rx) = oneshot::channel();
        assert_eq!(
            hal.open(InitType::Normal, tx),
            Err(HalError::Failed { status: 0x06 })
        );
        assert!(mock.was_closed());
        assert!(!hal.is_open());
    }

    #[test]
    fn test_test_mode_lands_in_self_test() {
        let (mut hal, mock) = hal();
        let (tx, mut rx) = oneshot::channel();
        hal.open(InitType::TestMode, tx).unwrap();
        hal.handle_transport_event(TransportEvent::OpenComplete(Ok(OpenInfo::default())));
        hal.handle_transport_event(TransportEvent::CommandComplete {
            opcode: Opcode::GetFirmwareInfo,
            result: Ok(Response::FirmwareInfo(FirmwareInfo {
                version: 0x0110,
                ..Default::default()
            })),
        });

        assert_eq!(rx.try_recv().unwrap(), Ok(()));
        assert_eq!(hal.current_state(), ControllerState::SelfTest);
        assert_eq!(hal.capabilities(), Err(HalError::NotInitialised));
        assert!(!mock
            .commands()
            .iter()
            .any(|c| matches!(c, Command::SetRoutingPriority(_))));
    }

    #[test]
    fn test_synchronous_open_is_replayed() {
        let (mut hal, mock) = hal();
        mock.script(nfchal_transport::mock::CallClass::Open, TransportStatus::Ok);

        let (tx, _rx) = oneshot::channel();
        hal.open(InitType::Normal, tx).unwrap();
        assert!(hal.has_deferred());
        hal.run_deferred();
        assert_eq!(mock.last_command(), Some(Command::GetFirmwareInfo));
    }

    #[test]
    fn test_events_without_context_are_ignored() {
        let (mut hal, mock) = hal();
        hal.handle_transport_event(TransportEvent::CloseComplete);
        hal.handle_timer_expired(ContextId::new(9), TimerId::new(1));
        assert!(!hal.is_open());
        assert_eq!(mock.call_count(), 0);
    }

    #[test]
    fn test_reset_without_context_is_noop() {
        let (mut hal, mock) = hal();
        hal.reset();
        assert_eq!(mock.call_count(), 0);
    }
}
