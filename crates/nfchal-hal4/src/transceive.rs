//! Connection and transceive engine.
//!
//! At most one exchange with the connected device is in flight. Its state
//! lives in [`TransceiveSession`] next to the response buffers:
//!
//! - `rx_buffer` chains `more` fragments into one response
//! - `tx_remaining` holds the P2P payload not yet handed to the transport
//! - `surplus` holds response bytes beyond the caller's limit, served by the
//!   next transceive
//!
//! Traffic for an SE-backed device goes over the secure element's logical
//! connection and is not timed.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use nfchal_core::constants::{
    FELICA_CMD_REQUEST_RESPONSE, ISO15693_CMD_INVENTORY, ISO15693_INVENTORY_FLAGS,
    JEWEL_CMD_RID, MIFARE_CMD_READ, P2P_MAX_FRAME_LEN, RF_CONN_ID, RF_FRAME_STATUS_CORRUPTED,
    RF_FRAME_STATUS_OK,
};
use nfchal_core::{
    DeviceHandle, DeviceInfo, HalError, ReleaseType, RemoteDevice, Result, Route,
};
use nfchal_transport::{
    Command, DataPacket, DeactivationKind, TimerId, TimerService, Transport,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::context::{complete, Completion, DeferredCall, DisconnectOp, PendingOp};
use crate::fsm::ControllerState;
use crate::secure_element::switch_command;
use crate::session::Hal4;

/// Command and address bytes prepended to a memory-tag frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryCommand {
    pub cmd: u8,
    pub addr: u8,
}

/// One reader-mode or P2P-initiator exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransceiveRequest {
    /// Used for memory tags only.
    pub command: Option<MemoryCommand>,
    pub data: Vec<u8>,
    /// Largest response handed back; the rest is kept for the next call.
    pub max_response_len: usize,
}

impl TransceiveRequest {
    /// Send `data` as is.
    pub fn raw(data: impl Into<Vec<u8>>, max_response_len: usize) -> Self {
        Self {
            command: None,
            data: data.into(),
            max_response_len,
        }
    }

    /// Send a memory-tag command.
    pub fn memory(cmd: u8, addr: u8, data: impl Into<Vec<u8>>, max_response_len: usize) -> Self {
        Self {
            command: Some(MemoryCommand { cmd, addr }),
            data: data.into(),
            max_response_len,
        }
    }

    /// Collect buffered response bytes left by the previous exchange.
    pub fn drain(max_response_len: usize) -> Self {
        Self::raw(Vec::new(), max_response_len)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransceiveStatus {
    Complete,
    /// More response bytes are buffered.
    MoreInformation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransceiveResponse {
    pub data: Vec<u8>,
    pub status: TransceiveStatus,
}

/// How to strip the response of one exchange.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct ResponseFraming {
    /// Frame RF interface: a trailing status byte.
    pub status_trailer: bool,
    /// Felica: a leading length byte.
    pub length_prefix: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExchangePhase {
    Sending,
    Receiving,
}

#[derive(Debug)]
pub(crate) enum Exchange {
    Transceive {
        completion: Completion<TransceiveResponse>,
        max_response_len: usize,
        framing: ResponseFraming,
        phase: ExchangePhase,
    },
    /// Served from the surplus buffer through the deferred queue.
    Drain {
        completion: Completion<TransceiveResponse>,
        max_response_len: usize,
    },
    Send {
        completion: Completion<()>,
    },
    Receive {
        completion: Completion<Vec<u8>>,
    },
    PresenceCheck {
        completion: Completion<()>,
    },
}

impl Exchange {
    pub fn fail(self, error: HalError) {
        match self {
            Self::Transceive { completion, .. } | Self::Drain { completion, .. } => {
                complete(completion, Err(error))
            }
            Self::Send { completion } | Self::PresenceCheck { completion } => {
                complete(completion, Err(error))
            }
            Self::Receive { completion } => complete(completion, Err(error)),
        }
    }
}

/// A disconnect waiting for a P2P send to finish.
#[derive(Debug)]
pub(crate) struct DeferredDisconnect {
    pub handle: DeviceHandle,
    pub release: ReleaseType,
    pub completion: Completion<()>,
}

/// Exchange state of the connected device.
#[derive(Debug, Default)]
pub(crate) struct TransceiveSession {
    pub exchange: Option<Exchange>,
    pub timer: Option<TimerId>,
    pub rx_buffer: BytesMut,
    pub tx_remaining: Bytes,
    pub frame_len: usize,
    pub surplus: Bytes,
    /// Complete P2P messages that arrived with no receive pending.
    pub rx_queue: VecDeque<Vec<u8>>,
    pub deferred_disconnect: Option<DeferredDisconnect>,
}

impl TransceiveSession {
    /// Fail the exchange and any deferred disconnect.
    ///
    /// Returns the exchange timer, if one was armed.
    pub fn fail(&mut self, error: HalError) -> Option<TimerId> {
        self.rx_buffer.clear();
        self.tx_remaining = Bytes::new();
        if let Some(exchange) = self.exchange.take() {
            exchange.fail(error.clone());
        }
        if let Some(pending) = self.deferred_disconnect.take() {
            complete(pending.completion, Err(error));
        }
        self.timer.take()
    }

    fn is_sending(&self) -> bool {
        matches!(self.exchange, Some(Exchange::Send { .. }))
    }

    /// Split `data` at the caller's limit, keeping the rest as surplus.
    fn take_response(&mut self, mut data: Bytes, max_response_len: usize) -> TransceiveResponse {
        let status = if data.len() > max_response_len {
            self.surplus = data.split_off(max_response_len);
            TransceiveStatus::MoreInformation
        } else {
            TransceiveStatus::Complete
        };
        TransceiveResponse {
            data: data.to_vec(),
            status,
        }
    }

    fn drain_surplus(&mut self, max_response_len: usize) -> TransceiveResponse {
        let take = max_response_len.min(self.surplus.len());
        let data = self.surplus.split_to(take);
        let status = if self.surplus.is_empty() {
            TransceiveStatus::Complete
        } else {
            TransceiveStatus::MoreInformation
        };
        TransceiveResponse {
            data: data.to_vec(),
            status,
        }
    }
}

enum Unframed {
    Data(Bytes),
    /// Dropped; the exchange waits for a retransmission or its timeout.
    Corrupted,
    Failed(HalError),
}

fn unframe(mut data: Bytes, framing: ResponseFraming) -> Unframed {
    if framing.status_trailer {
        let Some(&status) = data.last() else {
            return Unframed::Failed(HalError::RfError);
        };
        data.truncate(data.len() - 1);
        match status {
            RF_FRAME_STATUS_OK => {}
            RF_FRAME_STATUS_CORRUPTED => return Unframed::Corrupted,
            _ => return Unframed::Failed(HalError::RfError),
        }
    }
    if framing.length_prefix && !data.is_empty() {
        data = data.slice(1..);
    }
    Unframed::Data(data)
}

fn response_framing(device: &RemoteDevice) -> ResponseFraming {
    ResponseFraming {
        status_trailer: device.info.uses_frame_interface(),
        length_prefix: matches!(device.info, DeviceInfo::Felica(_)),
    }
}

/// Build the outgoing frame for a reader-mode exchange.
fn build_frame(device: &RemoteDevice, request: &TransceiveRequest) -> Result<(Vec<u8>, ResponseFraming)> {
    if request.data.is_empty() && request.command.is_none() {
        return Err(HalError::invalid_parameter("empty transceive frame"));
    }
    if device.is_se_backed() {
        return Ok((request.data.clone(), ResponseFraming::default()));
    }

    let framing = response_framing(device);
    let frame = match &device.info {
        info if info.is_memory_tag() => match request.command {
            Some(MemoryCommand { cmd, addr }) => {
                let mut frame = Vec::with_capacity(request.data.len() + 2);
                frame.push(cmd);
                frame.push(addr);
                frame.extend_from_slice(&request.data);
                frame
            }
            None => request.data.clone(),
        },
        DeviceInfo::Felica(_) => {
            let len = u8::try_from(request.data.len() + 1)
                .map_err(|_| HalError::invalid_parameter("Felica frame exceeds 254 bytes"))?;
            let mut frame = Vec::with_capacity(request.data.len() + 1);
            frame.push(len);
            frame.extend_from_slice(&request.data);
            frame
        }
        _ => request.data.clone(),
    };
    Ok((frame, framing))
}

enum Probe {
    Command(Command),
    Frame(Vec<u8>),
}

fn presence_probe(info: &DeviceInfo) -> Result<Probe> {
    let probe = match info {
        DeviceInfo::Iso14443A(_) | DeviceInfo::Mifare { .. } => Probe::Frame(vec![MIFARE_CMD_READ, 0x00]),
        DeviceInfo::Jewel(_) => Probe::Frame(vec![JEWEL_CMD_RID, 0, 0, 0, 0, 0, 0]),
        DeviceInfo::Felica(felica) => {
            let mut frame = Vec::with_capacity(2 + felica.idm.len());
            frame.push((2 + felica.idm.len()) as u8);
            frame.push(FELICA_CMD_REQUEST_RESPONSE);
            frame.extend_from_slice(&felica.idm);
            Probe::Frame(frame)
        }
        DeviceInfo::Iso15693(_) => {
            Probe::Frame(vec![ISO15693_INVENTORY_FLAGS, ISO15693_CMD_INVENTORY, 0x00])
        }
        DeviceInfo::Iso14443A4(_) | DeviceInfo::Iso14443B4(_) => {
            Probe::Command(Command::IsoDepPresenceCheck)
        }
        DeviceInfo::P2pTarget(_) | DeviceInfo::P2pInitiator(_) => {
            return Err(HalError::unsupported("presence check on a P2P peer"));
        }
    };
    Ok(probe)
}

fn conn_id_of(device: &RemoteDevice) -> u8 {
    match device.route {
        Route::Rf => RF_CONN_ID,
        Route::SecureElement { conn_id } => conn_id,
    }
}

fn stop_timer<M: TimerService>(timers: &mut M, session: &mut TransceiveSession) {
    if let Some(timer) = session.timer.take() {
        timers.stop(timer);
    }
}

impl<T: Transport, M: TimerService> Hal4<T, M> {
    // ------------------------------------------------------------------
    // Connect
    // ------------------------------------------------------------------

    /// Connect to a candidate of the current round.
    ///
    /// Reconnecting the connected device succeeds without RF traffic.
    ///
    /// # Errors
    ///
    /// - [`HalError::InvalidRemoteDevice`] if `handle` is not a candidate.
    /// - [`HalError::InvalidState`] if another device is connected or no
    ///   round has finished.
    /// - [`HalError::Busy`] while another request is pending.
    pub fn connect(&mut self, handle: DeviceHandle, completion: Completion<RemoteDevice>) -> Result<()> {
        let ctx = self.ctx_mut()?;

        if let Some(connected) = ctx.connected.as_ref() {
            if connected.handle != handle {
                return Err(HalError::invalid_state(ctx.fsm.current(), "connect"));
            }
            ctx.fsm.begin(ControllerState::TargetConnected)?;
            ctx.pending = Some(PendingOp::Connect { handle, completion });
            debug!(%handle, "reconnecting");
            self.defer(DeferredCall::ConnectComplete);
            return Ok(());
        }

        ctx.fsm.check(ControllerState::TargetConnected)?;
        let device = ctx
            .candidates
            .iter()
            .find(|d| d.handle == handle)
            .ok_or(HalError::InvalidRemoteDevice)?;
        let simulated = device.is_se_backed()
            || ctx.activated == Some((device.discovery_id, device.protocol));
        let command = Command::ActivateTarget {
            discovery_id: device.discovery_id,
            protocol: device.protocol,
        };

        ctx.fsm.begin(ControllerState::TargetConnected)?;
        ctx.pending = Some(PendingOp::Connect { handle, completion });
        debug!(%handle, simulated, "connecting");

        if simulated {
            self.defer(DeferredCall::ConnectComplete);
            return Ok(());
        }
        if let Err(error) = self.send_command(command) {
            self.drop_pending();
            return Err(error);
        }
        Ok(())
    }

    pub(crate) fn on_connect_deferred(&mut self) {
        let Some(ctx) = self.context.as_mut() else {
            return;
        };
        match ctx.pending.take() {
            Some(PendingOp::Connect { handle, completion }) => {
                self.finish_connect(handle, completion, Ok(()))
            }
            other => ctx.pending = other,
        }
    }

    pub(crate) fn finish_connect(
        &mut self,
        handle: DeviceHandle,
        completion: Completion<RemoteDevice>,
        result: Result<()>,
    ) {
        let Some(ctx) = self.context.as_mut() else {
            return;
        };
        if let Err(error) = result {
            warn!(%handle, %error, "connect failed");
            ctx.fsm.clear_pending();
            return complete(completion, Err(error));
        }

        if let Some(connected) = ctx.connected.as_mut()
            && connected.handle == handle
        {
            connected.session_open = true;
            let device = connected.clone();
            ctx.fsm.commit();
            return complete(completion, Ok(device));
        }

        let Some(pos) = ctx.candidates.iter().position(|d| d.handle == handle) else {
            ctx.fsm.clear_pending();
            return complete(completion, Err(HalError::InvalidRemoteDevice));
        };
        let mut device = ctx.candidates.remove(pos);
        device.session_open = true;
        if device.route == Route::Rf {
            ctx.activated = Some((device.discovery_id, device.protocol));
        }
        ctx.connected = Some(device.clone());
        ctx.session = Some(TransceiveSession::default());
        ctx.fsm.commit();
        info!(device = %device, "device connected");
        complete(completion, Ok(device));
    }

    // ------------------------------------------------------------------
    // Transceive
    // ------------------------------------------------------------------

    /// Exchange one frame with the connected device.
    ///
    /// When the previous response overflowed `max_response_len`, the next
    /// call is served from the buffered bytes without RF traffic.
    ///
    /// # Errors
    ///
    /// - [`HalError::InvalidRemoteDevice`] if `handle` is not connected.
    /// - [`HalError::InvalidParameter`] for an empty frame or a zero limit.
    /// - [`HalError::Busy`] while another exchange is in flight.
    pub fn transceive(
        &mut self,
        handle: DeviceHandle,
        request: TransceiveRequest,
        completion: Completion<TransceiveResponse>,
    ) -> Result<()> {
        let timeout = self.config.transceive_timeout();
        let default_frame_len = self.config.p2p_max_frame_len;
        let device = self.connected_for(handle, "transceive")?.clone();
        if request.max_response_len == 0 {
            return Err(HalError::invalid_parameter("max_response_len must be non-zero"));
        }
        if matches!(device.info, DeviceInfo::P2pInitiator(_)) {
            return Err(HalError::unsupported("transceive with a P2P initiator peer"));
        }

        let ctx = self.ctx_mut()?;
        ctx.fsm.check(ControllerState::Transaction)?;
        let session = ctx.session.get_or_insert_with(TransceiveSession::default);

        if !session.surplus.is_empty() {
            ctx.fsm.begin(ControllerState::Transaction)?;
            session.exchange = Some(Exchange::Drain {
                completion,
                max_response_len: request.max_response_len,
            });
            trace!(buffered = session.surplus.len(), "serving buffered response");
            self.defer(DeferredCall::Drain);
            return Ok(());
        }

        if let DeviceInfo::P2pTarget(peer) = &device.info {
            if request.data.is_empty() {
                return Err(HalError::invalid_parameter("empty P2P payload"));
            }
            let frame_len = match peer.max_frame_len {
                0 => default_frame_len,
                negotiated => negotiated.min(P2P_MAX_FRAME_LEN),
            };
            ctx.fsm.begin(ControllerState::Transaction)?;
            session.frame_len = frame_len;
            session.tx_remaining = Bytes::from(request.data);
            session.rx_buffer.clear();
            session.exchange = Some(Exchange::Transceive {
                completion,
                max_response_len: request.max_response_len,
                framing: ResponseFraming::default(),
                phase: ExchangePhase::Sending,
            });
            self.arm_exchange_timer(timeout);
            if let Err(error) = self.send_fragment() {
                self.abort_exchange();
                return Err(error);
            }
            return Ok(());
        }

        let (frame, framing) = build_frame(&device, &request)?;
        ctx.fsm.begin(ControllerState::Transaction)?;
        session.rx_buffer.clear();
        session.exchange = Some(Exchange::Transceive {
            completion,
            max_response_len: request.max_response_len,
            framing,
            phase: ExchangePhase::Receiving,
        });
        if device.route == Route::Rf {
            self.arm_exchange_timer(timeout);
        }
        let packet = DataPacket {
            conn_id: conn_id_of(&device),
            payload: frame,
            more: false,
            timeout,
        };
        if let Err(error) = self.send_packet(packet) {
            self.abort_exchange();
            return Err(error);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // P2P target side
    // ------------------------------------------------------------------

    /// Send a message to the remote P2P initiator.
    ///
    /// # Errors
    ///
    /// Returns [`HalError::FeatureNotSupported`] unless the connected
    /// device is a P2P initiator.
    pub fn send(&mut self, handle: DeviceHandle, data: Vec<u8>, completion: Completion<()>) -> Result<()> {
        let default_frame_len = self.config.p2p_max_frame_len;
        let device = self.connected_for(handle, "send")?;
        let DeviceInfo::P2pInitiator(peer) = &device.info else {
            return Err(HalError::unsupported("send requires a P2P initiator peer"));
        };
        let frame_len = match peer.max_frame_len {
            0 => default_frame_len,
            negotiated => negotiated.min(P2P_MAX_FRAME_LEN),
        };
        if data.is_empty() {
            return Err(HalError::invalid_parameter("empty P2P payload"));
        }

        let ctx = self.ctx_mut()?;
        ctx.fsm.begin(ControllerState::Transaction)?;
        let session = ctx.session.get_or_insert_with(TransceiveSession::default);
        session.frame_len = frame_len;
        session.tx_remaining = Bytes::from(data);
        session.exchange = Some(Exchange::Send { completion });
        if let Err(error) = self.send_fragment() {
            self.abort_exchange();
            return Err(error);
        }
        Ok(())
    }

    /// Receive the next message from the remote P2P initiator.
    ///
    /// # Errors
    ///
    /// Returns [`HalError::FeatureNotSupported`] unless the connected
    /// device is a P2P initiator.
    pub fn receive(&mut self, handle: DeviceHandle, completion: Completion<Vec<u8>>) -> Result<()> {
        let timeout = self.config.transceive_timeout();
        let device = self.connected_for(handle, "receive")?;
        if !matches!(device.info, DeviceInfo::P2pInitiator(_)) {
            return Err(HalError::unsupported("receive requires a P2P initiator peer"));
        }

        let ctx = self.ctx_mut()?;
        ctx.fsm.begin(ControllerState::Transaction)?;
        let session = ctx.session.get_or_insert_with(TransceiveSession::default);
        let queued = !session.rx_queue.is_empty();
        session.exchange = Some(Exchange::Receive { completion });
        if queued {
            self.defer(DeferredCall::Drain);
        } else {
            self.arm_exchange_timer(timeout);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Presence check
    // ------------------------------------------------------------------

    /// Probe whether the connected device is still in the field.
    ///
    /// # Errors
    ///
    /// - [`HalError::InvalidState`] without an open session.
    /// - [`HalError::FeatureNotSupported`] for P2P peers and SE-backed
    ///   devices.
    pub fn presence_check(&mut self, completion: Completion<()>) -> Result<()> {
        let timeout = self.config.presence_check_timeout();
        let ctx = self.ctx_mut()?;
        let current = ctx.fsm.current();
        let device = ctx
            .connected
            .as_ref()
            .filter(|d| d.session_open)
            .ok_or_else(|| HalError::invalid_state(current, "presence check"))?;
        if device.is_se_backed() {
            return Err(HalError::unsupported("presence check on a secure element"));
        }
        let probe = presence_probe(&device.info)?;
        ctx.fsm.begin(ControllerState::PresenceCheck)?;

        let session = ctx.session.get_or_insert_with(TransceiveSession::default);
        session.rx_buffer.clear();
        session.exchange = Some(Exchange::PresenceCheck { completion });
        self.arm_exchange_timer(timeout);

        let sent = match probe {
            Probe::Command(command) => self.send_command(command),
            Probe::Frame(payload) => self.send_packet(DataPacket {
                conn_id: RF_CONN_ID,
                payload,
                more: false,
                timeout,
            }),
        };
        if let Err(error) = sent {
            self.abort_exchange();
            return Err(error);
        }
        Ok(())
    }

    pub(crate) fn on_iso_dep_presence(&mut self, result: Result<()>) {
        let Some(ctx) = self.context.as_mut() else {
            return;
        };
        let Some(session) = ctx.session.as_mut() else {
            return;
        };
        let Some(Exchange::PresenceCheck { completion }) = session.exchange.take() else {
            warn!("presence check completion without a probe in flight");
            return;
        };
        stop_timer(&mut self.timers, session);
        let present = result.is_ok();
        if let Some(device) = ctx.connected.as_mut() {
            device.session_open = present;
        }
        ctx.fsm.commit();
        debug!(present, "presence check finished");
        complete(completion, result);
    }

    // ------------------------------------------------------------------
    // Disconnect
    // ------------------------------------------------------------------

    /// Disconnect the connected device.
    ///
    /// A disconnect issued while a P2P send is in flight runs once the send
    /// finishes.
    ///
    /// # Errors
    ///
    /// - [`HalError::InvalidRemoteDevice`] if `handle` is not connected.
    /// - [`HalError::InvalidState`] if nothing is connected.
    /// - [`HalError::Busy`] while another request is pending.
    pub fn disconnect(
        &mut self,
        handle: DeviceHandle,
        release: ReleaseType,
        completion: Completion<()>,
    ) -> Result<()> {
        self.connected_for(handle, "disconnect")?;
        let ctx = self.ctx_mut()?;

        if let Some(session) = ctx.session.as_mut()
            && session.is_sending()
        {
            if session.deferred_disconnect.is_some() {
                return Err(HalError::Busy);
            }
            debug!(%handle, "disconnect deferred until send completes");
            session.deferred_disconnect = Some(DeferredDisconnect {
                handle,
                release,
                completion,
            });
            return Ok(());
        }

        ctx.fsm.check(ControllerState::OpenAndReady)?;
        self.start_disconnect(handle, release, completion)
            .map_err(|(error, _)| error)
    }

    /// Issue the disconnect steps.
    ///
    /// On a synchronous failure the device is still released and the
    /// completion is handed back with the error.
    fn start_disconnect(
        &mut self,
        handle: DeviceHandle,
        release: ReleaseType,
        completion: Completion<()>,
    ) -> std::result::Result<(), (HalError, Completion<()>)> {
        let Some(ctx) = self.context.as_mut() else {
            return Err((HalError::NotInitialised, completion));
        };
        let Some(device) = ctx.connected.as_ref() else {
            let error = HalError::invalid_state(ctx.fsm.current(), "disconnect");
            return Err((error, completion));
        };

        let mut steps = VecDeque::new();
        let mut restarts = release.restarts_discovery();
        match device.route {
            Route::Rf => steps.push_back(Command::Deactivate(if restarts {
                DeactivationKind::Discovery
            } else {
                DeactivationKind::Idle
            })),
            Route::SecureElement { conn_id } => {
                steps.push_back(Command::CloseConnection { conn_id });
                if release == ReleaseType::Release
                    && let Some(smx_id) = ctx.smx_id
                {
                    steps.push_back(switch_command(ctx.is_hci, smx_id, false));
                }
                if restarts {
                    match ctx.discovery.as_ref() {
                        Some(config) => {
                            steps.push_back(Command::StartDiscovery(config.technologies.clone()))
                        }
                        None => restarts = false,
                    }
                }
            }
        }
        let target = if restarts {
            ControllerState::Configuring
        } else {
            ControllerState::OpenAndReady
        };
        if let Err(error) = ctx.fsm.begin(target) {
            return Err((error, completion));
        }

        let first = steps.front().cloned();
        ctx.pending = Some(PendingOp::Disconnect(DisconnectOp {
            handle,
            release,
            steps,
            completion,
        }));
        debug!(%handle, ?release, "disconnecting");

        if let Some(command) = first
            && let Err(error) = self.send_command(command)
        {
            if let Some(PendingOp::Disconnect(op)) = self.context.as_mut().and_then(|c| c.pending.take()) {
                let completion = self.release_connected(op);
                return Err((error, completion));
            }
            return Ok(());
        }
        Ok(())
    }

    pub(crate) fn on_disconnect_step(&mut self, mut op: DisconnectOp, result: Result<()>) {
        if let Err(error) = result {
            warn!(handle = %op.handle, %error, "disconnect step failed");
            let completion = self.release_connected(op);
            return complete(completion, Err(error));
        }

        op.steps.pop_front();
        if let Some(next) = op.steps.front().cloned() {
            if let Some(ctx) = self.context.as_mut() {
                ctx.pending = Some(PendingOp::Disconnect(op));
            }
            if let Err(error) = self.send_command(next)
                && let Some(PendingOp::Disconnect(op)) =
                    self.context.as_mut().and_then(|c| c.pending.take())
            {
                let completion = self.release_connected(op);
                complete(completion, Err(error));
            }
            return;
        }

        let outcome = match op.release {
            ReleaseType::Unknown(raw) => Err(HalError::unsupported(format!("release type {raw}"))),
            _ => Ok(()),
        };
        let completion = self.release_connected(op);
        complete(completion, outcome);
    }

    /// Drop the connected device and the round, then commit the target.
    ///
    /// Takes the completion out of `op` for the caller to answer.
    fn release_connected(&mut self, op: DisconnectOp) -> Completion<()> {
        if let Some(ctx) = self.context.as_mut() {
            let se_backed = ctx.connected.as_ref().is_some_and(RemoteDevice::is_se_backed);
            if let Some(timer) = ctx.release_devices() {
                self.timers.stop(timer);
            }
            if se_backed {
                ctx.se_conn_id = None;
            }
            ctx.fsm.commit();
            info!(handle = %op.handle, state = %ctx.fsm.current(), "device disconnected");
        }
        op.completion
    }

    // ------------------------------------------------------------------
    // Transport events
    // ------------------------------------------------------------------

    pub(crate) fn on_data_received(&mut self, conn_id: u8, result: Result<Vec<u8>>, more: bool) {
        let Some(ctx) = self.context.as_mut() else {
            return;
        };
        let Some(device) = ctx.connected.as_ref() else {
            debug!(conn_id, "data with no connected device dropped");
            return;
        };
        if conn_id_of(device) != conn_id {
            warn!(conn_id, "data on unexpected connection dropped");
            return;
        }
        let from_initiator = matches!(device.info, DeviceInfo::P2pInitiator(_));
        let device_framing = response_framing(device);
        let payload = match result {
            Ok(payload) => payload,
            Err(error) => return self.fail_exchange(error),
        };

        let session = if from_initiator {
            ctx.session.get_or_insert_with(TransceiveSession::default)
        } else {
            match ctx.session.as_mut() {
                Some(session) => session,
                None => return,
            }
        };
        session.rx_buffer.extend_from_slice(&payload);
        if more {
            trace!(buffered = session.rx_buffer.len(), "response fragment");
            return;
        }
        let message = session.rx_buffer.split().freeze();

        match session.exchange.take() {
            Some(Exchange::Transceive {
                completion,
                max_response_len,
                framing,
                ..
            }) => match unframe(message, framing) {
                Unframed::Corrupted => {
                    warn!("corrupted frame dropped");
                    session.exchange = Some(Exchange::Transceive {
                        completion,
                        max_response_len,
                        framing,
                        phase: ExchangePhase::Receiving,
                    });
                }
                Unframed::Failed(error) => {
                    stop_timer(&mut self.timers, session);
                    session.tx_remaining = Bytes::new();
                    ctx.fsm.clear_pending();
                    complete(completion, Err(error));
                }
                Unframed::Data(data) => {
                    stop_timer(&mut self.timers, session);
                    session.tx_remaining = Bytes::new();
                    let response = session.take_response(data, max_response_len);
                    ctx.fsm.commit();
                    trace!(len = response.data.len(), status = ?response.status, "transceive done");
                    complete(completion, Ok(response));
                }
            },
            Some(Exchange::Receive { completion }) => {
                stop_timer(&mut self.timers, session);
                ctx.fsm.commit();
                complete(completion, Ok(message.to_vec()));
            }
            Some(Exchange::PresenceCheck { completion }) => {
                stop_timer(&mut self.timers, session);
                let result = match unframe(message, device_framing) {
                    Unframed::Data(_) => Ok(()),
                    Unframed::Corrupted => Err(HalError::FrameCorrupted),
                    Unframed::Failed(error) => Err(error),
                };
                if let Some(device) = ctx.connected.as_mut() {
                    device.session_open = result.is_ok();
                }
                ctx.fsm.commit();
                debug!(present = result.is_ok(), "presence probe answered");
                complete(completion, result);
            }
            other => {
                session.exchange = other;
                if from_initiator {
                    session.rx_queue.push_back(message.to_vec());
                } else {
                    debug!(len = message.len(), "unsolicited data dropped");
                }
            }
        }
    }

    pub(crate) fn on_data_sent(&mut self, conn_id: u8, result: Result<()>) {
        let Some(ctx) = self.context.as_mut() else {
            return;
        };
        let Some(session) = ctx.session.as_mut() else {
            return;
        };
        if let Err(error) = result {
            if session.exchange.is_some() {
                self.fail_exchange(error);
            }
            return;
        }

        let more = !session.tx_remaining.is_empty();
        match session.exchange {
            Some(Exchange::Transceive {
                phase: ExchangePhase::Sending,
                ..
            }) if !more => {
                if let Some(Exchange::Transceive { phase, .. }) = session.exchange.as_mut() {
                    *phase = ExchangePhase::Receiving;
                }
            }
            Some(Exchange::Send { .. }) if !more => {
                if let Some(Exchange::Send { completion }) = session.exchange.take() {
                    ctx.fsm.commit();
                    complete(completion, Ok(()));
                }
                self.run_deferred_disconnect();
            }
            Some(Exchange::Transceive {
                phase: ExchangePhase::Sending,
                ..
            })
            | Some(Exchange::Send { .. }) => {
                if let Err(error) = self.send_fragment() {
                    self.fail_exchange(error);
                }
            }
            _ => trace!(conn_id, "data sent"),
        }
    }

    pub(crate) fn on_drain(&mut self) {
        let timeout = self.config.transceive_timeout();
        let Some(ctx) = self.context.as_mut() else {
            return;
        };
        let Some(session) = ctx.session.as_mut() else {
            return;
        };
        match session.exchange.take() {
            Some(Exchange::Drain {
                completion,
                max_response_len,
            }) => {
                let response = session.drain_surplus(max_response_len);
                ctx.fsm.commit();
                complete(completion, Ok(response));
            }
            Some(Exchange::Receive { completion }) => match session.rx_queue.pop_front() {
                Some(message) => {
                    ctx.fsm.commit();
                    complete(completion, Ok(message));
                }
                None => {
                    session.exchange = Some(Exchange::Receive { completion });
                    self.arm_exchange_timer(timeout);
                }
            },
            other => session.exchange = other,
        }
    }

    pub(crate) fn on_exchange_timeout(&mut self, timer: TimerId) {
        let Some(ctx) = self.context.as_mut() else {
            return;
        };
        let Some(session) = ctx.session.as_mut() else {
            return;
        };
        if session.timer != Some(timer) {
            debug!(%timer, "stale timer ignored");
            return;
        }
        session.timer = None;
        session.rx_buffer.clear();
        session.tx_remaining = Bytes::new();

        let Some(exchange) = session.exchange.take() else {
            return;
        };
        if matches!(exchange, Exchange::PresenceCheck { .. })
            && let Some(device) = ctx.connected.as_mut()
        {
            device.session_open = false;
        }
        ctx.fsm.clear_pending();
        warn!(%timer, "exchange timed out");
        exchange.fail(HalError::RfTimeout);
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn arm_exchange_timer(&mut self, timeout: std::time::Duration) {
        let Some(ctx) = self.context.as_mut() else {
            return;
        };
        let timer = self.timers.start(ctx.id, timeout);
        if let Some(session) = ctx.session.as_mut()
            && let Some(old) = session.timer.replace(timer)
        {
            self.timers.stop(old);
        }
    }

    /// Hand the next P2P fragment to the transport.
    fn send_fragment(&mut self) -> Result<()> {
        let timeout = self.config.transceive_timeout();
        let ctx = self.ctx_mut()?;
        let conn_id = ctx.connected.as_ref().map_or(RF_CONN_ID, conn_id_of);
        let session = ctx
            .session
            .as_mut()
            .ok_or_else(|| HalError::invalid_state(ControllerState::TargetConnected, "send"))?;
        let take = session.frame_len.max(1).min(session.tx_remaining.len());
        let chunk = session.tx_remaining.split_to(take);
        let more = !session.tx_remaining.is_empty();
        self.send_packet(DataPacket {
            conn_id,
            payload: chunk.to_vec(),
            more,
            timeout,
        })
    }

    /// Undo an exchange that the transport rejected synchronously.
    fn abort_exchange(&mut self) {
        let Some(ctx) = self.context.as_mut() else {
            return;
        };
        ctx.fsm.clear_pending();
        if let Some(session) = ctx.session.as_mut() {
            stop_timer(&mut self.timers, session);
            session.exchange = None;
            session.tx_remaining = Bytes::new();
        }
    }

    /// Fail the exchange in flight and release the pending slot.
    pub(crate) fn fail_exchange(&mut self, error: HalError) {
        let Some(ctx) = self.context.as_mut() else {
            return;
        };
        let Some(session) = ctx.session.as_mut() else {
            return;
        };
        stop_timer(&mut self.timers, session);
        session.rx_buffer.clear();
        session.tx_remaining = Bytes::new();
        let exchange = session.exchange.take();
        if matches!(exchange, Some(Exchange::PresenceCheck { .. }))
            && let Some(device) = ctx.connected.as_mut()
        {
            device.session_open = false;
        }
        ctx.fsm.clear_pending();
        if let Some(exchange) = exchange {
            debug!(%error, "exchange failed");
            exchange.fail(error);
        }
        self.run_deferred_disconnect();
    }

    fn run_deferred_disconnect(&mut self) {
        let pending = self
            .context
            .as_mut()
            .and_then(|ctx| ctx.session.as_mut())
            .and_then(|session| session.deferred_disconnect.take());
        let Some(pending) = pending else {
            return;
        };
        debug!(handle = %pending.handle, "running deferred disconnect");
        if let Err((error, completion)) =
            self.start_disconnect(pending.handle, pending.release, pending.completion)
        {
            complete(completion, Err(error));
        }
    }
}
