//! Secure-element control and parameter configuration.

use std::collections::VecDeque;

use nfchal_core::constants::{
    CFG_LN_ATR_RES_GEN_BYTES, CFG_PN_ATR_REQ_GEN_BYTES, MAX_GENERAL_BYTES_LEN,
};
use nfchal_core::device::{Iso14443A4Info, Iso14443AInfo};
use nfchal_core::{
    DeviceInfo, DiscoveryStatus, HalError, RemoteDevice, Result, RfProtocol, Route, SeTarget,
    SmxMode, SwpMode,
};
use nfchal_transport::{
    Command, ConfigTlv, NfceeInfo, Opcode, Response, RouteTarget, RoutingEntry, SeNotification,
    TechMask, TimerService, Transport,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::context::{complete, Completion, DeferredCall, PendingOp, SeSwitchOp};
use crate::fsm::ControllerState;
use crate::notification::{DiscoveryNotification, SecureElementEvent};
use crate::session::Hal4;

/// SAK reported for the SE-backed wired-mode candidate.
const WIRED_SAK: u8 = 0x20;

/// Emulation mode of one secure element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EmulationConfig {
    Smx(SmxMode),
    Uicc(SwpMode),
}

/// Argument of [`Hal4::configure_parameters`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigParameters {
    /// ATR general bytes for P2P, up to 48 bytes.
    P2pGeneralBytes(Vec<u8>),
    Emulation(EmulationConfig),
    /// Block wired access while an external reader is in the field.
    SeProtection(bool),
}

/// Pick the SMX and UICC from the NFCEEs reported at open.
///
/// The first NFCEE of each class wins.
pub(crate) fn detect_secure_elements(nfcees: &[NfceeInfo]) -> (Option<u8>, Option<u8>) {
    let smx = nfcees.iter().find(|ee| ee.is_smx()).map(|ee| ee.id);
    let uicc = nfcees.iter().find(|ee| ee.is_uicc()).map(|ee| ee.id);
    (smx, uicc)
}

/// Listen-mode routing for the detected secure elements.
///
/// F always goes to the host. A goes to the SMX when there is one. The UICC
/// takes A, B and F when present. With both present the SMX keeps a
/// trailing A entry so it catches A once the UICC route is absent.
///
/// ```
/// use nfchal_hal4::routing_priority;
/// use nfchal_transport::{RouteTarget, TechMask};
///
/// let routing = routing_priority(Some(1), None);
/// assert_eq!(routing[0].target, RouteTarget::Host);
/// assert_eq!(routing[1].target, RouteTarget::Nfcee(1));
/// assert_eq!(routing[1].technologies, TechMask::A);
/// ```
pub fn routing_priority(smx_id: Option<u8>, uicc_id: Option<u8>) -> Vec<RoutingEntry> {
    let host = RoutingEntry::new(RouteTarget::Host, TechMask::F);
    let all = TechMask::A | TechMask::B | TechMask::F;
    match (smx_id, uicc_id) {
        (None, None) => vec![host],
        (Some(smx), None) => vec![host, RoutingEntry::new(RouteTarget::Nfcee(smx), TechMask::A)],
        (None, Some(uicc)) => vec![host, RoutingEntry::new(RouteTarget::Nfcee(uicc), all)],
        (Some(smx), Some(uicc)) => vec![
            host,
            RoutingEntry::new(RouteTarget::Nfcee(smx), TechMask::A),
            RoutingEntry::new(RouteTarget::Nfcee(uicc), all),
            RoutingEntry::new(RouteTarget::Nfcee(smx), TechMask::A),
        ],
    }
}

/// Command that enables or disables an NFCEE.
///
/// HCI-network controllers drive the NFCEE through its pipe.
pub(crate) fn switch_command(is_hci: bool, nfcee_id: u8, enable: bool) -> Command {
    if is_hci {
        Command::HciPipe {
            nfcee_id,
            activate: enable,
        }
    } else {
        Command::NfceeModeSet { nfcee_id, enable }
    }
}

fn wired_device(handle: nfchal_core::DeviceHandle, conn_id: u8) -> RemoteDevice {
    let info = DeviceInfo::Iso14443A4(Iso14443A4Info {
        a: Iso14443AInfo {
            uid: Vec::new(),
            atqa: [0x00, 0x00],
            sak: WIRED_SAK,
        },
        ats: Vec::new(),
    });
    RemoteDevice::new(handle, 0, RfProtocol::IsoDep, info).with_route(Route::SecureElement { conn_id })
}

impl<T: Transport, M: TimerService> Hal4<T, M> {
    /// Apply one configuration parameter.
    ///
    /// # Errors
    ///
    /// - [`HalError::InvalidParameter`] if the general bytes exceed 48 bytes.
    /// - [`HalError::InvalidState`] before the controller is open.
    /// - [`HalError::Busy`] while another request is pending.
    pub fn configure_parameters(
        &mut self,
        params: ConfigParameters,
        completion: Completion<()>,
    ) -> Result<()> {
        let bytes = match params {
            ConfigParameters::Emulation(EmulationConfig::Smx(mode)) => {
                return self.switch_smx_mode(mode, completion);
            }
            ConfigParameters::Emulation(EmulationConfig::Uicc(mode)) => {
                return self.switch_swp_mode(mode, completion);
            }
            ConfigParameters::SeProtection(enabled) => {
                return self.store_se_protection(enabled, completion);
            }
            ConfigParameters::P2pGeneralBytes(bytes) => bytes,
        };

        let ctx = self.ctx_mut()?;
        let current = ctx.fsm.current();
        if !current.is_operational() {
            return Err(HalError::invalid_state(current, "configure parameters"));
        }
        ctx.fsm.check(current)?;

        if bytes.len() > MAX_GENERAL_BYTES_LEN {
            return Err(HalError::invalid_parameter(format!(
                "general bytes length {} exceeds {}",
                bytes.len(),
                MAX_GENERAL_BYTES_LEN
            )));
        }
        ctx.fsm.begin(current)?;
        ctx.pending = Some(PendingOp::Parameters {
            completion,
            opcode: Some(Opcode::SetConfig),
        });
        let command = Command::SetConfig(vec![
            ConfigTlv::new(CFG_PN_ATR_REQ_GEN_BYTES, bytes.clone()),
            ConfigTlv::new(CFG_LN_ATR_RES_GEN_BYTES, bytes),
        ]);
        if let Err(error) = self.send_command(command) {
            self.drop_pending();
            return Err(error);
        }
        Ok(())
    }

    fn store_se_protection(&mut self, enabled: bool, completion: Completion<()>) -> Result<()> {
        let ctx = self.ctx_mut()?;
        let current = ctx.fsm.current();
        if !current.is_operational() {
            return Err(HalError::invalid_state(current, "configure parameters"));
        }
        ctx.fsm.begin(current)?;
        ctx.se_protection = enabled;
        ctx.pending = Some(PendingOp::Parameters {
            completion,
            opcode: None,
        });
        debug!(enabled, "secure element protection stored");
        self.defer(DeferredCall::ParametersStored);
        Ok(())
    }

    /// Switch the embedded secure chip to `mode`.
    ///
    /// `Wired` exposes the chip as an SE-backed candidate on the tag
    /// discovery channel once the logical connection is open.
    ///
    /// # Errors
    ///
    /// Returns [`HalError::FeatureNotSupported`] if no SMX was detected.
    pub fn switch_smx_mode(&mut self, mode: SmxMode, completion: Completion<()>) -> Result<()> {
        let ctx = self.ctx_mut()?;
        let nfcee_id = ctx
            .smx_id
            .ok_or_else(|| HalError::unsupported("no embedded secure chip"))?;
        let enable = matches!(mode, SmxMode::Wired | SmxMode::Virtual);
        let wired = mode == SmxMode::Wired;
        self.begin_se_switch(SeTarget::Smx, nfcee_id, enable, wired, completion)
    }

    /// Switch the UICC to `mode`.
    ///
    /// # Errors
    ///
    /// Returns [`HalError::FeatureNotSupported`] if no UICC was detected.
    pub fn switch_swp_mode(&mut self, mode: SwpMode, completion: Completion<()>) -> Result<()> {
        let ctx = self.ctx_mut()?;
        let nfcee_id = ctx
            .uicc_id
            .ok_or_else(|| HalError::unsupported("no UICC"))?;
        let enable = matches!(mode, SwpMode::On | SwpMode::Default);
        self.begin_se_switch(SeTarget::Uicc, nfcee_id, enable, false, completion)
    }

    fn begin_se_switch(
        &mut self,
        target: SeTarget,
        nfcee_id: u8,
        enable: bool,
        wired: bool,
        completion: Completion<()>,
    ) -> Result<()> {
        let ctx = self.ctx_mut()?;
        let current = ctx.fsm.current();
        if !current.is_operational() {
            return Err(HalError::invalid_state(current, format!("switch {target} mode")));
        }
        let next = if wired {
            ControllerState::TargetDiscovered
        } else {
            current
        };
        ctx.fsm.begin(next)?;

        let mut steps = VecDeque::from([switch_command(ctx.is_hci, nfcee_id, enable)]);
        if wired {
            steps.push_back(Command::CreateConnection { nfcee_id });
        }
        let first = steps.front().cloned();
        ctx.pending = Some(PendingOp::SeSwitch(SeSwitchOp {
            target,
            nfcee_id,
            steps,
            wired,
            completion,
        }));
        debug!(%target, nfcee_id, enable, wired, "switching secure element");

        if let Some(command) = first
            && let Err(error) = self.send_command(command)
        {
            self.drop_pending();
            return Err(error);
        }
        Ok(())
    }

    pub(crate) fn on_se_switch_step(&mut self, mut op: SeSwitchOp, result: Result<Response>) {
        let Some(ctx) = self.context.as_mut() else {
            return;
        };
        let response = match result {
            Ok(response) => response,
            Err(error) => {
                warn!(target = %op.target, %error, "secure element switch failed");
                ctx.fsm.clear_pending();
                return complete(op.completion, Err(error));
            }
        };

        let step = op.steps.pop_front();
        if let (Some(Command::CreateConnection { .. }), Response::ConnectionCreated { conn_id }) =
            (&step, &response)
        {
            ctx.se_conn_id = Some(*conn_id);
        }
        if let Some(next) = op.steps.front().cloned() {
            ctx.pending = Some(PendingOp::SeSwitch(op));
            if let Err(error) = self.send_command(next) {
                self.fail_pending(error);
            }
            return;
        }

        if op.wired {
            let Some(conn_id) = ctx.se_conn_id else {
                warn!("secure element granted no logical connection");
                ctx.fsm.clear_pending();
                return complete(op.completion, Err(HalError::CoreInterfaceError));
            };
            ctx.clear_round();
            ctx.activated = None;
            let handle = ctx.allocate_handle();
            let device = wired_device(handle, conn_id);
            ctx.candidates.push(device.clone());
            ctx.fsm.commit();
            info!(nfcee_id = op.nfcee_id, conn_id, "secure chip in wired mode");
            ctx.listeners.notify_tag(DiscoveryNotification::Discovered {
                status: DiscoveryStatus::Success,
                devices: vec![device],
            });
        } else {
            if op.target == SeTarget::Smx {
                ctx.se_conn_id = None;
            }
            ctx.fsm.commit();
            info!(target = %op.target, nfcee_id = op.nfcee_id, "secure element mode switched");
        }
        complete(op.completion, Ok(()));
    }

    pub(crate) fn on_parameters_complete(&mut self, completion: Completion<()>, result: Result<()>) {
        let Some(ctx) = self.context.as_mut() else {
            return;
        };
        match &result {
            Ok(()) => {
                ctx.fsm.commit();
                debug!("parameters applied");
            }
            Err(error) => {
                warn!(%error, "parameters rejected");
                ctx.fsm.clear_pending();
            }
        }
        complete(completion, result);
    }

    pub(crate) fn on_parameters_stored(&mut self) {
        let Some(ctx) = self.context.as_mut() else {
            return;
        };
        match ctx.pending.take() {
            Some(PendingOp::Parameters {
                completion,
                opcode: None,
            }) => {
                ctx.fsm.commit();
                complete(completion, Ok(()));
            }
            other => ctx.pending = other,
        }
    }

    pub(crate) fn on_se_notification(&mut self, notification: SeNotification) {
        let Some(ctx) = self.context.as_mut() else {
            return;
        };
        let event = match notification {
            SeNotification::Transaction {
                nfcee_id,
                aid,
                data,
            } => SecureElementEvent::Transaction {
                nfcee_id,
                aid,
                data,
            },
            SeNotification::FieldChanged { nfcee_id, on } => {
                SecureElementEvent::FieldChanged { nfcee_id, on }
            }
        };
        if !ctx.listeners.notify_secure_element(event) {
            debug!("secure element event without listener dropped");
        }
    }

    /// Release the pending slot after a synchronous transport rejection.
    pub(crate) fn drop_pending(&mut self) {
        if let Some(ctx) = self.context.as_mut() {
            ctx.pending = None;
            ctx.fsm.clear_pending();
        }
    }

    /// Fail and release the pending request.
    pub(crate) fn fail_pending(&mut self, error: HalError) {
        if let Some(ctx) = self.context.as_mut() {
            ctx.fsm.clear_pending();
            if let Some(op) = ctx.pending.take() {
                op.fail(error);
            }
        }
    }
}
