//! Discovery engine.
//!
//! A `ConfigureDiscovery` request becomes a [`DiscoveryConfig`]: a protocol
//! mask plus the technology list handed to the controller. Each activation
//! notification is then expanded into candidates by [`resolve_candidates`]
//! and the round is delivered to the one listener that should see it.

use std::collections::BTreeSet;

use nfchal_core::constants::{
    FELICA_P2P_NFCID2_PREFIX, MIFARE_SAK_VALUES, MIFARE_UL_UID_LENGTH, NON_COMPLIANT_ATQA,
    NON_COMPLIANT_SAK, NXP_MANUFACTURER_ID, SAK_ISO14443_4_BIT, SAK_NFC_DEP_BIT,
};
use nfchal_core::device::{
    FelicaInfo, Iso14443A4Info, Iso14443AInfo, Iso14443B4Info, Iso15693Info, JewelInfo,
    MifareFamily, P2pInfo,
};
use nfchal_core::{
    Bitrate, DeviceInfo, DiscoverTechnology, DiscoveryMode, DiscoveryRequest, DiscoveryStatus,
    HalError, ListenerKind, P2pMode, ProtocolMask, RemoteDevice, Result, RfMode, RfProtocol,
    RfTechnology,
};
use nfchal_transport::{
    ActivationInfo, ActivationParams, Command, Opcode, TechParams, TimerService, Transport,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::context::{complete, Completion, PendingOp};
use crate::fsm::ControllerState;
use crate::notification::{DiscoveryNotification, P2pNotification, SecureElementEvent};
use crate::session::Hal4;

/// A discovery request as applied to the wheel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    pub request: DiscoveryRequest,
    /// Protocols a candidate may be reported with.
    pub protocols: ProtocolMask,
    /// Wheel entries, sorted and free of duplicates.
    pub technologies: Vec<DiscoverTechnology>,
}

impl DiscoveryConfig {
    /// Map a caller request onto protocol bits and wheel entries.
    ///
    /// ```
    /// use nfchal_core::{DiscoverTechnology, DiscoveryRequest, PollFlags, ProtocolMask};
    /// use nfchal_hal4::DiscoveryConfig;
    ///
    /// let request = DiscoveryRequest {
    ///     poll: PollFlags { iso14443a: true, ..Default::default() },
    ///     ..Default::default()
    /// };
    /// let config = DiscoveryConfig::from_request(request);
    /// assert!(config.protocols.contains(ProtocolMask::MIFARE));
    /// assert_eq!(config.technologies, vec![DiscoverTechnology::PollA]);
    /// ```
    pub fn from_request(request: DiscoveryRequest) -> Self {
        let poll = request.poll;
        let mut protocols = ProtocolMask::NONE;
        let mut technologies = BTreeSet::new();

        if poll.iso14443a {
            protocols |= ProtocolMask::ISO14443_3A | ProtocolMask::ISO14443_4A | ProtocolMask::MIFARE;
            technologies.insert(DiscoverTechnology::PollA);
        }
        if poll.iso14443b {
            protocols |= ProtocolMask::ISO14443_4B;
            technologies.insert(DiscoverTechnology::PollB);
        }
        if poll.felica212 {
            protocols |= ProtocolMask::FELICA;
            technologies.insert(DiscoverTechnology::PollF212);
        }
        if poll.felica424 {
            protocols |= ProtocolMask::FELICA;
            technologies.insert(DiscoverTechnology::PollF424);
        }
        if poll.jewel {
            protocols |= ProtocolMask::JEWEL;
            technologies.insert(DiscoverTechnology::PollA);
        }
        if poll.iso15693 {
            protocols |= ProtocolMask::ISO15693;
            technologies.insert(DiscoverTechnology::PollV);
        }

        let speeds = request.p2p_mode.speeds();
        if poll.nfcip1 && !speeds.is_disabled() {
            protocols |= ProtocolMask::NFCIP_INITIATOR;
            let listen = !request.nfcip_target_disable;
            if listen {
                protocols |= ProtocolMask::NFCIP_TARGET;
            }
            for (speed, poll_entry, listen_entry) in [
                (P2pMode::A106, DiscoverTechnology::PollA, DiscoverTechnology::ListenA),
                (P2pMode::F212, DiscoverTechnology::PollF212, DiscoverTechnology::ListenF212),
                (P2pMode::F424, DiscoverTechnology::PollF424, DiscoverTechnology::ListenF424),
            ] {
                if speeds.allows(speed) {
                    technologies.insert(poll_entry);
                    if listen {
                        technologies.insert(listen_entry);
                    }
                }
            }
        }

        Self {
            request,
            protocols,
            technologies: technologies.into_iter().collect(),
        }
    }

    fn allows(&self, bit: ProtocolMask) -> bool {
        self.protocols.contains(bit)
    }

    fn allows_p2p_speed(&self, bitrate: Bitrate) -> bool {
        let speed = match bitrate {
            Bitrate::Kbps106 => P2pMode::A106,
            Bitrate::Kbps212 => P2pMode::F212,
            Bitrate::Kbps424 | Bitrate::Kbps848 => P2pMode::F424,
        };
        self.allows(ProtocolMask::NFCIP_INITIATOR) && self.request.p2p_mode.allows(speed)
    }
}

/// One candidate produced from an activation, before its handle is assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub protocol: RfProtocol,
    pub info: DeviceInfo,
}

impl Candidate {
    fn new(protocol: RfProtocol, info: DeviceInfo) -> Self {
        Self { protocol, info }
    }
}

fn p2p_info(nfcid: &[u8], params: &ActivationParams, bitrate: Bitrate) -> P2pInfo {
    match params {
        ActivationParams::NfcDep {
            nfcid3,
            general_bytes,
            max_frame_len,
        } => P2pInfo {
            nfcid: if nfcid3.is_empty() {
                nfcid.to_vec()
            } else {
                nfcid3.clone()
            },
            general_bytes: general_bytes.clone(),
            max_frame_len: *max_frame_len,
            bitrate,
        },
        _ => P2pInfo {
            nfcid: nfcid.to_vec(),
            general_bytes: Vec::new(),
            max_frame_len: 0,
            bitrate,
        },
    }
}

fn resolve_a(
    info: &ActivationInfo,
    config: &DiscoveryConfig,
    p2p_listener: bool,
    a: Iso14443AInfo,
) -> Vec<Candidate> {
    let mut out = Vec::new();
    let sak = a.sak;

    if info.protocol == RfProtocol::T1t {
        if config.allows(ProtocolMask::JEWEL) {
            out.push(Candidate::new(
                RfProtocol::T1t,
                DeviceInfo::Jewel(JewelInfo {
                    uid: a.uid,
                    atqa: a.atqa,
                }),
            ));
        }
        return out;
    }

    let non_compliant = a.atqa == NON_COMPLIANT_ATQA && sak == NON_COMPLIANT_SAK;
    let iso_dep = sak & SAK_ISO14443_4_BIT != 0;
    let unlabeled_ultralight =
        sak == 0 && a.uid.len() == MIFARE_UL_UID_LENGTH && a.uid.first() == Some(&NXP_MANUFACTURER_ID);
    let mifare = MIFARE_SAK_VALUES.contains(&sak) || unlabeled_ultralight;

    if iso_dep && config.allows(ProtocolMask::ISO14443_4A) {
        let ats = match &info.activation_params {
            ActivationParams::IsoDepA { ats } => ats.clone(),
            _ => Vec::new(),
        };
        out.push(Candidate::new(
            RfProtocol::IsoDep,
            DeviceInfo::Iso14443A4(Iso14443A4Info { a: a.clone(), ats }),
        ));
    }

    if mifare
        && config.allows(ProtocolMask::MIFARE)
        && let Some(family) = MifareFamily::from_sak(sak)
    {
        out.push(Candidate::new(
            family.protocol(),
            DeviceInfo::Mifare {
                a: a.clone(),
                family,
            },
        ));
    }

    if sak & SAK_NFC_DEP_BIT == 0 {
        if config.allows(ProtocolMask::ISO14443_3A) {
            out.push(Candidate::new(RfProtocol::T2t, DeviceInfo::Iso14443A(a)));
        }
    } else if p2p_listener && config.allows_p2p_speed(Bitrate::Kbps106) {
        if non_compliant {
            // Advertises NFC-DEP but only answers as a memory tag.
            if config.allows(ProtocolMask::ISO14443_3A) {
                out.push(Candidate::new(RfProtocol::T2t, DeviceInfo::Iso14443A(a)));
            }
        } else {
            out.push(Candidate::new(
                RfProtocol::NfcDep,
                DeviceInfo::P2pTarget(p2p_info(&a.uid, &info.activation_params, Bitrate::Kbps106)),
            ));
        }
    }

    out
}

/// Expand one poll-side activation into candidates.
///
/// Only protocols enabled in `config` are reported. P2P targets are only
/// reported when a P2P listener is registered.
pub fn resolve_candidates(
    info: &ActivationInfo,
    config: &DiscoveryConfig,
    p2p_listener: bool,
) -> Vec<Candidate> {
    match &info.tech_params {
        TechParams::A {
            sens_res,
            nfcid1,
            sel_res,
        } => resolve_a(
            info,
            config,
            p2p_listener,
            Iso14443AInfo {
                uid: nfcid1.clone(),
                atqa: *sens_res,
                sak: *sel_res,
            },
        ),
        TechParams::B {
            nfcid0,
            app_data,
            prot_info,
        } => {
            if !config.allows(ProtocolMask::ISO14443_4B) {
                return Vec::new();
            }
            let attrib_response = match &info.activation_params {
                ActivationParams::IsoDepB { attrib_response } => attrib_response.clone(),
                _ => Vec::new(),
            };
            vec![Candidate::new(
                RfProtocol::IsoDep,
                DeviceInfo::Iso14443B4(Iso14443B4Info {
                    pupi: *nfcid0,
                    app_data: *app_data,
                    prot_info: prot_info.clone(),
                    attrib_response,
                }),
            )]
        }
        TechParams::F {
            nfcid2,
            pad,
            system_code,
            bitrate,
        } => {
            if nfcid2.starts_with(&FELICA_P2P_NFCID2_PREFIX)
                && p2p_listener
                && config.allows_p2p_speed(*bitrate)
            {
                return vec![Candidate::new(
                    RfProtocol::NfcDep,
                    DeviceInfo::P2pTarget(p2p_info(nfcid2, &info.activation_params, *bitrate)),
                )];
            }
            if !config.allows(ProtocolMask::FELICA) {
                return Vec::new();
            }
            vec![Candidate::new(
                RfProtocol::T3t,
                DeviceInfo::Felica(FelicaInfo {
                    idm: *nfcid2,
                    pmm: *pad,
                    system_code: *system_code,
                    bitrate: *bitrate,
                }),
            )]
        }
        TechParams::V { uid, dsfid, afi } => {
            if !config.allows(ProtocolMask::ISO15693) {
                return Vec::new();
            }
            vec![Candidate::new(
                RfProtocol::T5t,
                DeviceInfo::Iso15693(Iso15693Info {
                    uid: *uid,
                    dsfid: *dsfid,
                    afi: *afi,
                }),
            )]
        }
        TechParams::Listen => Vec::new(),
    }
}

fn listen_bitrate(info: &ActivationInfo) -> Bitrate {
    match info.technology {
        RfTechnology::F => Bitrate::Kbps212,
        _ => Bitrate::Kbps106,
    }
}

impl<T: Transport, M: TimerService> Hal4<T, M> {
    /// Configure, restart or stop the discovery wheel.
    ///
    /// `Config` and `Start` apply `request` and start the wheel. `Resume`
    /// restarts it with the active configuration. `Stop` stops it.
    ///
    /// # Errors
    ///
    /// - [`HalError::NotInitialised`] without a context.
    /// - [`HalError::Busy`] while another request is pending.
    /// - [`HalError::InvalidState`] while a device is connected.
    /// - [`HalError::InvalidParameter`] if the request enables no technology.
    pub fn configure_discovery(
        &mut self,
        mode: DiscoveryMode,
        request: DiscoveryRequest,
        completion: Completion<()>,
    ) -> Result<()> {
        let ctx = self.ctx_mut()?;
        let current = ctx.fsm.current();
        let allowed = matches!(
            current,
            ControllerState::OpenAndReady
                | ControllerState::Configuring
                | ControllerState::TargetActivating
                | ControllerState::TargetDiscovered
                | ControllerState::Emulation
        );
        if ctx.fsm.is_busy() {
            return Err(HalError::Busy);
        }
        if !allowed {
            return Err(HalError::invalid_state(current, "configure discovery"));
        }

        let rollback = matches!(mode, DiscoveryMode::Config | DiscoveryMode::Start);
        let command = match mode {
            DiscoveryMode::Config | DiscoveryMode::Start => {
                let config = DiscoveryConfig::from_request(request);
                if config.technologies.is_empty() {
                    return Err(HalError::invalid_parameter(
                        "discovery request enables no technology",
                    ));
                }
                ctx.fsm.begin(ControllerState::Configuring)?;
                let command = Command::StartDiscovery(config.technologies.clone());
                ctx.previous_discovery = ctx.discovery.replace(config);
                command
            }
            DiscoveryMode::Resume => {
                let Some(config) = ctx.discovery.as_ref() else {
                    return Err(HalError::invalid_state(current, "resume discovery"));
                };
                let command = Command::StartDiscovery(config.technologies.clone());
                ctx.fsm.begin(ControllerState::Configuring)?;
                ctx.previous_discovery = None;
                command
            }
            DiscoveryMode::Stop => {
                ctx.fsm.begin(ControllerState::OpenAndReady)?;
                Command::StopDiscovery
            }
        };

        let opcode = command.opcode();
        ctx.pending = Some(PendingOp::Discovery {
            completion: Some(completion),
            opcode,
            rollback,
        });
        debug!(?mode, "configuring discovery");

        if let Err(error) = self.send_command(command) {
            if let Some(ctx) = self.context.as_mut() {
                ctx.pending = None;
                ctx.fsm.clear_pending();
                if rollback {
                    ctx.discovery = ctx.previous_discovery.take();
                }
            }
            return Err(error);
        }
        Ok(())
    }

    pub(crate) fn on_discovery_complete(
        &mut self,
        completion: Option<Completion<()>>,
        opcode: Opcode,
        rollback: bool,
        result: Result<()>,
    ) {
        let Some(ctx) = self.context.as_mut() else {
            return;
        };

        match result {
            Ok(()) => {
                ctx.fsm.commit();
                ctx.previous_discovery = None;
                ctx.clear_round();
                ctx.activated = None;
                if opcode == Opcode::StopDiscovery {
                    info!("discovery stopped");
                } else {
                    info!(
                        technologies = ?ctx.discovery.as_ref().map(|c| &c.technologies),
                        "discovery running"
                    );
                }
                if let Some(completion) = completion {
                    complete(completion, Ok(()));
                }
            }
            Err(error) => {
                warn!(%opcode, %error, "discovery command failed");
                ctx.fsm.clear_pending();
                if rollback {
                    ctx.discovery = ctx.previous_discovery.take();
                }
                match completion {
                    Some(completion) => complete(completion, Err(error)),
                    None => ctx.listeners.notify_discovery_failed(&error),
                }
            }
        }
    }

    pub(crate) fn on_discover_next_complete(&mut self, result: Result<()>) {
        let Some(ctx) = self.context.as_mut() else {
            return;
        };
        match result {
            Ok(()) => {
                ctx.fsm.commit();
                debug!(notifications = ctx.round.notifications, "waiting for next device");
            }
            Err(error) => {
                warn!(%error, "discover next failed; delivering partial round");
                ctx.fsm.clear_pending();
                self.finish_round();
            }
        }
    }

    /// Restart the wheel with the active configuration.
    ///
    /// Used when a round ends with nobody to tell. No completion is owed.
    pub(crate) fn restart_discovery(&mut self) {
        let Some(ctx) = self.context.as_mut() else {
            return;
        };
        let Some(config) = ctx.discovery.as_ref() else {
            debug!("no discovery configuration to restart");
            return;
        };
        let command = Command::StartDiscovery(config.technologies.clone());
        if let Err(error) = ctx.fsm.begin(ControllerState::Configuring) {
            warn!(%error, "cannot restart discovery");
            return;
        }
        ctx.pending = Some(PendingOp::Discovery {
            completion: None,
            opcode: Opcode::StartDiscovery,
            rollback: false,
        });
        debug!("restarting discovery");

        if let Err(error) = self.send_command(command)
            && let Some(ctx) = self.context.as_mut()
        {
            ctx.pending = None;
            ctx.fsm.clear_pending();
            ctx.listeners.notify_discovery_failed(&error);
        }
    }

    pub(crate) fn on_activated(&mut self, info: ActivationInfo) {
        let Some(ctx) = self.context.as_mut() else {
            return;
        };

        // The notification can overtake the DiscoverNext completion.
        if matches!(ctx.pending, Some(PendingOp::DiscoverNext)) {
            ctx.pending = None;
            ctx.fsm.commit();
        }
        if matches!(ctx.pending, Some(PendingOp::Connect { .. })) {
            debug!(discovery_id = info.discovery_id, "target selected");
            ctx.activated = Some((info.discovery_id, info.protocol));
            return;
        }

        let current = ctx.fsm.current();
        if ctx.fsm.is_busy()
            || !matches!(
                current,
                ControllerState::Configuring | ControllerState::TargetActivating
            )
        {
            warn!(state = %current, discovery_id = info.discovery_id, "activation ignored");
            return;
        }
        if ctx.discovery.is_none() {
            warn!("activation without discovery configuration ignored");
            return;
        }

        match info.mode {
            RfMode::Poll => self.on_poll_activation(info),
            RfMode::Listen => self.on_listen_activation(info),
        }
    }

    fn on_poll_activation(&mut self, info: ActivationInfo) {
        let capacity = self.config.max_remote_devices;
        let Some(ctx) = self.context.as_mut() else {
            return;
        };
        let Some(config) = ctx.discovery.as_ref() else {
            return;
        };
        let p2p_listener = ctx.listeners.is_registered(ListenerKind::P2pDiscovery);
        let found = resolve_candidates(&info, config, p2p_listener);

        if ctx.candidates.len() + found.len() > capacity {
            let error = HalError::CapacityExceeded { capacity };
            warn!(%error, "discovery round aborted");
            ctx.clear_round();
            ctx.activated = None;
            ctx.listeners.notify_discovery_failed(&error);
            self.restart_discovery();
            return;
        }

        if ctx.round.notifications == 0 && found.len() > 1 {
            ctx.round.status = DiscoveryStatus::MultipleProtocols;
        }
        ctx.round.notifications += 1;
        debug!(
            discovery_id = info.discovery_id,
            protocol = ?info.protocol,
            candidates = found.len(),
            more = info.more,
            "device activated"
        );
        for candidate in found {
            let handle = ctx.allocate_handle();
            ctx.candidates.push(RemoteDevice::new(
                handle,
                info.discovery_id,
                candidate.protocol,
                candidate.info,
            ));
        }
        ctx.activated = Some((info.discovery_id, info.protocol));

        if info.more && ctx.round.notifications < capacity {
            ctx.round.status = DiscoveryStatus::MultipleTags;
            if let Err(error) = ctx.fsm.begin(ControllerState::TargetActivating) {
                warn!(%error, "cannot collect further devices");
                return self.finish_round();
            }
            ctx.pending = Some(PendingOp::DiscoverNext);
            if let Err(error) = self.send_command(Command::DiscoverNext) {
                warn!(%error, "discover next rejected; delivering partial round");
                if let Some(ctx) = self.context.as_mut() {
                    ctx.pending = None;
                    ctx.fsm.clear_pending();
                }
                self.finish_round();
            }
            return;
        }

        self.finish_round();
    }

    fn on_listen_activation(&mut self, info: ActivationInfo) {
        let Some(ctx) = self.context.as_mut() else {
            return;
        };
        let target_enabled = ctx
            .discovery
            .as_ref()
            .is_some_and(|c| c.protocols.contains(ProtocolMask::NFCIP_TARGET));

        if info.protocol == RfProtocol::NfcDep {
            if !target_enabled || !ctx.listeners.is_registered(ListenerKind::P2pDiscovery) {
                debug!("remote initiator with no P2P listener");
                return self.restart_discovery();
            }
            let bitrate = listen_bitrate(&info);
            let handle = ctx.allocate_handle();
            let peer = p2p_info(&[], &info.activation_params, bitrate);
            ctx.candidates.push(RemoteDevice::new(
                handle,
                info.discovery_id,
                RfProtocol::NfcDep,
                DeviceInfo::P2pInitiator(peer),
            ));
            ctx.round.notifications += 1;
            ctx.activated = Some((info.discovery_id, info.protocol));
            return self.finish_round();
        }

        if let Err(error) = ctx.fsm.advance(ControllerState::Emulation) {
            warn!(%error, "cannot enter emulation");
            return;
        }
        info!(technology = ?info.technology, "card emulation activated");
        ctx.listeners
            .notify_secure_element(SecureElementEvent::Activated {
                technology: info.technology,
            });
    }

    /// Close the round and hand it to the right listener.
    pub(crate) fn finish_round(&mut self) {
        let Some(ctx) = self.context.as_mut() else {
            return;
        };
        if ctx.candidates.is_empty() {
            debug!("round produced no candidates");
            ctx.clear_round();
            ctx.activated = None;
            return self.restart_discovery();
        }
        if let Err(error) = ctx.fsm.advance(ControllerState::TargetDiscovered) {
            warn!(%error, "cannot finish discovery round");
            return;
        }

        if ctx.listeners.is_registered(ListenerKind::P2pDiscovery) {
            let Some(peer) = ctx.candidates.iter().find(|d| d.info.is_p2p()).cloned() else {
                debug!("P2P listener registered but no peer in round; restarting discovery");
                ctx.clear_round();
                ctx.activated = None;
                return self.restart_discovery();
            };
            ctx.candidates.retain(|d| d.handle == peer.handle);
            info!(device = %peer, "P2P peer discovered");
            ctx.listeners.notify_p2p(P2pNotification::Discovered(peer));
            return;
        }

        if ctx.listeners.is_registered(ListenerKind::TagDiscovery) {
            let status = ctx.round.status;
            info!(count = ctx.candidates.len(), ?status, "tags discovered");
            ctx.listeners.notify_tag(DiscoveryNotification::Discovered {
                status,
                devices: ctx.candidates.clone(),
            });
            return;
        }

        debug!("no listener for discovered devices; restarting discovery");
        ctx.clear_round();
        ctx.activated = None;
        self.restart_discovery();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nfchal_core::{DeviceKind, PollFlags};
    use rstest::rstest;

    fn request(poll: PollFlags, p2p_mode: P2pMode, target_disable: bool) -> DiscoveryRequest {
        DiscoveryRequest {
            poll,
            p2p_mode,
            nfcip_target_disable: target_disable,
        }
    }

    fn everything() -> DiscoveryConfig {
        DiscoveryConfig::from_request(request(PollFlags::all(), P2pMode::DEFAULT, false))
    }

    fn poll_a(sak: u8, uid: Vec<u8>) -> ActivationInfo {
        ActivationInfo {
            discovery_id: 1,
            protocol: RfProtocol::IsoDep,
            technology: RfTechnology::A,
            mode: RfMode::Poll,
            tech_params: TechParams::A {
                sens_res: [0x44, 0x00],
                nfcid1: uid,
                sel_res: sak,
            },
            activation_params: ActivationParams::None,
            more: false,
        }
    }

    fn kinds(candidates: &[Candidate]) -> Vec<DeviceKind> {
        candidates.iter().map(|c| c.info.kind()).collect()
    }

    #[test]
    fn test_p2p_disabled_sets_no_p2p_bits() {
        let config = DiscoveryConfig::from_request(request(PollFlags::all(), P2pMode::DISABLED, false));
        assert!(!config.protocols.contains(ProtocolMask::NFCIP_INITIATOR));
        assert!(!config.protocols.contains(ProtocolMask::NFCIP_TARGET));
        assert!(!config.technologies.contains(&DiscoverTechnology::ListenA));
    }

    #[test]
    fn test_target_disable_drops_listen_entries() {
        let config = DiscoveryConfig::from_request(request(PollFlags::all(), P2pMode::DEFAULT, true));
        assert!(config.protocols.contains(ProtocolMask::NFCIP_INITIATOR));
        assert!(!config.protocols.contains(ProtocolMask::NFCIP_TARGET));
        assert!(config.technologies.iter().all(|t| !matches!(
            t,
            DiscoverTechnology::ListenA | DiscoverTechnology::ListenF212 | DiscoverTechnology::ListenF424
        )));
    }

    #[test]
    fn test_explicit_speed_only_adds_that_speed() {
        let poll = PollFlags {
            nfcip1: true,
            ..Default::default()
        };
        let config = DiscoveryConfig::from_request(request(poll, P2pMode::F424, false));
        assert_eq!(
            config.technologies,
            vec![DiscoverTechnology::PollF424, DiscoverTechnology::ListenF424]
        );
    }

    #[test]
    fn test_technologies_are_deduplicated() {
        let poll = PollFlags {
            iso14443a: true,
            jewel: true,
            ..Default::default()
        };
        let config = DiscoveryConfig::from_request(request(poll, P2pMode::DISABLED, false));
        assert_eq!(config.technologies, vec![DiscoverTechnology::PollA]);
    }

    #[rstest]
    #[case(0x20, vec![DeviceKind::Iso14443A4, DeviceKind::Iso14443A])]
    #[case(0x28, vec![DeviceKind::Iso14443A4, DeviceKind::Mifare, DeviceKind::Iso14443A])]
    #[case(0x08, vec![DeviceKind::Mifare, DeviceKind::Iso14443A])]
    #[case(0x04, vec![DeviceKind::Iso14443A])]
    #[case(0x60, vec![DeviceKind::Iso14443A4])]
    fn test_sak_rules_apply_independently(#[case] sak: u8, #[case] expected: Vec<DeviceKind>) {
        let found = resolve_candidates(&poll_a(sak, vec![0x08, 1, 2, 3]), &everything(), false);
        assert_eq!(kinds(&found), expected);
    }

    #[test]
    fn test_iso_dep_and_nfc_dep_with_listener() {
        let found = resolve_candidates(&poll_a(0x60, vec![0x08, 1, 2, 3]), &everything(), true);
        assert_eq!(kinds(&found), vec![DeviceKind::Iso14443A4, DeviceKind::P2pTarget]);
    }

    #[test]
    fn test_unlabeled_ultralight() {
        let found = resolve_candidates(
            &poll_a(0x00, vec![0x04, 1, 2, 3, 4, 5, 6]),
            &everything(),
            false,
        );
        assert_eq!(kinds(&found), vec![DeviceKind::Mifare, DeviceKind::Iso14443A]);
        assert_eq!(found[0].protocol, RfProtocol::T2t);
        assert!(matches!(
            found[0].info,
            DeviceInfo::Mifare {
                family: MifareFamily::Ultralight,
                ..
            }
        ));
    }

    #[test]
    fn test_nfc_dep_needs_listener() {
        let info = poll_a(0x40, vec![0x08, 1, 2, 3]);
        assert!(resolve_candidates(&info, &everything(), false).is_empty());

        let found = resolve_candidates(&info, &everything(), true);
        assert_eq!(kinds(&found), vec![DeviceKind::P2pTarget]);
        assert_eq!(found[0].protocol, RfProtocol::NfcDep);
    }

    #[test]
    fn test_non_compliant_card_falls_back_to_memory_tag() {
        let mut info = poll_a(NON_COMPLIANT_SAK, vec![0x08, 1, 2, 3]);
        info.tech_params = TechParams::A {
            sens_res: NON_COMPLIANT_ATQA,
            nfcid1: vec![0x08, 1, 2, 3],
            sel_res: NON_COMPLIANT_SAK,
        };
        let found = resolve_candidates(&info, &everything(), true);
        assert_eq!(kinds(&found), vec![DeviceKind::Iso14443A]);

        assert!(resolve_candidates(&info, &everything(), false).is_empty());

        let no_106 = DiscoveryConfig::from_request(request(PollFlags::all(), P2pMode::F212, false));
        assert!(resolve_candidates(&info, &no_106, true).is_empty());
    }

    #[test]
    fn test_disabled_protocol_is_not_reported() {
        let poll = PollFlags {
            felica212: true,
            ..Default::default()
        };
        let config = DiscoveryConfig::from_request(request(poll, P2pMode::DISABLED, false));
        assert!(resolve_candidates(&poll_a(0x20, vec![1, 2, 3, 4]), &config, false).is_empty());
    }

    #[test]
    fn test_felica_p2p_prefix() {
        let mut nfcid2 = [0u8; 8];
        nfcid2[..2].copy_from_slice(&FELICA_P2P_NFCID2_PREFIX);
        let info = ActivationInfo {
            discovery_id: 2,
            protocol: RfProtocol::NfcDep,
            technology: RfTechnology::F,
            mode: RfMode::Poll,
            tech_params: TechParams::F {
                nfcid2,
                pad: [0; 8],
                system_code: None,
                bitrate: Bitrate::Kbps212,
            },
            activation_params: ActivationParams::None,
            more: false,
        };

        let found = resolve_candidates(&info, &everything(), true);
        assert_eq!(kinds(&found), vec![DeviceKind::P2pTarget]);

        let found = resolve_candidates(&info, &everything(), false);
        assert_eq!(kinds(&found), vec![DeviceKind::Felica]);
    }

    #[test]
    fn test_jewel_uses_t1t() {
        let mut info = poll_a(0x00, vec![1, 2, 3, 4]);
        info.protocol = RfProtocol::T1t;
        let found = resolve_candidates(&info, &everything(), false);
        assert_eq!(kinds(&found), vec![DeviceKind::Jewel]);
        assert_eq!(found[0].protocol, RfProtocol::T1t);
    }
}
