//! Common test utilities for integration tests.
//!
//! [`Harness`] wraps a [`Hal4`] over the mock transport and manual timers
//! and plays the controller's part: it answers the last command, feeds
//! activations and data, and collects listener notifications.
//!
//! The activation builders (`iso_dep_a`, `felica`, ...) produce the
//! notifications a controller sends for common cards.

#![allow(dead_code)]

use nfchal_core::{
    Bitrate, DeviceHandle, DiscoveryRequest, DiscoveryMode, InitType, P2pMode, PollFlags,
    RemoteDevice, RfMode, RfProtocol, RfTechnology,
};
use nfchal_hal4::{
    Completion, DefaultEvent, DiscoveryNotification, Hal4, Hal4Config, Listener, P2pNotification,
    SecureElementEvent,
};
use nfchal_transport::mock::{ManualTimers, MockTransport, MockTransportHandle};
use nfchal_transport::{
    ActivationInfo, ActivationParams, Command, FirmwareInfo, NfceeInfo, NfceeProtocol, OpenInfo,
    Opcode, Response, TechParams, TransportError, TransportEvent,
};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::oneshot;

pub type TestHal = Hal4<MockTransport, ManualTimers>;
pub type Outcome<T> = oneshot::Receiver<nfchal_core::Result<T>>;

/// Install a test log writer once; `RUST_LOG` picks the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Create a completion and the receiver that observes it.
pub fn completion<T>() -> (Completion<T>, Outcome<T>) {
    oneshot::channel()
}

/// Read a completion that must have been answered.
pub fn outcome<T>(rx: &mut Outcome<T>) -> nfchal_core::Result<T> {
    rx.try_recv().expect("completion not answered")
}

/// Assert a completion has not been answered yet.
pub fn assert_pending<T: std::fmt::Debug>(rx: &mut Outcome<T>) {
    assert_eq!(rx.try_recv().err(), Some(oneshot::error::TryRecvError::Empty));
}

pub fn smx() -> NfceeInfo {
    NfceeInfo::new(0x01, vec![NfceeProtocol::Apdu])
}

pub fn uicc() -> NfceeInfo {
    NfceeInfo::new(0x02, vec![NfceeProtocol::HciAccess])
}

/// Poll everything, P2P at default speeds.
pub fn discovery_request() -> DiscoveryRequest {
    DiscoveryRequest {
        poll: PollFlags::all(),
        p2p_mode: P2pMode::DEFAULT,
        nfcip_target_disable: false,
    }
}

fn poll(discovery_id: u8, protocol: RfProtocol, technology: RfTechnology, tech_params: TechParams) -> ActivationInfo {
    ActivationInfo {
        discovery_id,
        protocol,
        technology,
        mode: RfMode::Poll,
        tech_params,
        activation_params: ActivationParams::None,
        more: false,
    }
}

pub fn poll_a(discovery_id: u8, protocol: RfProtocol, sak: u8, uid: Vec<u8>) -> ActivationInfo {
    poll(
        discovery_id,
        protocol,
        RfTechnology::A,
        TechParams::A {
            sens_res: [0x44, 0x00],
            nfcid1: uid,
            sel_res: sak,
        },
    )
}

/// ISO14443-4A smart card.
pub fn iso_dep_a(discovery_id: u8) -> ActivationInfo {
    let mut info = poll_a(discovery_id, RfProtocol::IsoDep, 0x20, vec![0x08, 0x11, 0x22, 0x33]);
    info.activation_params = ActivationParams::IsoDepA {
        ats: vec![0x05, 0x78, 0x80, 0x70, 0x02],
    };
    info
}

/// Mifare Ultralight with an NXP UID.
pub fn ultralight(discovery_id: u8) -> ActivationInfo {
    poll_a(
        discovery_id,
        RfProtocol::T2t,
        0x00,
        vec![0x04, 0xA1, 0xB2, 0xC3, 0xD4, 0xE5, 0xF6],
    )
}

pub fn felica(discovery_id: u8) -> ActivationInfo {
    poll(
        discovery_id,
        RfProtocol::T3t,
        RfTechnology::F,
        TechParams::F {
            nfcid2: [0x01, 0x2E, 0x4C, 0x00, 0x11, 0x22, 0x33, 0x44],
            pad: [0; 8],
            system_code: Some([0x12, 0xFC]),
            bitrate: Bitrate::Kbps212,
        },
    )
}

pub fn iso15693(discovery_id: u8) -> ActivationInfo {
    poll(
        discovery_id,
        RfProtocol::T5t,
        RfTechnology::V,
        TechParams::V {
            uid: [0xE0, 0x04, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06],
            dsfid: 0,
            afi: 0,
        },
    )
}

/// Remote NFC-DEP target over A.
pub fn nfc_dep_target(discovery_id: u8, max_frame_len: usize) -> ActivationInfo {
    let mut info = poll_a(discovery_id, RfProtocol::NfcDep, 0x40, vec![0x08, 0x01, 0x02, 0x03]);
    info.activation_params = ActivationParams::NfcDep {
        nfcid3: vec![0xAA; 10],
        general_bytes: vec![0x46, 0x66, 0x6D],
        max_frame_len,
    };
    info
}

/// Remote NFC-DEP initiator; the controller is target.
pub fn remote_initiator(discovery_id: u8, max_frame_len: usize) -> ActivationInfo {
    ActivationInfo {
        discovery_id,
        protocol: RfProtocol::NfcDep,
        technology: RfTechnology::A,
        mode: RfMode::Listen,
        tech_params: TechParams::Listen,
        activation_params: ActivationParams::NfcDep {
            nfcid3: vec![0xBB; 10],
            general_bytes: Vec::new(),
            max_frame_len,
        },
        more: false,
    }
}

/// External reader talking to card emulation.
pub fn emulation_a() -> ActivationInfo {
    ActivationInfo {
        discovery_id: 1,
        protocol: RfProtocol::IsoDep,
        technology: RfTechnology::A,
        mode: RfMode::Listen,
        tech_params: TechParams::Listen,
        activation_params: ActivationParams::None,
        more: false,
    }
}

/// A session manager driven by hand.
pub struct Harness {
    pub hal: TestHal,
    pub mock: MockTransportHandle,
    pub tags: UnboundedReceiver<DiscoveryNotification>,
    pub p2p: UnboundedReceiver<P2pNotification>,
    pub se: UnboundedReceiver<SecureElementEvent>,
    pub events: UnboundedReceiver<DefaultEvent>,
    p2p_tx: Option<mpsc::UnboundedSender<P2pNotification>>,
}

impl Harness {
    /// Open with the given NFCEEs and register the tag, SE and default
    /// listeners.
    pub fn open_with(nfcees: Vec<NfceeInfo>) -> Self {
        Self::open_configured(Hal4Config::default(), nfcees)
    }

    pub fn open_configured(config: Hal4Config, nfcees: Vec<NfceeInfo>) -> Self {
        init_tracing();
        let (transport, mock) = MockTransport::new();
        let mut hal = Hal4::with_config(config, transport, ManualTimers::new()).expect("valid config");

        let (tx, mut rx) = completion();
        hal.open(InitType::Normal, tx).expect("open accepted");
        hal.handle_transport_event(TransportEvent::OpenComplete(Ok(OpenInfo { nfcees })));
        hal.handle_transport_event(TransportEvent::CommandComplete {
            opcode: Opcode::GetFirmwareInfo,
            result: Ok(Response::FirmwareInfo(FirmwareInfo {
                version: 0x0120,
                ..Default::default()
            })),
        });
        hal.handle_transport_event(TransportEvent::CommandComplete {
            opcode: Opcode::SetRoutingPriority,
            result: Ok(Response::None),
        });
        assert_eq!(outcome(&mut rx), Ok(()));

        let (tag_tx, tags) = mpsc::unbounded_channel();
        let (p2p_tx, p2p) = mpsc::unbounded_channel();
        let (se_tx, se) = mpsc::unbounded_channel();
        let (default_tx, events) = mpsc::unbounded_channel();
        hal.register_listener(Listener::TagDiscovery(tag_tx)).expect("tag listener");
        hal.register_listener(Listener::SecureElement(se_tx)).expect("se listener");
        hal.register_listener(Listener::Default(default_tx)).expect("default listener");

        Self {
            hal,
            mock,
            tags,
            p2p,
            se,
            events,
            p2p_tx: Some(p2p_tx),
        }
    }

    pub fn open() -> Self {
        Self::open_with(Vec::new())
    }

    /// Register the P2P discovery listener.
    pub fn with_p2p_listener(mut self) -> Self {
        if let Some(tx) = self.p2p_tx.take() {
            self.hal
                .register_listener(Listener::P2pDiscovery(tx))
                .expect("p2p listener");
        }
        self
    }

    /// Feed an event and drain deferred work.
    pub fn event(&mut self, event: TransportEvent) {
        self.hal.handle_transport_event(event);
        self.hal.run_deferred();
    }

    pub fn complete(&mut self, opcode: Opcode) {
        self.complete_with(opcode, Response::None);
    }

    pub fn complete_with(&mut self, opcode: Opcode, response: Response) {
        self.event(TransportEvent::CommandComplete {
            opcode,
            result: Ok(response),
        });
    }

    pub fn fail(&mut self, opcode: Opcode, error: TransportError) {
        self.event(TransportEvent::CommandComplete {
            opcode,
            result: Err(error),
        });
    }

    /// Answer the most recent command with success.
    pub fn complete_last(&mut self) {
        let command = self.mock.last_command().expect("no command issued");
        self.complete(command.opcode());
    }

    pub fn last_command(&self) -> Option<Command> {
        self.mock.last_command()
    }

    /// Configure discovery with [`discovery_request`] and confirm it.
    pub fn start_discovery(&mut self) {
        let (tx, mut rx) = completion();
        self.hal
            .configure_discovery(DiscoveryMode::Config, discovery_request(), tx)
            .expect("discovery accepted");
        self.complete(Opcode::StartDiscovery);
        assert_eq!(outcome(&mut rx), Ok(()));
    }

    pub fn activate(&mut self, info: ActivationInfo) {
        self.event(TransportEvent::Activated(info));
    }

    /// Start discovery, activate one device and return the tag round.
    pub fn discover(&mut self, info: ActivationInfo) -> Vec<RemoteDevice> {
        self.start_discovery();
        self.activate(info);
        self.next_round()
    }

    /// Pull the next tag discovery notification.
    pub fn next_round(&mut self) -> Vec<RemoteDevice> {
        match self.tags.try_recv() {
            Ok(DiscoveryNotification::Discovered { devices, .. }) => devices,
            other => panic!("expected a discovery round, got {other:?}"),
        }
    }

    /// Pull the next P2P discovery notification.
    pub fn next_peer(&mut self) -> RemoteDevice {
        match self.p2p.try_recv() {
            Ok(P2pNotification::Discovered(device)) => device,
            other => panic!("expected a P2P peer, got {other:?}"),
        }
    }

    /// Discover a P2P peer through the P2P listener and connect to it.
    pub fn connected_peer(&mut self, info: ActivationInfo) -> RemoteDevice {
        self.start_discovery();
        self.activate(info);
        let handle = self.next_peer().handle;
        self.connect(handle)
    }

    /// Connect to `handle`, answering the activation if one is issued.
    pub fn connect(&mut self, handle: DeviceHandle) -> RemoteDevice {
        let before = self.mock.commands().len();
        let (tx, mut rx) = completion();
        self.hal.connect(handle, tx).expect("connect accepted");
        if self.mock.commands().len() > before {
            self.complete(Opcode::ActivateTarget);
        } else {
            self.hal.run_deferred();
        }
        outcome(&mut rx).expect("connect succeeded")
    }

    /// Discover and connect to one device.
    pub fn connected(&mut self, info: ActivationInfo) -> RemoteDevice {
        let devices = self.discover(info);
        let handle = devices.first().expect("one candidate").handle;
        self.connect(handle)
    }

    pub fn receive(&mut self, conn_id: u8, payload: Vec<u8>, more: bool) {
        self.event(TransportEvent::DataReceived {
            conn_id,
            result: Ok(payload),
            more,
        });
    }

    pub fn data_sent(&mut self, conn_id: u8) {
        self.event(TransportEvent::DataSent {
            conn_id,
            result: Ok(()),
        });
    }

    /// Fire the most recently armed timer.
    pub fn expire_timer(&mut self) {
        let timer = self
            .hal
            .timers_mut()
            .expire_latest()
            .expect("no timer armed");
        self.hal.handle_timer_expired(timer.owner, timer.id);
        self.hal.run_deferred();
    }

    pub fn armed_timers(&self) -> usize {
        self.hal.timers().active().len()
    }
}
