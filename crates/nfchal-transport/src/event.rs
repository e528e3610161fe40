//! Events delivered by the transport.
//!
//! Every asynchronous completion and every unsolicited controller
//! notification reaches the session manager as one [`TransportEvent`].

use nfchal_core::{Bitrate, RfMode, RfProtocol, RfTechnology};
use serde::{Deserialize, Serialize};

use crate::command::{DeactivationKind, Opcode, Response};
use crate::error::TransportError;

/// Protocol spoken by an NFCEE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NfceeProtocol {
    Apdu,
    Transparent,
    HciAccess,
    Proprietary(u8),
}

/// One NFCEE found during transport open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NfceeInfo {
    pub id: u8,
    pub protocols: Vec<NfceeProtocol>,
}

impl NfceeInfo {
    /// Create a new NFCEE descriptor.
    pub fn new(id: u8, protocols: Vec<NfceeProtocol>) -> Self {
        Self { id, protocols }
    }

    /// Check whether this NFCEE is an embedded secure chip (APDU or
    /// transparent access).
    pub fn is_smx(&self) -> bool {
        self.protocols
            .iter()
            .any(|p| matches!(p, NfceeProtocol::Apdu | NfceeProtocol::Transparent))
    }

    /// Check whether this NFCEE is a UICC behind HCI access.
    pub fn is_uicc(&self) -> bool {
        self.protocols.contains(&NfceeProtocol::HciAccess)
    }
}

/// Payload of a successful transport open.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OpenInfo {
    /// NFCEEs discovered by the controller, in discovery order.
    pub nfcees: Vec<NfceeInfo>,
}

/// Technology-specific parameters of an activation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TechParams {
    /// NFC-A: SENS_RES, NFCID1, SEL_RES.
    A {
        sens_res: [u8; 2],
        nfcid1: Vec<u8>,
        sel_res: u8,
    },
    /// NFC-B: NFCID0 and the rest of SENSB_RES.
    B {
        nfcid0: [u8; 4],
        app_data: [u8; 4],
        prot_info: Vec<u8>,
    },
    /// NFC-F: NFCID2, PAD and optional system code.
    F {
        nfcid2: [u8; 8],
        pad: [u8; 8],
        system_code: Option<[u8; 2]>,
        bitrate: Bitrate,
    },
    /// NFC-V: UID, DSFID and AFI.
    V { uid: [u8; 8], dsfid: u8, afi: u8 },
    /// Listen mode; the remote initiator's identity arrives with the
    /// activation parameters.
    Listen,
}

/// Protocol-specific activation parameters.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ActivationParams {
    #[default]
    None,
    /// ISO-DEP over A: the answer-to-select.
    IsoDepA { ats: Vec<u8> },
    /// ISO-DEP over B: the ATTRIB response.
    IsoDepB { attrib_response: Vec<u8> },
    /// NFC-DEP: the ATR general bytes and negotiated frame length.
    NfcDep {
        nfcid3: Vec<u8>,
        general_bytes: Vec<u8>,
        max_frame_len: usize,
    },
}

/// One activation or discovery notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationInfo {
    /// Controller-assigned discovery id.
    pub discovery_id: u8,
    pub protocol: RfProtocol,
    pub technology: RfTechnology,
    pub mode: RfMode,
    pub tech_params: TechParams,
    pub activation_params: ActivationParams,
    /// More devices answered; another notification follows a `DiscoverNext`.
    pub more: bool,
}

/// Secure-element events originated by the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SeNotification {
    /// An external reader selected an application on an NFCEE.
    Transaction {
        nfcee_id: u8,
        aid: Vec<u8>,
        data: Vec<u8>,
    },
    /// The NFCEE entered or left the field.
    FieldChanged { nfcee_id: u8, on: bool },
}

/// Completion or notification from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    OpenComplete(Result<OpenInfo, TransportError>),
    CloseComplete,
    CommandComplete {
        opcode: Opcode,
        result: Result<Response, TransportError>,
    },
    /// Data arrived on a logical connection. `more` is set on every
    /// fragment but the last.
    DataReceived {
        conn_id: u8,
        result: Result<Vec<u8>, TransportError>,
        more: bool,
    },
    DataSent {
        conn_id: u8,
        result: Result<(), TransportError>,
    },
    Activated(ActivationInfo),
    Deactivated(DeactivationKind),
    GenericError(TransportError),
    InterfaceError(TransportError),
    SecureElement(SeNotification),
}

impl TransportEvent {
    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::OpenComplete(_) => "OpenComplete",
            Self::CloseComplete => "CloseComplete",
            Self::CommandComplete { .. } => "CommandComplete",
            Self::DataReceived { .. } => "DataReceived",
            Self::DataSent { .. } => "DataSent",
            Self::Activated(_) => "Activated",
            Self::Deactivated(_) => "Deactivated",
            Self::GenericError(_) => "GenericError",
            Self::InterfaceError(_) => "InterfaceError",
            Self::SecureElement(_) => "SecureElement",
        }
    }
}
