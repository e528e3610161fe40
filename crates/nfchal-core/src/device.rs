//! Remote device model.
//!
//! A [`RemoteDevice`] is one candidate found during a discovery round. Its
//! protocol-specific identity lives in [`DeviceInfo`], a sum type with one
//! variant per device kind. Command framing, presence probes and
//! notification conversion all match on it exhaustively.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{Bitrate, DeviceHandle, ProtocolMask, RfProtocol};

/// Identity bytes of an ISO14443-A device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Iso14443AInfo {
    /// NFCID1 (4, 7 or 10 bytes).
    pub uid: Vec<u8>,

    /// SENS_RES / ATQA.
    pub atqa: [u8; 2],

    /// SEL_RES / SAK.
    pub sak: u8,
}

/// ISO14443-4A device: A identity plus the answer-to-select.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Iso14443A4Info {
    pub a: Iso14443AInfo,
    pub ats: Vec<u8>,
}

/// ISO14443-4B device identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Iso14443B4Info {
    /// PUPI / NFCID0.
    pub pupi: [u8; 4],
    pub app_data: [u8; 4],
    pub prot_info: Vec<u8>,
    pub attrib_response: Vec<u8>,
}

/// Felica device identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FelicaInfo {
    /// IDm / NFCID2.
    pub idm: [u8; 8],
    /// PMm / PAD.
    pub pmm: [u8; 8],
    pub system_code: Option<[u8; 2]>,
    pub bitrate: Bitrate,
}

/// Jewel/Topaz device identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JewelInfo {
    pub uid: Vec<u8>,
    pub atqa: [u8; 2],
}

/// ISO15693 device identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Iso15693Info {
    pub uid: [u8; 8],
    pub dsfid: u8,
    pub afi: u8,
}

/// NFC-DEP peer identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct P2pInfo {
    /// NFCID1 / NFCID2 / NFCID3 of the peer.
    pub nfcid: Vec<u8>,
    pub general_bytes: Vec<u8>,
    /// Negotiated maximum frame payload.
    pub max_frame_len: usize,
    pub bitrate: Bitrate,
}

/// Mifare family derived from the SAK.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MifareFamily {
    Ultralight,
    Mini,
    Classic1K,
    Classic4K,
    ProX,
}

impl MifareFamily {
    /// Classify a Mifare SAK.
    ///
    /// ```
    /// use nfchal_core::device::MifareFamily;
    ///
    /// assert_eq!(MifareFamily::from_sak(0x08), Some(MifareFamily::Classic1K));
    /// assert_eq!(MifareFamily::from_sak(0x00), Some(MifareFamily::Ultralight));
    /// assert_eq!(MifareFamily::from_sak(0x20), None);
    /// ```
    #[must_use]
    pub fn from_sak(sak: u8) -> Option<Self> {
        match sak {
            0x00 => Some(Self::Ultralight),
            0x09 => Some(Self::Mini),
            0x01 | 0x08 | 0x28 | 0x88 => Some(Self::Classic1K),
            0x18 | 0x38 => Some(Self::Classic4K),
            0x98 | 0xB8 => Some(Self::ProX),
            _ => None,
        }
    }

    /// RF protocol the controller uses to reach this family.
    #[must_use]
    pub fn protocol(&self) -> RfProtocol {
        match self {
            Self::Ultralight => RfProtocol::T2t,
            _ => RfProtocol::Mifare,
        }
    }
}

/// Payload-free discriminant of [`DeviceInfo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceKind {
    Iso14443A,
    Iso14443A4,
    Iso14443B4,
    Mifare,
    Felica,
    Jewel,
    Iso15693,
    P2pTarget,
    P2pInitiator,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Iso14443A => "ISO14443-3A",
            Self::Iso14443A4 => "ISO14443-4A",
            Self::Iso14443B4 => "ISO14443-4B",
            Self::Mifare => "Mifare",
            Self::Felica => "Felica",
            Self::Jewel => "Jewel",
            Self::Iso15693 => "ISO15693",
            Self::P2pTarget => "P2P-Target",
            Self::P2pInitiator => "P2P-Initiator",
        };
        write!(f, "{name}")
    }
}

/// Protocol-specific identity of a remote device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceInfo {
    /// ISO14443-3A memory tag.
    Iso14443A(Iso14443AInfo),
    /// ISO14443-4A smart tag.
    Iso14443A4(Iso14443A4Info),
    /// ISO14443-4B smart tag.
    Iso14443B4(Iso14443B4Info),
    Mifare {
        a: Iso14443AInfo,
        family: MifareFamily,
    },
    Felica(FelicaInfo),
    Jewel(JewelInfo),
    Iso15693(Iso15693Info),
    /// Remote NFC-DEP target; the controller is initiator.
    P2pTarget(P2pInfo),
    /// Remote NFC-DEP initiator; the controller is target.
    P2pInitiator(P2pInfo),
}

impl DeviceInfo {
    /// Get the payload-free kind.
    #[must_use]
    pub fn kind(&self) -> DeviceKind {
        match self {
            Self::Iso14443A(_) => DeviceKind::Iso14443A,
            Self::Iso14443A4(_) => DeviceKind::Iso14443A4,
            Self::Iso14443B4(_) => DeviceKind::Iso14443B4,
            Self::Mifare { .. } => DeviceKind::Mifare,
            Self::Felica(_) => DeviceKind::Felica,
            Self::Jewel(_) => DeviceKind::Jewel,
            Self::Iso15693(_) => DeviceKind::Iso15693,
            Self::P2pTarget(_) => DeviceKind::P2pTarget,
            Self::P2pInitiator(_) => DeviceKind::P2pInitiator,
        }
    }

    /// Protocol bit that had to be enabled for this device to be reported.
    #[must_use]
    pub fn protocol_bit(&self) -> ProtocolMask {
        match self {
            Self::Iso14443A(_) => ProtocolMask::ISO14443_3A,
            Self::Iso14443A4(_) => ProtocolMask::ISO14443_4A,
            Self::Iso14443B4(_) => ProtocolMask::ISO14443_4B,
            Self::Mifare { .. } => ProtocolMask::MIFARE,
            Self::Felica(_) => ProtocolMask::FELICA,
            Self::Jewel(_) => ProtocolMask::JEWEL,
            Self::Iso15693(_) => ProtocolMask::ISO15693,
            Self::P2pTarget(_) => ProtocolMask::NFCIP_INITIATOR,
            Self::P2pInitiator(_) => ProtocolMask::NFCIP_TARGET,
        }
    }

    /// Identifier bytes used for display and logging.
    #[must_use]
    pub fn uid(&self) -> &[u8] {
        match self {
            Self::Iso14443A(a) | Self::Mifare { a, .. } => &a.uid,
            Self::Iso14443A4(info) => &info.a.uid,
            Self::Iso14443B4(info) => &info.pupi,
            Self::Felica(info) => &info.idm,
            Self::Jewel(info) => &info.uid,
            Self::Iso15693(info) => &info.uid,
            Self::P2pTarget(info) | Self::P2pInitiator(info) => &info.nfcid,
        }
    }

    /// Check whether this is an NFC-DEP peer.
    #[must_use]
    pub fn is_p2p(&self) -> bool {
        matches!(self, Self::P2pTarget(_) | Self::P2pInitiator(_))
    }

    /// Check whether this device is reached through the frame RF interface,
    /// whose responses end with a status byte.
    #[must_use]
    pub fn uses_frame_interface(&self) -> bool {
        matches!(
            self,
            Self::Iso14443A(_)
                | Self::Mifare { .. }
                | Self::Felica(_)
                | Self::Jewel(_)
                | Self::Iso15693(_)
        )
    }

    /// Check whether this device takes `command, address, data` frames.
    #[must_use]
    pub fn is_memory_tag(&self) -> bool {
        matches!(
            self,
            Self::Iso14443A(_) | Self::Mifare { .. } | Self::Jewel(_)
        )
    }

    /// Negotiated NFC-DEP frame length, for P2P peers.
    #[must_use]
    pub fn max_frame_len(&self) -> Option<usize> {
        match self {
            Self::P2pTarget(info) | Self::P2pInitiator(info) => Some(info.max_frame_len),
            _ => None,
        }
    }
}

/// Where traffic for a device is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Route {
    /// Over the RF logical connection.
    Rf,
    /// Over the logical connection of a wired secure element.
    SecureElement { conn_id: u8 },
}

/// One candidate device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteDevice {
    /// Stable identity within the context.
    pub handle: DeviceHandle,

    /// Controller-assigned discovery id.
    pub discovery_id: u8,

    /// Protocol used to activate this candidate.
    pub protocol: RfProtocol,

    /// Protocol-specific identity.
    pub info: DeviceInfo,

    /// Whether a logical session with the device is open.
    pub session_open: bool,

    pub route: Route,

    /// When the candidate was built.
    pub discovered_at: DateTime<Utc>,
}

impl RemoteDevice {
    /// Create a new RF-routed candidate with the current timestamp.
    pub fn new(handle: DeviceHandle, discovery_id: u8, protocol: RfProtocol, info: DeviceInfo) -> Self {
        Self {
            handle,
            discovery_id,
            protocol,
            info,
            session_open: false,
            route: Route::Rf,
            discovered_at: Utc::now(),
        }
    }

    /// Route this device through a secure-element logical connection.
    #[must_use]
    pub fn with_route(mut self, route: Route) -> Self {
        self.route = route;
        self
    }

    /// Get the payload-free kind.
    #[must_use]
    pub fn kind(&self) -> DeviceKind {
        self.info.kind()
    }

    /// Get the identifier as a hexadecimal string.
    pub fn uid_hex(&self) -> String {
        self.info
            .uid()
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join("")
    }

    /// Check whether traffic goes through a secure element.
    #[must_use]
    pub fn is_se_backed(&self) -> bool {
        matches!(self.route, Route::SecureElement { .. })
    }
}

impl fmt::Display for RemoteDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} [{}]", self.handle, self.kind(), self.uid_hex())
    }
}
