//! Commands issued to the transport and their responses.
//!
//! The session manager never builds wire frames. It issues typed
//! [`Command`]s, and the transport encodes them. Each completion comes
//! back as a [`TransportEvent::CommandComplete`](crate::TransportEvent)
//! tagged with the command's [`Opcode`].

use nfchal_core::{DiscoverTechnology, RfProtocol};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;
use std::time::Duration;

/// Listen-mode technologies routed to one host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TechMask(u8);

impl TechMask {
    pub const A: Self = Self(0x01);
    pub const B: Self = Self(0x02);
    pub const F: Self = Self(0x04);

    /// Get the raw bits.
    pub fn bits(&self) -> u8 {
        self.0
    }

    /// Check whether every bit of `other` is set.
    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for TechMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Destination of a listen-mode routing entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RouteTarget {
    /// The device host running this HAL.
    Host,
    /// An NFCEE, by id.
    Nfcee(u8),
}

/// One listen-mode routing priority entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoutingEntry {
    pub target: RouteTarget,
    pub technologies: TechMask,
}

impl RoutingEntry {
    /// Create a new routing entry.
    pub fn new(target: RouteTarget, technologies: TechMask) -> Self {
        Self {
            target,
            technologies,
        }
    }
}

/// Configuration parameter in TLV form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigTlv {
    pub id: u8,
    pub value: Vec<u8>,
}

impl ConfigTlv {
    /// Create a new TLV.
    pub fn new(id: u8, value: Vec<u8>) -> Self {
        Self { id, value }
    }

    /// Encode as `id, len, value`.
    ///
    /// ```
    /// use nfchal_transport::ConfigTlv;
    ///
    /// assert_eq!(ConfigTlv::new(0x29, vec![0xAA, 0xBB]).encode(), vec![0x29, 0x02, 0xAA, 0xBB]);
    /// ```
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.value.len() + 2);
        out.push(self.id);
        out.push(self.value.len() as u8);
        out.extend_from_slice(&self.value);
        out
    }
}

/// Target state of an RF deactivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeactivationKind {
    /// Stop the wheel.
    Idle,
    /// Put the device to sleep and keep it selectable.
    Sleep,
    /// Return to the discovery wheel.
    Discovery,
}

/// A command for the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Query firmware and capability info.
    GetFirmwareInfo,
    /// Program listen-mode routing priority, first entry highest.
    SetRoutingPriority(Vec<RoutingEntry>),
    /// Start (or restart) the discovery wheel.
    StartDiscovery(Vec<DiscoverTechnology>),
    StopDiscovery,
    /// Query the next candidate of a multi-device round.
    DiscoverNext,
    /// Activate a discovered target with the given protocol.
    ActivateTarget { discovery_id: u8, protocol: RfProtocol },
    Deactivate(DeactivationKind),
    /// ISO-DEP presence probe.
    IsoDepPresenceCheck,
    SetConfig(Vec<ConfigTlv>),
    /// Enable or disable an NFCEE.
    NfceeModeSet { nfcee_id: u8, enable: bool },
    /// Open or close the HCI pipe of an NFCEE.
    HciPipe { nfcee_id: u8, activate: bool },
    /// Open a logical connection to an NFCEE.
    CreateConnection { nfcee_id: u8 },
    CloseConnection { conn_id: u8 },
}

/// Payload-free discriminant of [`Command`], used to match completions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Opcode {
    GetFirmwareInfo,
    SetRoutingPriority,
    StartDiscovery,
    StopDiscovery,
    DiscoverNext,
    ActivateTarget,
    Deactivate,
    IsoDepPresenceCheck,
    SetConfig,
    NfceeModeSet,
    HciPipe,
    CreateConnection,
    CloseConnection,
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl Command {
    /// Get the opcode of this command.
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::GetFirmwareInfo => Opcode::GetFirmwareInfo,
            Self::SetRoutingPriority(_) => Opcode::SetRoutingPriority,
            Self::StartDiscovery(_) => Opcode::StartDiscovery,
            Self::StopDiscovery => Opcode::StopDiscovery,
            Self::DiscoverNext => Opcode::DiscoverNext,
            Self::ActivateTarget { .. } => Opcode::ActivateTarget,
            Self::Deactivate(_) => Opcode::Deactivate,
            Self::IsoDepPresenceCheck => Opcode::IsoDepPresenceCheck,
            Self::SetConfig(_) => Opcode::SetConfig,
            Self::NfceeModeSet { .. } => Opcode::NfceeModeSet,
            Self::HciPipe { .. } => Opcode::HciPipe,
            Self::CreateConnection { .. } => Opcode::CreateConnection,
            Self::CloseConnection { .. } => Opcode::CloseConnection,
        }
    }
}

/// Controller firmware and capability info.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FirmwareInfo {
    /// Packed firmware version.
    pub version: u16,
    pub hardware_version: u8,
    pub manufacturer_id: u8,
    /// Secure elements sit on an HCI network and are switched by pipe.
    pub hci_network: bool,
}

/// Successful command response payload.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Response {
    #[default]
    None,
    FirmwareInfo(FirmwareInfo),
    ConnectionCreated { conn_id: u8 },
}

/// One outgoing data packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    pub conn_id: u8,
    pub payload: Vec<u8>,
    /// More packets of the same message follow.
    pub more: bool,
    pub timeout: Duration,
}

/// Notification kinds the session registers with the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotificationKind {
    Activation,
    Deactivation,
    GenericError,
    InterfaceError,
    SecureElement,
}

impl NotificationKind {
    /// Every kind, in the order the session registers them.
    pub const ALL: [Self; 5] = [
        Self::Activation,
        Self::Deactivation,
        Self::GenericError,
        Self::InterfaceError,
        Self::SecureElement,
    ];
}
