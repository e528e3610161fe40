use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Stable identity of a remote device within one controller context.
///
/// Handles are never reused inside a context, so a stale handle held by the
/// caller cannot alias a newer candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceHandle(u32);

impl DeviceHandle {
    /// Wrap a raw handle value.
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the raw handle value.
    #[must_use]
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "dev#{}", self.0)
    }
}

/// Identity of one opened controller context.
///
/// Timers carry this value so an expiry can be routed back to the context
/// that armed it, and ignored once that context is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextId(u64);

impl ContextId {
    /// Wrap a raw context id.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw context id.
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

/// Reader-side protocol bits enabled for the discovery wheel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ProtocolMask(u16);

impl ProtocolMask {
    pub const NONE: Self = Self(0);
    pub const ISO14443_3A: Self = Self(1 << 0);
    pub const ISO14443_4A: Self = Self(1 << 1);
    pub const ISO14443_4B: Self = Self(1 << 2);
    pub const MIFARE: Self = Self(1 << 3);
    pub const FELICA: Self = Self(1 << 4);
    pub const JEWEL: Self = Self(1 << 5);
    pub const ISO15693: Self = Self(1 << 6);
    pub const NFCIP_INITIATOR: Self = Self(1 << 7);
    pub const NFCIP_TARGET: Self = Self(1 << 8);

    /// Every reader-side protocol the controller supports.
    pub const ALL_READER: Self = Self(
        Self::ISO14443_3A.0
            | Self::ISO14443_4A.0
            | Self::ISO14443_4B.0
            | Self::MIFARE.0
            | Self::FELICA.0
            | Self::JEWEL.0
            | Self::ISO15693.0,
    );

    /// Get the raw bits.
    #[must_use]
    pub fn bits(&self) -> u16 {
        self.0
    }

    /// Check whether every bit of `other` is set.
    #[must_use]
    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    /// Check whether no bit is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl BitOr for ProtocolMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for ProtocolMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// NFC-DEP speed mask requested for P2P.
///
/// An empty mask disables P2P. [`P2pMode::DEFAULT`] lets the controller use
/// every supported speed. Any other value enables exactly the listed speeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct P2pMode(u8);

impl P2pMode {
    pub const DISABLED: Self = Self(0);
    pub const A106: Self = Self(0x01);
    pub const F212: Self = Self(0x02);
    pub const F424: Self = Self(0x04);
    pub const DEFAULT: Self = Self(0x80);

    /// Build a mode from raw bits.
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// Get the raw bits.
    #[must_use]
    pub fn bits(&self) -> u8 {
        self.0
    }

    /// Check whether P2P is disabled.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.0 == 0
    }

    /// Expand the mode into the concrete speeds it enables.
    ///
    /// ```
    /// use nfchal_core::P2pMode;
    ///
    /// assert_eq!(P2pMode::DEFAULT.speeds(), P2pMode::A106 | P2pMode::F212 | P2pMode::F424);
    /// assert_eq!(P2pMode::F212.speeds(), P2pMode::F212);
    /// assert!(P2pMode::DISABLED.speeds().is_disabled());
    /// ```
    #[must_use]
    pub fn speeds(&self) -> Self {
        if self.0 & Self::DEFAULT.0 != 0 {
            Self::A106 | Self::F212 | Self::F424
        } else {
            Self(self.0 & (Self::A106.0 | Self::F212.0 | Self::F424.0))
        }
    }

    /// Check whether the given speed is enabled once the mode is expanded.
    #[must_use]
    pub fn allows(&self, speed: Self) -> bool {
        self.speeds().0 & speed.0 != 0
    }
}

impl BitOr for P2pMode {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Poll technologies requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PollFlags {
    pub iso14443a: bool,
    pub iso14443b: bool,
    pub felica212: bool,
    pub felica424: bool,
    pub jewel: bool,
    pub iso15693: bool,
    pub nfcip1: bool,
}

impl PollFlags {
    /// Enable every poll technology.
    #[must_use]
    pub fn all() -> Self {
        Self {
            iso14443a: true,
            iso14443b: true,
            felica212: true,
            felica424: true,
            jewel: true,
            iso15693: true,
            nfcip1: true,
        }
    }
}

/// A `ConfigureDiscovery` request as supplied by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DiscoveryRequest {
    /// Poll technologies to enable.
    pub poll: PollFlags,

    /// NFC-DEP speeds.
    pub p2p_mode: P2pMode,

    /// Suppress listen-side (target) P2P.
    pub nfcip_target_disable: bool,
}

/// How a `ConfigureDiscovery` request applies to the wheel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiscoveryMode {
    /// Apply a new configuration and start the wheel.
    Config,
    /// Same as `Config`.
    Start,
    /// Restart the wheel with the active configuration.
    Resume,
    /// Stop the wheel.
    Stop,
}

/// Radio technology of an activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RfTechnology {
    A,
    B,
    F,
    V,
}

/// Radio protocol of an activation or a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RfProtocol {
    /// Jewel/Topaz.
    T1t,
    /// ISO14443-3A memory tags.
    T2t,
    /// Felica.
    T3t,
    /// ISO15693.
    T5t,
    IsoDep,
    NfcDep,
    /// Mifare Classic (proprietary frame interface).
    Mifare,
    Unknown(u8),
}

/// Whether the controller polled the device or was polled by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RfMode {
    Poll,
    Listen,
}

/// Radio bitrate of an activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Bitrate {
    Kbps106,
    Kbps212,
    Kbps424,
    Kbps848,
}

/// One technology/mode entry of the discovery wheel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DiscoverTechnology {
    PollA,
    PollB,
    PollF212,
    PollF424,
    PollV,
    ListenA,
    ListenF212,
    ListenF424,
}

/// How the controller is brought up on Open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum InitType {
    #[default]
    Normal,
    /// Bring the controller up for self-test only.
    TestMode,
}

/// How the controller is brought down on Close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CloseMode {
    #[default]
    Normal,
    /// Keep the controller powered so secure elements stay reachable.
    Standby,
}

/// Release semantics of a `Disconnect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReleaseType {
    /// Release and switch any associated secure element back to default.
    Release,
    /// Release and keep the discovery wheel running.
    ContinueDiscovery,
    /// Release and restart the discovery wheel.
    RestartDiscovery,
    /// Release the smart-chip logical connection.
    SmartChipRelease,
    /// A raw release code this HAL does not know.
    Unknown(u8),
}

impl ReleaseType {
    /// Decode a raw release code.
    ///
    /// ```
    /// use nfchal_core::ReleaseType;
    ///
    /// assert_eq!(ReleaseType::from_raw(0), ReleaseType::Release);
    /// assert_eq!(ReleaseType::from_raw(9), ReleaseType::Unknown(9));
    /// ```
    #[must_use]
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Release,
            1 => Self::ContinueDiscovery,
            2 => Self::RestartDiscovery,
            3 => Self::SmartChipRelease,
            other => Self::Unknown(other),
        }
    }

    /// Check whether the discovery wheel runs after this release.
    #[must_use]
    pub fn restarts_discovery(&self) -> bool {
        matches!(self, Self::ContinueDiscovery | Self::RestartDiscovery)
    }
}

/// Embedded secure chip (SMX) modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SmxMode {
    /// Host talks to the chip over the wired interface.
    Wired,
    /// External readers reach the chip through the antenna.
    Virtual,
    Off,
    #[default]
    Default,
}

/// UICC (SWP) modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SwpMode {
    #[default]
    Default,
    On,
    Off,
}

/// Secure element class targeted by a mode switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SeTarget {
    Smx,
    Uicc,
}

impl fmt::Display for SeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Smx => write!(f, "SMX"),
            Self::Uicc => write!(f, "UICC"),
        }
    }
}

/// Status attached to a discovery notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DiscoveryStatus {
    Success,
    /// One device answered with more than one protocol.
    MultipleProtocols,
    /// More than one device is in the field.
    MultipleTags,
}

/// Upper-layer notification channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ListenerKind {
    TagDiscovery,
    P2pDiscovery,
    SecureElement,
    Default,
}

impl fmt::Display for ListenerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TagDiscovery => write!(f, "TagDiscovery"),
            Self::P2pDiscovery => write!(f, "P2pDiscovery"),
            Self::SecureElement => write!(f, "SecureElement"),
            Self::Default => write!(f, "Default"),
        }
    }
}

/// Static capability descriptor of an open controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Reader-side protocols.
    pub reader_protocols: ProtocolMask,

    /// Emulation-side protocols (transmit-only P2P target).
    pub emulation_protocols: ProtocolMask,

    /// Packed HAL version, major in the high byte.
    pub hal_version: u16,

    /// Firmware version reported by the controller.
    pub firmware_version: u16,
}
