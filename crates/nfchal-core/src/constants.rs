//! Core constants for the HAL4 controller session manager.
//!
//! Values here are protocol contracts shared between the discovery resolver,
//! the transceive engine and the transport contract. Changing them changes
//! how remote devices are classified on the wire.
//!
//! # Usage
//!
//! ```
//! use nfchal_core::constants::*;
//!
//! fn is_mifare_sak(sak: u8) -> bool {
//!     MIFARE_SAK_VALUES.contains(&sak)
//! }
//!
//! assert!(is_mifare_sak(0x08));
//! assert_eq!(SAK_ISO14443_4_BIT, 0x20);
//! ```

// ============================================================================
// Session Limits
// ============================================================================

/// Maximum number of candidate remote devices held from one discovery round.
pub const MAX_REMOTE_DEVICES: usize = 10;

/// Static RF logical connection identifier used for reader and P2P data.
pub const RF_CONN_ID: u8 = 0x00;

// ============================================================================
// HAL Version
// ============================================================================

/// HAL4 major version, packed into the high byte of the capability version.
pub const HAL4_VERSION_MAJOR: u8 = 4;

/// HAL4 minor version, packed into the low byte of the capability version.
pub const HAL4_VERSION_MINOR: u8 = 2;

/// Packed HAL version as reported by the capability descriptor.
///
/// ```
/// use nfchal_core::constants::HAL4_VERSION;
///
/// assert_eq!(HAL4_VERSION >> 8, 4);
/// ```
pub const HAL4_VERSION: u16 = ((HAL4_VERSION_MAJOR as u16) << 8) | HAL4_VERSION_MINOR as u16;

// ============================================================================
// ISO14443-A Identification
// ============================================================================

/// SAK bit signalling ISO14443-4 compliance.
pub const SAK_ISO14443_4_BIT: u8 = 0x20;

/// SAK bit signalling NFC-DEP (P2P) support.
pub const SAK_NFC_DEP_BIT: u8 = 0x40;

/// SAK values of the Mifare Classic, Mini, Pro and emulated families.
pub const MIFARE_SAK_VALUES: [u8; 9] = [0x01, 0x08, 0x09, 0x18, 0x28, 0x38, 0x88, 0x98, 0xB8];

/// Manufacturer byte found at UID\[0\] of NXP tags.
pub const NXP_MANUFACTURER_ID: u8 = 0x04;

/// UID length of an unlabeled Mifare Ultralight (SAK 0x00).
pub const MIFARE_UL_UID_LENGTH: usize = 7;

/// ATQA of a non-compliant card that advertises NFC-DEP but is not a P2P target.
pub const NON_COMPLIANT_ATQA: [u8; 2] = [0x04, 0x00];

/// SAK of the same non-compliant card.
pub const NON_COMPLIANT_SAK: u8 = 0x53;

// ============================================================================
// Felica Identification
// ============================================================================

/// NFCID2 prefix reserved for NFC-DEP targets over F technology.
pub const FELICA_P2P_NFCID2_PREFIX: [u8; 2] = [0x01, 0xFE];

/// Length of a Felica IDm / NFCID2.
pub const FELICA_IDM_LENGTH: usize = 8;

// ============================================================================
// Reader Command Bytes
// ============================================================================

/// Type 2 / Mifare READ command.
pub const MIFARE_CMD_READ: u8 = 0x30;

/// Jewel/Topaz read-identification command.
pub const JEWEL_CMD_RID: u8 = 0x78;

/// Felica request-response command.
pub const FELICA_CMD_REQUEST_RESPONSE: u8 = 0x04;

/// ISO15693 request flags for a single-slot inventory.
pub const ISO15693_INVENTORY_FLAGS: u8 = 0x26;

/// ISO15693 inventory command.
pub const ISO15693_CMD_INVENTORY: u8 = 0x01;

// ============================================================================
// Frame RF Interface Status
// ============================================================================

/// Trailer status byte of a frame that arrived intact.
pub const RF_FRAME_STATUS_OK: u8 = 0x00;

/// Trailer status byte of a frame the controller flagged as corrupted.
pub const RF_FRAME_STATUS_CORRUPTED: u8 = 0x02;

// ============================================================================
// P2P
// ============================================================================

/// Largest NFC-DEP frame payload the controller can negotiate (LR = 3).
pub const P2P_MAX_FRAME_LEN: usize = 254;

/// Smallest NFC-DEP frame payload (LR = 0).
pub const P2P_MIN_FRAME_LEN: usize = 64;

/// Maximum length of the general bytes carried in ATR_REQ/ATR_RES.
pub const MAX_GENERAL_BYTES_LEN: usize = 48;

/// Config parameter id for the poll-side ATR_REQ general bytes.
pub const CFG_PN_ATR_REQ_GEN_BYTES: u8 = 0x29;

/// Config parameter id for the listen-side ATR_RES general bytes.
pub const CFG_LN_ATR_RES_GEN_BYTES: u8 = 0x61;

// ============================================================================
// Timeouts
// ============================================================================

/// Default transceive timeout in milliseconds.
pub const DEFAULT_TRANSCEIVE_TIMEOUT_MS: u64 = 3000;

/// Default presence-check timeout in milliseconds.
pub const DEFAULT_PRESENCE_CHECK_TIMEOUT_MS: u64 = 1000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packed_version() {
        assert_eq!(HAL4_VERSION, 0x0402);
    }

    #[test]
    fn test_sak_bits_are_distinct() {
        assert_eq!(SAK_ISO14443_4_BIT & SAK_NFC_DEP_BIT, 0);
    }

    #[test]
    fn test_non_compliant_sak_has_nfc_dep_bit() {
        assert_ne!(NON_COMPLIANT_SAK & SAK_NFC_DEP_BIT, 0);
    }

    #[test]
    fn test_frame_len_bounds() {
        assert!(P2P_MIN_FRAME_LEN < P2P_MAX_FRAME_LEN);
    }
}
