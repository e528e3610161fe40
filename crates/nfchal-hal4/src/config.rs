//! Session manager configuration.

use nfchal_core::constants::{
    DEFAULT_PRESENCE_CHECK_TIMEOUT_MS, DEFAULT_TRANSCEIVE_TIMEOUT_MS, MAX_REMOTE_DEVICES,
    P2P_MAX_FRAME_LEN, P2P_MIN_FRAME_LEN,
};
use nfchal_core::{HalError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for one [`Hal4`](crate::Hal4) instance.
///
/// Missing fields take their defaults when deserialized.
///
/// ```
/// use nfchal_hal4::Hal4Config;
///
/// let config: Hal4Config = serde_json::from_str(r#"{ "transceive_timeout_ms": 500 }"#).unwrap();
/// assert_eq!(config.transceive_timeout_ms, 500);
/// assert_eq!(config.max_remote_devices, 10);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Hal4Config {
    /// Timeout of one transceive or P2P receive.
    pub transceive_timeout_ms: u64,

    /// Timeout of one presence probe.
    pub presence_check_timeout_ms: u64,

    /// Candidate list capacity for one discovery round.
    pub max_remote_devices: usize,

    /// Fragment size used when the peer did not negotiate one.
    pub p2p_max_frame_len: usize,

    /// Inbox capacity of the service worker.
    pub worker_queue_capacity: usize,
}

impl Default for Hal4Config {
    fn default() -> Self {
        Self {
            transceive_timeout_ms: DEFAULT_TRANSCEIVE_TIMEOUT_MS,
            presence_check_timeout_ms: DEFAULT_PRESENCE_CHECK_TIMEOUT_MS,
            max_remote_devices: MAX_REMOTE_DEVICES,
            p2p_max_frame_len: P2P_MAX_FRAME_LEN,
            worker_queue_capacity: 64,
        }
    }
}

impl Hal4Config {
    /// Check every field against its allowed range.
    pub fn validate(&self) -> Result<()> {
        if self.transceive_timeout_ms == 0 {
            return Err(HalError::config("transceive_timeout_ms must be non-zero"));
        }
        if self.presence_check_timeout_ms == 0 {
            return Err(HalError::config("presence_check_timeout_ms must be non-zero"));
        }
        if self.max_remote_devices == 0 || self.max_remote_devices > MAX_REMOTE_DEVICES {
            return Err(HalError::config(format!(
                "max_remote_devices must be 1-{}, got {}",
                MAX_REMOTE_DEVICES, self.max_remote_devices
            )));
        }
        if !(P2P_MIN_FRAME_LEN..=P2P_MAX_FRAME_LEN).contains(&self.p2p_max_frame_len) {
            return Err(HalError::config(format!(
                "p2p_max_frame_len must be {}-{}, got {}",
                P2P_MIN_FRAME_LEN, P2P_MAX_FRAME_LEN, self.p2p_max_frame_len
            )));
        }
        if self.worker_queue_capacity == 0 {
            return Err(HalError::config("worker_queue_capacity must be non-zero"));
        }
        Ok(())
    }

    pub fn transceive_timeout(&self) -> Duration {
        Duration::from_millis(self.transceive_timeout_ms)
    }

    pub fn presence_check_timeout(&self) -> Duration {
        Duration::from_millis(self.presence_check_timeout_ms)
    }
}
