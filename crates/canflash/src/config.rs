//! Flasher configuration
//!
//! This module contains configuration types for the CAN channel, the ISO-TP
//! layer, the UDS client and both flash strategies. Every field has a
//! default matching the reference bootloader, so an empty TOML file is a
//! valid configuration.
//!
//! ```toml
//! [channel]
//! interface = "can0"
//!
//! [isotp]
//! tx_id = "0x7E0"
//! rx_id = "0x7E8"
//!
//! [iap]
//! ack_timeout_ms = 500
//! max_retries = 3
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::frame::MAX_STANDARD_ID;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration for a flashing session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlasherConfig {
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub isotp: IsoTpConfig,
    #[serde(default)]
    pub uds: UdsClientConfig,
    #[serde(default)]
    pub iap: IapConfig,
    #[serde(default)]
    pub uds_flash: UdsFlashConfig,
    #[serde(default)]
    pub image: ImageConfig,
}

impl FlasherConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Reject settings no compliant device can work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_id("isotp.tx_id", self.isotp.tx_id)?;
        check_id("isotp.rx_id", self.isotp.rx_id)?;
        if self.isotp.tx_id == self.isotp.rx_id {
            return Err(ConfigError::Invalid(format!(
                "isotp.tx_id and isotp.rx_id are both 0x{:X}",
                self.isotp.tx_id
            )));
        }

        for (name, id) in self.iap.ids() {
            check_id(name, id)?;
        }

        let block = self.uds_flash.max_block_size;
        if block == 0 || block % 4 != 0 {
            return Err(ConfigError::Invalid(format!(
                "uds_flash.max_block_size must be a non-zero multiple of 4, got {}",
                block
            )));
        }
        // SID + block counter must fit in one ISO-TP message
        if block + 2 > crate::isotp::MAX_PAYLOAD_LEN {
            return Err(ConfigError::Invalid(format!(
                "uds_flash.max_block_size {} exceeds the ISO-TP message limit",
                block
            )));
        }

        if self.image.max_size == 0 {
            return Err(ConfigError::Invalid("image.max_size must be non-zero".into()));
        }
        Ok(())
    }
}

fn check_id(name: &str, id: u32) -> Result<(), ConfigError> {
    if id > MAX_STANDARD_ID {
        return Err(ConfigError::Invalid(format!(
            "{} 0x{:X} is not an 11-bit identifier",
            name, id
        )));
    }
    Ok(())
}

/// Parse a CAN identifier written as decimal or `0x`-prefixed hex
pub fn parse_can_id(text: &str) -> Result<u32, ConfigError> {
    let trimmed = text.trim();
    let parsed = match trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => trimmed.parse(),
    };
    parsed.map_err(|_| ConfigError::Invalid(format!("Invalid CAN ID: {}", text)))
}

fn de_can_id<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Number(u32),
        Text(String),
    }

    match RawId::deserialize(deserializer)? {
        RawId::Number(id) => Ok(id),
        RawId::Text(text) => parse_can_id(&text).map_err(serde::de::Error::custom),
    }
}

// =============================================================================
// Channel
// =============================================================================

/// CAN channel selection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// CAN interface name (e.g., "can0", "vcan0")
    #[serde(default = "default_interface")]
    pub interface: String,
    /// CAN bus bit rate
    #[serde(default = "default_bitrate")]
    pub bitrate: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            bitrate: default_bitrate(),
        }
    }
}

fn default_interface() -> String {
    "can0".to_string()
}

fn default_bitrate() -> u32 {
    1_000_000
}

// =============================================================================
// ISO-TP
// =============================================================================

/// ISO-TP addressing, flow control and timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsoTpConfig {
    /// Transmit CAN ID (host -> device)
    #[serde(default = "default_tx_id", deserialize_with = "de_can_id")]
    pub tx_id: u32,
    /// Receive CAN ID (device -> host)
    #[serde(default = "default_rx_id", deserialize_with = "de_can_id")]
    pub rx_id: u32,
    /// Byte used to pad frames to 8 bytes
    #[serde(default)]
    pub padding: u8,
    /// N_Bs: wait for flow control after a First Frame or block
    #[serde(default = "default_n_bs_ms")]
    pub n_bs_ms: u64,
    /// N_Cr: wait for the next Consecutive Frame while receiving
    #[serde(default = "default_n_cr_ms")]
    pub n_cr_ms: u64,
    /// Block size advertised in our flow control frames (0 = unlimited)
    #[serde(default)]
    pub block_size: u8,
    /// Raw STmin advertised in our flow control frames
    #[serde(default)]
    pub st_min: u8,
    /// Maximum number of FlowStatus::Wait frames accepted in a row
    #[serde(default = "default_wft_max")]
    pub wft_max: u8,
    /// Sleep between receive polls
    #[serde(default = "default_isotp_poll_ms")]
    pub poll_interval_ms: u64,
}

impl IsoTpConfig {
    pub fn n_bs(&self) -> Duration {
        Duration::from_millis(self.n_bs_ms)
    }

    pub fn n_cr(&self) -> Duration {
        Duration::from_millis(self.n_cr_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for IsoTpConfig {
    fn default() -> Self {
        Self {
            tx_id: default_tx_id(),
            rx_id: default_rx_id(),
            padding: 0x00,
            n_bs_ms: default_n_bs_ms(),
            n_cr_ms: default_n_cr_ms(),
            block_size: 0,
            st_min: 0,
            wft_max: default_wft_max(),
            poll_interval_ms: default_isotp_poll_ms(),
        }
    }
}

fn default_tx_id() -> u32 {
    0x7E0
}

fn default_rx_id() -> u32 {
    0x7E8
}

fn default_n_bs_ms() -> u64 {
    2000
}

fn default_n_cr_ms() -> u64 {
    2000
}

fn default_wft_max() -> u8 {
    8
}

fn default_isotp_poll_ms() -> u64 {
    2
}

// =============================================================================
// UDS client
// =============================================================================

/// UDS request/response timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UdsClientConfig {
    /// Default response timeout for a request
    #[serde(default = "default_uds_timeout_ms")]
    pub timeout_ms: u64,
    /// Upper bound on the total time spent in "response pending" extensions
    #[serde(default = "default_pending_limit_ms")]
    pub pending_limit_ms: u64,
}

impl UdsClientConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn pending_limit(&self) -> Duration {
        Duration::from_millis(self.pending_limit_ms)
    }
}

impl Default for UdsClientConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_uds_timeout_ms(),
            pending_limit_ms: default_pending_limit_ms(),
        }
    }
}

fn default_uds_timeout_ms() -> u64 {
    3000
}

fn default_pending_limit_ms() -> u64 {
    30000
}

// =============================================================================
// Raw IAP protocol
// =============================================================================

/// Identifiers and timing of the bespoke IAP protocol
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IapConfig {
    /// Host -> app: reset into bootloader
    #[serde(default = "default_reset_id", deserialize_with = "de_can_id")]
    pub reset_id: u32,
    /// Host -> bootloader: size and CRC
    #[serde(default = "default_metadata_id", deserialize_with = "de_can_id")]
    pub metadata_id: u32,
    /// Host -> bootloader: data packets
    #[serde(default = "default_data_id", deserialize_with = "de_can_id")]
    pub data_id: u32,
    /// Host -> bootloader: end of transmission
    #[serde(default = "default_eot_id", deserialize_with = "de_can_id")]
    pub eot_id: u32,
    /// App -> host: reset acknowledged
    #[serde(default = "default_app_ack_id", deserialize_with = "de_can_id")]
    pub app_ack_id: u32,
    /// Bootloader -> host: ready (or plain boot)
    #[serde(default = "default_ready_id", deserialize_with = "de_can_id")]
    pub ready_id: u32,
    /// Bootloader -> host: erase done
    #[serde(default = "default_erase_done_id", deserialize_with = "de_can_id")]
    pub erase_done_id: u32,
    /// Bootloader -> host: data packet acknowledged
    #[serde(default = "default_data_ack_id", deserialize_with = "de_can_id")]
    pub data_ack_id: u32,
    /// Bootloader -> host: image verified
    #[serde(default = "default_verify_ok_id", deserialize_with = "de_can_id")]
    pub verify_ok_id: u32,
    /// Bootloader -> host: error
    #[serde(default = "default_error_id", deserialize_with = "de_can_id")]
    pub error_id: u32,

    #[serde(default = "default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,
    #[serde(default = "default_erase_timeout_ms")]
    pub erase_timeout_ms: u64,
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    /// Retransmissions of one data packet before giving up
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_verify_timeout_ms")]
    pub verify_timeout_ms: u64,
    #[serde(default = "default_iap_poll_ms")]
    pub poll_interval_ms: u64,
}

impl IapConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn erase_timeout(&self) -> Duration {
        Duration::from_millis(self.erase_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_millis(self.verify_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    fn ids(&self) -> [(&'static str, u32); 10] {
        [
            ("iap.reset_id", self.reset_id),
            ("iap.metadata_id", self.metadata_id),
            ("iap.data_id", self.data_id),
            ("iap.eot_id", self.eot_id),
            ("iap.app_ack_id", self.app_ack_id),
            ("iap.ready_id", self.ready_id),
            ("iap.erase_done_id", self.erase_done_id),
            ("iap.data_ack_id", self.data_ack_id),
            ("iap.verify_ok_id", self.verify_ok_id),
            ("iap.error_id", self.error_id),
        ]
    }
}

impl Default for IapConfig {
    fn default() -> Self {
        Self {
            reset_id: default_reset_id(),
            metadata_id: default_metadata_id(),
            data_id: default_data_id(),
            eot_id: default_eot_id(),
            app_ack_id: default_app_ack_id(),
            ready_id: default_ready_id(),
            erase_done_id: default_erase_done_id(),
            data_ack_id: default_data_ack_id(),
            verify_ok_id: default_verify_ok_id(),
            error_id: default_error_id(),
            ready_timeout_ms: default_ready_timeout_ms(),
            erase_timeout_ms: default_erase_timeout_ms(),
            ack_timeout_ms: default_ack_timeout_ms(),
            max_retries: default_max_retries(),
            verify_timeout_ms: default_verify_timeout_ms(),
            poll_interval_ms: default_iap_poll_ms(),
        }
    }
}

fn default_reset_id() -> u32 {
    0xC0
}

fn default_metadata_id() -> u32 {
    0xC1
}

fn default_data_id() -> u32 {
    0xC2
}

fn default_eot_id() -> u32 {
    0xC3
}

fn default_app_ack_id() -> u32 {
    0xA0
}

fn default_ready_id() -> u32 {
    0xB0
}

fn default_erase_done_id() -> u32 {
    0xB1
}

fn default_data_ack_id() -> u32 {
    0xB2
}

fn default_verify_ok_id() -> u32 {
    0xB3
}

fn default_error_id() -> u32 {
    0xB4
}

fn default_ready_timeout_ms() -> u64 {
    5000
}

fn default_erase_timeout_ms() -> u64 {
    15000
}

fn default_ack_timeout_ms() -> u64 {
    500
}

fn default_max_retries() -> u32 {
    3
}

fn default_verify_timeout_ms() -> u64 {
    10000
}

fn default_iap_poll_ms() -> u64 {
    5
}

// =============================================================================
// UDS flash sequence
// =============================================================================

/// Timing and sizing of the UDS flash sequence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UdsFlashConfig {
    /// Wait after the application accepts the programming session and resets
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    /// Pause between the application-side handshake steps
    #[serde(default = "default_step_gap_ms")]
    pub step_gap_ms: u64,
    /// Response timeout for the erase routine
    #[serde(default = "default_uds_erase_timeout_ms")]
    pub erase_timeout_ms: u64,
    /// Firmware bytes per TransferData request
    ///
    /// Device buffer of 4096 minus SID and block counter, rounded down to
    /// the 4-byte flash write alignment.
    #[serde(default = "default_max_block_size")]
    pub max_block_size: usize,
    /// Pause after each acknowledged TransferData block
    #[serde(default = "default_block_gap_ms")]
    pub block_gap_ms: u64,
    /// Routine identifier for both the pre-programming check and the erase
    #[serde(default = "default_flash_routine")]
    pub flash_routine: u16,
}

impl UdsFlashConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn step_gap(&self) -> Duration {
        Duration::from_millis(self.step_gap_ms)
    }

    pub fn erase_timeout(&self) -> Duration {
        Duration::from_millis(self.erase_timeout_ms)
    }

    pub fn block_gap(&self) -> Duration {
        Duration::from_millis(self.block_gap_ms)
    }
}

impl Default for UdsFlashConfig {
    fn default() -> Self {
        Self {
            settle_ms: default_settle_ms(),
            step_gap_ms: default_step_gap_ms(),
            erase_timeout_ms: default_uds_erase_timeout_ms(),
            max_block_size: default_max_block_size(),
            block_gap_ms: default_block_gap_ms(),
            flash_routine: default_flash_routine(),
        }
    }
}

fn default_settle_ms() -> u64 {
    2000
}

fn default_step_gap_ms() -> u64 {
    100
}

fn default_uds_erase_timeout_ms() -> u64 {
    10000
}

fn default_max_block_size() -> usize {
    4092
}

fn default_block_gap_ms() -> u64 {
    50
}

fn default_flash_routine() -> u16 {
    0xFF00
}

// =============================================================================
// Firmware image
// =============================================================================

/// Firmware image limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Application partition size in bytes
    #[serde(default = "default_max_image_size")]
    pub max_size: u32,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            max_size: default_max_image_size(),
        }
    }
}

fn default_max_image_size() -> u32 {
    300 * 1024
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = FlasherConfig::from_toml_str("").unwrap();

        assert_eq!(config.isotp.tx_id, 0x7E0);
        assert_eq!(config.isotp.rx_id, 0x7E8);
        assert_eq!(config.isotp.n_bs(), Duration::from_secs(2));
        assert_eq!(config.iap.ack_timeout(), Duration::from_millis(500));
        assert_eq!(config.iap.max_retries, 3);
        assert_eq!(config.iap.erase_timeout(), Duration::from_secs(15));
        assert_eq!(config.uds_flash.max_block_size, 4092);
        assert_eq!(config.image.max_size, 300 * 1024);
    }

    #[test]
    fn test_can_ids_accept_hex_strings_and_numbers() {
        let config = FlasherConfig::from_toml_str(
            r#"
            [isotp]
            tx_id = "0x701"
            rx_id = 1801

            [iap]
            data_id = "0xC8"
            "#,
        )
        .unwrap();

        assert_eq!(config.isotp.tx_id, 0x701);
        assert_eq!(config.isotp.rx_id, 1801);
        assert_eq!(config.iap.data_id, 0xC8);
    }

    #[test]
    fn test_rejects_extended_ids() {
        let err = FlasherConfig::from_toml_str(
            r#"
            [isotp]
            tx_id = "0x18DA00F1"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_same_tx_and_rx() {
        let err = FlasherConfig::from_toml_str(
            r#"
            [isotp]
            tx_id = "0x7E0"
            rx_id = "0x7E0"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("both 0x7E0"));
    }

    #[test]
    fn test_rejects_unaligned_block_size() {
        let err = FlasherConfig::from_toml_str(
            r#"
            [uds_flash]
            max_block_size = 4094
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[channel]\ninterface = \"vcan0\"").unwrap();

        let config = FlasherConfig::load(file.path()).unwrap();
        assert_eq!(config.channel.interface, "vcan0");
        assert_eq!(config.channel.bitrate, 1_000_000);
    }

    #[test]
    fn test_parse_can_id() {
        assert_eq!(parse_can_id("0x7E8").unwrap(), 0x7E8);
        assert_eq!(parse_can_id("192").unwrap(), 0xC0);
        assert!(parse_can_id("seven").is_err());
    }
}
