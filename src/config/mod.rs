//! # Configuration Management Module
//!
//! This module handles all configuration aspects of the meshmeter agent,
//! providing a centralized configuration system with validation and defaults.
//!
//! ## Configuration Structure
//!
//! The configuration is organized into logical sections:
//!
//! - [`AgentConfig`] - Node identity and upload scheduling
//! - [`MeshConfig`] - Mesh transport settings (UDP or in-process loopback)
//! - [`ModemConfig`] - Modem bridge settings (serial device or simulator)
//! - [`TransferConfig`] - Chunked measurement transfer tuning
//! - [`LoggingConfig`] - Logging settings
//!
//! ## Configuration File Format
//!
//! meshmeter uses TOML format for human-readable configuration:
//!
//! ```toml
//! [agent]
//! node_id = "0x00c0ffee"
//! upload_interval_secs = 300
//!
//! [mesh]
//! mode = "udp"
//! port = 5683
//!
//! [modem]
//! mode = "serial"
//! port = "/dev/ttyUSB1"
//! baud_rate = 115200
//! ```
//!
//! Values not present in the file fall back to the defaults below.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub agent: AgentConfig,
    pub mesh: MeshConfig,
    pub modem: ModemConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Node address on the mesh, written as `0x`-prefixed hex or decimal.
    /// Empty string means a random address is picked at startup.
    #[serde(default)]
    pub node_id: String,
    /// Seconds between measurement upload attempts. 0 disables the periodic
    /// trigger; rounds can still be started with the control channel.
    #[serde(default = "default_upload_interval_secs")]
    pub upload_interval_secs: u64,
    /// Announce ourselves with a discover probe once the mesh link attaches.
    #[serde(default = "default_discover_on_start")]
    pub discover_on_start: bool,
}

fn default_upload_interval_secs() -> u64 {
    300
}

fn default_discover_on_start() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Transport backing the mesh: "udp" or "loopback".
    #[serde(default = "default_mesh_mode")]
    pub mode: String,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_mesh_port")]
    pub port: u16,
    /// Multicast group used for discover probes. Unicast traffic goes to the
    /// sender address learned from inbound frames.
    #[serde(default = "default_multicast_group")]
    pub multicast_group: String,
}

fn default_mesh_mode() -> String {
    "udp".to_string()
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_mesh_port() -> u16 {
    5683
}

fn default_multicast_group() -> String {
    "239.0.0.77".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModemConfig {
    /// Modem backing: "serial" for a real AT-command device, "sim" for the
    /// built-in simulator.
    #[serde(default = "default_modem_mode")]
    pub mode: String,
    pub port: String,
    pub baud_rate: u32,
    /// How long a cloud publish may stay unacknowledged before the attempt is
    /// declared dead and retransmitted (ms).
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,
    /// Transmissions of one publish, first send included, before it is
    /// abandoned.
    #[serde(default = "default_publish_retry_limit")]
    pub publish_retry_limit: u8,
    /// If the modem has not produced its ready banner within this window the
    /// bridge pulses the wake line and keeps waiting (secs).
    #[serde(default = "default_sync_watchdog_secs")]
    pub sync_watchdog_secs: u64,
}

fn default_modem_mode() -> String {
    "serial".to_string()
}

fn default_publish_timeout_ms() -> u64 {
    10_000
}

fn default_publish_retry_limit() -> u8 {
    3
}

fn default_sync_watchdog_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Bytes per chunk on the mesh and per block in local push mode.
    #[serde(default = "default_block_size")]
    pub block_size: u16,
    /// Chunks in a generated measurement.
    #[serde(default = "default_total_chunks")]
    pub total_chunks: u32,
    /// Transmissions of a single chunk, first send included, before the
    /// transfer is abandoned.
    #[serde(default = "default_chunk_retry_limit")]
    pub chunk_retry_limit: u8,
    /// Timeout waiting for a chunk acknowledgement from the serving peer (ms).
    #[serde(default = "default_chunk_timeout_ms")]
    pub chunk_timeout_ms: u64,
    /// Timeout waiting for a negotiation response (ms).
    #[serde(default = "default_negotiation_timeout_ms")]
    pub negotiation_timeout_ms: u64,
    /// Pacing between blocks in local push mode (ms).
    #[serde(default = "default_local_push_interval_ms")]
    pub local_push_interval_ms: u64,
    /// Back-off before re-pushing a block the bridge reported busy for (ms).
    #[serde(default = "default_local_retry_delay_ms")]
    pub local_retry_delay_ms: u64,
}

fn default_block_size() -> u16 {
    128
}

fn default_total_chunks() -> u32 {
    8
}

fn default_chunk_retry_limit() -> u8 {
    3
}

fn default_chunk_timeout_ms() -> u64 {
    2_000
}

fn default_negotiation_timeout_ms() -> u64 {
    3_000
}

fn default_local_push_interval_ms() -> u64 {
    200
}

fn default_local_retry_delay_ms() -> u64 {
    500
}

impl Default for TransferConfig {
    fn default() -> Self {
        TransferConfig {
            block_size: default_block_size(),
            total_chunks: default_total_chunks(),
            chunk_retry_limit: default_chunk_retry_limit(),
            chunk_timeout_ms: default_chunk_timeout_ms(),
            negotiation_timeout_ms: default_negotiation_timeout_ms(),
            local_push_interval_ms: default_local_push_interval_ms(),
            local_retry_delay_ms: default_local_retry_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        config.validate()?;
        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    /// Parse the configured node id. Accepts `0x`-prefixed hex or decimal;
    /// an empty string yields `None` (caller picks a random address).
    pub fn parse_node_id(&self) -> Result<Option<u32>> {
        let raw = self.agent.node_id.trim();
        if raw.is_empty() {
            return Ok(None);
        }
        let value = if let Some(hex) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
            u32::from_str_radix(hex, 16)
        } else {
            raw.parse::<u32>()
        }
        .map_err(|e| anyhow!("Invalid node_id '{}': {}", raw, e))?;
        Ok(Some(value))
    }

    /// Reject configurations that cannot work before any task is spawned.
    pub fn validate(&self) -> Result<()> {
        match self.mesh.mode.as_str() {
            "udp" | "loopback" => {}
            other => return Err(anyhow!("Unknown mesh mode '{}'", other)),
        }
        match self.modem.mode.as_str() {
            "serial" | "sim" => {}
            other => return Err(anyhow!("Unknown modem mode '{}'", other)),
        }
        if self.transfer.block_size == 0 || self.transfer.total_chunks == 0 {
            return Err(anyhow!("block_size and total_chunks must be non-zero"));
        }
        let max = crate::modem::command::max_cloud_payload();
        if usize::from(self.transfer.block_size) > max {
            return Err(anyhow!(
                "block_size {} exceeds the {} byte limit of the modem command buffer",
                self.transfer.block_size,
                max
            ));
        }
        // Measurement lengths travel as u32; the product must fit.
        if u64::from(self.transfer.block_size) * u64::from(self.transfer.total_chunks)
            > u64::from(u32::MAX)
        {
            return Err(anyhow!(
                "block_size {} x total_chunks {} overflows the 32-bit measurement length",
                self.transfer.block_size,
                self.transfer.total_chunks
            ));
        }
        self.parse_node_id()?;
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            agent: AgentConfig {
                node_id: "".to_string(),
                upload_interval_secs: default_upload_interval_secs(),
                discover_on_start: default_discover_on_start(),
            },
            mesh: MeshConfig {
                mode: default_mesh_mode(),
                bind_addr: default_bind_addr(),
                port: default_mesh_port(),
                multicast_group: default_multicast_group(),
            },
            modem: ModemConfig {
                mode: default_modem_mode(),
                port: "/dev/ttyUSB1".to_string(),
                baud_rate: 115200,
                publish_timeout_ms: default_publish_timeout_ms(),
                publish_retry_limit: default_publish_retry_limit(),
                sync_watchdog_secs: default_sync_watchdog_secs(),
            },
            transfer: TransferConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
                file: Some("meshmeter.log".to_string()),
            },
        }
    }
}
