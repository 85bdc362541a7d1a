// Configuration for the companion core
//
// Stored as JSON in the platform config directory:
// - Linux: ~/.config/meshlink/config.json
// - macOS: ~/Library/Application Support/meshlink/config.json
// - Windows: %APPDATA%\meshlink\config.json

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompanionConfig {
    /// Default log filter when RUST_LOG is unset
    pub log_level: String,

    /// Emit JSON log lines instead of human-readable ones
    pub json_logs: bool,

    /// Directory for the sled database; `Companion::open` falls back to the data directory
    pub storage_path: Option<String>,

    pub delivery: DeliveryConfig,
    pub session: SessionConfig,
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Lower bound for the ack wait of a single send
    pub ack_timeout_floor_ms: u64,

    /// Period of the expiry sweep
    pub sweep_interval_ms: u64,

    /// How long delivered entries linger to count heard repeats
    pub delivered_grace_ms: u64,

    /// Wire limit for message text, in UTF-8 bytes
    pub max_message_bytes: usize,

    /// How long a stray acknowledgement is remembered before its send registers
    pub early_ack_window_ms: u64,

    pub retry: RetryConfig,
}

/// Policy for the send-with-retry loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u8,

    /// Attempt index at which the path is reset and flood routing begins
    pub flood_after: u8,

    pub max_flood_attempts: u8,

    /// Per-attempt ack wait; the device's suggestion wins when it is longer
    pub custom_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub login_base_timeout_ms: u64,
    pub login_per_hop_timeout_ms: u64,
    pub login_max_timeout_ms: u64,

    /// Default keep-alive period for room sessions
    pub keep_alive_interval_secs: u64,

    /// How often a waiting CLI command pulls buffered messages
    pub cli_poll_interval_ms: u64,
    pub cli_timeout_ms: u64,

    pub status_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Fetch attempts per slot before it counts as a transient failure
    pub max_slot_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_jitter_ms: u64,

    /// Consecutive transient failures that abandon a full sync
    pub circuit_threshold: u32,
    pub settle_delay_ms: u64,

    /// Consecutive transient failures that abandon a retry pass
    pub retry_circuit_threshold: u32,
    pub retry_settle_delay_ms: u64,
}

impl Default for CompanionConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            storage_path: None,
            delivery: DeliveryConfig::default(),
            session: SessionConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            ack_timeout_floor_ms: 10_000,
            sweep_interval_ms: 5_000,
            delivered_grace_ms: 60_000,
            max_message_bytes: crate::message::MAX_TEXT_BYTES,
            early_ack_window_ms: 10_000,
            retry: RetryConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            flood_after: 2,
            max_flood_attempts: 2,
            custom_timeout_ms: 8_000,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            login_base_timeout_ms: 5_000,
            login_per_hop_timeout_ms: 10_000,
            login_max_timeout_ms: 60_000,
            keep_alive_interval_secs: 90,
            cli_poll_interval_ms: 500,
            cli_timeout_ms: 15_000,
            status_timeout_ms: 20_000,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_slot_attempts: 3,
            backoff_base_ms: 200,
            backoff_jitter_ms: 100,
            circuit_threshold: 3,
            settle_delay_ms: 1_000,
            retry_circuit_threshold: 2,
            retry_settle_delay_ms: 500,
        }
    }
}

impl DeliveryConfig {
    pub fn ack_timeout_floor(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_floor_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn delivered_grace(&self) -> Duration {
        Duration::from_millis(self.delivered_grace_ms)
    }

    pub fn early_ack_window(&self) -> Duration {
        Duration::from_millis(self.early_ack_window_ms)
    }
}

impl RetryConfig {
    pub fn custom_timeout(&self) -> Duration {
        Duration::from_millis(self.custom_timeout_ms)
    }
}

impl SessionConfig {
    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_secs(self.keep_alive_interval_secs)
    }

    pub fn cli_poll_interval(&self) -> Duration {
        Duration::from_millis(self.cli_poll_interval_ms)
    }

    pub fn cli_timeout(&self) -> Duration {
        Duration::from_millis(self.cli_timeout_ms)
    }

    pub fn status_timeout(&self) -> Duration {
        Duration::from_millis(self.status_timeout_ms)
    }
}

impl SyncConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn retry_settle_delay(&self) -> Duration {
        Duration::from_millis(self.retry_settle_delay_ms)
    }
}

impl CompanionConfig {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("meshlink");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the data directory path (cross-platform)
    pub fn data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .context("Failed to determine data directory")?
            .join("meshlink");

        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        Ok(data_dir)
    }

    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from the default location, writing defaults on first run
    pub fn load() -> Result<Self> {
        let config_file = Self::config_file()?;
        if config_file.exists() {
            Self::load_from(&config_file)
        } else {
            let config = Self::default();
            config.save_to(&config_file)?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: CompanionConfig =
            serde_json::from_str(&contents).context("Failed to parse config file")?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }
}
