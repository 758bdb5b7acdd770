//! Configuration types

use std::path::PathBuf;
use std::time::Duration;

use mixcraft_relay::{AckPolicy, OverflowPolicy, RelayConfig, TicketPricing};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{default_settings_path, Result, SettingsError};

/// Main settings structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Relay runtime settings
    #[serde(default)]
    pub relay: RelaySettings,

    #[serde(default)]
    pub logging: LoggingSettings,

    /// Custom settings file path (not serialized)
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

impl Settings {
    /// Load settings from the default path, or create defaults
    pub fn load_or_default() -> Result<Self> {
        Self::load_from(&default_settings_path())
    }

    /// Load settings from a specific path, or create defaults
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path).map_err(SettingsError::ReadError)?;
            let mut settings: Settings =
                serde_json::from_str(&content).map_err(SettingsError::ParseError)?;
            settings.relay.validate()?;
            settings.config_path = Some(path.clone());
            info!("Loaded settings from {:?}", path);
            Ok(settings)
        } else {
            let mut settings = Self::default();
            settings.config_path = Some(path.clone());
            Ok(settings)
        }
    }

    /// Save settings to the configured path
    pub fn save(&self) -> Result<()> {
        let path = self.config_path.clone().unwrap_or_else(default_settings_path);
        self.save_to(&path)
    }

    /// Save settings to a specific path
    pub fn save_to(&self, path: &PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(SettingsError::CreateDirError)?;
            }
        }

        let content = serde_json::to_string_pretty(self).map_err(SettingsError::ParseError)?;
        std::fs::write(path, content).map_err(SettingsError::WriteError)?;
        info!("Saved settings to {:?}", path);
        Ok(())
    }

    /// Runtime configuration for the relay
    pub fn to_relay_config(&self) -> RelayConfig {
        self.relay.to_relay_config()
    }
}

/// Relay settings. Durations are in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySettings {
    #[serde(default)]
    pub min_mix_delay_ms: u64,

    #[serde(default = "default_max_mix_delay")]
    pub max_mix_delay_ms: u64,

    /// Packets the mixer holds before the overflow policy applies
    #[serde(default = "default_queue_depth")]
    pub max_queue_depth: usize,

    #[serde(default)]
    pub overflow: OverflowMode,

    #[serde(default = "default_forward_timeout")]
    pub forward_timeout_ms: u64,

    #[serde(default = "default_forward_attempts")]
    pub forward_attempts: u32,

    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,

    #[serde(default)]
    pub ack: AckMode,

    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_ms: u64,

    /// Amount each relay keeps per forwarded packet
    #[serde(default = "default_price_per_hop")]
    pub price_per_hop: u64,

    /// Win probability written into issued tickets
    #[serde(default = "default_win_probability")]
    pub win_probability: f64,

    /// Capacity of each channel between pipeline stages
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    #[serde(default = "default_store_retry_attempts")]
    pub store_retry_attempts: u32,

    #[serde(default = "default_store_retry_backoff")]
    pub store_retry_backoff_ms: u64,

    /// Packets and acks held while the store is down
    #[serde(default = "default_max_parked")]
    pub max_parked: usize,

    #[serde(default = "default_parked_retry_interval")]
    pub parked_retry_interval_ms: u64,
}

fn default_max_mix_delay() -> u64 {
    200
}

fn default_queue_depth() -> usize {
    4096
}

fn default_forward_timeout() -> u64 {
    5000
}

fn default_forward_attempts() -> u32 {
    3
}

fn default_retry_backoff() -> u64 {
    250
}

fn default_ack_timeout() -> u64 {
    5000
}

fn default_price_per_hop() -> u64 {
    100
}

fn default_win_probability() -> f64 {
    1.0
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_store_retry_attempts() -> u32 {
    3
}

fn default_store_retry_backoff() -> u64 {
    100
}

fn default_max_parked() -> usize {
    1024
}

fn default_parked_retry_interval() -> u64 {
    1000
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            min_mix_delay_ms: 0,
            max_mix_delay_ms: default_max_mix_delay(),
            max_queue_depth: default_queue_depth(),
            overflow: OverflowMode::default(),
            forward_timeout_ms: default_forward_timeout(),
            forward_attempts: default_forward_attempts(),
            retry_backoff_ms: default_retry_backoff(),
            ack: AckMode::default(),
            ack_timeout_ms: default_ack_timeout(),
            price_per_hop: default_price_per_hop(),
            win_probability: default_win_probability(),
            channel_capacity: default_channel_capacity(),
            store_retry_attempts: default_store_retry_attempts(),
            store_retry_backoff_ms: default_store_retry_backoff(),
            max_parked: default_max_parked(),
            parked_retry_interval_ms: default_parked_retry_interval(),
        }
    }
}

impl RelaySettings {
    /// Reject settings the relay cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.min_mix_delay_ms > self.max_mix_delay_ms {
            return Err(SettingsError::Invalid(format!(
                "min_mix_delay_ms ({}) exceeds max_mix_delay_ms ({})",
                self.min_mix_delay_ms, self.max_mix_delay_ms
            )));
        }
        if !(0.0..=1.0).contains(&self.win_probability) {
            return Err(SettingsError::Invalid(format!(
                "win_probability {} is outside [0, 1]",
                self.win_probability
            )));
        }
        if self.forward_attempts == 0 {
            return Err(SettingsError::Invalid("forward_attempts must be at least 1".into()));
        }
        if self.max_queue_depth == 0 || self.channel_capacity == 0 || self.max_parked == 0 {
            return Err(SettingsError::Invalid(
                "max_queue_depth, channel_capacity and max_parked must be positive".into(),
            ));
        }
        if self.parked_retry_interval_ms == 0 {
            return Err(SettingsError::Invalid(
                "parked_retry_interval_ms must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn to_relay_config(&self) -> RelayConfig {
        RelayConfig {
            min_mix_delay: Duration::from_millis(self.min_mix_delay_ms),
            max_mix_delay: Duration::from_millis(self.max_mix_delay_ms),
            max_queue_depth: self.max_queue_depth,
            overflow_policy: self.overflow.into(),
            forward_timeout: Duration::from_millis(self.forward_timeout_ms),
            forward_attempts: self.forward_attempts,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            ack_policy: self.ack.into(),
            ack_timeout: Duration::from_millis(self.ack_timeout_ms),
            pricing: TicketPricing {
                price_per_hop: self.price_per_hop as u128,
                win_probability: self.win_probability,
            },
            channel_capacity: self.channel_capacity,
            store_retry_attempts: self.store_retry_attempts,
            store_retry_backoff: Duration::from_millis(self.store_retry_backoff_ms),
            max_parked: self.max_parked,
            parked_retry_interval: Duration::from_millis(self.parked_retry_interval_ms),
        }
    }
}

/// Mixer overflow behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverflowMode {
    #[default]
    DropOldest,
    DropNewest,
}

impl From<OverflowMode> for OverflowPolicy {
    fn from(mode: OverflowMode) -> Self {
        match mode {
            OverflowMode::DropOldest => OverflowPolicy::DropOldest,
            OverflowMode::DropNewest => OverflowPolicy::DropNewest,
        }
    }
}

/// When forwarded packets are acknowledged upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AckMode {
    /// After the next hop accepted the packet
    #[default]
    AfterForward,
    /// As soon as the first send attempt starts
    AfterDispatch,
}

impl From<AckMode> for AckPolicy {
    fn from(mode: AckMode) -> Self {
        match mode {
            AckMode::AfterForward => AckPolicy::AfterForward,
            AckMode::AfterDispatch => AckPolicy::AfterDispatch,
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Filter used when `RUST_LOG` is unset
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

fn default_log_filter() -> String {
    "info,mixcraft=debug".to_string()
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}
