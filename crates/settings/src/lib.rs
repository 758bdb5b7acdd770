//! MixCraft Settings
//!
//! Relay node configuration stored as JSON.
//!
//! ## Usage
//!
//! ```no_run
//! use mixcraft_settings::Settings;
//!
//! // Load or create default settings
//! let mut settings = Settings::load_or_default()?;
//!
//! // Slow the mixer down
//! settings.relay.max_mix_delay_ms = 500;
//! settings.save()?;
//!
//! let config = settings.to_relay_config();
//! # Ok::<(), mixcraft_settings::SettingsError>(())
//! ```

mod config;

pub use config::{AckMode, LoggingSettings, OverflowMode, RelaySettings, Settings};

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to read settings: {0}")]
    ReadError(std::io::Error),

    #[error("Failed to write settings: {0}")]
    WriteError(std::io::Error),

    #[error("Failed to parse settings: {0}")]
    ParseError(serde_json::Error),

    #[error("Failed to create config directory: {0}")]
    CreateDirError(std::io::Error),

    #[error("Invalid setting: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, SettingsError>;

/// Directory holding MixCraft configuration (`$HOME/.mixcraft`)
pub fn default_config_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mixcraft")
}

/// Get the default settings file path
pub fn default_settings_path() -> PathBuf {
    default_config_dir().join("settings.json")
}
