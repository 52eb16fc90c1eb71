//! Configuration loaded with Figment.
//!
//! Configuration is layered:
//! 1. Built-in defaults
//! 2. An optional TOML file
//! 3. Environment variables prefixed with `MDA_`, nested with `__`
//!    (e.g. `MDA_STORE__CAPACITY_BYTES=2000000000`)
//!
//! # Example
//! ```no_run
//! use mda_core::config::StreamConfig;
//!
//! let config = StreamConfig::load_from(Some("config/mda.toml".as_ref()))?;
//! config.validate()?;
//! println!("capacity: {}", config.store.capacity_bytes);
//! # Ok::<(), mda_core::EdaError>(())
//! ```

use crate::data::PixelType;
use crate::error::{EdaError, EdaResult};
use crate::limits::{
    DEFAULT_CAPACITY_BYTES, DEFAULT_INDEX_CHANNELS, DEFAULT_INDEX_TIME, DEFAULT_INDEX_Z,
    MAX_INDEX_ENTRIES, MAX_MESSAGE_BYTES, RECEIVER_POLL_TIMEOUT,
};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "MDA_";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub store: StoreConfig,
    pub index: IndexConfig,
    pub channel: ChannelConfig,
    pub logging: LoggingConfig,
}

/// What to do when a second frame arrives for an already recorded coordinate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    /// Re-point the index entry at the new frame; the old bytes are orphaned.
    #[default]
    Overwrite,
    /// Fail the `put` with `DuplicateCoordinate`, nothing is written.
    Reject,
}

/// What the remote receiver does with queued messages when asked to stop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownPolicy {
    /// Dispatch everything already readable from the transport before exiting.
    #[default]
    Drain,
    /// Exit as soon as the stop flag is seen; queued messages are discarded.
    Drop,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Size of the ring buffer data region in bytes
    pub capacity_bytes: u64,
    pub pixel_type: PixelType,
    /// Backing file (e.g. under /dev/shm). None means anonymous memory that
    /// cannot be opened by another process.
    pub backing_path: Option<PathBuf>,
    pub duplicate_policy: DuplicatePolicy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: DEFAULT_CAPACITY_BYTES,
            pixel_type: PixelType::U16,
            backing_path: None,
            duplicate_policy: DuplicatePolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub initial_channels: usize,
    pub initial_z: usize,
    pub initial_time: usize,
    /// Upper bound on channel x z x time cells
    pub max_entries: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            initial_channels: DEFAULT_INDEX_CHANNELS,
            initial_z: DEFAULT_INDEX_Z,
            initial_time: DEFAULT_INDEX_TIME,
            max_entries: MAX_INDEX_ENTRIES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// `unix:<path>` or `tcp:<host:port>`
    pub endpoint: Option<String>,
    pub poll_timeout_ms: u64,
    pub shutdown: ShutdownPolicy,
    pub max_message_bytes: usize,
}

impl ChannelConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            poll_timeout_ms: RECEIVER_POLL_TIMEOUT.as_millis() as u64,
            shutdown: ShutdownPolicy::default(),
            max_message_bytes: MAX_MESSAGE_BYTES,
        }
    }
}

/// Output format for log lines
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace, debug, info, warn, error
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::default(),
        }
    }
}

impl StreamConfig {
    /// Figment with defaults, the optional TOML file, and `MDA_` overrides.
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(StreamConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn load_from(path: Option<&Path>) -> EdaResult<Self> {
        Ok(Self::figment(path).extract()?)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> EdaResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(EdaError::Configuration(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }

        if self.store.capacity_bytes == 0 {
            return Err(EdaError::Configuration(
                "store.capacity_bytes must be positive".into(),
            ));
        }

        let index = &self.index;
        if index.initial_channels == 0 || index.initial_z == 0 || index.initial_time == 0 {
            return Err(EdaError::Configuration(
                "index extents must be at least 1 on every axis".into(),
            ));
        }
        let initial = index
            .initial_channels
            .checked_mul(index.initial_z)
            .and_then(|n| n.checked_mul(index.initial_time));
        match initial {
            Some(cells) if cells <= index.max_entries => {}
            _ => {
                return Err(EdaError::Configuration(format!(
                    "initial index {}x{}x{} exceeds max_entries {}",
                    index.initial_channels, index.initial_z, index.initial_time, index.max_entries
                )))
            }
        }

        if self.channel.poll_timeout_ms == 0 {
            return Err(EdaError::Configuration(
                "channel.poll_timeout_ms must be positive".into(),
            ));
        }
        if self.channel.max_message_bytes == 0 {
            return Err(EdaError::Configuration(
                "channel.max_message_bytes must be positive".into(),
            ));
        }

        Ok(())
    }

    /// Effective configuration as TOML, loadable again with `load_from`.
    pub fn to_toml(&self) -> EdaResult<String> {
        toml::to_string_pretty(self).map_err(|e| EdaError::Configuration(e.to_string()))
    }
}
