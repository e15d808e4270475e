//! Translator configuration: structs, parsing, and validation.
//!
//! The session-database knobs live in the domain crate
//! ([`domain::bib::entity::BibSettings`]); this module wraps them in the
//! full config file, validates the whole, and carries the deployment-side
//! sections (logging, sweeping, session sync transport).

mod common;

pub use common::{ConfigError, LogFormat, LogLevel};

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use domain::bib::entity::BibSettings;
use domain::sync::record::{HEADER_LEN, RECORD_LEN};

use crate::constants::{DEFAULT_SWEEP_PERIOD_MS, DEFAULT_SYNC_CAPACITY, DEFAULT_SYNC_DEADLINE_MS};
use common::{default_true, warn_if_world_readable};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TranslatorConfig {
    #[serde(default)]
    pub nat64: BibSettings,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub sync: SyncSectionConfig,

    /// How often the expiration sweeper runs, in milliseconds.
    #[serde(default = "default_sweep_period_ms")]
    pub sweep_period_ms: u64,
}

fn default_sweep_period_ms() -> u64 {
    DEFAULT_SWEEP_PERIOD_MS
}

impl Default for TranslatorConfig {
    fn default() -> Self {
        Self {
            nat64: BibSettings::default(),
            logging: LoggingConfig::default(),
            sync: SyncSectionConfig::default(),
            sweep_period_ms: DEFAULT_SWEEP_PERIOD_MS,
        }
    }
}

impl TranslatorConfig {
    /// Load config from a YAML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        warn_if_world_readable(path, "config file");
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse config from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml_ng::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.nat64
            .validate()
            .map_err(|e| ConfigError::Validation {
                field: "nat64".to_string(),
                message: e.to_string(),
            })?;
        if self.sweep_period_ms == 0 {
            return Err(ConfigError::Validation {
                field: "sweep_period_ms".to_string(),
                message: "must be nonzero".to_string(),
            });
        }
        self.sync.validate()
    }

    pub fn sweep_period(&self) -> Duration {
        Duration::from_millis(self.sweep_period_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: LogLevel,
    #[serde(default)]
    pub format: LogFormat,
}

/// Session synchronization section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSectionConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Ship snapshots immediately instead of batching to the deadline.
    #[serde(default = "default_true")]
    pub flush_asap: bool,

    #[serde(default = "default_sync_deadline_ms")]
    pub deadline_ms: u64,

    #[serde(default = "default_sync_capacity")]
    pub capacity: usize,

    /// Frame payload budget, bytes. The default packs a typical MTU.
    #[serde(default = "default_sync_max_payload")]
    pub max_payload: usize,
}

fn default_sync_deadline_ms() -> u64 {
    DEFAULT_SYNC_DEADLINE_MS
}

fn default_sync_capacity() -> usize {
    DEFAULT_SYNC_CAPACITY
}

fn default_sync_max_payload() -> usize {
    domain::sync::record::DEFAULT_MAX_PAYLOAD
}

impl Default for SyncSectionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            flush_asap: true,
            deadline_ms: DEFAULT_SYNC_DEADLINE_MS,
            capacity: DEFAULT_SYNC_CAPACITY,
            max_payload: domain::sync::record::DEFAULT_MAX_PAYLOAD,
        }
    }
}

impl SyncSectionConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_payload < HEADER_LEN + RECORD_LEN {
            return Err(ConfigError::Validation {
                field: "sync.max_payload".to_string(),
                message: format!(
                    "must fit at least one record ({} bytes)",
                    HEADER_LEN + RECORD_LEN
                ),
            });
        }
        if self.capacity == 0 {
            return Err(ConfigError::Validation {
                field: "sync.capacity".to_string(),
                message: "must be nonzero".to_string(),
            });
        }
        if self.deadline_ms == 0 {
            return Err(ConfigError::Validation {
                field: "sync.deadline_ms".to_string(),
                message: "must be nonzero".to_string(),
            });
        }
        Ok(())
    }
}
