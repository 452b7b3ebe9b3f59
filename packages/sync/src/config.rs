//! Timing configuration for a sync session.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_NAME: &str = "collab.config.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid setting: {0}")]
    Invalid(String),
}

/// Sync session settings file format
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSettings {
    /// Delay between heartbeats carrying the current lease claim
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// Retry delay after a heartbeat could not be delivered
    #[serde(default = "default_heartbeat_recover")]
    pub heartbeat_recover_ms: u64,

    /// Quiet period after a local save or edit before server refreshes run
    #[serde(default = "default_persistence_debounce")]
    pub persistence_debounce_ms: u64,

    /// Time a leaving user stays visible before being removed
    #[serde(default = "default_presence_grace")]
    pub presence_grace_ms: u64,

    /// Delay before the lease conflict warning is shown
    #[serde(default = "default_rejection_warning_delay")]
    pub rejection_warning_delay_ms: u64,

    /// Drop deduplication markers untouched for this long (never when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub marker_ttl_ms: Option<u64>,

    /// Capacity of the session command channel
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_heartbeat_interval() -> u64 {
    35_000
}

fn default_heartbeat_recover() -> u64 {
    2_000
}

fn default_persistence_debounce() -> u64 {
    2_500
}

fn default_presence_grace() -> u64 {
    2_000
}

fn default_rejection_warning_delay() -> u64 {
    1_500
}

fn default_event_buffer() -> usize {
    100
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval(),
            heartbeat_recover_ms: default_heartbeat_recover(),
            persistence_debounce_ms: default_persistence_debounce(),
            presence_grace_ms: default_presence_grace(),
            rejection_warning_delay_ms: default_rejection_warning_delay(),
            marker_ttl_ms: None,
            event_buffer: default_event_buffer(),
        }
    }
}

impl SyncSettings {
    /// Load settings from a directory, falling back to defaults
    pub fn load(dir: &Path) -> Result<Self, ConfigError> {
        let config_path = dir.join(DEFAULT_CONFIG_NAME);

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            Self::from_json(&content)
        } else {
            Ok(Self::default())
        }
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let settings: SyncSettings = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("heartbeatIntervalMs", self.heartbeat_interval_ms),
            ("heartbeatRecoverMs", self.heartbeat_recover_ms),
            ("persistenceDebounceMs", self.persistence_debounce_ms),
            ("presenceGraceMs", self.presence_grace_ms),
            ("rejectionWarningDelayMs", self.rejection_warning_delay_ms),
        ];
        for (name, value) in durations {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be greater than zero", name)));
            }
        }
        if self.marker_ttl_ms == Some(0) {
            return Err(ConfigError::Invalid("markerTtlMs must be greater than zero".to_string()));
        }
        if self.event_buffer == 0 {
            return Err(ConfigError::Invalid("eventBuffer must be greater than zero".to_string()));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_recover(&self) -> Duration {
        Duration::from_millis(self.heartbeat_recover_ms)
    }

    pub fn persistence_debounce(&self) -> Duration {
        Duration::from_millis(self.persistence_debounce_ms)
    }

    pub fn presence_grace(&self) -> Duration {
        Duration::from_millis(self.presence_grace_ms)
    }

    pub fn rejection_warning_delay(&self) -> Duration {
        Duration::from_millis(self.rejection_warning_delay_ms)
    }

    pub fn marker_ttl(&self) -> Option<Duration> {
        self.marker_ttl_ms.map(Duration::from_millis)
    }
}
