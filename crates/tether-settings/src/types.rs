//! Settings types.
//!
//! Every struct uses `#[serde(default)]` so a partial user file only needs
//! the keys it changes.

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TetherSettings {
    /// Connection pool settings.
    pub pool: PoolSettings,
    /// Request correlator settings.
    pub correlator: CorrelatorSettings,
    /// Ordinal fallback matcher settings.
    pub ordinal: OrdinalSettings,
    /// Logging settings.
    pub logging: LoggingSettings,
}

impl TetherSettings {
    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.pool.max_connections == 0 {
            return Err(SettingsError::InvalidValue(
                "pool.maxConnections must be greater than 0".into(),
            ));
        }
        if self.pool.outbound_buffer == 0 {
            return Err(SettingsError::InvalidValue(
                "pool.outboundBuffer must be greater than 0".into(),
            ));
        }
        if self.pool.max_reconnect_attempts == Some(0) {
            return Err(SettingsError::InvalidValue(
                "pool.maxReconnectAttempts must be greater than 0 (omit for unbounded)".into(),
            ));
        }
        if self.correlator.request_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "correlator.requestTimeoutMs must be greater than 0".into(),
            ));
        }
        if self.ordinal.queue_max_size == 0 {
            return Err(SettingsError::InvalidValue(
                "ordinal.queueMaxSize must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// Connection pool settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PoolSettings {
    /// Ceiling on endpoints with a live or connecting record.
    pub max_connections: usize,
    /// Fixed delay between reconnect attempts in milliseconds.
    pub reconnect_delay_ms: u64,
    /// Attempt cap; `None` retries for as long as subscribers remain.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_reconnect_attempts: Option<u32>,
    /// Per-connection outbound frame buffer.
    pub outbound_buffer: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 10,
            reconnect_delay_ms: 3000,
            max_reconnect_attempts: None,
            outbound_buffer: 256,
        }
    }
}

/// Request correlator settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CorrelatorSettings {
    /// Default listener timeout in milliseconds.
    pub request_timeout_ms: u64,
}

impl Default for CorrelatorSettings {
    fn default() -> Self {
        Self {
            request_timeout_ms: 15_000,
        }
    }
}

/// Ordinal fallback matcher settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OrdinalSettings {
    /// Queue length that triggers a forced reset.
    pub queue_max_size: usize,
    /// Body field holding the explicit subject identifier.
    pub subject_field: String,
}

impl Default for OrdinalSettings {
    fn default() -> Self {
        Self {
            queue_max_size: 10,
            subject_field: "subject".to_string(),
        }
    }
}

/// Logging settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Minimum level (`RUST_LOG` takes precedence).
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            json: false,
        }
    }
}
