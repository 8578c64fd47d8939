//! Engine Settings
//!
//! Process-wide automation settings loaded from YAML. Every field has a
//! default so a partial (or absent) settings file is valid.
//!
//! # Example YAML Format
//!
//! ```yaml
//! server_name: automation-01
//! connections:
//!   enforce_threshold: true
//!   threshold: 100
//!   raise_exception: true
//! limits:
//!   max_result_size: 16777215
//!   truncate_logs: true
//!   truncate_size: 1000000
//! batch_size: 1000
//! ```

use std::fs;

use log::info;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Top-level automation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Identity of this engine process; runs it owns are recovered on restart
    pub server_name: String,

    /// Connection cache policy
    pub connections: ConnectionSettings,

    /// Size caps for results and logs
    pub limits: SizeLimits,

    /// Rows per batch when flushing buffered results at finalization
    pub batch_size: usize,

    /// Worker count used when a service does not set `max_processes`
    pub default_max_processes: usize,

    /// Sandbox limits for user expressions
    pub expressions: ExpressionSettings,
}

/// Policy applied by the connection cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    pub enforce_threshold: bool,
    /// Maximum concurrent open connections per run
    pub threshold: usize,
    /// Raise instead of only logging when the threshold is reached
    pub raise_exception: bool,
    /// Severity used to log a threshold breach
    pub log_level: String,
    /// Upper bound on waiting for connections to close at run end
    pub disconnect_timeout_secs: u64,
}

/// Size limits for persisted data, in bytes of serialized JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SizeLimits {
    pub max_result_size: usize,
    pub max_log_size: usize,
    pub truncate_logs: bool,
    pub truncate_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpressionSettings {
    pub max_operations: u64,
    pub max_call_levels: usize,
    /// Function names that user expressions may not call
    pub forbidden_functions: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_name: "localhost".to_string(),
            connections: ConnectionSettings::default(),
            limits: SizeLimits::default(),
            batch_size: 1000,
            default_max_processes: num_cpus::get().max(1),
            expressions: ExpressionSettings::default(),
        }
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            enforce_threshold: false,
            threshold: 100,
            raise_exception: false,
            log_level: "warning".to_string(),
            disconnect_timeout_secs: 10,
        }
    }
}

impl Default for SizeLimits {
    fn default() -> Self {
        Self {
            max_result_size: 16_777_215,
            max_log_size: 4_294_967_295,
            truncate_logs: true,
            truncate_size: 1_000_000,
        }
    }
}

impl Default for ExpressionSettings {
    fn default() -> Self {
        Self {
            max_operations: 1_000_000,
            max_call_levels: 64,
            forbidden_functions: vec!["eval".to_string()],
        }
    }
}

/// Loads settings from a YAML file.
pub fn load_settings(path: &str) -> Result<Settings> {
    let content = fs::read_to_string(path).map_err(|e| {
        EngineError::Config(format!("Failed to read settings file '{}': {}", path, e))
    })?;

    let settings: Settings = serde_yaml::from_str(&content)
        .map_err(|e| EngineError::Config(format!("Failed to parse settings YAML: {}", e)))?;

    if settings.batch_size == 0 {
        return Err(EngineError::Config("batch_size must be at least 1".to_string()));
    }

    info!("Loaded settings from {} (server: {})", path, settings.server_name);
    Ok(settings)
}
