//! Job Record and the rows a run persists.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::inventory::{DeviceId, PoolId, ServiceId};

/// Aggregate result of an execution context.
pub type ResultMap = Map<String, Value>;

/// Lifecycle status of a run. Everything but `Running` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Running,
    Completed,
    Aborted,
    #[serde(rename = "Aborted (error)")]
    AbortedError,
    #[serde(rename = "Aborted (reload)")]
    AbortedReload,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "Running",
            RunStatus::Completed => "Completed",
            RunStatus::Aborted => "Aborted",
            RunStatus::AbortedError => "Aborted (error)",
            RunStatus::AbortedReload => "Aborted (reload)",
        }
    }

    pub fn is_terminal(self) -> bool {
        self != RunStatus::Running
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted lifecycle row of one top-level trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub runtime: String,
    pub name: String,
    pub service_id: ServiceId,
    pub creator: String,
    /// Engine process owning the run
    pub server: String,
    pub status: RunStatus,
    pub success: Option<bool>,
    pub duration: Option<String>,
    pub trigger: String,
    pub payload: Value,
    pub target_devices: Vec<DeviceId>,
    pub target_pools: Vec<PoolId>,
    /// Runtime of the run this one restarts
    pub restart_run: Option<String>,
    pub parameterized: bool,
    pub start_services: Vec<ServiceId>,
    pub result: Option<Value>,
    /// State snapshot taken at finalization
    pub state: Option<Value>,
    pub memory_size: u64,
    pub created_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn new(runtime: &str, service_id: ServiceId, creator: &str, server: &str) -> Self {
        Self {
            runtime: runtime.to_string(),
            name: format!("{} ({})", runtime, creator),
            service_id,
            creator: creator.to_string(),
            server: server.to_string(),
            status: RunStatus::Running,
            success: None,
            duration: None,
            trigger: "Regular Run".to_string(),
            payload: Value::Object(Map::new()),
            target_devices: Vec::new(),
            target_pools: Vec::new(),
            restart_run: None,
            parameterized: false,
            start_services: Vec::new(),
            result: None,
            state: None,
            memory_size: 0,
            created_at: Utc::now(),
        }
    }
}

/// One result row per (run, service step, device).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceResult {
    pub runtime: String,
    /// Service ids from the top-level service down, joined by `>`
    pub path: String,
    pub service_id: ServiceId,
    pub device: Option<String>,
    pub success: bool,
    pub duration: String,
    pub result: Value,
    pub memory_size: u64,
}

/// Buffered log lines of one service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceLogEntry {
    pub runtime: String,
    pub service_id: ServiceId,
    pub content: String,
}

/// Rendered report of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceReport {
    pub runtime: String,
    pub service_id: ServiceId,
    pub content: String,
}

/// A configuration change recorded through change logs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub runtime: String,
    pub service_id: ServiceId,
    pub device: Option<String>,
    pub content: String,
    pub time: DateTime<Utc>,
}

/// Unique runtime token: microsecond timestamp plus a random suffix.
pub fn generate_runtime() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "{}-{}",
        Utc::now().format("%Y-%m-%d %H:%M:%S%.6f"),
        &suffix[..8]
    )
}

/// Renders a duration as `1h02m05s`, `2m05s` or `2.3s`.
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{}h{:02}m{:02}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m{:02}s", minutes, seconds)
    } else {
        format!("{}.{:01}s", seconds, duration.subsec_millis() / 100)
    }
}

/// `"<done>/<total> (<failed> failed)"` from a `progress/device` state node.
pub fn progress_text(progress: &Value) -> String {
    let count = |key: &str| progress.get(key).and_then(Value::as_u64).unwrap_or(0);
    let (success, failure) = (count("success"), count("failure"));
    format!(
        "{}/{} ({} failed)",
        success + failure,
        count("total"),
        failure
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_spelling() {
        assert_eq!(RunStatus::AbortedReload.to_string(), "Aborted (reload)");
        assert_eq!(
            serde_json::to_value(RunStatus::AbortedError).unwrap(),
            json!("Aborted (error)")
        );
        assert!(RunStatus::Aborted.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
    }

    #[test]
    fn test_record_name_and_defaults() {
        let record = JobRecord::new("rt-1", 3, "admin", "node-a");
        assert_eq!(record.name, "rt-1 (admin)");
        assert_eq!(record.status, RunStatus::Running);
        assert_eq!(record.trigger, "Regular Run");
        assert!(record.success.is_none());
    }

    #[test]
    fn test_runtimes_are_unique() {
        let a = generate_runtime();
        let b = generate_runtime();
        assert_ne!(a, b);
        assert_eq!(a.rsplit('-').next().unwrap().len(), 8);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(2300)), "2.3s");
        assert_eq!(format_duration(Duration::from_secs(125)), "2m05s");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1h02m05s");
    }

    #[test]
    fn test_progress_text() {
        let progress = json!({"total": 3, "success": 1, "failure": 1});
        assert_eq!(progress_text(&progress), "2/3 (1 failed)");
        assert_eq!(progress_text(&json!({})), "0/0 (0 failed)");
    }
}
