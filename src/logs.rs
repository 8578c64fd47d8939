//! Run Logging
//!
//! Every log line produced while a run executes goes to the `log` facade
//! and is also buffered per service so it can be persisted when the run
//! finalizes. Lines written with [`LogKind::Change`] are additionally kept
//! as change records.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::inventory::ServiceId;
use crate::lock;
use crate::run::ChangeRecord;

/// Log target for security notices. Never filtered by a service's log level.
pub const SECURITY_TARGET: &str = "fleetrunner::security";

/// Log target for ordinary run logs.
pub const RUN_TARGET: &str = "fleetrunner::run";

/// Severity ladder, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub const LADDER: [Severity; 5] = [
        Severity::Debug,
        Severity::Info,
        Severity::Warning,
        Severity::Error,
        Severity::Critical,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }

    /// Parses a severity name. Unknown names map to `None`.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "debug" => Some(Severity::Debug),
            "info" => Some(Severity::Info),
            "warning" | "warn" => Some(Severity::Warning),
            "error" => Some(Severity::Error),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }

    /// `log` has no critical level; critical lines go out as errors.
    pub fn level(self) -> log::Level {
        match self {
            Severity::Debug => log::Level::Debug,
            Severity::Info => log::Level::Info,
            Severity::Warning => log::Level::Warn,
            Severity::Error | Severity::Critical => log::Level::Error,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a line entered the run log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    /// Engine-generated service log
    Service,
    /// Security notice (authorization drops, connection opening)
    Security,
    /// Configuration change; also kept as a change record
    Change,
    /// Emitted by a user script through `log(...)`
    User,
}

/// Filtering policy taken from the run's top-level service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogPolicy {
    /// Index into [`Severity::LADDER`]; `-1` disables service logs entirely
    pub log_level: i32,
    pub show_user_logs: bool,
}

impl Default for LogPolicy {
    fn default() -> Self {
        Self {
            log_level: 1,
            show_user_logs: true,
        }
    }
}

impl LogPolicy {
    pub fn allows(&self, severity: Severity, kind: LogKind) -> bool {
        if kind == LogKind::Security {
            return true;
        }
        if kind == LogKind::User && self.show_user_logs {
            return true;
        }
        self.log_level >= 0 && severity.index() >= self.log_level as usize
    }
}

/// Identifies the service a log line belongs to.
#[derive(Debug, Clone, Copy)]
pub struct LogSource<'a> {
    pub service_id: ServiceId,
    pub service_name: &'a str,
}

#[derive(Debug, Default)]
struct LogBuffer {
    lines: HashMap<ServiceId, Vec<String>>,
    changes: Vec<ChangeRecord>,
}

/// Per-run logger shared by every execution context of the run.
#[derive(Debug, Clone)]
pub struct RunLogger {
    runtime: Arc<str>,
    creator: Arc<str>,
    main_service: ServiceId,
    policy: LogPolicy,
    buffer: Arc<Mutex<LogBuffer>>,
}

impl RunLogger {
    pub fn new(runtime: &str, creator: &str, main_service: ServiceId, policy: LogPolicy) -> Self {
        Self {
            runtime: Arc::from(runtime),
            creator: Arc::from(creator),
            main_service,
            policy,
            buffer: Arc::new(Mutex::new(LogBuffer::default())),
        }
    }

    /// Writes one line. Returns false when the policy filtered it out.
    pub fn log(
        &self,
        source: LogSource<'_>,
        severity: Severity,
        message: &str,
        device: Option<&str>,
        kind: LogKind,
    ) -> bool {
        if !self.policy.allows(severity, kind) {
            return false;
        }

        let body = match device {
            Some(name) => format!("DEVICE {} - {}", name, message),
            None => message.to_string(),
        };

        let target = if kind == LogKind::Security {
            SECURITY_TARGET
        } else {
            RUN_TARGET
        };
        log::log!(
            target: target,
            severity.level(),
            "RUNTIME {} - USER {} - SERVICE '{}' - {}",
            self.runtime,
            self.creator,
            source.service_name,
            body
        );

        let now = Utc::now();
        let line = format!(
            "{} - {} - USER {} - SERVICE {} - {}",
            now.format("%Y-%m-%d %H:%M:%S%.6f"),
            severity,
            self.creator,
            source.service_name,
            body
        );

        let mut buffer = lock(&self.buffer);
        if source.service_id != self.main_service {
            buffer
                .lines
                .entry(self.main_service)
                .or_default()
                .push(line.clone());
        }
        buffer
            .lines
            .entry(source.service_id)
            .or_default()
            .push(line);

        if kind == LogKind::Change {
            buffer.changes.push(ChangeRecord {
                runtime: self.runtime.to_string(),
                service_id: source.service_id,
                device: device.map(str::to_string),
                content: message.to_string(),
                time: now,
            });
        }
        true
    }

    /// Buffered lines of one service.
    pub fn lines(&self, service_id: ServiceId) -> Vec<String> {
        lock(&self.buffer)
            .lines
            .get(&service_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Takes every buffered line, grouped by service.
    pub fn drain(&self) -> HashMap<ServiceId, Vec<String>> {
        std::mem::take(&mut lock(&self.buffer).lines)
    }

    pub fn drain_changes(&self) -> Vec<ChangeRecord> {
        std::mem::take(&mut lock(&self.buffer).changes)
    }

    pub fn policy(&self) -> LogPolicy {
        self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(id: ServiceId) -> LogSource<'static> {
        LogSource {
            service_id: id,
            service_name: "backup",
        }
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Debug < Severity::Info);
        assert!(Severity::Error < Severity::Critical);
        assert_eq!(Severity::LADDER[2], Severity::Warning);
        assert_eq!(Severity::parse("WARN"), Some(Severity::Warning));
        assert_eq!(Severity::parse("verbose"), None);
    }

    #[test]
    fn test_policy_filters_below_level() {
        let policy = LogPolicy {
            log_level: 2,
            show_user_logs: false,
        };
        assert!(!policy.allows(Severity::Info, LogKind::Service));
        assert!(policy.allows(Severity::Warning, LogKind::Service));
        assert!(policy.allows(Severity::Debug, LogKind::Security));
        assert!(!policy.allows(Severity::Info, LogKind::User));
    }

    #[test]
    fn test_policy_disabled() {
        let policy = LogPolicy {
            log_level: -1,
            show_user_logs: true,
        };
        assert!(!policy.allows(Severity::Critical, LogKind::Service));
        assert!(policy.allows(Severity::Debug, LogKind::User));
        assert!(policy.allows(Severity::Info, LogKind::Security));
    }

    #[test]
    fn test_logger_prefixes_and_buffers() {
        let logger = RunLogger::new("rt-1", "admin", 1, LogPolicy::default());
        assert!(logger.log(source(1), Severity::Info, "STARTING", Some("r1"), LogKind::Service));

        let lines = logger.lines(1);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("info - USER admin - SERVICE backup - DEVICE r1 - STARTING"));
    }

    #[test]
    fn test_member_lines_copied_to_main_service() {
        let logger = RunLogger::new("rt-1", "admin", 1, LogPolicy::default());
        logger.log(source(7), Severity::Warning, "slow", None, LogKind::Service);

        assert_eq!(logger.lines(7).len(), 1);
        assert_eq!(logger.lines(1).len(), 1);

        let drained = logger.drain();
        assert_eq!(drained.len(), 2);
        assert!(logger.lines(1).is_empty());
    }

    #[test]
    fn test_filtered_line_not_buffered() {
        let logger = RunLogger::new("rt-1", "admin", 1, LogPolicy::default());
        assert!(!logger.log(source(1), Severity::Debug, "noise", None, LogKind::Service));
        assert!(logger.lines(1).is_empty());
    }

    #[test]
    fn test_change_records() {
        let logger = RunLogger::new("rt-1", "admin", 1, LogPolicy::default());
        logger.log(source(1), Severity::Info, "set hostname", Some("r1"), LogKind::Change);

        let changes = logger.drain_changes();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].device.as_deref(), Some("r1"));
        assert!(logger.drain_changes().is_empty());
    }
}
