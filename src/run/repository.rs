//! Persistence collaborator for run rows.
//!
//! The engine writes Device Results, logs, reports and change records in
//! batches and updates the Job Record once at finalization.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::record::{
    ChangeRecord, DeviceResult, JobRecord, RunStatus, ServiceLogEntry, ServiceReport,
};
use crate::error::{EngineError, Result};
use crate::inventory::ServiceId;
use crate::lock;

pub trait RunRepository: Send + Sync {
    fn create_run(&self, record: &JobRecord) -> Result<()>;

    fn update_run(&self, record: &JobRecord) -> Result<()>;

    fn get_run(&self, runtime: &str) -> Option<JobRecord>;

    /// Runs still marked `Running` and owned by `server`.
    fn running_runs(&self, server: &str) -> Vec<JobRecord>;

    fn insert_results(&self, results: Vec<DeviceResult>) -> Result<()>;

    fn insert_logs(&self, logs: Vec<ServiceLogEntry>) -> Result<()>;

    fn insert_reports(&self, reports: Vec<ServiceReport>) -> Result<()>;

    fn insert_changes(&self, changes: Vec<ChangeRecord>) -> Result<()>;

    fn results(&self, runtime: &str) -> Vec<DeviceResult>;

    fn logs(&self, runtime: &str) -> Vec<ServiceLogEntry>;

    fn reports(&self, runtime: &str) -> Vec<ServiceReport>;

    fn changes(&self, runtime: &str) -> Vec<ChangeRecord>;

    /// Adjusts a service's active-run counter, never below zero.
    fn update_service_count(&self, service_id: ServiceId, delta: i64) -> u64;

    fn service_count(&self, service_id: ServiceId) -> u64;
}

#[derive(Debug, Default)]
struct Tables {
    runs: HashMap<String, JobRecord>,
    results: Vec<DeviceResult>,
    logs: Vec<ServiceLogEntry>,
    reports: Vec<ServiceReport>,
    changes: Vec<ChangeRecord>,
    service_counts: HashMap<ServiceId, u64>,
}

/// In-memory repository used by the CLI and tests.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    tables: Mutex<Tables>,
    batches: AtomicUsize,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of result batches inserted so far.
    pub fn result_batches(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }
}

impl RunRepository for MemoryRepository {
    fn create_run(&self, record: &JobRecord) -> Result<()> {
        let mut tables = lock(&self.tables);
        if tables.runs.contains_key(&record.runtime) {
            return Err(EngineError::Persistence(format!(
                "run '{}' already exists",
                record.runtime
            )));
        }
        tables.runs.insert(record.runtime.clone(), record.clone());
        Ok(())
    }

    fn update_run(&self, record: &JobRecord) -> Result<()> {
        let mut tables = lock(&self.tables);
        match tables.runs.get_mut(&record.runtime) {
            Some(stored) => {
                *stored = record.clone();
                Ok(())
            }
            None => Err(EngineError::RunNotFound(record.runtime.clone())),
        }
    }

    fn get_run(&self, runtime: &str) -> Option<JobRecord> {
        lock(&self.tables).runs.get(runtime).cloned()
    }

    fn running_runs(&self, server: &str) -> Vec<JobRecord> {
        lock(&self.tables)
            .runs
            .values()
            .filter(|r| r.status == RunStatus::Running && r.server == server)
            .cloned()
            .collect()
    }

    fn insert_results(&self, results: Vec<DeviceResult>) -> Result<()> {
        self.batches.fetch_add(1, Ordering::SeqCst);
        lock(&self.tables).results.extend(results);
        Ok(())
    }

    fn insert_logs(&self, logs: Vec<ServiceLogEntry>) -> Result<()> {
        lock(&self.tables).logs.extend(logs);
        Ok(())
    }

    fn insert_reports(&self, reports: Vec<ServiceReport>) -> Result<()> {
        lock(&self.tables).reports.extend(reports);
        Ok(())
    }

    fn insert_changes(&self, changes: Vec<ChangeRecord>) -> Result<()> {
        lock(&self.tables).changes.extend(changes);
        Ok(())
    }

    fn results(&self, runtime: &str) -> Vec<DeviceResult> {
        lock(&self.tables)
            .results
            .iter()
            .filter(|r| r.runtime == runtime)
            .cloned()
            .collect()
    }

    fn logs(&self, runtime: &str) -> Vec<ServiceLogEntry> {
        lock(&self.tables)
            .logs
            .iter()
            .filter(|l| l.runtime == runtime)
            .cloned()
            .collect()
    }

    fn reports(&self, runtime: &str) -> Vec<ServiceReport> {
        lock(&self.tables)
            .reports
            .iter()
            .filter(|r| r.runtime == runtime)
            .cloned()
            .collect()
    }

    fn changes(&self, runtime: &str) -> Vec<ChangeRecord> {
        lock(&self.tables)
            .changes
            .iter()
            .filter(|c| c.runtime == runtime)
            .cloned()
            .collect()
    }

    fn update_service_count(&self, service_id: ServiceId, delta: i64) -> u64 {
        let mut tables = lock(&self.tables);
        let count = tables.service_counts.entry(service_id).or_insert(0);
        *count = if delta < 0 {
            count.saturating_sub(delta.unsigned_abs())
        } else {
            count.saturating_add(delta as u64)
        };
        *count
    }

    fn service_count(&self, service_id: ServiceId) -> u64 {
        lock(&self.tables)
            .service_counts
            .get(&service_id)
            .copied()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_create_and_update_run() {
        let repo = MemoryRepository::new();
        let mut record = JobRecord::new("rt", 1, "admin", "node-a");
        repo.create_run(&record).unwrap();
        assert!(repo.create_run(&record).is_err());

        record.status = RunStatus::Completed;
        repo.update_run(&record).unwrap();
        assert_eq!(repo.get_run("rt").unwrap().status, RunStatus::Completed);
    }

    #[test]
    fn test_update_unknown_run() {
        let repo = MemoryRepository::new();
        let record = JobRecord::new("missing", 1, "admin", "node-a");
        assert!(matches!(repo.update_run(&record), Err(EngineError::RunNotFound(_))));
    }

    #[test]
    fn test_running_runs_filtered_by_server() {
        let repo = MemoryRepository::new();
        repo.create_run(&JobRecord::new("a", 1, "admin", "node-a")).unwrap();
        repo.create_run(&JobRecord::new("b", 1, "admin", "node-b")).unwrap();
        let mut done = JobRecord::new("c", 1, "admin", "node-a");
        done.status = RunStatus::Completed;
        repo.create_run(&done).unwrap();

        let running = repo.running_runs("node-a");
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].runtime, "a");
    }

    #[test]
    fn test_results_by_runtime() {
        let repo = MemoryRepository::new();
        let row = |runtime: &str| DeviceResult {
            runtime: runtime.to_string(),
            path: "1".to_string(),
            service_id: 1,
            device: Some("r1".to_string()),
            success: true,
            duration: "0.0s".to_string(),
            result: json!({"success": true}),
            memory_size: 17,
        };
        repo.insert_results(vec![row("a"), row("b")]).unwrap();
        repo.insert_results(vec![row("a")]).unwrap();

        assert_eq!(repo.results("a").len(), 2);
        assert_eq!(repo.result_batches(), 2);
    }

    #[test]
    fn test_service_count_saturates() {
        let repo = MemoryRepository::new();
        assert_eq!(repo.update_service_count(1, 1), 1);
        assert_eq!(repo.update_service_count(1, -1), 0);
        assert_eq!(repo.update_service_count(1, -1), 0);
        assert_eq!(repo.service_count(1), 0);
    }
}
