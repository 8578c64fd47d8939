//! Run Lifecycle
//!
//! Drives a run from its top-level context to a persisted terminal status:
//! - `execute_run`: runs the top-level service, turning errors and panics
//!   into a failed `Aborted (error)` result
//! - `finalize_run`: flushes buffered rows, releases connections, snapshots
//!   state and closes the Job Record exactly once
//! - `recover_interrupted`: marks runs left `Running` by a dead process

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use serde_json::{json, Value};

use super::record::{format_duration, RunStatus, ServiceLogEntry};
use super::repository::RunRepository;
use super::ResultMap;
use crate::error::{EngineError, Result};
use crate::execution::{RunScope, Runner};
use crate::lock;
use crate::state::WriteMode;

const TRUNCATION_MARKER: &str = "\n[... log truncated ...]";

/// Runs the scope's top-level service and finalizes the run.
pub fn execute_run(scope: Arc<RunScope>) -> ResultMap {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| -> Result<(ResultMap, bool)> {
        let runner = Runner::main(Arc::clone(&scope))?;
        match runner.start_run() {
            Ok(results) => Ok((results, false)),
            Err(e) => {
                error!("RUNTIME {} - Run failed: {}", scope.runtime, e);
                let failed = failure(&scope, e.to_string());
                let created = runner.create_result(failed.clone(), None, true);
                Ok((created.unwrap_or(failed), true))
            }
        }
    }));

    let (results, errored) = match outcome {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => {
            error!("RUNTIME {} - Run could not start: {}", scope.runtime, e);
            (failure(&scope, e.to_string()), true)
        }
        Err(_) => {
            error!("RUNTIME {} - Run panicked", scope.runtime);
            (failure(&scope, "Run panicked".to_string()), true)
        }
    };
    finalize_run(&scope, results, errored)
}

fn failure(scope: &RunScope, message: String) -> ResultMap {
    let mut failed = ResultMap::new();
    failed.insert("success".into(), json!(false));
    failed.insert("runtime".into(), json!(scope.runtime));
    failed.insert("result".into(), json!(message));
    failed
}

/// Closes the run: persists everything, releases connections and writes
/// the terminal Job Record.
///
/// Only the first call does the work; later calls release whatever
/// connections are still cached and return `results` unchanged.
pub fn finalize_run(scope: &RunScope, mut results: ResultMap, errored: bool) -> ResultMap {
    let timeout = Duration::from_secs(scope.settings.connections.disconnect_timeout_secs);
    if !scope.mark_finalized() {
        scope.connections.release_all(&scope.runtime, timeout);
        return results;
    }

    let duration = format_duration(scope.started.elapsed());
    results.insert("duration".into(), json!(duration));

    let (device_results, reports) = scope.take_buffers();
    for batch in device_results.chunks(scope.settings.batch_size.max(1)) {
        if let Err(e) = scope.repository.insert_results(batch.to_vec()) {
            error!("RUNTIME {} - Failed to flush results: {}", scope.runtime, e);
        }
    }
    if !reports.is_empty() {
        if let Err(e) = scope.repository.insert_reports(reports) {
            error!("RUNTIME {} - Failed to flush reports: {}", scope.runtime, e);
        }
    }
    let changes = scope.logger.drain_changes();
    if !changes.is_empty() {
        if let Err(e) = scope.repository.insert_changes(changes) {
            error!("RUNTIME {} - Failed to insert changes: {}", scope.runtime, e);
        }
    }
    persist_logs(scope);

    for protocol in scope.connections.release_all(&scope.runtime, timeout) {
        let path = format!("connections/{}/closed", protocol);
        if let Err(e) = scope.state.write(&scope.runtime, &path, json!(1), WriteMode::Increment) {
            warn!("RUNTIME {} - {}", scope.runtime, e);
        }
    }

    let status = if errored {
        RunStatus::AbortedError
    } else if scope.stop_requested() {
        RunStatus::Aborted
    } else {
        RunStatus::Completed
    };
    let timeline = scope.timeline();
    debug!("RUNTIME {} - Timeline:\n{}", scope.runtime, timeline.gantt_chart());
    let mut state = scope.state.read(&scope.runtime);
    if let Value::Object(map) = &mut state {
        map.remove("stop");
        map.insert("timeline".into(), timeline.durations_value());
    }
    let success = results.get("success").and_then(Value::as_bool).unwrap_or(false);
    let memory_size = state
        .get("memory_size")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let payload = lock(&scope.payload).clone();

    scope.update_record(|record| {
        record.status = status;
        record.success = Some(success);
        record.duration = Some(duration.clone());
        record.result = Some(Value::Object(results.clone()));
        record.state = Some(state);
        record.memory_size = memory_size;
        record.payload = payload;
    });
    if let Err(e) = scope.repository.update_run(&scope.record()) {
        error!("RUNTIME {} - Failed to update run: {}", scope.runtime, e);
    }
    scope.repository.update_service_count(scope.main_service, -1);
    scope.state.clear(&scope.runtime);

    info!(
        "RUNTIME {} - Run finished: {} ({}) in {}",
        scope.runtime,
        status,
        if success { "success" } else { "failure" },
        duration
    );
    results
}

/// Writes each service's log, truncated or dropped when oversized.
fn persist_logs(scope: &RunScope) {
    let limits = &scope.settings.limits;
    let mut entries = Vec::new();
    for (service_id, lines) in scope.logger.drain() {
        let mut content = lines.join("\n");
        if limits.truncate_logs && content.len() > limits.truncate_size {
            let mut cut = limits.truncate_size;
            while !content.is_char_boundary(cut) {
                cut -= 1;
            }
            content.truncate(cut);
            content.push_str(TRUNCATION_MARKER);
        }
        if content.len() >= limits.max_log_size {
            let e = EngineError::DataOverflow("Log".to_string());
            error!(
                "RUNTIME {} - Service {}: {} ({}B / {}B)",
                scope.runtime,
                service_id,
                e,
                content.len(),
                limits.max_log_size
            );
            continue;
        }
        entries.push(ServiceLogEntry {
            runtime: scope.runtime.clone(),
            service_id,
            content,
        });
    }
    if entries.is_empty() {
        return;
    }
    if let Err(e) = scope.repository.insert_logs(entries) {
        error!("RUNTIME {} - Failed to insert logs: {}", scope.runtime, e);
    }
}

/// Marks every run still `Running` on `server` as `Aborted (reload)`.
pub fn recover_interrupted(repository: &dyn RunRepository, server: &str) -> Result<usize> {
    let runs = repository.running_runs(server);
    for mut record in runs.iter().cloned() {
        record.status = RunStatus::AbortedReload;
        record.success = Some(false);
        repository.update_run(&record)?;
        repository.update_service_count(record.service_id, -1);
        warn!("RUNTIME {} - Marked as {}", record.runtime, record.status);
    }
    Ok(runs.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{ServiceJob, SubmitRequest};
    use crate::inventory::Device;
    use crate::settings::Settings;
    use crate::test_support::{engine_with, engine_with_settings, record_of, sample_inventory};
    use crate::workflow::Service;

    #[test]
    fn test_finalize_is_idempotent() {
        let mut inventory = sample_inventory();
        inventory.add_service(Service::new(10, "svc", "command").with_devices(&[1]));
        let (engine, repository, driver) = engine_with(inventory);

        let scope = engine.prepare(SubmitRequest::new(10)).unwrap();
        let _other = engine.prepare(SubmitRequest::new(10)).unwrap();
        assert_eq!(repository.service_count(10), 2);

        let runner = Runner::main(Arc::clone(&scope)).unwrap();
        let device = scope.inventory.device(1).unwrap();
        runner.connection(&device).unwrap();
        assert_eq!(engine.connections().open_count(&scope.runtime), 1);

        let mut results = ResultMap::new();
        results.insert("success".into(), json!(true));
        finalize_run(&scope, results.clone(), false);
        finalize_run(&scope, results, false);

        assert_eq!(repository.service_count(10), 1);
        assert_eq!(driver.closed(), 1);
        assert_eq!(engine.connections().open_count(&scope.runtime), 0);

        let record = record_of(&repository, &scope.runtime);
        assert_eq!(record.status, RunStatus::Completed);
        let state = record.state.unwrap();
        assert_eq!(state["connections"]["cli"]["opened"], json!(1));
        assert_eq!(state["connections"]["cli"]["closed"], json!(1));
    }

    #[test]
    fn test_long_logs_are_truncated() {
        let mut inventory = sample_inventory();
        inventory.add_service(Service::new(10, "svc", "command").with_devices(&[1, 2, 3]));
        let mut settings = Settings::default();
        settings.limits.truncate_logs = true;
        settings.limits.truncate_size = 40;
        let (engine, repository, _) = engine_with_settings(inventory, settings);

        let runtime = engine.submit(SubmitRequest::new(10)).unwrap().runtime().to_string();
        let logs = repository.logs(&runtime);
        assert_eq!(logs.len(), 1);
        assert!(logs[0].content.ends_with(TRUNCATION_MARKER));
        assert_eq!(logs[0].content.len(), 40 + TRUNCATION_MARKER.len());
    }

    #[test]
    fn test_oversized_log_is_dropped() {
        let mut inventory = sample_inventory();
        inventory.add_service(Service::new(10, "svc", "command").with_devices(&[1]));
        let mut settings = Settings::default();
        settings.limits.truncate_logs = false;
        settings.limits.max_log_size = 10;
        let (engine, repository, _) = engine_with_settings(inventory, settings);

        let runtime = engine.submit(SubmitRequest::new(10)).unwrap().runtime().to_string();
        assert!(repository.logs(&runtime).is_empty());
        assert_eq!(record_of(&repository, &runtime).status, RunStatus::Completed);
    }

    #[test]
    fn test_panicking_job_fails_only_its_device() {
        struct Panicky;
        impl ServiceJob for Panicky {
            fn run(&self, _: &Runner, device: Option<&Device>) -> Result<ResultMap> {
                if device.map(|d| d.name.as_str()) == Some("r2") {
                    panic!("driver bug");
                }
                let mut results = ResultMap::new();
                results.insert("success".into(), json!(true));
                Ok(results)
            }
        }

        let mut inventory = sample_inventory();
        inventory.add_service(Service::new(10, "svc", "panicky").with_devices(&[1, 2]));
        let (engine, repository, _) = engine_with(inventory);
        engine.register_job("panicky", Arc::new(Panicky));

        let runtime = engine.submit(SubmitRequest::new(10)).unwrap().runtime().to_string();
        let record = record_of(&repository, &runtime);
        assert_eq!(record.status, RunStatus::Completed);
        assert_eq!(record.success, Some(false));

        let failed = repository
            .results(&runtime)
            .into_iter()
            .find(|r| r.device.as_deref() == Some("r2"))
            .unwrap();
        assert!(!failed.success);
        assert_eq!(failed.result["result"], json!("Job panicked: driver bug"));
    }

    #[test]
    fn test_unknown_job_kind_is_a_device_failure() {
        let mut inventory = sample_inventory();
        inventory.add_service(Service::new(10, "svc", "netmiko").with_devices(&[1]));
        let (engine, repository, _) = engine_with(inventory);

        let runtime = engine.submit(SubmitRequest::new(10)).unwrap().runtime().to_string();
        let row = repository
            .results(&runtime)
            .into_iter()
            .find(|r| r.device.is_some())
            .unwrap();
        assert_eq!(
            row.result["result"],
            json!("No job registered for service type 'netmiko'")
        );
    }
}
