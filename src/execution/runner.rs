//! Execution Context
//!
//! A [`Runner`] executes one service within a run: the top-level service,
//! a workflow member, an iteration sub-run or one pooled device job. It
//! resolves targets, applies skip rules, dispatches device jobs, records
//! progress and creates result rows.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::warn;
use serde_json::{json, Map, Value};

use super::scope::RunScope;
use crate::connection::{ConnectionHandle, ConnectionRequest, Credentials};
use crate::error::{EngineError, Result};
use crate::expression::{is_truthy, set_payload_variable, ExpressionEngine, Helpers, LogHook, ScriptOutcome};
use crate::inventory::{Device, DeviceId, ServiceId};
use crate::lock;
use crate::logs::{LogKind, LogSource, Severity};
use crate::monitoring::EventType;
use crate::run::{format_duration, DeviceResult, ResultMap, ServiceReport};
use crate::state::WriteMode;
use crate::workflow::{RunMethod, Service, SkipValue};

/// Identity of an execution context.
///
/// Only ids cross into worker threads; each worker rebuilds its runner
/// from the shared [`RunScope`].
#[derive(Debug, Clone, PartialEq)]
pub struct RunnerSpec {
    pub service_id: ServiceId,
    /// Service ids from the top-level service down, joined by `>`
    pub path: String,
    pub is_main_run: bool,
    /// Sub-run created by device iteration
    pub iteration_run: bool,
    /// Enclosing workflow, if any
    pub workflow: Option<ServiceId>,
    pub parent_device: Option<DeviceId>,
    /// Targets handed down by the parent context
    pub targets: Option<Vec<DeviceId>>,
    /// Already running inside a worker pool
    pub in_process: bool,
}

impl RunnerSpec {
    /// Context of a run's top-level service.
    pub fn main(service_id: ServiceId) -> Self {
        Self {
            service_id,
            path: service_id.to_string(),
            is_main_run: true,
            iteration_run: false,
            workflow: None,
            parent_device: None,
            targets: None,
            in_process: false,
        }
    }
}

/// Device names grouped by outcome.
#[derive(Debug, Default)]
struct Summary {
    groups: Map<String, Value>,
}

impl Summary {
    fn new() -> Self {
        let mut groups = Map::new();
        for key in ["success", "failure", "skipped"] {
            groups.insert(key.to_string(), Value::Array(Vec::new()));
        }
        Self { groups }
    }

    fn push(&mut self, key: &str, device: &str) {
        let entry = self
            .groups
            .entry(key.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(names) = entry {
            names.push(Value::String(device.to_string()));
        }
    }

    fn count(&self, key: &str) -> usize {
        self.groups
            .get(key)
            .and_then(Value::as_array)
            .map(Vec::len)
            .unwrap_or(0)
    }

    fn into_value(self) -> Value {
        Value::Object(self.groups)
    }
}

pub(crate) fn success_of(results: &ResultMap) -> bool {
    results.get("success").and_then(Value::as_bool).unwrap_or(false)
}

pub(crate) fn failed_result(message: impl Into<String>) -> ResultMap {
    let mut results = ResultMap::new();
    results.insert("success".into(), Value::Bool(false));
    results.insert("result".into(), Value::String(message.into()));
    results
}

/// Text form of a value: strings unquoted, everything else as JSON.
pub(crate) fn render(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn now_text() -> String {
    chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.6f").to_string()
}

/// Executes one service within a run.
pub struct Runner {
    pub(crate) scope: Arc<RunScope>,
    pub(crate) spec: RunnerSpec,
    pub(crate) service: Service,
    pub(crate) workflow: Option<Service>,
    parent_device: Option<Device>,
    pub(crate) progress_key: &'static str,
    run_targets: Mutex<Vec<Device>>,
    has_result: AtomicBool,
}

impl Runner {
    pub fn from_spec(scope: Arc<RunScope>, spec: RunnerSpec) -> Result<Self> {
        let service = scope
            .service(spec.service_id)
            .cloned()
            .or_else(|| scope.inventory.service(spec.service_id))
            .ok_or_else(|| EngineError::ServiceNotFound(spec.service_id.to_string()))?;
        let workflow = spec
            .workflow
            .and_then(|id| scope.service(id).cloned().or_else(|| scope.inventory.service(id)));
        let parent_device = spec.parent_device.and_then(|id| scope.inventory.device(id));
        let progress_key = if spec.iteration_run {
            "progress/iteration_device"
        } else {
            "progress/device"
        };

        Ok(Self {
            scope,
            spec,
            service,
            workflow,
            parent_device,
            progress_key,
            run_targets: Mutex::new(Vec::new()),
            has_result: AtomicBool::new(false),
        })
    }

    /// Runner of the run's top-level service.
    pub fn main(scope: Arc<RunScope>) -> Result<Self> {
        let spec = RunnerSpec::main(scope.main_service);
        Self::from_spec(scope, spec)
    }

    pub fn service(&self) -> &Service {
        &self.service
    }

    pub fn scope(&self) -> &Arc<RunScope> {
        &self.scope
    }

    pub fn path(&self) -> &str {
        &self.spec.path
    }

    pub fn runtime(&self) -> &str {
        &self.scope.runtime
    }

    pub fn is_main_run(&self) -> bool {
        self.spec.is_main_run
    }

    /// Targets resolved by the last [`start_run`](Self::start_run).
    pub fn run_targets(&self) -> Vec<Device> {
        lock(&self.run_targets).clone()
    }

    // Options a parameterized form may override on the main run.

    fn option(&self, name: &str) -> Option<&Value> {
        if self.spec.is_main_run {
            self.scope.form_value(name)
        } else {
            None
        }
    }

    pub fn multiprocessing(&self) -> bool {
        self.option("multiprocessing")
            .and_then(Value::as_bool)
            .unwrap_or(self.service.multiprocessing)
    }

    pub fn max_processes(&self) -> usize {
        let configured = self
            .option("max_processes")
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .unwrap_or(self.service.max_processes);
        if configured == 0 {
            self.scope.settings.default_max_processes
        } else {
            configured
        }
    }

    pub fn dry_run(&self) -> bool {
        self.option("dry_run")
            .and_then(Value::as_bool)
            .unwrap_or(self.service.dry_run)
    }

    pub fn number_of_retries(&self) -> u32 {
        self.option("number_of_retries")
            .and_then(Value::as_u64)
            .map(|n| n as u32)
            .unwrap_or(self.service.number_of_retries)
    }

    pub fn stop(&self) -> bool {
        self.scope.stop_requested()
    }

    // Logging

    pub fn log(&self, severity: Severity, message: &str, device: Option<&str>) -> bool {
        self.log_kind(severity, message, device, LogKind::Service)
    }

    pub fn log_kind(&self, severity: Severity, message: &str, device: Option<&str>, kind: LogKind) -> bool {
        let source = LogSource {
            service_id: self.service.id,
            service_name: &self.service.name,
        };
        self.scope.logger.log(source, severity, message, device, kind)
    }

    /// Logs a configuration change; it is also persisted as a change record.
    pub fn log_change(&self, message: &str, device: Option<&str>) -> bool {
        self.log_kind(Severity::Info, message, device, LogKind::Change)
    }

    // State

    pub(crate) fn write_state(&self, path: &str, value: Value, mode: WriteMode) {
        self.write_top_state(&format!("{}/{}", self.spec.path, path), value, mode);
    }

    pub(crate) fn write_top_state(&self, path: &str, value: Value, mode: WriteMode) {
        if let Err(e) = self.scope.state.write(&self.scope.runtime, path, value, mode) {
            warn!(
                "RUNTIME {} - State write to '{}' failed: {}",
                self.scope.runtime, path, e
            );
        }
    }

    fn record_success(&self, success: bool) {
        if let Err(e) = self
            .scope
            .state
            .record_success(&self.scope.runtime, &self.spec.path, success)
        {
            warn!("RUNTIME {} - Failed to record success: {}", self.scope.runtime, e);
        }
    }

    fn state_status(&self) -> Option<Value> {
        self.scope
            .state
            .get(&self.scope.runtime, &format!("{}/status", self.spec.path))
    }

    // Expressions

    /// Variables visible to user code for a device.
    pub fn variables(&self, device: Option<&Device>, extra: Map<String, Value>) -> Map<String, Value> {
        let payload = lock(&self.scope.payload).clone();
        let mut vars = Map::new();

        if let Some(variables) = payload.get("variables").and_then(Value::as_object) {
            for (name, value) in variables {
                if name != "devices" {
                    vars.insert(name.clone(), value.clone());
                }
            }
            let scoped = device.and_then(|d| {
                variables
                    .get("devices")
                    .and_then(|devices| devices.get(&d.name))
                    .and_then(Value::as_object)
            });
            if let Some(scoped) = scoped {
                vars.extend(scoped.clone());
            }
        }

        vars.insert("payload".into(), payload);
        vars.insert("runtime".into(), json!(self.scope.runtime));
        vars.insert("creator".into(), json!(self.scope.creator));
        vars.insert(
            "service".into(),
            json!({"id": self.service.id, "name": self.service.name, "type": self.service.kind}),
        );
        if let Some(device) = device {
            vars.insert("device".into(), device.to_value());
        }
        if let Some(parent) = &self.parent_device {
            vars.insert("parent_device".into(), parent.to_value());
        }
        if let Some(workflow) = &self.workflow {
            vars.insert("workflow".into(), json!({"id": workflow.id, "name": workflow.name}));
        }
        vars.extend(extra);
        vars
    }

    fn expressions(&self, device: Option<&Device>) -> ExpressionEngine {
        let logger = self.scope.logger.clone();
        let service_id = self.service.id;
        let service_name = self.service.name.clone();
        let device_name = device.map(|d| d.name.clone());

        let hook: LogHook = Arc::new(move |severity: &str, message: &str| {
            let (severity, kind) = if severity.eq_ignore_ascii_case("change") {
                (Severity::Info, LogKind::Change)
            } else {
                (Severity::parse(severity).unwrap_or(Severity::Info), LogKind::User)
            };
            let source = LogSource {
                service_id,
                service_name: &service_name,
            };
            logger.log(source, severity, message, device_name.as_deref(), kind);
        });

        let helpers = Helpers {
            payload: Arc::clone(&self.scope.payload),
            log: Some(hook),
        };
        ExpressionEngine::new(&self.scope.settings.expressions, helpers)
    }

    pub fn eval(&self, query: &str, device: Option<&Device>, extra: Map<String, Value>) -> Result<Value> {
        let vars = self.variables(device, extra);
        self.expressions(device).eval(query, &vars)
    }

    pub fn exec(&self, script: &str, device: Option<&Device>, extra: Map<String, Value>) -> Result<ScriptOutcome> {
        let vars = self.variables(device, extra);
        self.expressions(device).exec(script, &vars)
    }

    /// Substitutes `{{ }}` placeholders in a service property.
    pub fn sub(&self, text: &str, device: Option<&Device>, extra: Map<String, Value>) -> Result<String> {
        let vars = self.variables(device, extra);
        self.expressions(device).substitute(text, &vars)
    }

    pub fn sub_value(&self, value: &Value, device: Option<&Device>, extra: Map<String, Value>) -> Result<Value> {
        let vars = self.variables(device, extra);
        self.expressions(device).substitute_value(value, &vars)
    }

    // Connections

    /// Cached connection to a device, opened on first use.
    pub fn connection(&self, device: &Device) -> Result<ConnectionHandle> {
        let credentials = self
            .scope
            .inventory
            .credential(&self.scope.creator, device)
            .map(Credentials::from)
            .unwrap_or_default();
        let (handle, opened) = self.scope.connections.acquire(ConnectionRequest {
            runtime: &self.scope.runtime,
            protocol: self.service.protocol,
            device,
            credentials: &credentials,
            name: &self.service.connection_name,
            force_new: self.service.start_new_connection,
        })?;

        if opened {
            self.log_kind(
                Severity::Info,
                &format!(
                    "OPENING {} connection '{}'",
                    handle.protocol, self.service.connection_name
                ),
                Some(&device.name),
                LogKind::Security,
            );
            self.write_top_state(
                &format!("connections/{}/opened", handle.protocol),
                json!(1),
                WriteMode::Increment,
            );
        } else {
            self.log(
                Severity::Info,
                &format!(
                    "Using cached {} connection '{}'",
                    handle.protocol, self.service.connection_name
                ),
                Some(&device.name),
            );
        }
        Ok(handle)
    }

    fn close_device_connections(&self, device: &Device) {
        for protocol in self
            .scope
            .connections
            .close_device(&self.scope.runtime, &device.name)
        {
            self.log(
                Severity::Info,
                &format!("Closed {} connection", protocol),
                Some(&device.name),
            );
            self.write_top_state(
                &format!("connections/{}/closed", protocol),
                json!(1),
                WriteMode::Increment,
            );
        }
    }

    // Execution

    /// Runs the service against its targets and returns the aggregate
    /// result.
    ///
    /// Errors are target-resolution and expression failures raised before
    /// any device job ran.
    pub fn start_run(&self) -> Result<ResultMap> {
        let start = Instant::now();
        self.record_success(true);
        self.write_state("status", json!("Running"), WriteMode::Set);
        self.write_state("runtime", json!(self.scope.runtime), WriteMode::Set);

        let mut results = ResultMap::new();
        results.insert("runtime".into(), json!(self.scope.runtime));
        results.insert("success".into(), json!(true));

        match self.compute_targets_and_collect_results() {
            Ok(collected) => results.extend(collected),
            Err(e) => {
                self.log(Severity::Error, &e.to_string(), None);
                self.record_success(false);
                self.write_state("status", json!("Failed"), WriteMode::Set);
                return Err(e);
            }
        }

        self.generate_report(&results);
        results.insert("duration".into(), json!(format_duration(start.elapsed())));
        let success = success_of(&results);
        self.record_success(success);
        if self.state_status() == Some(json!("Running")) {
            self.write_state("status", json!("Completed"), WriteMode::Set);
        }
        if self.spec.is_main_run {
            results.insert("properties".into(), self.service.properties());
        }

        let must_have_results =
            !self.has_result.load(Ordering::SeqCst) && self.service.iteration_devices.is_empty();
        if self.spec.is_main_run || lock(&self.run_targets).len() > 1 || must_have_results {
            match self.create_result(results.clone(), None, self.spec.is_main_run) {
                Ok(created) => results = created,
                Err(e) => {
                    let duration = results.get("duration").cloned();
                    results = failed_result(e.to_string());
                    results.insert("runtime".into(), json!(self.scope.runtime));
                    if let Some(duration) = duration {
                        results.insert("duration".into(), duration);
                    }
                }
            }
        }
        Ok(results)
    }

    fn compute_targets_and_collect_results(&self) -> Result<ResultMap> {
        let targets = self.compute_run_targets()?;
        *lock(&self.run_targets) = targets.clone();
        if self.spec.is_main_run {
            self.persist_run_targets(&targets);
        }

        if !self.service.iteration_devices.is_empty() && !self.spec.iteration_run {
            return self.iterate_devices(&targets);
        }

        self.write_state(
            &format!("{}/total", self.progress_key),
            json!(targets.len()),
            WriteMode::Increment,
        );

        let skip_service = self
            .workflow
            .as_ref()
            .and_then(|workflow| self.service.skip.get(&workflow.name).copied())
            .unwrap_or(false);
        if skip_service {
            self.write_state("status", json!("Skipped"), WriteMode::Set);
        }
        let skip_success = self.service.skip_value == SkipValue::Success;

        if self.service.run_method == RunMethod::Once && targets.is_empty() {
            let skip = skip_service
                || (!self.service.skip_query.is_empty()
                    && is_truthy(&self.eval(&self.service.skip_query, None, Map::new())?));
            if skip {
                self.write_state("status", json!("Skipped"), WriteMode::Set);
                let mut results = ResultMap::new();
                results.insert("success".into(), json!(skip_success));
                results.insert("result".into(), json!("skipped"));
                return Ok(results);
            }
        }

        let mut summary = Summary::new();
        let mut results = Vec::new();
        let mut runnable = Vec::new();
        for device in &targets {
            let skip_device = skip_service
                || (!self.service.skip_query.is_empty()
                    && is_truthy(&self.eval(&self.service.skip_query, Some(device), Map::new())?));
            if !skip_device {
                runnable.push(device.clone());
                continue;
            }
            self.write_state(
                &format!("{}/skipped", self.progress_key),
                json!(1),
                WriteMode::Increment,
            );
            if self.service.skip_value == SkipValue::Discard {
                continue;
            }
            summary.push("skipped", &device.name);
            let mut placeholder = ResultMap::new();
            placeholder.insert("device_target".into(), json!(device.name));
            placeholder.insert("runtime".into(), json!(now_text()));
            placeholder.insert("result".into(), json!("skipped"));
            placeholder.insert("duration".into(), json!("0.0s"));
            placeholder.insert("success".into(), json!(skip_success));
            results.push(match self.create_result(placeholder.clone(), Some(device), false) {
                Ok(created) => created,
                Err(_) => placeholder,
            });
        }

        if self.service.run_method == RunMethod::Once {
            return Ok(self.run_once(&targets, &runnable, summary));
        }

        if self.spec.is_main_run && targets.is_empty() {
            let message =
                "The service 'Run method' is set to 'Per device' mode, but no targets have been selected";
            self.log(Severity::Error, message, None);
            let mut failed = failed_result(message);
            failed.insert("runtime".into(), json!(self.scope.runtime));
            return Ok(failed);
        }

        let device_results = if self.multiprocessing()
            && runnable.len() > 1
            && !self.spec.in_process
            && !self.spec.iteration_run
        {
            self.run_in_pool(&runnable)
        } else {
            runnable
                .iter()
                .map(|device| self.run_job_and_collect_results(Some(device)))
                .collect()
        };

        for result in &device_results {
            let key = self.outcome_key(result);
            if let Some(name) = result.get("device_target").and_then(Value::as_str) {
                summary.push(&key, name);
            }
        }
        let success = results.iter().chain(device_results.iter()).all(success_of);

        let mut aggregate = ResultMap::new();
        aggregate.insert("summary".into(), summary.into_value());
        aggregate.insert("success".into(), json!(success));
        aggregate.insert("runtime".into(), json!(self.scope.runtime));
        Ok(aggregate)
    }

    /// Stores the resolved devices on the Job Record so a restart from this
    /// run sees the same targets.
    fn persist_run_targets(&self, targets: &[Device]) {
        let ids: Vec<DeviceId> = targets.iter().map(|device| device.id).collect();
        self.scope.update_record(|record| record.target_devices = ids);
        if let Err(e) = self.scope.repository.update_run(&self.scope.record()) {
            warn!("RUNTIME {} - Failed to store run targets: {}", self.scope.runtime, e);
        }
    }

    /// Once mode: a single job sees every runnable target.
    fn run_once(&self, targets: &[Device], runnable: &[Device], mut summary: Summary) -> ResultMap {
        if !targets.is_empty() && runnable.is_empty() {
            let mut results = ResultMap::new();
            results.insert(
                "success".into(),
                json!(self.service.skip_value == SkipValue::Success),
            );
            results.insert("summary".into(), summary.into_value());
            results.insert("runtime".into(), json!(self.scope.runtime));
            return results;
        }

        *lock(&self.run_targets) = runnable.to_vec();
        let mut results = self.run_job_and_collect_results(None);
        if !results.contains_key("summary") {
            let key = self.outcome_key(&results);
            for device in runnable {
                summary.push(&key, &device.name);
            }
            for key in ["success", "failure"] {
                if summary.count(key) > 0 {
                    self.write_state(
                        &format!("{}/{}", self.progress_key, key),
                        json!(summary.count(key)),
                        WriteMode::Increment,
                    );
                }
            }
            results.insert("summary".into(), summary.into_value());
        }
        results
    }

    /// Device iteration: a nested run per target, against the devices
    /// its iteration query derives.
    fn iterate_devices(&self, targets: &[Device]) -> Result<ResultMap> {
        if self.workflow.is_none() {
            let message = "Device iteration not allowed outside of a workflow";
            self.log(Severity::Error, message, None);
            let mut failed = failed_result(message);
            failed.insert("runtime".into(), json!(self.scope.runtime));
            return Ok(failed);
        }

        self.write_state("progress/device/total", json!(targets.len()), WriteMode::Increment);
        let mut summary = Summary::new();
        for device in targets {
            let key = if self.device_iteration(device)? {
                "success"
            } else {
                "failure"
            };
            self.write_state(&format!("progress/device/{}", key), json!(1), WriteMode::Increment);
            summary.push(key, &device.name);
        }

        let mut results = ResultMap::new();
        results.insert("success".into(), json!(summary.count("failure") == 0));
        results.insert("summary".into(), summary.into_value());
        results.insert("runtime".into(), json!(self.scope.runtime));
        Ok(results)
    }

    fn device_iteration(&self, device: &Device) -> Result<bool> {
        let derived = self.compute_devices_from_query(
            &self.service.iteration_devices,
            &self.service.iteration_devices_property,
            Some(device),
        )?;
        let spec = RunnerSpec {
            service_id: self.service.id,
            path: self.spec.path.clone(),
            is_main_run: false,
            iteration_run: true,
            workflow: self.spec.workflow,
            parent_device: Some(device.id),
            targets: Some(derived.iter().map(|d| d.id).collect()),
            in_process: self.spec.in_process,
        };
        let runner = Runner::from_spec(Arc::clone(&self.scope), spec)?;
        Ok(success_of(&runner.start_run()?))
    }

    /// Summary key of a result: its outgoing edge, else success/failure.
    fn outcome_key(&self, results: &ResultMap) -> String {
        match results.get("outgoing_edge").and_then(Value::as_str) {
            Some(edge) => edge.to_string(),
            None if success_of(results) => "success".to_string(),
            None => "failure".to_string(),
        }
    }

    fn timeline_key(&self, device: Option<&Device>) -> String {
        format!(
            "{}>{}",
            self.spec.path,
            device.map(|d| d.name.as_str()).unwrap_or("-")
        )
    }

    /// Runs the job for one device (or once, with `None`), then records
    /// progress and the device's result row.
    pub fn run_job_and_collect_results(&self, device: Option<&Device>) -> ResultMap {
        let device_name = device.map(|d| d.name.as_str());
        self.log(Severity::Info, "STARTING", device_name);
        let start = Instant::now();

        let mut results = ResultMap::new();
        results.insert("device_target".into(), json!(device_name));

        if self.stop() {
            results.insert("success".into(), json!(false));
            results.insert("result".into(), json!("Aborted"));
            if let Some(device) = device {
                let mut row = results.clone();
                row.insert("runtime".into(), json!(now_text()));
                if let Err(e) = self.create_result(row, Some(device), false) {
                    self.log(Severity::Error, &e.to_string(), device_name);
                }
            }
            self.record_success(false);
            return results;
        }

        let key = self.timeline_key(device);
        self.scope.timeline_event(key.clone(), EventType::Started);

        let outcome = if self.service.iteration_values.is_empty() {
            Ok(self.run_service_job(device))
        } else {
            self.iterate_values(device)
        };
        match outcome {
            Ok(job_results) => results.extend(job_results),
            Err(e) => {
                self.log(Severity::Error, &e.to_string(), device_name);
                results.insert("success".into(), json!(false));
                results.insert("result".into(), json!(e.to_string()));
            }
        }
        results.insert("duration".into(), json!(format_duration(start.elapsed())));

        if let Some(device) = device {
            if self.service.close_connection || self.spec.is_main_run {
                self.close_device_connections(device);
            }
            let mut row = results.clone();
            row.insert("runtime".into(), json!(now_text()));
            if let Err(e) = self.create_result(row, Some(device), false) {
                results.insert("success".into(), json!(false));
                results.insert("result".into(), json!(e.to_string()));
            }
            let status = if success_of(&results) {
                "success"
            } else {
                "failure"
            };
            self.write_state(
                &format!("{}/{}", self.progress_key, status),
                json!(1),
                WriteMode::Increment,
            );
        }

        let success = success_of(&results);
        let event = if success {
            EventType::Completed
        } else {
            EventType::Failed
        };
        self.scope.timeline_event(key, event);
        self.log(Severity::Info, "FINISHED", device_name);

        if self.service.waiting_time > 0 {
            self.log(
                Severity::Info,
                &format!("SLEEP {} seconds...", self.service.waiting_time),
                device_name,
            );
            thread::sleep(Duration::from_secs(self.service.waiting_time));
        }
        if !success {
            self.record_success(false);
        }
        results
    }

    /// Runs the job once per iteration value, exposing the value as a
    /// payload variable.
    fn iterate_values(&self, device: Option<&Device>) -> Result<ResultMap> {
        let values = self.eval(&self.service.iteration_values, device, Map::new())?;
        let values: Vec<(String, Value)> = match values {
            Value::Object(map) => map.into_iter().collect(),
            Value::Array(items) => items.into_iter().map(|v| (render(&v), v)).collect(),
            Value::Null => Vec::new(),
            other => vec![(render(&other), other)],
        };

        let mut per_value = Map::new();
        let mut success = true;
        for (name, value) in values {
            set_payload_variable(
                &self.scope.payload,
                &self.service.iteration_variable_name,
                value,
                device.map(|d| d.name.as_str()),
            );
            let results = self.run_service_job(device);
            success &= success_of(&results);
            per_value.insert(name, Value::Object(results));
        }

        let mut results = ResultMap::new();
        results.insert("result".into(), Value::Object(per_value));
        results.insert("success".into(), json!(success));
        Ok(results)
    }

    /// Persists a result row, immediately or into the run's buffer.
    pub(crate) fn create_result(
        &self,
        mut results: ResultMap,
        device: Option<&Device>,
        run_result: bool,
    ) -> Result<ResultMap> {
        let success = success_of(&results);
        if self.spec.is_main_run {
            results.insert("trigger".into(), json!(self.scope.trigger));
        }
        if self.spec.is_main_run && device.is_none() {
            results.insert("payload".into(), lock(&self.scope.payload).clone());
        } else {
            results.remove("payload");
        }
        if let Err(e) = self.check_result_size(&mut results) {
            // Keep a row for the target even though its result is dropped.
            let mut placeholder = failed_result(e.to_string());
            for key in ["runtime", "duration", "device_target"] {
                if let Some(value) = results.get(key) {
                    placeholder.insert(key.into(), value.clone());
                }
            }
            self.store_result_row(&placeholder, device, false);
            return Err(e);
        }

        let create_failed = self.service.disable_result_creation && !success;
        if !self.service.disable_result_creation || create_failed || run_result {
            self.store_result_row(&results, device, success);
        }
        Ok(results)
    }

    fn store_result_row(&self, results: &ResultMap, device: Option<&Device>, success: bool) {
        self.has_result.store(true, Ordering::SeqCst);
        let row = DeviceResult {
            runtime: self.scope.runtime.clone(),
            path: self.spec.path.clone(),
            service_id: self.service.id,
            device: device.map(|d| d.name.clone()),
            success,
            duration: results
                .get("duration")
                .map(render)
                .unwrap_or_default(),
            memory_size: results.get("memory_size").and_then(Value::as_u64).unwrap_or(0),
            result: Value::Object(results.clone()),
        };
        if self.scope.high_performance {
            self.scope.buffer_result(row);
        } else if let Err(e) = self.scope.repository.insert_results(vec![row]) {
            self.log(
                Severity::Critical,
                &format!("Failed to commit result:\n{}", e),
                device.map(|d| d.name.as_str()),
            );
        }
    }

    fn check_result_size(&self, results: &mut ResultMap) -> Result<()> {
        let size = serde_json::to_string(&*results).map(|s| s.len()).unwrap_or(0);
        results.insert("memory_size".into(), json!(size));
        self.check_size("result", size, self.scope.settings.limits.max_result_size)
    }

    /// Counts `size` against the run's memory and enforces the cap.
    pub(crate) fn check_size(&self, data_type: &str, size: usize, max: usize) -> Result<()> {
        self.write_top_state("memory_size", json!(size), WriteMode::Increment);
        if size >= max {
            self.log(
                Severity::Critical,
                &format!(
                    "The {} is too large to be committed to the database: \
                     Size: {}B / Maximum Allowed Size: {}B",
                    data_type, size, max
                ),
                None,
            );
            let mut label = data_type.to_string();
            if let Some(first) = label.get_mut(0..1) {
                first.make_ascii_uppercase();
            }
            return Err(EngineError::DataOverflow(label));
        }
        let percent = size as f64 / max as f64 * 100.0;
        if percent > 50.0 {
            self.log(
                Severity::Warning,
                &format!("The {} is {:.1}% the maximum allowed size.", data_type, percent),
                None,
            );
        }
        Ok(())
    }

    /// Renders the service report template against the results.
    fn generate_report(&self, results: &ResultMap) -> Option<String> {
        if self.service.report.is_empty() {
            return None;
        }
        let mut extra = Map::new();
        extra.insert("results".into(), Value::Object(results.clone()));
        let report = match self.sub(&self.service.report, None, extra) {
            Ok(report) => report,
            Err(e) => {
                let message = format!("Failed to build report:\n{}", e);
                self.log(Severity::Error, &message, None);
                message
            }
        };
        if self
            .check_size("report", report.len(), self.scope.settings.limits.max_log_size)
            .is_err()
        {
            return None;
        }

        let row = ServiceReport {
            runtime: self.scope.runtime.clone(),
            service_id: self.service.id,
            content: report.clone(),
        };
        if self.scope.high_performance {
            self.scope.buffer_report(row);
        } else if let Err(e) = self.scope.repository.insert_reports(vec![row]) {
            self.log(Severity::Error, &format!("Failed to commit report:\n{}", e), None);
        }
        Some(report)
    }
}
