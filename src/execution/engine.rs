//! Job Execution Engine
//!
//! The trigger surface of the crate:
//! - `submit` creates a Job Record and runs it inline or on its own thread
//! - `request_stop` sets a run's cooperative stop flag
//! - `get_state` / `progress` read live (or snapshotted) run state
//! - `recover_interrupted` aborts runs a previous process left `Running`

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::info;
use serde_json::{Map, Value};

use super::job::{JobRegistry, ServiceJob};
use super::scope::{RunOptions, RunScope, TargetSet};
use crate::connection::{ConnectionCache, DeviceDriver};
use crate::error::{EngineError, Result};
use crate::inventory::{DeviceId, Inventory, PoolId, ServiceId};
use crate::run::{
    execute_run, finalize_run, generate_runtime, progress_text, recover_interrupted, JobRecord,
    ResultMap, RunRepository, RunStatus,
};
use crate::settings::Settings;
use crate::state::StateStore;

/// Targets of a restarted run.
#[derive(Debug, Clone, PartialEq)]
pub enum RestartTargets {
    /// Explicit devices and pools
    Manual(TargetSet),
    /// The targets the restarted run was submitted with
    FromRun,
}

/// Link to the run being restarted.
#[derive(Debug, Clone, PartialEq)]
pub struct Restart {
    pub runtime: String,
    pub targets: RestartTargets,
}

/// Parameters of one trigger.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub service_id: ServiceId,
    pub devices: Vec<DeviceId>,
    pub pools: Vec<PoolId>,
    pub payload: Value,
    pub creator: String,
    pub asynchronous: bool,
    pub trigger: Option<String>,
    pub restart: Option<Restart>,
    /// Workflow entry points overriding the definition's
    pub start_services: Vec<ServiceId>,
}

impl SubmitRequest {
    pub fn new(service_id: ServiceId) -> Self {
        Self {
            service_id,
            devices: Vec::new(),
            pools: Vec::new(),
            payload: Value::Object(Map::new()),
            creator: "admin".to_string(),
            asynchronous: false,
            trigger: None,
            restart: None,
            start_services: Vec::new(),
        }
    }

    pub fn with_devices(mut self, devices: &[DeviceId]) -> Self {
        self.devices = devices.to_vec();
        self
    }

    pub fn with_pools(mut self, pools: &[PoolId]) -> Self {
        self.pools = pools.to_vec();
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn by(mut self, creator: &str) -> Self {
        self.creator = creator.to_string();
        self
    }

    pub fn asynchronous(mut self) -> Self {
        self.asynchronous = true;
        self
    }

    pub fn with_trigger(mut self, trigger: &str) -> Self {
        self.trigger = Some(trigger.to_string());
        self
    }

    pub fn restarting(mut self, restart: Restart) -> Self {
        self.restart = Some(restart);
        self
    }

    pub fn starting_at(mut self, services: &[ServiceId]) -> Self {
        self.start_services = services.to_vec();
        self
    }
}

/// Outcome of [`Engine::submit`].
#[derive(Debug)]
pub enum Submission {
    /// Synchronous run, already finalized
    Completed {
        runtime: String,
        status: RunStatus,
        results: ResultMap,
    },
    /// Asynchronous run; the handle yields the final results
    Started {
        runtime: String,
        handle: JoinHandle<ResultMap>,
    },
}

impl Submission {
    pub fn runtime(&self) -> &str {
        match self {
            Submission::Completed { runtime, .. } | Submission::Started { runtime, .. } => runtime,
        }
    }
}

/// Job execution engine.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use fleetrunner::execution::{Engine, SubmitRequest};
/// use fleetrunner::inventory::MemoryInventory;
/// use fleetrunner::run::MemoryRepository;
/// use fleetrunner::settings::Settings;
/// use fleetrunner::workflow::load_fleet;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let fleet = load_fleet("fleet.yaml")?;
///     let inventory = Arc::new(MemoryInventory::from_fleet(fleet));
///     let engine = Engine::new(inventory, Arc::new(MemoryRepository::new()), Settings::default());
///
///     let submission = engine.submit(SubmitRequest::new(1).with_devices(&[1, 2]))?;
///     println!("{}", submission.runtime());
///     Ok(())
/// }
/// ```
pub struct Engine {
    pub(crate) inventory: Arc<dyn Inventory>,
    pub(crate) repository: Arc<dyn RunRepository>,
    pub(crate) settings: Arc<Settings>,
    pub(crate) state: StateStore,
    pub(crate) connections: Arc<ConnectionCache>,
    pub(crate) jobs: Arc<JobRegistry>,
}

impl Engine {
    /// Creates an engine with a process-local state store and the built-in
    /// job kinds.
    pub fn new(
        inventory: Arc<dyn Inventory>,
        repository: Arc<dyn RunRepository>,
        settings: Settings,
    ) -> Self {
        Self {
            connections: Arc::new(ConnectionCache::new(settings.connections.clone())),
            inventory,
            repository,
            settings: Arc::new(settings),
            state: StateStore::local(),
            jobs: Arc::new(JobRegistry::with_defaults()),
        }
    }

    /// Replaces the state store, e.g. with a shared key/value backend.
    pub fn set_state_store(&mut self, state: StateStore) {
        self.state = state;
    }

    pub fn register_driver(&self, driver: Arc<dyn DeviceDriver>) {
        self.connections.register_driver(driver);
    }

    /// Registers (or replaces) the job run for a service type.
    pub fn register_job(&self, kind: &str, job: Arc<dyn ServiceJob>) {
        self.jobs.register(kind, job);
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn repository(&self) -> &Arc<dyn RunRepository> {
        &self.repository
    }

    pub fn connections(&self) -> &Arc<ConnectionCache> {
        &self.connections
    }

    /// Creates the Job Record and the run scope without executing.
    pub(crate) fn prepare(&self, request: SubmitRequest) -> Result<Arc<RunScope>> {
        let service = self
            .inventory
            .service(request.service_id)
            .ok_or_else(|| EngineError::ServiceNotFound(request.service_id.to_string()))?;
        if service.disabled {
            return Err(EngineError::ServiceDisabled(service.name));
        }

        let runtime = generate_runtime();
        let mut record = JobRecord::new(
            &runtime,
            service.id,
            &request.creator,
            &self.settings.server_name,
        );
        let payload = match request.payload {
            Value::Object(map) => Value::Object(map),
            _ => Value::Object(Map::new()),
        };
        let form = payload.get("form").and_then(Value::as_object).cloned();
        record.parameterized = form.is_some();
        record.trigger = request.trigger.unwrap_or_else(|| {
            if form.is_some() {
                "Parameterized Run".to_string()
            } else {
                "Regular Run".to_string()
            }
        });
        record.payload = payload;
        record.target_devices = request.devices;
        record.target_pools = request.pools;
        record.start_services = request.start_services;

        let restart_targets = match request.restart {
            None => None,
            Some(restart) => {
                record.restart_run = Some(restart.runtime.clone());
                Some(match restart.targets {
                    RestartTargets::Manual(targets) => targets,
                    RestartTargets::FromRun => {
                        let prior = self
                            .repository
                            .get_run(&restart.runtime)
                            .ok_or_else(|| EngineError::RunNotFound(restart.runtime.clone()))?;
                        TargetSet::new(prior.target_devices, prior.target_pools)
                    }
                })
            }
        };

        let scope = RunScope::new(
            self,
            record.clone(),
            RunOptions {
                form,
                restart_targets,
            },
        )?;
        self.repository.create_run(&record)?;
        self.repository.update_service_count(service.id, 1);
        info!(
            "RUNTIME {} - Run '{}' created by {} ({})",
            runtime, service.name, record.creator, record.trigger
        );
        Ok(Arc::new(scope))
    }

    /// Triggers a run of a service.
    pub fn submit(&self, request: SubmitRequest) -> Result<Submission> {
        let asynchronous = request.asynchronous;
        let scope = self.prepare(request)?;
        let runtime = scope.runtime.clone();

        if asynchronous {
            let worker_scope = Arc::clone(&scope);
            let spawned = thread::Builder::new()
                .name(format!("run-{}", runtime))
                .spawn(move || execute_run(worker_scope));
            return match spawned {
                Ok(handle) => Ok(Submission::Started { runtime, handle }),
                Err(e) => {
                    let mut failed = ResultMap::new();
                    failed.insert("success".into(), Value::Bool(false));
                    failed.insert("result".into(), Value::String(e.to_string()));
                    finalize_run(&scope, failed, true);
                    Err(e.into())
                }
            };
        }

        let results = execute_run(Arc::clone(&scope));
        let status = self
            .repository
            .get_run(&runtime)
            .map(|record| record.status)
            .unwrap_or(RunStatus::Completed);
        Ok(Submission::Completed {
            runtime,
            status,
            results,
        })
    }

    /// Asks a running run to stop. Returns false when it already ended.
    pub fn request_stop(&self, runtime: &str) -> Result<bool> {
        let record = self
            .repository
            .get_run(runtime)
            .ok_or_else(|| EngineError::RunNotFound(runtime.to_string()))?;
        if record.status.is_terminal() {
            return Ok(false);
        }
        self.state.request_stop(runtime)?;
        if self.discard_late_stop(runtime) {
            return Ok(false);
        }
        info!("RUNTIME {} - Stop requested", runtime);
        Ok(true)
    }

    /// Drops a stop flag that landed after finalization cleared the run's
    /// state. Finalization stores the terminal status before clearing.
    fn discard_late_stop(&self, runtime: &str) -> bool {
        let finished = self
            .repository
            .get_run(runtime)
            .map(|record| record.status.is_terminal())
            .unwrap_or(true);
        if finished {
            self.state.clear(runtime);
        }
        finished
    }

    /// Run state below `path`: live while running, the finalization
    /// snapshot afterwards.
    pub fn get_state(&self, runtime: &str, path: Option<&str>) -> Result<Value> {
        let record = self
            .repository
            .get_run(runtime)
            .ok_or_else(|| EngineError::RunNotFound(runtime.to_string()))?;
        if !record.status.is_terminal() {
            return Ok(self.state.read_path(runtime, path));
        }

        let snapshot = record.state.unwrap_or_else(StateStore::empty);
        let Some(path) = path else {
            return Ok(snapshot);
        };
        Ok(path
            .split('/')
            .filter(|segment| !segment.is_empty())
            .try_fold(&snapshot, |node, segment| node.get(segment))
            .cloned()
            .unwrap_or(Value::Null))
    }

    /// `"<done>/<total> (<failed> failed)"` for the run's top-level service.
    pub fn progress(&self, runtime: &str) -> Result<String> {
        let record = self
            .repository
            .get_run(runtime)
            .ok_or_else(|| EngineError::RunNotFound(runtime.to_string()))?;
        let path = format!("{}/progress/device", record.service_id);
        Ok(progress_text(&self.get_state(runtime, Some(&path))?))
    }

    /// Marks runs this server left `Running` as `Aborted (reload)`.
    pub fn recover_interrupted(&self) -> Result<usize> {
        recover_interrupted(self.repository.as_ref(), &self.settings.server_name)
    }
}
