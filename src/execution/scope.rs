//! Run-wide context shared by every runner of one run.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde_json::{Map, Value};

use super::engine::Engine;
use super::job::JobRegistry;
use crate::connection::ConnectionCache;
use crate::error::{EngineError, Result};
use crate::expression::SharedPayload;
use crate::inventory::{DeviceId, Inventory, PoolId, ServiceId};
use crate::lock;
use crate::logs::{LogPolicy, RunLogger};
use crate::monitoring::{EventType, ExecutionTimeline};
use crate::run::{DeviceResult, JobRecord, RunRepository, ServiceReport};
use crate::settings::Settings;
use crate::state::StateStore;
use crate::workflow::Service;

/// Explicit device and pool references.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TargetSet {
    pub devices: Vec<DeviceId>,
    pub pools: Vec<PoolId>,
}

impl TargetSet {
    pub fn new(devices: Vec<DeviceId>, pools: Vec<PoolId>) -> Self {
        Self { devices, pools }
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty() && self.pools.is_empty()
    }
}

/// Per-run options decided at submission.
#[derive(Debug, Clone, Default)]
pub(crate) struct RunOptions {
    /// Parameterized form values; they override service options on the main run
    pub form: Option<Map<String, Value>>,
    pub restart_targets: Option<TargetSet>,
}

#[derive(Debug, Default)]
struct RunBuffers {
    results: Vec<DeviceResult>,
    reports: Vec<ServiceReport>,
}

/// Everything the runners of one run share.
///
/// Service definitions are snapshotted at submission so edits made while
/// the run is in progress do not leak into it.
pub struct RunScope {
    pub runtime: String,
    pub creator: String,
    pub main_service: ServiceId,
    pub(crate) services: HashMap<ServiceId, Service>,
    pub(crate) inventory: Arc<dyn Inventory>,
    pub(crate) repository: Arc<dyn RunRepository>,
    pub(crate) state: StateStore,
    pub(crate) connections: Arc<ConnectionCache>,
    pub(crate) jobs: Arc<JobRegistry>,
    pub(crate) settings: Arc<Settings>,
    pub(crate) logger: RunLogger,
    pub(crate) allowed_targets: HashSet<DeviceId>,
    pub(crate) trigger: String,
    pub(crate) form: Option<Map<String, Value>>,
    pub(crate) restart_targets: Option<TargetSet>,
    pub(crate) record_targets: TargetSet,
    pub(crate) start_services: Vec<ServiceId>,
    pub(crate) payload: SharedPayload,
    pub(crate) high_performance: bool,
    pub(crate) started: Instant,
    record: Mutex<JobRecord>,
    buffers: Mutex<RunBuffers>,
    timeline: Mutex<ExecutionTimeline>,
    finalized: AtomicBool,
}

impl RunScope {
    pub(crate) fn new(engine: &Engine, record: JobRecord, options: RunOptions) -> Result<Self> {
        let services = snapshot_services(engine.inventory.as_ref(), record.service_id)?;
        let main = services
            .get(&record.service_id)
            .ok_or_else(|| EngineError::ServiceNotFound(record.service_id.to_string()))?;
        let policy = LogPolicy {
            log_level: main.log_level,
            show_user_logs: main.show_user_logs,
        };
        let high_performance = main.high_performance;

        Ok(Self {
            logger: RunLogger::new(&record.runtime, &record.creator, record.service_id, policy),
            allowed_targets: engine.inventory.allowed_targets(&record.creator),
            runtime: record.runtime.clone(),
            creator: record.creator.clone(),
            main_service: record.service_id,
            services,
            inventory: Arc::clone(&engine.inventory),
            repository: Arc::clone(&engine.repository),
            state: engine.state.clone(),
            connections: Arc::clone(&engine.connections),
            jobs: Arc::clone(&engine.jobs),
            settings: Arc::clone(&engine.settings),
            trigger: record.trigger.clone(),
            form: options.form,
            restart_targets: options.restart_targets,
            record_targets: TargetSet::new(record.target_devices.clone(), record.target_pools.clone()),
            start_services: record.start_services.clone(),
            payload: Arc::new(Mutex::new(record.payload.clone())),
            high_performance,
            started: Instant::now(),
            record: Mutex::new(record),
            buffers: Mutex::new(RunBuffers::default()),
            timeline: Mutex::new(ExecutionTimeline::new()),
            finalized: AtomicBool::new(false),
        })
    }

    pub fn service(&self, id: ServiceId) -> Option<&Service> {
        self.services.get(&id)
    }

    pub fn stop_requested(&self) -> bool {
        self.state.stop_requested(&self.runtime)
    }

    /// Form value overriding a service option.
    pub(crate) fn form_value(&self, name: &str) -> Option<&Value> {
        self.form.as_ref().and_then(|form| form.get(name))
    }

    pub fn record(&self) -> JobRecord {
        lock(&self.record).clone()
    }

    pub(crate) fn update_record(&self, update: impl FnOnce(&mut JobRecord)) {
        update(&mut lock(&self.record));
    }

    pub(crate) fn buffer_result(&self, result: DeviceResult) {
        lock(&self.buffers).results.push(result);
    }

    pub(crate) fn buffer_report(&self, report: ServiceReport) {
        lock(&self.buffers).reports.push(report);
    }

    pub(crate) fn take_buffers(&self) -> (Vec<DeviceResult>, Vec<ServiceReport>) {
        let mut buffers = lock(&self.buffers);
        (
            std::mem::take(&mut buffers.results),
            std::mem::take(&mut buffers.reports),
        )
    }

    pub(crate) fn timeline_event(&self, key: String, event: EventType) {
        lock(&self.timeline).add_event(key, event);
    }

    pub fn timeline(&self) -> ExecutionTimeline {
        lock(&self.timeline).clone()
    }

    /// True for the first caller only.
    pub(crate) fn mark_finalized(&self) -> bool {
        !self.finalized.swap(true, Ordering::SeqCst)
    }
}

/// The top-level service and every service reachable through workflow
/// membership.
fn snapshot_services(inventory: &dyn Inventory, root: ServiceId) -> Result<HashMap<ServiceId, Service>> {
    let mut services = HashMap::new();
    let mut queue = VecDeque::from([root]);
    while let Some(id) = queue.pop_front() {
        if services.contains_key(&id) {
            continue;
        }
        let service = inventory
            .service(id)
            .ok_or_else(|| EngineError::ServiceNotFound(id.to_string()))?;
        queue.extend(service.members().iter().copied());
        services.insert(id, service);
    }
    Ok(services)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::MemoryInventory;
    use crate::workflow::WorkflowSpec;

    #[test]
    fn test_snapshot_follows_members() {
        let mut inventory = MemoryInventory::new();
        inventory.add_service(Service::new(1, "a", "command"));
        inventory.add_service(Service::new(2, "b", "command"));
        inventory.add_service(Service::new(3, "inner", "workflow").with_workflow(WorkflowSpec {
            services: vec![2],
            ..WorkflowSpec::default()
        }));
        inventory.add_service(Service::new(4, "outer", "workflow").with_workflow(WorkflowSpec {
            services: vec![1, 3],
            ..WorkflowSpec::default()
        }));

        let services = snapshot_services(&inventory, 4).unwrap();
        let mut ids: Vec<_> = services.keys().copied().collect();
        ids.sort();
        assert_eq!(ids, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_snapshot_missing_member() {
        let mut inventory = MemoryInventory::new();
        inventory.add_service(Service::new(4, "outer", "workflow").with_workflow(WorkflowSpec {
            services: vec![9],
            ..WorkflowSpec::default()
        }));
        assert!(matches!(
            snapshot_services(&inventory, 4),
            Err(EngineError::ServiceNotFound(id)) if id == "9"
        ));
    }

    #[test]
    fn test_target_set_empty() {
        assert!(TargetSet::default().is_empty());
        assert!(!TargetSet::new(vec![], vec![1]).is_empty());
    }
}
