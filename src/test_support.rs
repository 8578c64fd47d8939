//! Fixtures shared by the crate's unit tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::json;

use crate::connection::{LoopbackDriver, Protocol};
use crate::error::Result;
use crate::execution::{Engine, RunScope, Runner, ServiceJob, SubmitRequest};
use crate::inventory::{Device, MemoryInventory, Pool, User};
use crate::lock;
use crate::run::{JobRecord, MemoryRepository, ResultMap, RunRepository};
use crate::settings::Settings;
use crate::state::StateStore;

/// Three routers in one pool, an admin and an operator limited to `r1`.
pub(crate) fn sample_inventory() -> MemoryInventory {
    let mut inventory = MemoryInventory::new();
    inventory.add_device(
        Device::new(1, "r1", "10.0.0.1").with_response("show version", "Cisco IOS 15.2"),
    );
    inventory.add_device(
        Device::new(2, "r2", "10.0.0.2").with_response("show version", "JUNOS 21.4R1"),
    );
    inventory.add_device(Device::new(3, "r3", "10.0.0.3"));
    inventory.add_pool(Pool {
        id: 1,
        name: "core".to_string(),
        devices: vec![1, 2, 3],
    });
    inventory.add_user(User {
        name: "admin".to_string(),
        is_admin: true,
        allowed_devices: None,
    });
    inventory.add_user(User {
        name: "operator".to_string(),
        is_admin: false,
        allowed_devices: Some(vec![1]),
    });
    inventory
}

/// Engine over `inventory` with a loopback CLI driver.
pub(crate) fn engine_with(
    inventory: MemoryInventory,
) -> (Engine, Arc<MemoryRepository>, LoopbackDriver) {
    engine_with_settings(inventory, Settings::default())
}

pub(crate) fn engine_with_settings(
    inventory: MemoryInventory,
    settings: Settings,
) -> (Engine, Arc<MemoryRepository>, LoopbackDriver) {
    let repository = Arc::new(MemoryRepository::new());
    let engine = Engine::new(Arc::new(inventory), repository.clone(), settings);
    let driver = LoopbackDriver::new(Protocol::Cli);
    engine.register_driver(Arc::new(driver.clone()));
    (engine, repository, driver)
}

/// Run scope for `request`, created without executing the run.
pub(crate) fn prepare_scope(inventory: MemoryInventory, request: SubmitRequest) -> Arc<RunScope> {
    let (engine, _, _) = engine_with(inventory);
    engine.prepare(request).unwrap()
}

pub(crate) fn record_of(repository: &MemoryRepository, runtime: &str) -> JobRecord {
    repository.get_run(runtime).unwrap()
}

/// Counts attempts per device and fails on the listed device names.
pub(crate) struct CountingJob {
    failing: Vec<String>,
    attempts: Mutex<HashMap<String, usize>>,
}

impl CountingJob {
    pub(crate) fn failing_on(devices: &[&str]) -> Self {
        Self {
            failing: devices.iter().map(|d| d.to_string()).collect(),
            attempts: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn attempts(&self, device: &str) -> usize {
        lock(&self.attempts).get(device).copied().unwrap_or(0)
    }

    pub(crate) fn total_attempts(&self) -> usize {
        lock(&self.attempts).values().sum()
    }
}

impl ServiceJob for CountingJob {
    fn run(&self, _runner: &Runner, device: Option<&Device>) -> Result<ResultMap> {
        let name = device.map(|d| d.name.clone()).unwrap_or_default();
        *lock(&self.attempts).entry(name.clone()).or_insert(0) += 1;

        let mut results = ResultMap::new();
        results.insert("result".into(), json!(format!("ran on {}", name)));
        results.insert("success".into(), json!(!self.failing.contains(&name)));
        Ok(results)
    }
}

/// Requests a stop of its own run on the first call.
pub(crate) struct StopAfterFirstJob {
    state: StateStore,
    calls: Mutex<usize>,
}

impl StopAfterFirstJob {
    pub(crate) fn new(state: StateStore) -> Self {
        Self {
            state,
            calls: Mutex::new(0),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        *lock(&self.calls)
    }
}

impl ServiceJob for StopAfterFirstJob {
    fn run(&self, runner: &Runner, _device: Option<&Device>) -> Result<ResultMap> {
        *lock(&self.calls) += 1;
        self.state.request_stop(runner.runtime())?;
        let mut results = ResultMap::new();
        results.insert("success".into(), json!(true));
        Ok(results)
    }
}
