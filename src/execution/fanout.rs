//! Parallel Device Fan-out
//!
//! Runs per-device jobs on a bounded set of worker threads. Each worker
//! receives only the run scope, the runner identity and a device id, and
//! rebuilds its own [`Runner`] from them.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread;

use log::error;
use serde_json::json;

use super::runner::{failed_result, Runner, RunnerSpec};
use super::scope::RunScope;
use crate::inventory::{Device, DeviceId};
use crate::logs::Severity;
use crate::run::ResultMap;

impl Runner {
    /// Runs the job for every device on at most `max_processes` threads.
    ///
    /// Returns one result per device, in completion order.
    pub(crate) fn run_in_pool(&self, devices: &[Device]) -> Vec<ResultMap> {
        let max_parallel = devices.len().min(self.max_processes()).max(1);
        self.log(
            Severity::Info,
            &format!("Starting a pool of {} threads", max_parallel),
            None,
        );

        let mut pending: VecDeque<DeviceId> = devices.iter().map(|d| d.id).collect();
        let mut spec = self.spec.clone();
        spec.in_process = true;

        let (tx, rx): (Sender<(DeviceId, ResultMap)>, Receiver<(DeviceId, ResultMap)>) = channel();
        let mut results = Vec::with_capacity(devices.len());
        let mut running_count = 0;

        loop {
            while running_count < max_parallel {
                let Some(device_id) = pending.pop_front() else {
                    break;
                };

                let tx = tx.clone();
                let scope = Arc::clone(&self.scope);
                let spec = spec.clone();
                thread::spawn(move || {
                    let result = run_device_job(scope, spec, device_id);
                    if let Err(e) = tx.send((device_id, result)) {
                        error!("Failed to send device result: {}", e);
                    }
                });
                running_count += 1;
            }

            if running_count == 0 {
                break;
            }

            match rx.recv() {
                Ok((_, result)) => {
                    running_count -= 1;
                    results.push(result);
                }
                Err(e) => {
                    error!("Failed to receive device result: {}", e);
                    break;
                }
            }
        }

        results
    }
}

/// Body of one worker thread.
fn run_device_job(scope: Arc<RunScope>, spec: RunnerSpec, device_id: DeviceId) -> ResultMap {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let Some(device) = scope.inventory.device(device_id) else {
            return failed_result(format!("Device {} not found", device_id));
        };
        match Runner::from_spec(Arc::clone(&scope), spec) {
            Ok(runner) => runner.run_job_and_collect_results(Some(&device)),
            Err(e) => {
                let mut results = failed_result(e.to_string());
                results.insert("device_target".into(), json!(device.name));
                results
            }
        }
    }));

    outcome.unwrap_or_else(|_| {
        error!("RUNTIME {} - Worker for device {} panicked", scope.runtime, device_id);
        failed_result(format!("Worker for device {} panicked", device_id))
    })
}
