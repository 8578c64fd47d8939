//! Workflow traversal within a run.

use std::sync::Arc;

use serde_json::{json, Map, Value};

use super::runner::{success_of, Runner, RunnerSpec};
use crate::error::{EngineError, Result};
use crate::inventory::Device;
use crate::logs::Severity;
use crate::run::ResultMap;
use crate::workflow::{WorkflowPlanner, WorkflowRunMethod};

impl Runner {
    /// Runs the members of this workflow service, following success and
    /// failure edges from the start services.
    ///
    /// With `device` set, members run against that device only; in once
    /// mode they get the workflow's targets. Members using their own
    /// targets resolve them themselves.
    pub(crate) fn run_workflow(&self, device: Option<&Device>) -> Result<ResultMap> {
        let spec = self.service.workflow.clone().ok_or_else(|| {
            EngineError::Job(format!("Service '{}' is not a workflow", self.service.name))
        })?;
        let start_services = if self.spec.is_main_run {
            self.scope.start_services.clone()
        } else {
            Vec::new()
        };
        let member_targets = match spec.run_method {
            WorkflowRunMethod::PerServiceWithWorkflowTargets => Some(match device {
                Some(device) => vec![device.id],
                None => self.run_targets().iter().map(|d| d.id).collect(),
            }),
            WorkflowRunMethod::PerServiceWithServiceTargets => None,
        };
        let device_name = device.map(|d| d.name.as_str());

        let mut planner = WorkflowPlanner::new(spec, &start_services);
        let mut members = Map::new();
        let mut stopped = false;

        while let Some(member) = planner.next_ready() {
            if self.stop() {
                self.log(Severity::Error, "Workflow stopped before completion", device_name);
                stopped = true;
                break;
            }
            planner.mark_running(member);

            let child = RunnerSpec {
                service_id: member,
                path: format!("{}>{}", self.spec.path, member),
                is_main_run: false,
                iteration_run: false,
                workflow: Some(self.service.id),
                parent_device: device.map(|d| d.id),
                targets: member_targets.clone(),
                in_process: self.spec.in_process,
            };
            let outcome =
                Runner::from_spec(Arc::clone(&self.scope), child).and_then(|runner| runner.start_run());
            let success = match &outcome {
                Ok(results) => success_of(results),
                Err(e) => {
                    self.log(
                        Severity::Error,
                        &format!("Service {} failed: {}", member, e),
                        device_name,
                    );
                    false
                }
            };
            planner.mark_completed(member, success);

            let name = self
                .scope
                .service(member)
                .map(|s| s.name.clone())
                .unwrap_or_else(|| member.to_string());
            members.insert(name, json!({"success": success}));
        }

        let (done, total) = planner.progress();
        let unhandled: Vec<Value> = planner
            .unhandled_failures()
            .iter()
            .map(|id| json!(id))
            .collect();

        let mut results = ResultMap::new();
        results.insert("success".into(), json!(planner.succeeded() && !stopped));
        results.insert("result".into(), Value::Object(members));
        results.insert("progress".into(), json!(format!("{}/{}", done, total)));
        if !unhandled.is_empty() {
            results.insert("unhandled_failures".into(), Value::Array(unhandled));
        }
        Ok(results)
    }
}
