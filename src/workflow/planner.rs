//! Workflow Planner
//!
//! Walks a workflow from its start services along success/failure edges:
//! - Tracks member status and timing
//! - Activates edge destinations matching each member's outcome
//! - Remembers failures no failure edge handles

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Instant;

use log::debug;

use super::model::{EdgeKind, WorkflowSpec};
use crate::inventory::ServiceId;

/// Status of a workflow member during execution.
#[derive(Debug, Clone, PartialEq)]
pub enum MemberStatus {
    /// Not reached yet
    Pending,
    /// Reached, waiting to run
    Queued,
    Running,
    Succeeded,
    Failed,
}

/// Execution metrics for a single member.
#[derive(Debug, Clone)]
pub struct MemberMetrics {
    pub start_time: Option<Instant>,
    pub end_time: Option<Instant>,
    pub duration_ms: Option<u128>,
    pub status: MemberStatus,
}

impl MemberMetrics {
    fn new() -> Self {
        Self {
            start_time: None,
            end_time: None,
            duration_ms: None,
            status: MemberStatus::Pending,
        }
    }
}

/// Schedules the members of one workflow run.
///
/// A member runs at most once, as soon as any edge activates it.
pub struct WorkflowPlanner {
    spec: WorkflowSpec,
    queue: VecDeque<ServiceId>,
    metrics: HashMap<ServiceId, MemberMetrics>,
    unhandled_failures: Vec<ServiceId>,
}

impl WorkflowPlanner {
    /// Creates a planner. `start_services` overrides the workflow's own
    /// entry points when non-empty.
    pub fn new(spec: WorkflowSpec, start_services: &[ServiceId]) -> Self {
        let mut metrics = HashMap::new();
        for id in &spec.services {
            metrics.insert(*id, MemberMetrics::new());
        }

        let starts: Vec<ServiceId> = if !start_services.is_empty() {
            start_services.to_vec()
        } else if !spec.start_services.is_empty() {
            spec.start_services.clone()
        } else {
            let destinations: HashSet<ServiceId> =
                spec.edges.iter().map(|e| e.destination).collect();
            spec.services
                .iter()
                .filter(|id| !destinations.contains(id))
                .copied()
                .collect()
        };

        let mut planner = Self {
            spec,
            queue: VecDeque::new(),
            metrics,
            unhandled_failures: Vec::new(),
        };
        for id in starts {
            planner.enqueue(id);
        }
        planner
    }

    fn enqueue(&mut self, id: ServiceId) -> bool {
        match self.metrics.get_mut(&id) {
            Some(metrics) if metrics.status == MemberStatus::Pending => {
                metrics.status = MemberStatus::Queued;
                self.queue.push_back(id);
                true
            }
            _ => false,
        }
    }

    /// Next member ready to run.
    pub fn next_ready(&mut self) -> Option<ServiceId> {
        self.queue.pop_front()
    }

    pub fn mark_running(&mut self, id: ServiceId) {
        if let Some(metrics) = self.metrics.get_mut(&id) {
            metrics.start_time = Some(Instant::now());
            metrics.status = MemberStatus::Running;
        }
    }

    /// Records a member's outcome and activates matching edges.
    ///
    /// Returns the members newly queued.
    pub fn mark_completed(&mut self, id: ServiceId, success: bool) -> Vec<ServiceId> {
        if let Some(metrics) = self.metrics.get_mut(&id) {
            let now = Instant::now();
            metrics.end_time = Some(now);
            if let Some(start) = metrics.start_time {
                metrics.duration_ms = Some(start.elapsed().as_millis());
            }
            metrics.status = if success {
                MemberStatus::Succeeded
            } else {
                MemberStatus::Failed
            };
        }

        let outcome = if success {
            EdgeKind::Success
        } else {
            EdgeKind::Failure
        };
        let destinations: Vec<ServiceId> = self
            .spec
            .edges
            .iter()
            .filter(|e| e.source == id && e.subtype == outcome)
            .map(|e| e.destination)
            .collect();

        if !success && destinations.is_empty() {
            self.unhandled_failures.push(id);
        }

        let queued: Vec<ServiceId> = destinations
            .into_iter()
            .filter(|destination| self.enqueue(*destination))
            .collect();
        debug!("Member {} done (success: {}), queued {:?}", id, success, queued);
        queued
    }

    /// True while members are queued.
    pub fn has_work_remaining(&self) -> bool {
        !self.queue.is_empty()
    }

    /// A workflow succeeds when every failure was routed along a failure edge.
    pub fn succeeded(&self) -> bool {
        self.unhandled_failures.is_empty()
    }

    pub fn unhandled_failures(&self) -> &[ServiceId] {
        &self.unhandled_failures
    }

    /// Returns the progress as (finished, total).
    pub fn progress(&self) -> (usize, usize) {
        let done = self
            .metrics
            .values()
            .filter(|m| matches!(m.status, MemberStatus::Succeeded | MemberStatus::Failed))
            .count();
        (done, self.metrics.len())
    }

    pub fn get_metrics(&self) -> &HashMap<ServiceId, MemberMetrics> {
        &self.metrics
    }
}
