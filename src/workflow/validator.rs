//! Fleet Validation
//!
//! Checks a fleet definition before anything runs:
//! - Unique ids and names
//! - Reference integrity (targets, pool members, workflow members, edges)
//! - Workflows are acyclic

use std::collections::{HashMap, HashSet, VecDeque};

use log::{debug, info, warn};

use super::model::{Service, WorkflowSpec};
use super::parser::FleetDefinition;
use crate::inventory::ServiceId;

/// Validation error types for user-friendly error messages.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    EmptyName { kind: &'static str, id: u64 },
    DuplicateId { kind: &'static str, id: u64 },
    DuplicateName { kind: &'static str, name: String },
    InvalidReference { owner: String, kind: &'static str, reference: u64 },
    EmptyWorkflow(String),
    StartServiceNotMember { workflow: String, service: ServiceId },
    EdgeOutsideWorkflow { workflow: String, service: ServiceId },
    SelfContaining(String),
    CyclicWorkflow(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyName { kind, id } => write!(f, "{} {} has an empty name", kind, id),
            Self::DuplicateId { kind, id } => write!(f, "Duplicate {} id: {}", kind, id),
            Self::DuplicateName { kind, name } => {
                write!(f, "Duplicate {} name: '{}'", kind, name)
            }
            Self::InvalidReference {
                owner,
                kind,
                reference,
            } => write!(f, "'{}' references unknown {} {}", owner, kind, reference),
            Self::EmptyWorkflow(name) => write!(f, "Workflow '{}' has no services", name),
            Self::StartServiceNotMember { workflow, service } => write!(
                f,
                "Workflow '{}': start service {} is not a member",
                workflow, service
            ),
            Self::EdgeOutsideWorkflow { workflow, service } => write!(
                f,
                "Workflow '{}': edge endpoint {} is not a member",
                workflow, service
            ),
            Self::SelfContaining(name) => write!(f, "Workflow '{}' contains itself", name),
            Self::CyclicWorkflow(name) => write!(
                f,
                "Workflow '{}' contains a cycle (services lead back to each other)",
                name
            ),
        }
    }
}

fn check_unique<'a>(
    kind: &'static str,
    records: impl Iterator<Item = (u64, &'a str)>,
    errors: &mut Vec<ValidationError>,
) -> HashSet<u64> {
    let mut ids = HashSet::new();
    let mut names = HashSet::new();
    for (id, name) in records {
        if name.trim().is_empty() {
            errors.push(ValidationError::EmptyName { kind, id });
        }
        if !ids.insert(id) {
            errors.push(ValidationError::DuplicateId { kind, id });
        }
        if !name.is_empty() && !names.insert(name) {
            errors.push(ValidationError::DuplicateName {
                kind,
                name: name.to_string(),
            });
        }
    }
    ids
}

/// Validates a workflow's members and edges.
fn validate_workflow(
    service: &Service,
    spec: &WorkflowSpec,
    service_ids: &HashSet<u64>,
) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if spec.services.is_empty() {
        errors.push(ValidationError::EmptyWorkflow(service.name.clone()));
        return errors;
    }

    if spec.services.contains(&service.id) {
        errors.push(ValidationError::SelfContaining(service.name.clone()));
    }

    let members: HashSet<ServiceId> = spec.services.iter().copied().collect();
    for member in &spec.services {
        if !service_ids.contains(member) {
            errors.push(ValidationError::InvalidReference {
                owner: service.name.clone(),
                kind: "service",
                reference: *member,
            });
        }
    }

    for start in &spec.start_services {
        if !members.contains(start) {
            errors.push(ValidationError::StartServiceNotMember {
                workflow: service.name.clone(),
                service: *start,
            });
        }
    }

    for edge in &spec.edges {
        for endpoint in [edge.source, edge.destination] {
            if !members.contains(&endpoint) {
                errors.push(ValidationError::EdgeOutsideWorkflow {
                    workflow: service.name.clone(),
                    service: endpoint,
                });
            }
        }
    }

    if errors.is_empty() && topological_order(spec).is_none() {
        errors.push(ValidationError::CyclicWorkflow(service.name.clone()));
    }

    if spec.start_services.is_empty() {
        debug!(
            "Workflow '{}' has no start services, roots will be used",
            service.name
        );
    }

    errors
}

/// Orders workflow members with Kahn's algorithm.
///
/// Returns `None` when the edges contain a cycle.
pub fn topological_order(spec: &WorkflowSpec) -> Option<Vec<ServiceId>> {
    let mut in_degree: HashMap<ServiceId, usize> =
        spec.services.iter().map(|id| (*id, 0)).collect();
    for edge in &spec.edges {
        if let Some(degree) = in_degree.get_mut(&edge.destination) {
            *degree += 1;
        }
    }

    let mut queue: VecDeque<ServiceId> = spec
        .services
        .iter()
        .filter(|id| in_degree.get(id) == Some(&0))
        .copied()
        .collect();

    let mut sorted_order = Vec::new();
    while let Some(current) = queue.pop_front() {
        sorted_order.push(current);
        for edge in spec.edges.iter().filter(|e| e.source == current) {
            if let Some(degree) = in_degree.get_mut(&edge.destination) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(edge.destination);
                }
            }
        }
    }

    if sorted_order.len() == in_degree.len() {
        Some(sorted_order)
    } else {
        None
    }
}

/// Validates the entire fleet definition.
///
/// Performs the following checks:
/// 1. Devices, pools and services have unique ids and names
/// 2. Service targets and pool members point to known devices/pools
/// 3. Workflow members, start services and edges are consistent
/// 4. Workflows are acyclic
pub fn validate_fleet(fleet: &FleetDefinition) -> Result<(), String> {
    info!(
        "Validating fleet: {} devices, {} pools, {} services",
        fleet.devices.len(),
        fleet.pools.len(),
        fleet.services.len()
    );

    let mut errors = Vec::new();

    let device_ids = check_unique(
        "device",
        fleet.devices.iter().map(|d| (d.id, d.name.as_str())),
        &mut errors,
    );
    let pool_ids = check_unique(
        "pool",
        fleet.pools.iter().map(|p| (p.id, p.name.as_str())),
        &mut errors,
    );
    let service_ids = check_unique(
        "service",
        fleet.services.iter().map(|s| (s.id, s.name.as_str())),
        &mut errors,
    );

    for pool in &fleet.pools {
        for device in &pool.devices {
            if !device_ids.contains(device) {
                errors.push(ValidationError::InvalidReference {
                    owner: pool.name.clone(),
                    kind: "device",
                    reference: *device,
                });
            }
        }
    }

    for service in &fleet.services {
        for device in &service.target_devices {
            if !device_ids.contains(device) {
                errors.push(ValidationError::InvalidReference {
                    owner: service.name.clone(),
                    kind: "device",
                    reference: *device,
                });
            }
        }
        for pool in &service.target_pools {
            if !pool_ids.contains(pool) {
                errors.push(ValidationError::InvalidReference {
                    owner: service.name.clone(),
                    kind: "pool",
                    reference: *pool,
                });
            }
        }
        if let Some(spec) = &service.workflow {
            errors.extend(validate_workflow(service, spec, &service_ids));
        } else if service.kind == "workflow" {
            warn!("Service '{}' has type workflow but no members", service.name);
            errors.push(ValidationError::EmptyWorkflow(service.name.clone()));
        }
    }

    if !errors.is_empty() {
        let error_messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        return Err(error_messages.join("\n"));
    }

    info!("Fleet validated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::{Device, Pool};
    use crate::workflow::model::{Edge, EdgeKind};

    fn fleet() -> FleetDefinition {
        FleetDefinition {
            devices: vec![Device::new(1, "r1", "10.0.0.1"), Device::new(2, "r2", "10.0.0.2")],
            pools: vec![Pool {
                id: 1,
                name: "all".into(),
                devices: vec![1, 2],
            }],
            services: vec![
                Service::new(1, "a", "command").with_devices(&[1]),
                Service::new(2, "b", "command").with_pools(&[1]),
                Service::new(3, "wf", "workflow").with_workflow(WorkflowSpec {
                    services: vec![1, 2],
                    edges: vec![Edge::new(1, 2, EdgeKind::Success)],
                    start_services: vec![1],
                    ..WorkflowSpec::default()
                }),
            ],
            ..FleetDefinition::default()
        }
    }

    #[test]
    fn test_valid_fleet() {
        assert!(validate_fleet(&fleet()).is_ok());
    }

    #[test]
    fn test_duplicate_service_id() {
        let mut fleet = fleet();
        fleet.services.push(Service::new(1, "again", "command"));
        let err = validate_fleet(&fleet).unwrap_err();
        assert!(err.contains("Duplicate service id: 1"));
    }

    #[test]
    fn test_duplicate_device_name() {
        let mut fleet = fleet();
        fleet.devices.push(Device::new(3, "r1", "10.0.0.3"));
        let err = validate_fleet(&fleet).unwrap_err();
        assert!(err.contains("Duplicate device name: 'r1'"));
    }

    #[test]
    fn test_unknown_target() {
        let mut fleet = fleet();
        fleet.services[0].target_devices.push(42);
        let err = validate_fleet(&fleet).unwrap_err();
        assert!(err.contains("'a' references unknown device 42"));
    }

    #[test]
    fn test_edge_outside_workflow() {
        let mut fleet = fleet();
        if let Some(spec) = fleet.services[2].workflow.as_mut() {
            spec.edges.push(Edge::new(2, 7, EdgeKind::Failure));
        }
        let err = validate_fleet(&fleet).unwrap_err();
        assert!(err.contains("edge endpoint 7 is not a member"));
    }

    #[test]
    fn test_cyclic_workflow() {
        let mut fleet = fleet();
        if let Some(spec) = fleet.services[2].workflow.as_mut() {
            spec.edges.push(Edge::new(2, 1, EdgeKind::Failure));
        }
        let err = validate_fleet(&fleet).unwrap_err();
        assert!(err.contains("contains a cycle"));
    }

    #[test]
    fn test_topological_order() {
        let spec = WorkflowSpec {
            services: vec![3, 2, 1],
            edges: vec![
                Edge::new(1, 2, EdgeKind::Success),
                Edge::new(2, 3, EdgeKind::Failure),
            ],
            ..WorkflowSpec::default()
        };
        assert_eq!(topological_order(&spec), Some(vec![1, 2, 3]));
    }

    #[test]
    fn test_workflow_type_without_members() {
        let mut fleet = fleet();
        fleet.services.push(Service::new(4, "empty", "workflow"));
        assert!(validate_fleet(&fleet).is_err());
    }
}
