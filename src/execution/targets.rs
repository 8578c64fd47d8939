//! Target Resolution
//!
//! Where a context's devices come from, in order of precedence:
//! 1. Restart targets of the main run
//! 2. Parameterized form targets of the main run
//! 3. Targets submitted with the main run
//! 4. The member's own targets, for workflows using service targets
//! 5. Targets handed down by the parent context
//! 6. The service's own targets
//!
//! Every device then passes the creator's authorization filter.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use super::runner::{render, Runner};
use super::scope::TargetSet;
use crate::error::{EngineError, Result};
use crate::inventory::{Device, DeviceId};
use crate::logs::{LogKind, Severity};
use crate::workflow::WorkflowRunMethod;

/// Where a context's explicit targets come from.
enum TargetSource {
    Explicit(TargetSet),
    /// Explicit targets plus the dynamic device query
    Query {
        targets: TargetSet,
        query: String,
        property: String,
    },
}

fn ids_of(value: Option<&Value>) -> Vec<u64> {
    match value {
        Some(Value::Array(items)) => items.iter().filter_map(Value::as_u64).collect(),
        Some(Value::Number(n)) => n.as_u64().into_iter().collect(),
        _ => Vec::new(),
    }
}

impl Runner {
    fn target_source(&self) -> TargetSource {
        let scope = &self.scope;
        if self.spec.is_main_run {
            if let Some(restart) = &scope.restart_targets {
                return TargetSource::Explicit(restart.clone());
            }
            if let Some(form) = &scope.form {
                let keys = ["target_devices", "target_pools", "device_query"];
                if keys.iter().any(|key| form.contains_key(*key)) {
                    return TargetSource::Query {
                        targets: TargetSet::new(
                            ids_of(form.get("target_devices")),
                            ids_of(form.get("target_pools")),
                        ),
                        query: form
                            .get("device_query")
                            .map(render)
                            .unwrap_or_default(),
                        property: form
                            .get("device_query_property")
                            .map(render)
                            .unwrap_or_else(|| self.service.device_query_property.clone()),
                    };
                }
            }
            if !scope.record_targets.is_empty() {
                return TargetSource::Explicit(scope.record_targets.clone());
            }
        }

        let uses_service_targets = self
            .workflow
            .as_ref()
            .and_then(|w| w.workflow.as_ref())
            .map(|w| w.run_method == WorkflowRunMethod::PerServiceWithServiceTargets)
            .unwrap_or(false);
        if !uses_service_targets {
            if let Some(ids) = &self.spec.targets {
                return TargetSource::Explicit(TargetSet::new(ids.clone(), Vec::new()));
            }
        }

        TargetSource::Query {
            targets: TargetSet::new(
                self.service.target_devices.clone(),
                self.service.target_pools.clone(),
            ),
            query: self.service.device_query.clone(),
            property: self.service.device_query_property.clone(),
        }
    }

    /// Resolves, authorizes and sorts the targets of this context.
    pub(crate) fn compute_run_targets(&self) -> Result<Vec<Device>> {
        let inventory = &self.scope.inventory;
        let (targets, query) = match self.target_source() {
            TargetSource::Explicit(targets) => (targets, None),
            TargetSource::Query {
                targets,
                query,
                property,
            } => (targets, Some((query, property))),
        };

        let mut devices: BTreeMap<DeviceId, Device> = BTreeMap::new();
        for id in &targets.devices {
            if let Some(device) = inventory.device(*id) {
                devices.insert(device.id, device);
            }
        }
        for pool in &targets.pools {
            for device in inventory.pool_devices(*pool) {
                devices.insert(device.id, device);
            }
        }
        if let Some((query, property)) = query {
            if !query.trim().is_empty() {
                for device in self.compute_devices_from_query(&query, &property, None)? {
                    devices.insert(device.id, device);
                }
            }
        }

        Ok(self.authorize(devices.into_values().collect()))
    }

    /// Devices whose `property` matches a value produced by `query`.
    ///
    /// Values may also be device objects carrying an `id`. Any value that
    /// matches nothing fails the whole query.
    pub(crate) fn compute_devices_from_query(
        &self,
        query: &str,
        property: &str,
        device: Option<&Device>,
    ) -> Result<Vec<Device>> {
        let values = match self.eval(query, device, Map::new())? {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            Value::String(text) if text.is_empty() => Vec::new(),
            other => vec![other],
        };

        let inventory = &self.scope.inventory;
        let mut found = Vec::new();
        let mut not_found = Vec::new();
        for value in values {
            let matched = match value.get("id").and_then(Value::as_u64) {
                Some(id) if value.is_object() => inventory.device(id),
                _ => inventory.find_device(property, &render(&value)),
            };
            match matched {
                Some(device) => found.push(device),
                None => not_found.push(render(&value)),
            }
        }

        if !not_found.is_empty() {
            return Err(EngineError::InvalidQueryTargets(not_found));
        }
        Ok(found)
    }

    /// Drops devices the creator may not target, logging a security
    /// notice, and orders the rest by name.
    fn authorize(&self, devices: Vec<Device>) -> Vec<Device> {
        let (mut allowed, restricted): (Vec<Device>, Vec<Device>) = devices
            .into_iter()
            .partition(|device| self.scope.allowed_targets.contains(&device.id));

        if !restricted.is_empty() {
            let names: Vec<&str> = restricted.iter().map(|d| d.name.as_str()).collect();
            self.log_kind(
                Severity::Info,
                &format!(
                    "Error 403: User '{}' is not allowed to use these devices as targets: {}",
                    self.scope.creator,
                    names.join(", ")
                ),
                None,
                LogKind::Security,
            );
        }

        allowed.sort_by(|a, b| a.name.cmp(&b.name));
        allowed
    }
}
