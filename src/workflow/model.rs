//! Service Data Model
//!
//! Declarative service definitions: a single action run against devices,
//! or a workflow composing other services along success/failure edges.
//!
//! # Example YAML Format
//!
//! ```yaml
//! services:
//!   - id: 1
//!     name: show_version
//!     type: command
//!     command: show version
//!     target_pools: [10]
//!     number_of_retries: 2
//!     time_between_retries: 5
//!     validation_condition: success
//!     content_match: "Version"
//!
//!   - id: 2
//!     name: audit
//!     type: workflow
//!     run_method: once
//!     target_devices: [1, 2]
//!     workflow:
//!       services: [1, 3]
//!       start_services: [1]
//!       edges:
//!         - { source: 1, destination: 3, subtype: success }
//! ```

use std::collections::HashMap;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::connection::Protocol;
use crate::inventory::{DeviceId, PoolId, ServiceId};

/// Whether a service runs once per device or once overall.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMethod {
    #[default]
    PerDevice,
    Once,
}

/// Outcome recorded for a skipped device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipValue {
    #[default]
    Success,
    Failure,
    /// No result at all
    Discard,
}

impl SkipValue {
    pub fn as_str(self) -> &'static str {
        match self {
            SkipValue::Success => "success",
            SkipValue::Failure => "failure",
            SkipValue::Discard => "discard",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversionMethod {
    #[default]
    None,
    Text,
    Json,
    Xml,
}

impl ConversionMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            ConversionMethod::None => "none",
            ConversionMethod::Text => "text",
            ConversionMethod::Json => "json",
            ConversionMethod::Xml => "xml",
        }
    }
}

/// When validation applies, relative to the job outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationCondition {
    #[default]
    None,
    Always,
    Success,
    Failure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationMethod {
    #[default]
    Text,
    DictEqual,
    DictIncluded,
}

/// When postprocessing runs, relative to the job outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostprocessingMode {
    Always,
    #[default]
    Success,
    Failure,
}

impl PostprocessingMode {
    pub fn applies(self, success: bool) -> bool {
        match self {
            PostprocessingMode::Always => true,
            PostprocessingMode::Success => success,
            PostprocessingMode::Failure => !success,
        }
    }
}

impl ValidationCondition {
    pub fn applies(self, success: bool) -> bool {
        match self {
            ValidationCondition::None => false,
            ValidationCondition::Always => true,
            ValidationCondition::Success => success,
            ValidationCondition::Failure => !success,
        }
    }
}

/// How workflow members pick their targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowRunMethod {
    /// Members run against the workflow's targets (or the current device)
    #[default]
    PerServiceWithWorkflowTargets,
    /// Members resolve their own targets
    PerServiceWithServiceTargets,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    #[default]
    Success,
    Failure,
}

/// A transition between two workflow members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub source: ServiceId,
    pub destination: ServiceId,
    #[serde(default)]
    pub subtype: EdgeKind,
}

impl Edge {
    pub fn new(source: ServiceId, destination: ServiceId, subtype: EdgeKind) -> Self {
        Self {
            source,
            destination,
            subtype,
        }
    }
}

/// Members and edges of a workflow service.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowSpec {
    #[serde(deserialize_with = "single_or_vec")]
    pub services: Vec<ServiceId>,
    pub edges: Vec<Edge>,
    /// Entry points. Empty means every member without incoming edges.
    #[serde(deserialize_with = "single_or_vec")]
    pub start_services: Vec<ServiceId>,
    pub run_method: WorkflowRunMethod,
}

/// A declarative service.
///
/// Every field has a default so definitions only state what differs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Service {
    pub id: ServiceId,
    pub name: String,
    /// Job kind, resolved through the job registry
    #[serde(rename = "type")]
    pub kind: String,
    pub description: String,
    /// Disabled services cannot be triggered
    pub disabled: bool,

    // Targets
    #[serde(deserialize_with = "single_or_vec")]
    pub target_devices: Vec<DeviceId>,
    #[serde(deserialize_with = "single_or_vec")]
    pub target_pools: Vec<PoolId>,
    /// Expression producing device property values
    pub device_query: String,
    pub device_query_property: String,

    // Execution
    pub run_method: RunMethod,
    pub multiprocessing: bool,
    pub max_processes: usize,
    pub dry_run: bool,
    /// Seconds slept after each device job
    pub waiting_time: u64,
    pub high_performance: bool,
    pub disable_result_creation: bool,

    // Retries
    pub number_of_retries: u32,
    /// Seconds between two failed attempts
    pub time_between_retries: u64,
    pub max_number_of_retries: u32,

    // Skip
    /// Skip flags keyed by the name of the enclosing workflow
    pub skip: HashMap<String, bool>,
    pub skip_query: String,
    pub skip_value: SkipValue,

    // Iteration
    pub iteration_devices: String,
    pub iteration_devices_property: String,
    pub iteration_values: String,
    pub iteration_variable_name: String,

    // Hooks
    pub preprocessing: String,
    pub postprocessing: String,
    pub postprocessing_mode: PostprocessingMode,

    // Conversion and validation
    pub conversion_method: ConversionMethod,
    pub validation_condition: ValidationCondition,
    pub validation_method: ValidationMethod,
    pub validation_section: String,
    pub content_match: String,
    pub content_match_regex: bool,
    pub delete_spaces_before_matching: bool,
    pub dict_match: Value,
    pub negative_logic: bool,

    // Logging
    pub log_level: i32,
    pub show_user_logs: bool,

    // Connection
    pub protocol: Protocol,
    pub connection_name: String,
    pub start_new_connection: bool,
    pub close_connection: bool,

    // Job bodies
    pub command: String,
    pub script: String,
    pub report: String,

    pub workflow: Option<WorkflowSpec>,
}

impl Default for Service {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            kind: "command".to_string(),
            description: String::new(),
            disabled: false,
            target_devices: Vec::new(),
            target_pools: Vec::new(),
            device_query: String::new(),
            device_query_property: "ip_address".to_string(),
            run_method: RunMethod::PerDevice,
            multiprocessing: false,
            max_processes: 5,
            dry_run: false,
            waiting_time: 0,
            high_performance: false,
            disable_result_creation: false,
            number_of_retries: 0,
            time_between_retries: 10,
            max_number_of_retries: 100,
            skip: HashMap::new(),
            skip_query: String::new(),
            skip_value: SkipValue::Success,
            iteration_devices: String::new(),
            iteration_devices_property: "ip_address".to_string(),
            iteration_values: String::new(),
            iteration_variable_name: "iteration_value".to_string(),
            preprocessing: String::new(),
            postprocessing: String::new(),
            postprocessing_mode: PostprocessingMode::Success,
            conversion_method: ConversionMethod::None,
            validation_condition: ValidationCondition::None,
            validation_method: ValidationMethod::Text,
            validation_section: "results[\"result\"]".to_string(),
            content_match: String::new(),
            content_match_regex: false,
            delete_spaces_before_matching: false,
            dict_match: Value::Object(Map::new()),
            negative_logic: false,
            log_level: 1,
            show_user_logs: true,
            protocol: Protocol::Cli,
            connection_name: "default".to_string(),
            start_new_connection: false,
            close_connection: false,
            command: String::new(),
            script: String::new(),
            report: String::new(),
            workflow: None,
        }
    }
}

impl Service {
    /// Creates a service of the given job kind with default options.
    ///
    /// # Example
    ///
    /// ```
    /// use fleetrunner::workflow::Service;
    ///
    /// let service = Service::new(1, "show_version", "command")
    ///     .with_command("show version")
    ///     .with_devices(&[1, 2])
    ///     .with_retries(2, 0);
    /// assert_eq!(service.number_of_retries, 2);
    /// ```
    pub fn new(id: ServiceId, name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into().trim().to_string(),
            kind: kind.into().trim().to_string(),
            ..Self::default()
        }
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = command.into();
        self
    }

    pub fn with_script(mut self, script: impl Into<String>) -> Self {
        self.script = script.into();
        self
    }

    pub fn with_devices(mut self, devices: &[DeviceId]) -> Self {
        self.target_devices = devices.to_vec();
        self
    }

    pub fn with_pools(mut self, pools: &[PoolId]) -> Self {
        self.target_pools = pools.to_vec();
        self
    }

    pub fn with_retries(mut self, number: u32, seconds_between: u64) -> Self {
        self.number_of_retries = number;
        self.time_between_retries = seconds_between;
        self
    }

    pub fn with_run_method(mut self, run_method: RunMethod) -> Self {
        self.run_method = run_method;
        self
    }

    pub fn with_workflow(mut self, workflow: WorkflowSpec) -> Self {
        self.kind = "workflow".to_string();
        self.workflow = Some(workflow);
        self
    }

    pub fn is_workflow(&self) -> bool {
        self.workflow.is_some()
    }

    /// Member ids, empty for non-workflow services.
    pub fn members(&self) -> &[ServiceId] {
        self.workflow
            .as_ref()
            .map(|w| w.services.as_slice())
            .unwrap_or(&[])
    }

    /// Serializable view stored on the top-level run result.
    pub fn properties(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Deserializes either a single id or an array of ids into Vec<u64>.
fn single_or_vec<'de, D>(deserializer: D) -> Result<Vec<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    match val {
        Value::Null => Ok(Vec::new()),
        Value::Number(n) => n
            .as_u64()
            .map(|id| vec![id])
            .ok_or_else(|| de::Error::custom("Expected a positive integer id")),
        Value::Array(arr) => arr
            .into_iter()
            .map(|v| {
                v.as_u64()
                    .ok_or_else(|| de::Error::custom("Expected integer ids in array"))
            })
            .collect(),
        _ => Err(de::Error::custom("Expected an id or array of ids")),
    }
}
