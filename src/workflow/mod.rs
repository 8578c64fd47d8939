//! Service Definition Module
//!
//! Data structures and utilities for defining, parsing and validating
//! services and workflows.
//!
//! # Structure
//!
//! - [`model`]: Core data structures (Service, WorkflowSpec, Edge)
//! - [`parser`]: YAML fleet parsing and loading
//! - [`validator`]: Reference and cycle checks
//! - [`planner`]: Workflow traversal along success/failure edges

pub mod model;
pub mod parser;
pub mod planner;
pub mod validator;

pub use model::{
    ConversionMethod, Edge, EdgeKind, PostprocessingMode, RunMethod, Service, SkipValue,
    ValidationCondition, ValidationMethod, WorkflowRunMethod, WorkflowSpec,
};
pub use parser::{load_fleet, parse_fleet, FleetDefinition};
pub use planner::{MemberStatus, WorkflowPlanner};
