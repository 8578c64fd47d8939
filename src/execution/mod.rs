//! Job Execution Module
//!
//! Runs services against their device targets.
//!
//! # Architecture
//!
//! - [`engine`]: Trigger surface (submit, stop, state queries)
//! - [`scope`]: State shared by every context of one run
//! - [`runner`]: Execution context of one service
//! - [`targets`]: Target resolution and authorization
//! - [`retry`]: Job attempts, conversion and validation
//! - [`fanout`]: Bounded worker pool for per-device jobs
//! - [`workflow`]: Workflow traversal along success/failure edges
//! - [`job`]: The [`ServiceJob`] trait and built-in job kinds

pub mod engine;
pub mod fanout;
pub mod job;
pub mod retry;
pub mod runner;
pub mod scope;
pub mod targets;
pub mod workflow;

pub use engine::{Engine, Restart, RestartTargets, Submission, SubmitRequest};
pub use job::{JobRegistry, ServiceJob};
pub use runner::{Runner, RunnerSpec};
pub use scope::{RunScope, TargetSet};
