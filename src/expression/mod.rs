//! User Expressions
//!
//! Device queries, skip queries, iteration values, hooks, validation
//! sections and `{{ }}` substitutions are all written in rhai and run in
//! a sandbox:
//! - No module loading
//! - Forbidden functions rejected before evaluation
//! - Operation and call-depth limits from settings
//!
//! Scripts reach the run payload through `get_var` / `set_var` and write
//! user logs through `log(severity, message)`.

pub mod engine;

pub use engine::{
    is_truthy, set_payload_variable, ExpressionEngine, Helpers, LogHook, ScriptOutcome,
    SharedPayload,
};
