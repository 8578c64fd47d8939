//! Run Module
//!
//! Job Records, their persisted rows and the run lifecycle.
//!
//! - [`record`]: Job Record, Device Result, log, report and change rows
//! - [`repository`]: Persistence trait and in-memory implementation
//! - [`lifecycle`]: Execution, finalization and crash recovery

pub mod lifecycle;
pub mod record;
pub mod repository;

pub use lifecycle::{execute_run, finalize_run, recover_interrupted};
pub use record::{
    format_duration, generate_runtime, progress_text, ChangeRecord, DeviceResult, JobRecord,
    ResultMap, RunStatus, ServiceLogEntry, ServiceReport,
};
pub use repository::{MemoryRepository, RunRepository};
