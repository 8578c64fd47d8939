//! Run Monitoring
//!
//! - [`ExecutionTimeline`]: Start/end timing of each device job, kept with
//!   the run state and rendered as a Gantt chart by the CLI

pub mod timeline;

pub use timeline::{EventType, ExecutionTimeline, TimelineEvent};
