//! FleetRunner - Network Automation Job Engine
//!
//! Runs declarative services (single jobs or workflows of jobs) against
//! fleets of network devices, with retries, validation, cooperative
//! cancellation and a persisted record of every run.
//!
//! # Architecture
//!
//! - [`workflow`]: Service and workflow definitions, fleet parsing, traversal planning
//! - [`inventory`]: Devices, pools, users and credentials
//! - [`execution`]: Engine, execution contexts, worker pool and job kinds
//! - [`run`]: Job Records, persistence and the run lifecycle
//! - [`state`]: Per-run live state, local or shared
//! - [`connection`]: Per-run device connection cache
//! - [`expression`]: Sandboxed user expressions
//! - [`logs`]: Run-scoped logging with severity ladder
//! - [`monitoring`]: Execution timeline
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use fleetrunner::execution::{Engine, SubmitRequest};
//! use fleetrunner::inventory::MemoryInventory;
//! use fleetrunner::run::MemoryRepository;
//! use fleetrunner::settings::Settings;
//! use fleetrunner::load_fleet;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let fleet = load_fleet("fleet.yaml")?;
//!     let inventory = Arc::new(MemoryInventory::from_fleet(fleet));
//!     let engine = Engine::new(inventory, Arc::new(MemoryRepository::new()), Settings::default());
//!
//!     let submission = engine.submit(SubmitRequest::new(1).asynchronous())?;
//!     engine.request_stop(submission.runtime())?;
//!     Ok(())
//! }
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod connection;
pub mod error;
pub mod execution;
pub mod expression;
pub mod inventory;
pub mod logs;
pub mod monitoring;
pub mod run;
pub mod settings;
pub mod state;
pub mod workflow;

#[cfg(test)]
mod test_support;

// Re-export commonly used types
pub use error::{EngineError, Result};
pub use execution::{Engine, Submission, SubmitRequest};
pub use run::{JobRecord, RunStatus};
pub use workflow::model::Service;
pub use workflow::parser::load_fleet;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "FleetRunner";

/// Locks a mutex, recovering the data if a panicking thread poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_library_version() {
        assert!(!VERSION.is_empty());
        assert!(VERSION.contains('.'));
    }

    #[test]
    fn test_app_name() {
        assert_eq!(APP_NAME, "FleetRunner");
    }

    #[test]
    fn test_module_exports_service() {
        let service = Service::new(1, "backup", "command");
        assert_eq!(service.name, "backup");
        assert_eq!(service.kind, "command");
    }

    #[test]
    fn test_lock_recovers_poisoned_mutex() {
        let shared = Arc::new(Mutex::new(1));
        let poisoner = Arc::clone(&shared);
        let _ = thread::spawn(move || {
            let _guard = poisoner.lock().unwrap();
            panic!("poison");
        })
        .join();

        assert!(shared.is_poisoned());
        *lock(&shared) += 1;
        assert_eq!(*lock(&shared), 2);
    }

    #[test]
    fn test_version_format() {
        let parts: Vec<&str> = VERSION.split('.').collect();
        assert!(parts.len() >= 2, "Version should have at least major.minor");
        for part in parts {
            assert!(part.parse::<u32>().is_ok(), "Version components should be numeric");
        }
    }
}
