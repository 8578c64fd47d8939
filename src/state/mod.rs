//! Run State Store
//!
//! Live, queryable state of every active run, keyed by runtime:
//! - [`local`]: In-process nested map
//! - [`shared`]: Flat key/value store reachable by other processes
//!
//! State paths are slash-separated and live under `"{runtime}/state"`.
//! The stop flag of a run lives at `"{runtime}/stop"`.

pub mod local;
pub mod shared;

use std::sync::Arc;

use serde_json::{Map, Value};

pub use local::LocalStateBackend;
pub use shared::{KeyValueStore, KvValue, MemoryKeyValueStore, SharedStateBackend};

use crate::error::Result;

/// How a value is written into the state store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Set,
    Append,
    Increment,
    Delete,
}

/// Storage behind a [`StateStore`].
pub trait StateBackend: Send + Sync {
    fn write(&self, key: &str, value: Value, mode: WriteMode) -> Result<()>;

    /// Writes only when the key is absent. Returns whether it wrote.
    fn set_if_absent(&self, key: &str, value: Value) -> Result<bool>;

    fn get(&self, key: &str) -> Option<Value>;

    /// Nested view of every key under `prefix`; empty object when none.
    fn read(&self, prefix: &str) -> Value;

    /// Removes `prefix` and everything below it.
    fn remove_prefix(&self, prefix: &str);
}

/// Handle on the run state, cheap to clone across workers.
#[derive(Clone)]
pub struct StateStore {
    backend: Arc<dyn StateBackend>,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::local()
    }
}

impl StateStore {
    pub fn new(backend: Arc<dyn StateBackend>) -> Self {
        Self { backend }
    }

    /// Process-local store.
    pub fn local() -> Self {
        Self::new(Arc::new(LocalStateBackend::new()))
    }

    /// Store backed by an external key/value service.
    pub fn shared(store: Arc<dyn KeyValueStore>) -> Self {
        Self::new(Arc::new(SharedStateBackend::new(store)))
    }

    fn state_key(runtime: &str, path: &str) -> String {
        if path.is_empty() {
            format!("{}/state", runtime)
        } else {
            format!("{}/state/{}", runtime, path)
        }
    }

    pub fn write(&self, runtime: &str, path: &str, value: Value, mode: WriteMode) -> Result<()> {
        self.backend
            .write(&Self::state_key(runtime, path), value, mode)
    }

    /// Whole state of a run.
    pub fn read(&self, runtime: &str) -> Value {
        self.backend.read(&Self::state_key(runtime, ""))
    }

    /// State below `path`, or the whole run state when `path` is `None`.
    pub fn read_path(&self, runtime: &str, path: Option<&str>) -> Value {
        match path {
            None => self.read(runtime),
            Some(path) => {
                let key = Self::state_key(runtime, path);
                match self.backend.get(&key) {
                    Some(Value::Object(_)) | None => self.backend.read(&key),
                    Some(value) => value,
                }
            }
        }
    }

    pub fn get(&self, runtime: &str, path: &str) -> Option<Value> {
        self.backend.get(&Self::state_key(runtime, path))
    }

    pub fn request_stop(&self, runtime: &str) -> Result<()> {
        self.backend
            .write(&format!("{}/stop", runtime), Value::Bool(true), WriteMode::Set)
    }

    pub fn stop_requested(&self, runtime: &str) -> bool {
        matches!(
            self.backend.get(&format!("{}/stop", runtime)),
            Some(Value::Bool(true))
        )
    }

    /// Records a success flag. Once false, it stays false.
    pub fn record_success(&self, runtime: &str, path: &str, success: bool) -> Result<()> {
        let key = Self::state_key(runtime, &format!("{}/success", path));
        if success {
            self.backend.set_if_absent(&key, Value::Bool(true)).map(|_| ())
        } else {
            self.backend.write(&key, Value::Bool(false), WriteMode::Set)
        }
    }

    /// Drops every key of a run, stop flag included.
    pub fn clear(&self, runtime: &str) {
        self.backend.remove_prefix(runtime);
    }

    /// Empty state object, used when a run has nothing recorded.
    pub fn empty() -> Value {
        Value::Object(Map::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stores() -> Vec<StateStore> {
        vec![
            StateStore::local(),
            StateStore::shared(Arc::new(MemoryKeyValueStore::new())),
        ]
    }

    #[test]
    fn test_write_and_read_path() {
        for store in stores() {
            store
                .write("rt", "1/progress/device/total", json!(2), WriteMode::Increment)
                .unwrap();
            store.write("rt", "1/status", json!("Running"), WriteMode::Set).unwrap();

            assert_eq!(store.read_path("rt", Some("1/status")), json!("Running"));
            assert_eq!(
                store.read_path("rt", Some("1/progress"))["device"]["total"],
                json!(2)
            );
            assert_eq!(store.read("rt")["1"]["status"], json!("Running"));
        }
    }

    #[test]
    fn test_stop_flag() {
        for store in stores() {
            assert!(!store.stop_requested("rt"));
            store.request_stop("rt").unwrap();
            assert!(store.stop_requested("rt"));
            assert!(!store.stop_requested("rt2"));
        }
    }

    #[test]
    fn test_success_is_monotonic() {
        for store in stores() {
            store.record_success("rt", "1", true).unwrap();
            store.record_success("rt", "1", false).unwrap();
            store.record_success("rt", "1", true).unwrap();
            assert_eq!(store.get("rt", "1/success"), Some(json!(false)));
        }
    }

    #[test]
    fn test_clear_removes_run() {
        for store in stores() {
            store.write("rt", "1/status", json!("Running"), WriteMode::Set).unwrap();
            store.request_stop("rt").unwrap();
            store.clear("rt");
            assert_eq!(store.read("rt"), StateStore::empty());
            assert!(!store.stop_requested("rt"));
        }
    }

    #[test]
    fn test_missing_path_reads_empty() {
        for store in stores() {
            assert_eq!(store.read_path("rt", Some("9")), json!({}));
        }
    }
}
