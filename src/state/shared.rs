//! Shared state backend over a flat key/value store.
//!
//! Keys are slash-separated paths. Scalars are stored as their JSON text so
//! strings survive a round trip, appends go to lists, and reads re-nest
//! every key under the requested prefix.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};

use super::{StateBackend, WriteMode};
use crate::error::{EngineError, Result};
use crate::lock;

/// A stored value in the external store.
#[derive(Debug, Clone, PartialEq)]
pub enum KvValue {
    Scalar(String),
    /// Most recent push first
    List(Vec<String>),
}

/// Minimal contract of an external shared store.
pub trait KeyValueStore: Send + Sync {
    fn set(&self, key: &str, value: String) -> Result<()>;

    /// Sets the key only when it does not exist yet.
    fn set_nx(&self, key: &str, value: String) -> Result<bool>;

    fn get(&self, key: &str) -> Result<Option<KvValue>>;

    /// Atomically adds `delta` to an integer key and returns the new value.
    fn incr_by(&self, key: &str, delta: i64) -> Result<i64>;

    /// Prepends to a list key.
    fn lpush(&self, key: &str, value: String) -> Result<()>;

    fn delete(&self, key: &str) -> Result<()>;

    /// Every key starting with `prefix`.
    fn keys(&self, prefix: &str) -> Result<Vec<String>>;
}

/// In-process [`KeyValueStore`], used where no external store is configured.
#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    data: Mutex<HashMap<String, KvValue>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn set(&self, key: &str, value: String) -> Result<()> {
        lock(&self.data).insert(key.to_string(), KvValue::Scalar(value));
        Ok(())
    }

    fn set_nx(&self, key: &str, value: String) -> Result<bool> {
        let mut data = lock(&self.data);
        if data.contains_key(key) {
            return Ok(false);
        }
        data.insert(key.to_string(), KvValue::Scalar(value));
        Ok(true)
    }

    fn get(&self, key: &str) -> Result<Option<KvValue>> {
        Ok(lock(&self.data).get(key).cloned())
    }

    fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
        let mut data = lock(&self.data);
        let current = match data.get(key) {
            None => 0,
            Some(KvValue::Scalar(text)) => text.parse::<i64>().map_err(|_| {
                EngineError::Persistence(format!("value at '{}' is not an integer", key))
            })?,
            Some(KvValue::List(_)) => {
                return Err(EngineError::Persistence(format!(
                    "value at '{}' is a list",
                    key
                )))
            }
        };
        let total = current + delta;
        data.insert(key.to_string(), KvValue::Scalar(total.to_string()));
        Ok(total)
    }

    fn lpush(&self, key: &str, value: String) -> Result<()> {
        let mut data = lock(&self.data);
        match data.get_mut(key) {
            Some(KvValue::List(items)) => items.insert(0, value),
            Some(KvValue::Scalar(_)) => {
                return Err(EngineError::Persistence(format!(
                    "value at '{}' is not a list",
                    key
                )))
            }
            None => {
                data.insert(key.to_string(), KvValue::List(vec![value]));
            }
        }
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        lock(&self.data).remove(key);
        Ok(())
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = lock(&self.data)
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

fn encode(value: &Value) -> String {
    value.to_string()
}

/// Integer counters are written by the store itself as plain digits, which
/// is also their JSON text. Anything unparsable is kept as a raw string.
fn decode_scalar(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

/// Inserts `value` at the slash-split `parts` path, replacing scalars that
/// sit where an object is needed.
fn insert_path(map: &mut Map<String, Value>, parts: &[&str], value: Value) {
    match parts {
        [] => {}
        [last] => {
            map.insert(last.to_string(), value);
        }
        [first, rest @ ..] => {
            let entry = map
                .entry(first.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            if let Value::Object(child) = entry {
                insert_path(child, rest, value);
            }
        }
    }
}

fn decode(value: KvValue) -> Value {
    match value {
        KvValue::Scalar(text) => decode_scalar(&text),
        KvValue::List(items) => Value::Array(items.iter().rev().map(|i| decode_scalar(i)).collect()),
    }
}

/// State backend writing through a [`KeyValueStore`].
#[derive(Clone)]
pub struct SharedStateBackend {
    store: Arc<dyn KeyValueStore>,
}

impl SharedStateBackend {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }
}

impl StateBackend for SharedStateBackend {
    fn write(&self, key: &str, value: Value, mode: WriteMode) -> Result<()> {
        match mode {
            WriteMode::Set => self.store.set(key, encode(&value)),
            WriteMode::Append => self.store.lpush(key, encode(&value)),
            WriteMode::Delete => self.store.delete(key),
            WriteMode::Increment => {
                let delta = value.as_i64().ok_or_else(|| {
                    EngineError::Persistence(format!(
                        "shared store only increments by integers, got {}",
                        value
                    ))
                })?;
                self.store.incr_by(key, delta).map(|_| ())
            }
        }
    }

    fn set_if_absent(&self, key: &str, value: Value) -> Result<bool> {
        self.store.set_nx(key, encode(&value))
    }

    fn get(&self, key: &str) -> Option<Value> {
        self.store.get(key).ok().flatten().map(decode)
    }

    fn read(&self, prefix: &str) -> Value {
        let mut state = Map::new();
        let scan = format!("{}/", prefix);
        let keys = match self.store.keys(&scan) {
            Ok(keys) => keys,
            Err(e) => {
                log::warn!("State scan of '{}' failed: {}", prefix, e);
                return Value::Object(state);
            }
        };

        for key in keys {
            let Some(value) = self.get(&key) else { continue };
            let parts: Vec<&str> = key[scan.len()..].split('/').collect();
            insert_path(&mut state, &parts, value);
        }
        Value::Object(state)
    }

    fn remove_prefix(&self, prefix: &str) {
        let scan = format!("{}/", prefix);
        match self.store.keys(&scan) {
            Ok(keys) => {
                for key in keys {
                    if let Err(e) = self.store.delete(&key) {
                        log::warn!("Failed to delete state key '{}': {}", key, e);
                    }
                }
            }
            Err(e) => log::warn!("State scan of '{}' failed: {}", prefix, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn backend() -> SharedStateBackend {
        SharedStateBackend::new(Arc::new(MemoryKeyValueStore::new()))
    }

    #[test]
    fn test_decode_scalars() {
        assert_eq!(decode_scalar("true"), json!(true));
        assert_eq!(decode_scalar("12"), json!(12));
        assert_eq!(decode_scalar("1.5"), json!(1.5));
        assert_eq!(decode_scalar("\"Running\""), json!("Running"));
        assert_eq!(decode_scalar("Running"), json!("Running"));
        assert_eq!(decode_scalar("{\"a\": 1}"), json!({"a": 1}));
    }

    #[test]
    fn test_strings_that_look_like_other_types_survive() {
        let backend = backend();
        for text in ["True", "12", "[1]", "null"] {
            backend.write("rt/state/note", json!(text), WriteMode::Set).unwrap();
            assert_eq!(backend.get("rt/state/note"), Some(json!(text)));
        }
        backend.write("rt/state/flag", json!(true), WriteMode::Set).unwrap();
        assert_eq!(backend.get("rt/state/flag"), Some(json!(true)));
    }

    #[test]
    fn test_read_replaces_scalar_with_nested_object() {
        let backend = backend();
        backend.write("rt/state/1", json!("x"), WriteMode::Set).unwrap();
        backend.write("rt/state/1/success", json!(false), WriteMode::Set).unwrap();

        let state = backend.read("rt/state");
        assert_eq!(state["1"]["success"], json!(false));
    }

    #[test]
    fn test_read_renests_keys() {
        let backend = backend();
        backend.write("rt/state/1/success", json!(true), WriteMode::Set).unwrap();
        backend.write("rt/state/1/progress/device/total", json!(2), WriteMode::Increment).unwrap();
        backend.write("rt/state/1/progress/device/total", json!(1), WriteMode::Increment).unwrap();
        backend.write("rt/state/memory_size", json!(120), WriteMode::Increment).unwrap();

        let state = backend.read("rt/state");
        assert_eq!(state["1"]["success"], json!(true));
        assert_eq!(state["1"]["progress"]["device"]["total"], json!(3));
        assert_eq!(state["memory_size"], json!(120));
    }

    #[test]
    fn test_append_keeps_insertion_order() {
        let backend = backend();
        backend.write("rt/state/notes", json!("first"), WriteMode::Append).unwrap();
        backend.write("rt/state/notes", json!("second"), WriteMode::Append).unwrap();
        assert_eq!(backend.get("rt/state/notes"), Some(json!(["first", "second"])));
    }

    #[test]
    fn test_float_increment_rejected() {
        let backend = backend();
        assert!(backend.write("rt/x", json!(0.5), WriteMode::Increment).is_err());
    }

    #[test]
    fn test_remove_prefix_only_touches_own_keys() {
        let backend = backend();
        backend.write("rt1/state/a", json!(1), WriteMode::Set).unwrap();
        backend.write("rt1/stop", json!(true), WriteMode::Set).unwrap();
        backend.write("rt10/state/a", json!(1), WriteMode::Set).unwrap();

        backend.remove_prefix("rt1");
        assert!(backend.get("rt1/state/a").is_none());
        assert!(backend.get("rt1/stop").is_none());
        assert_eq!(backend.get("rt10/state/a"), Some(json!(1)));
    }

    #[test]
    fn test_set_if_absent() {
        let backend = backend();
        assert!(backend.set_if_absent("rt/state/success", json!(true)).unwrap());
        assert!(!backend.set_if_absent("rt/state/success", json!(false)).unwrap());
        assert_eq!(backend.get("rt/state/success"), Some(json!(true)));
    }

    #[test]
    fn test_incr_on_list_fails() {
        let store = MemoryKeyValueStore::new();
        store.lpush("k", "a".into()).unwrap();
        assert!(store.incr_by("k", 1).is_err());
    }
}
