//! Process-local state backend: one nested JSON map behind a mutex.

use std::sync::Mutex;

use serde_json::{Map, Value};

use super::{StateBackend, WriteMode};
use crate::error::{EngineError, Result};
use crate::lock;

#[derive(Debug, Default)]
pub struct LocalStateBackend {
    root: Mutex<Map<String, Value>>,
}

impl LocalStateBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Walks to the parent map of `key`, creating intermediate maps.
/// Non-map values on the way are replaced.
fn parent_map<'a>(
    root: &'a mut Map<String, Value>,
    parents: &[&str],
) -> Option<&'a mut Map<String, Value>> {
    let mut store = root;
    for part in parents {
        let entry = store
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        store = entry.as_object_mut()?;
    }
    Some(store)
}

fn lookup<'a>(root: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    let mut parts = key.split('/');
    let first = parts.next()?;
    let mut current = root.get(first)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

pub(crate) fn add_numbers(current: Option<&Value>, delta: &Value) -> Result<Value> {
    let current = current.cloned().unwrap_or(Value::from(0));
    match (current.as_i64(), delta.as_i64()) {
        (Some(a), Some(b)) => Ok(Value::from(a + b)),
        _ => match (current.as_f64(), delta.as_f64()) {
            (Some(a), Some(b)) => Ok(Value::from(a + b)),
            _ => Err(EngineError::Persistence(format!(
                "cannot increment {} by {}",
                current, delta
            ))),
        },
    }
}

impl StateBackend for LocalStateBackend {
    fn write(&self, key: &str, value: Value, mode: WriteMode) -> Result<()> {
        let parts: Vec<&str> = key.split('/').collect();
        let Some((last, parents)) = parts.split_last() else {
            return Ok(());
        };

        let mut root = lock(&self.root);
        let Some(store) = parent_map(&mut root, parents) else {
            return Ok(());
        };
        match mode {
            WriteMode::Set => {
                store.insert(last.to_string(), value);
            }
            WriteMode::Increment => {
                let total = add_numbers(store.get(*last), &value)?;
                store.insert(last.to_string(), total);
            }
            WriteMode::Append => {
                let entry = store
                    .entry(last.to_string())
                    .or_insert_with(|| Value::Array(Vec::new()));
                match entry {
                    Value::Array(items) => items.push(value),
                    other => *other = Value::Array(vec![other.clone(), value]),
                }
            }
            WriteMode::Delete => {
                store.remove(*last);
            }
        }
        Ok(())
    }

    fn set_if_absent(&self, key: &str, value: Value) -> Result<bool> {
        let parts: Vec<&str> = key.split('/').collect();
        let Some((last, parents)) = parts.split_last() else {
            return Ok(false);
        };

        let mut root = lock(&self.root);
        let Some(store) = parent_map(&mut root, parents) else {
            return Ok(false);
        };
        if store.contains_key(*last) {
            return Ok(false);
        }
        store.insert(last.to_string(), value);
        Ok(true)
    }

    fn get(&self, key: &str) -> Option<Value> {
        lookup(&lock(&self.root), key).cloned()
    }

    fn read(&self, prefix: &str) -> Value {
        lookup(&lock(&self.root), prefix)
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new()))
    }

    fn remove_prefix(&self, prefix: &str) {
        let parts: Vec<&str> = prefix.split('/').collect();
        let Some((last, parents)) = parts.split_last() else {
            return;
        };
        let mut root = lock(&self.root);
        let mut store = &mut *root;
        for part in parents {
            match store.get_mut(*part) {
                Some(Value::Object(map)) => store = map,
                _ => return,
            }
        }
        store.remove(*last);
    }
}
