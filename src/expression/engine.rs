//! Sandboxed evaluation of user expressions and scripts.

use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use regex::Regex;
use rhai::module_resolvers::DummyModuleResolver;
use rhai::{Dynamic, EvalAltResult, Scope};
use serde_json::{Map, Value};

use crate::error::{EngineError, Result};
use crate::lock;
use crate::settings::ExpressionSettings;

/// Run payload shared by every execution context of a run.
pub type SharedPayload = Arc<Mutex<Value>>;

/// Callback receiving `(severity, message)` from `log(...)` calls.
pub type LogHook = Arc<dyn Fn(&str, &str) + Send + Sync>;

const EARLY_EXIT: &str = "__fleetrunner_early_exit__";

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{(.*?)\}\}").expect("Invalid hardcoded regex pattern for placeholders")
});

static IDENTIFIER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("Invalid hardcoded regex pattern for identifiers")
});

/// Host functions exposed to user code.
#[derive(Clone, Default)]
pub struct Helpers {
    pub payload: SharedPayload,
    pub log: Option<LogHook>,
}

/// Variables left behind by a script.
#[derive(Debug, Clone, Default)]
pub struct ScriptOutcome {
    pub variables: Map<String, Value>,
    /// The script called `early_exit()`
    pub exited: bool,
}

/// A rhai engine with module loading disabled, forbidden functions
/// removed and the payload helpers registered.
pub struct ExpressionEngine {
    engine: rhai::Engine,
    forbidden: Option<Regex>,
}

type RhaiResult<T> = std::result::Result<T, Box<EvalAltResult>>;

fn runtime_error(message: String) -> Box<EvalAltResult> {
    message.into()
}

fn to_json(value: &Dynamic) -> RhaiResult<Value> {
    rhai::serde::from_dynamic::<Value>(value)
}

fn variables_of(payload: &Value) -> Option<&Map<String, Value>> {
    payload.get("variables")?.as_object()
}

/// Replaces non-object values with an empty object.
fn ensure_object(value: &mut Value) -> Option<&mut Map<String, Value>> {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    value.as_object_mut()
}

fn child_object<'a>(map: &'a mut Map<String, Value>, key: &str) -> Option<&'a mut Map<String, Value>> {
    ensure_object(
        map.entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new())),
    )
}

fn store_variable(payload: &mut Value, name: &str, value: Value, device: Option<&str>) -> RhaiResult<()> {
    let variables = ensure_object(payload).and_then(|root| child_object(root, "variables"));
    let target = match device {
        Some(device) => variables
            .and_then(|vars| child_object(vars, "devices"))
            .and_then(|devices| child_object(devices, device)),
        None => variables,
    };
    match target {
        Some(map) => {
            map.insert(name.to_string(), value);
            Ok(())
        }
        None => Err(runtime_error(format!("Payload Editor: cannot store {}", name))),
    }
}

impl ExpressionEngine {
    pub fn new(settings: &ExpressionSettings, helpers: Helpers) -> Self {
        let mut engine = rhai::Engine::new();
        engine.set_module_resolver(DummyModuleResolver::new());
        engine.set_max_operations(settings.max_operations);
        engine.set_max_call_levels(settings.max_call_levels);
        engine.disable_symbol("eval");
        for name in &settings.forbidden_functions {
            engine.disable_symbol(name.as_str());
        }

        let payload = Arc::clone(&helpers.payload);
        engine.register_fn("get_var", move |name: &str| -> RhaiResult<Dynamic> {
            let payload = lock(&payload);
            match variables_of(&payload).and_then(|vars| vars.get(name)) {
                Some(value) => rhai::serde::to_dynamic(value),
                None => Err(runtime_error(format!("Payload Editor: {} not found", name))),
            }
        });

        let payload = Arc::clone(&helpers.payload);
        engine.register_fn(
            "get_var",
            move |name: &str, device: &str| -> RhaiResult<Dynamic> {
                let payload = lock(&payload);
                let value = variables_of(&payload)
                    .and_then(|vars| vars.get("devices"))
                    .and_then(|devices| devices.get(device))
                    .and_then(|vars| vars.get(name));
                match value {
                    Some(value) => rhai::serde::to_dynamic(value),
                    None => Err(runtime_error(format!("Payload Editor: {} not found", name))),
                }
            },
        );

        let payload = Arc::clone(&helpers.payload);
        engine.register_fn(
            "set_var",
            move |name: &str, value: Dynamic| -> RhaiResult<()> {
                let value = to_json(&value)?;
                store_variable(&mut lock(&payload), name, value, None)
            },
        );

        let payload = Arc::clone(&helpers.payload);
        engine.register_fn(
            "set_var",
            move |name: &str, value: Dynamic, device: &str| -> RhaiResult<()> {
                let value = to_json(&value)?;
                store_variable(&mut lock(&payload), name, value, Some(device))
            },
        );

        let hook = helpers.log.clone();
        engine.register_fn("log", move |severity: &str, message: &str| {
            if let Some(hook) = &hook {
                hook(severity, message);
            }
        });

        engine.register_fn("early_exit", || -> RhaiResult<()> {
            Err(runtime_error(EARLY_EXIT.to_string()))
        });

        let names: Vec<String> = settings
            .forbidden_functions
            .iter()
            .chain(std::iter::once(&"eval".to_string()))
            .map(|name| regex::escape(name))
            .collect();
        let forbidden = Regex::new(&format!(r"\b({})\s*\(", names.join("|"))).ok();

        Self { engine, forbidden }
    }

    fn check_forbidden(&self, code: &str) -> Result<()> {
        if let Some(found) = self.forbidden.as_ref().and_then(|re| re.captures(code)) {
            let name = found.get(1).map(|m| m.as_str()).unwrap_or_default();
            return Err(EngineError::Expression {
                query: code.to_string(),
                message: format!("Function '{}' is not allowed", name),
            });
        }
        Ok(())
    }

    fn scope_for(vars: &Map<String, Value>) -> Scope<'static> {
        let mut scope = Scope::new();
        for (name, value) in vars {
            if !IDENTIFIER.is_match(name) {
                continue;
            }
            if let Ok(dynamic) = rhai::serde::to_dynamic(value) {
                scope.push_dynamic(name.clone(), dynamic);
            }
        }
        scope
    }

    /// Evaluates an expression. An empty query yields an empty string.
    pub fn eval(&self, query: &str, vars: &Map<String, Value>) -> Result<Value> {
        if query.trim().is_empty() {
            return Ok(Value::String(String::new()));
        }
        self.check_forbidden(query)?;

        let mut scope = Self::scope_for(vars);
        let error = |message: String| EngineError::Expression {
            query: query.to_string(),
            message,
        };
        let result = self
            .engine
            .eval_with_scope::<Dynamic>(&mut scope, query)
            .map_err(|e| error(e.to_string()))?;
        to_json(&result).map_err(|e| error(e.to_string()))
    }

    /// Runs a script and returns the variables it left in scope.
    pub fn exec(&self, script: &str, vars: &Map<String, Value>) -> Result<ScriptOutcome> {
        let mut outcome = ScriptOutcome::default();
        if script.trim().is_empty() {
            return Ok(outcome);
        }
        self.check_forbidden(script)?;

        let mut scope = Self::scope_for(vars);
        if let Err(e) = self.engine.run_with_scope(&mut scope, script) {
            if e.to_string().contains(EARLY_EXIT) {
                outcome.exited = true;
            } else {
                return Err(EngineError::Expression {
                    query: script.to_string(),
                    message: e.to_string(),
                });
            }
        }

        for (name, _, value) in scope.iter() {
            if let Ok(value) = to_json(&value) {
                outcome.variables.insert(name.to_string(), value);
            }
        }
        Ok(outcome)
    }

    /// Replaces every `{{ expression }}` in `text` with its value.
    pub fn substitute(&self, text: &str, vars: &Map<String, Value>) -> Result<String> {
        if !text.contains("{{") {
            return Ok(text.to_string());
        }
        let mut output = String::with_capacity(text.len());
        let mut last = 0;
        for captures in PLACEHOLDER.captures_iter(text) {
            let (Some(whole), Some(inner)) = (captures.get(0), captures.get(1)) else {
                continue;
            };
            output.push_str(&text[last..whole.start()]);
            match self.eval(inner.as_str().trim(), vars)? {
                Value::String(rendered) => output.push_str(&rendered),
                other => output.push_str(&other.to_string()),
            }
            last = whole.end();
        }
        output.push_str(&text[last..]);
        Ok(output)
    }

    /// Applies [`substitute`](Self::substitute) to every string inside `value`.
    pub fn substitute_value(&self, value: &Value, vars: &Map<String, Value>) -> Result<Value> {
        Ok(match value {
            Value::String(text) => Value::String(self.substitute(text, vars)?),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.substitute_value(item, vars))
                    .collect::<Result<Vec<_>>>()?,
            ),
            Value::Object(map) => {
                let mut substituted = Map::new();
                for (key, item) in map {
                    substituted.insert(key.clone(), self.substitute_value(item, vars)?);
                }
                Value::Object(substituted)
            }
            other => other.clone(),
        })
    }
}

/// Stores a payload variable, global or scoped to one device.
pub fn set_payload_variable(payload: &SharedPayload, name: &str, value: Value, device: Option<&str>) {
    // Only fails when the payload cannot hold objects, which ensure_object rules out.
    let _ = store_variable(&mut lock(payload), name, value, device);
}

/// Truthiness of an expression result: empty and zero values are false.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn engine_with(payload: Value) -> (ExpressionEngine, SharedPayload) {
        let payload = Arc::new(Mutex::new(payload));
        let helpers = Helpers {
            payload: Arc::clone(&payload),
            log: None,
        };
        (ExpressionEngine::new(&ExpressionSettings::default(), helpers), payload)
    }

    fn vars(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[test]
    fn test_eval_with_variables() {
        let (engine, _) = engine_with(json!({}));
        let result = engine
            .eval("results[\"result\"]", &vars(json!({"results": {"result": "ok"}})))
            .unwrap();
        assert_eq!(result, json!("ok"));
        assert_eq!(engine.eval("1 + 2", &Map::new()).unwrap(), json!(3));
        assert_eq!(engine.eval("", &Map::new()).unwrap(), json!(""));
    }

    #[test]
    fn test_eval_error_carries_query() {
        let (engine, _) = engine_with(json!({}));
        let err = engine.eval("missing_variable + 1", &Map::new()).unwrap_err();
        let message = err.to_string();
        assert!(message.starts_with("Error when executing user query:"));
        assert!(message.contains("Query: 'missing_variable + 1'"));
    }

    #[test]
    fn test_forbidden_function_rejected() {
        let (engine, _) = engine_with(json!({}));
        let err = engine.eval("eval(\"1\")", &Map::new()).unwrap_err();
        assert!(err.to_string().contains("not allowed"));
    }

    #[test]
    fn test_get_and_set_var() {
        let (engine, payload) = engine_with(json!({"variables": {"site": "lab"}}));
        assert_eq!(engine.eval("get_var(\"site\")", &Map::new()).unwrap(), json!("lab"));

        engine.exec("set_var(\"count\", 2); set_var(\"mtu\", 9000, \"r1\");", &Map::new()).unwrap();
        let payload = lock(&payload).clone();
        assert_eq!(payload["variables"]["count"], json!(2));
        assert_eq!(payload["variables"]["devices"]["r1"]["mtu"], json!(9000));
        assert_eq!(
            engine.eval("get_var(\"mtu\", \"r1\")", &Map::new()).unwrap(),
            json!(9000)
        );
    }

    #[test]
    fn test_get_var_missing() {
        let (engine, _) = engine_with(json!({}));
        let err = engine.eval("get_var(\"nope\")", &Map::new()).unwrap_err();
        assert!(err.to_string().contains("Payload Editor: nope not found"));
    }

    #[test]
    fn test_exec_returns_scope_and_early_exit() {
        let (engine, _) = engine_with(json!({}));
        let outcome = engine.exec("let retries = 3;", &Map::new()).unwrap();
        assert_eq!(outcome.variables["retries"], json!(3));
        assert!(!outcome.exited);

        let outcome = engine.exec("let a = 1; early_exit(); let b = 2;", &Map::new()).unwrap();
        assert!(outcome.exited);
        assert_eq!(outcome.variables["a"], json!(1));
        assert!(!outcome.variables.contains_key("b"));
    }

    #[test]
    fn test_log_hook() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let helpers = Helpers {
            payload: Arc::new(Mutex::new(json!({}))),
            log: Some(Arc::new(move |severity: &str, message: &str| {
                lock(&sink).push(format!("{}:{}", severity, message));
            })),
        };
        let engine = ExpressionEngine::new(&ExpressionSettings::default(), helpers);
        engine.exec("log(\"warning\", \"check\");", &Map::new()).unwrap();
        assert_eq!(lock(&seen).as_slice(), ["warning:check".to_string()]);
    }

    #[test]
    fn test_substitute() {
        let (engine, _) = engine_with(json!({}));
        let vars = vars(json!({"device": {"name": "r1", "port": 22}}));
        assert_eq!(
            engine.substitute("ping {{device.name}} port {{ device.port }}", &vars).unwrap(),
            "ping r1 port 22"
        );
        assert_eq!(engine.substitute("plain", &vars).unwrap(), "plain");

        let value = engine
            .substitute_value(&json!({"cmd": ["show {{device.name}}"], "n": 1}), &vars)
            .unwrap();
        assert_eq!(value, json!({"cmd": ["show r1"], "n": 1}));
    }

    #[test]
    fn test_operation_limit() {
        let payload = Arc::new(Mutex::new(json!({})));
        let settings = ExpressionSettings {
            max_operations: 1000,
            ..ExpressionSettings::default()
        };
        let engine = ExpressionEngine::new(&settings, Helpers { payload, log: None });
        assert!(engine.exec("loop {}", &Map::new()).is_err());
    }

    #[test]
    fn test_truthiness() {
        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!([])));
        assert!(is_truthy(&json!("x")));
        assert!(is_truthy(&json!({"a": 1})));
    }
}
