//! Job attempts: retries, hooks, result conversion and validation.

use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::Duration;

use regex::Regex;
use serde_json::{json, Map, Value};

use super::runner::{failed_result, render, success_of, Runner};
use crate::error::{EngineError, Result};
use crate::inventory::Device;
use crate::logs::Severity;
use crate::run::ResultMap;
use crate::state::WriteMode;
use crate::workflow::{ConversionMethod, PostprocessingMode, ValidationMethod};

impl Runner {
    /// Runs the service job for one device with retries.
    ///
    /// Attempts stop at the first success, when retries run out, or at
    /// the service's hard retry cap. A stop request aborts before the
    /// next attempt.
    pub fn run_service_job(&self, device: Option<&Device>) -> ResultMap {
        let device_name = device.map(|d| d.name.as_str());
        let mut retries = i64::from(self.number_of_retries()) + 1;
        let mut total_attempts = 0;
        let mut results = ResultMap::new();

        while retries > 0 && total_attempts < self.service.max_number_of_retries {
            if self.stop() {
                self.log(
                    Severity::Error,
                    &format!("ABORTING {} (STOP)", device_name.unwrap_or(&self.service.name)),
                    None,
                );
                return failed_result("Aborted");
            }
            retries -= 1;
            total_attempts += 1;
            if total_attempts > 1 {
                self.log(
                    Severity::Error,
                    &format!("RETRY #{}", total_attempts - 1),
                    device_name,
                );
            }

            match self.attempt(device, &mut retries) {
                Ok(outcome) => {
                    results = outcome;
                    if success_of(&results) {
                        return results;
                    }
                    if retries > 0 && total_attempts < self.service.max_number_of_retries {
                        thread::sleep(Duration::from_secs(self.service.time_between_retries));
                    }
                }
                Err(e) => {
                    self.log(Severity::Error, &e.to_string(), device_name);
                    let partial = std::mem::take(&mut results);
                    results = failed_result(e.to_string());
                    results.insert("result_dict".into(), Value::Object(partial));
                }
            }
        }

        results.entry("success").or_insert(json!(false));
        results
    }

    fn attempt(&self, device: Option<&Device>, retries: &mut i64) -> Result<ResultMap> {
        if !self.service.preprocessing.is_empty() {
            self.exec(&self.service.preprocessing, device, Map::new())?;
        }

        let mut results = match self.invoke_job(device) {
            Ok(results) => results,
            Err(e) => {
                self.log(Severity::Error, &e.to_string(), device.map(|d| d.name.as_str()));
                failed_result(e.to_string())
            }
        };
        results = self.convert_result(results);
        results.entry("success").or_insert(json!(true));

        if self.dry_run() {
            self.write_state("dry_run", json!(true), WriteMode::Set);
            results.insert("dry_run".into(), json!(true));
        }

        if !self.service.postprocessing.is_empty() {
            let success = success_of(&results);
            if self.service.postprocessing_mode.applies(success) {
                let mut extra = Map::new();
                extra.insert("results".into(), Value::Object(results.clone()));
                extra.insert("retries".into(), json!(*retries));
                let outcome = self.exec(&self.service.postprocessing, device, extra)?;
                if let Some(Value::Object(updated)) = outcome.variables.get("results") {
                    results = updated.clone();
                }
                if let Some(remaining) = outcome.variables.get("retries").and_then(Value::as_i64) {
                    *retries = remaining;
                }
            } else {
                self.log(
                    Severity::Warning,
                    &format!(
                        "Postprocessing was skipped as it is set to {} only, and the service {}",
                        match self.service.postprocessing_mode {
                            PostprocessingMode::Failure => "failure",
                            _ => "success",
                        },
                        if success { "passed" } else { "failed" }
                    ),
                    device.map(|d| d.name.as_str()),
                );
            }
        }

        if self.service.validation_condition.applies(success_of(&results)) {
            let mut extra = Map::new();
            extra.insert("results".into(), Value::Object(results.clone()));
            let section = self.eval(&self.service.validation_section, device, extra)?;
            let validation = self.validate_result(section, device)?;
            results.extend(validation);
            if self.service.negative_logic {
                let flipped = !success_of(&results);
                results.insert("success".into(), json!(flipped));
            }
        }
        Ok(results)
    }

    /// Calls the registered job, turning panics into errors.
    fn invoke_job(&self, device: Option<&Device>) -> Result<ResultMap> {
        let job = self.scope.jobs.get(&self.service.kind).ok_or_else(|| {
            EngineError::Job(format!(
                "No job registered for service type '{}'",
                self.service.kind
            ))
        })?;
        match panic::catch_unwind(AssertUnwindSafe(|| job.run(self, device))) {
            Ok(results) => results,
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(EngineError::Job(format!("Job panicked: {}", message)))
            }
        }
    }

    fn convert_result(&self, mut results: ResultMap) -> ResultMap {
        let method = self.service.conversion_method;
        if method == ConversionMethod::None {
            return results;
        }
        let Some(raw) = results.get("result").cloned() else {
            return results;
        };

        let converted = match method {
            ConversionMethod::Text => Ok(Value::String(render(&raw))),
            ConversionMethod::Json => match raw {
                Value::String(text) => serde_json::from_str(&text).map_err(|e| e.to_string()),
                other => Ok(other),
            },
            ConversionMethod::Xml => xml_to_json(&render(&raw)),
            ConversionMethod::None => Ok(raw),
        };

        match converted {
            Ok(value) => {
                results.insert("result".into(), value);
                results
            }
            Err(exception) => {
                let mut failed = ResultMap::new();
                failed.insert("success".into(), json!(false));
                failed.insert("text_response".into(), Value::Object(results));
                failed.insert(
                    "error".into(),
                    json!(format!("Conversion to {} failed", method.as_str())),
                );
                failed.insert("exception".into(), json!(exception));
                failed
            }
        }
    }

    fn validate_result(&self, section: Value, device: Option<&Device>) -> Result<ResultMap> {
        let (success, expected) = match self.service.validation_method {
            ValidationMethod::Text => {
                let mut pattern = self.sub(&self.service.content_match, device, Map::new())?;
                let mut text = render(&section);
                if self.service.delete_spaces_before_matching {
                    pattern.retain(|c| !c.is_whitespace());
                    text.retain(|c| !c.is_whitespace());
                }
                let matched = if self.service.content_match_regex {
                    Regex::new(&pattern)
                        .map_err(|e| EngineError::Job(format!("Invalid content match regex: {}", e)))?
                        .is_match(&text)
                } else {
                    text.contains(&pattern)
                };
                (matched, Value::String(pattern))
            }
            method => {
                let expected = self.sub_value(&self.service.dict_match, device, Map::new())?;
                (match_dictionary(&section, &expected, method), expected)
            }
        };

        let mut validation = ResultMap::new();
        validation.insert("success".into(), json!(success));
        validation.insert(
            "validation".into(),
            json!({
                "path": self.service.validation_section,
                "value": section,
                "match": expected,
            }),
        );
        Ok(validation)
    }
}

/// Dictionary validation: exact equality, or inclusion anywhere in the
/// result tree. List values match item by item.
pub(crate) fn match_dictionary(result: &Value, expected: &Value, method: ValidationMethod) -> bool {
    if method == ValidationMethod::DictEqual {
        return result == expected;
    }
    let mut remaining = expected.clone();
    remove_matches(result, &mut remaining);
    remaining.as_object().map(Map::is_empty).unwrap_or(false)
}

fn remove_matches(result: &Value, remaining: &mut Value) {
    match result {
        Value::Object(map) => {
            for (key, value) in map {
                let matched = match remaining.as_object_mut().and_then(|r| r.get_mut(key)) {
                    Some(Value::Array(expected_items)) if value.is_array() => {
                        for item in value.as_array().into_iter().flatten() {
                            if let Some(pos) = expected_items.iter().position(|e| e == item) {
                                expected_items.remove(pos);
                            }
                        }
                        expected_items.is_empty()
                    }
                    Some(expected) => expected == value,
                    None => false,
                };
                if matched {
                    if let Some(r) = remaining.as_object_mut() {
                        r.remove(key);
                    }
                } else {
                    remove_matches(value, remaining);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                remove_matches(item, remaining);
            }
        }
        _ => {}
    }
}

/// Parses XML into JSON: elements map to objects, every child element is
/// a list, attributes are `@name` keys and mixed text is `#text`.
pub(crate) fn xml_to_json(text: &str) -> std::result::Result<Value, String> {
    let document = roxmltree::Document::parse(text).map_err(|e| e.to_string())?;
    let root = document.root_element();
    let mut object = Map::new();
    object.insert(root.tag_name().name().to_string(), element_value(root));
    Ok(Value::Object(object))
}

fn element_value(node: roxmltree::Node<'_, '_>) -> Value {
    let mut object = Map::new();
    for attribute in node.attributes() {
        object.insert(format!("@{}", attribute.name()), json!(attribute.value()));
    }
    for child in node.children().filter(|c| c.is_element()) {
        let entry = object
            .entry(child.tag_name().name().to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(items) = entry {
            items.push(element_value(child));
        }
    }

    let text: String = node
        .children()
        .filter(|c| c.is_text())
        .filter_map(|c| c.text())
        .collect::<String>()
        .trim()
        .to_string();

    if object.is_empty() {
        return if text.is_empty() {
            Value::Null
        } else {
            Value::String(text)
        };
    }
    if !text.is_empty() {
        object.insert("#text".into(), Value::String(text));
    }
    Value::Object(object)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dict_equal() {
        let result = json!({"a": 1, "b": [1, 2]});
        assert!(match_dictionary(&result, &json!({"a": 1, "b": [1, 2]}), ValidationMethod::DictEqual));
        assert!(!match_dictionary(&result, &json!({"a": 1}), ValidationMethod::DictEqual));
    }

    #[test]
    fn test_dict_included_nested() {
        let result = json!({"interfaces": {"eth0": {"status": "up", "mtu": 1500}}, "hostname": "r1"});
        let expected = json!({"status": "up", "hostname": "r1"});
        assert!(match_dictionary(&result, &expected, ValidationMethod::DictIncluded));

        let expected = json!({"status": "down"});
        assert!(!match_dictionary(&result, &expected, ValidationMethod::DictIncluded));
    }

    #[test]
    fn test_dict_included_lists_match_per_item() {
        let result = json!({"vlans": [10, 20, 30]});
        assert!(match_dictionary(&result, &json!({"vlans": [30, 10]}), ValidationMethod::DictIncluded));
        assert!(!match_dictionary(&result, &json!({"vlans": [40]}), ValidationMethod::DictIncluded));
    }

    #[test]
    fn test_dict_included_inside_lists() {
        let result = json!([{"name": "a"}, {"name": "b", "state": "ok"}]);
        assert!(match_dictionary(&result, &json!({"state": "ok"}), ValidationMethod::DictIncluded));
    }

    #[test]
    fn test_xml_children_are_lists() {
        let xml = r#"<rpc-reply id="7"><interface><name>eth0</name></interface><interface><name>eth1</name></interface></rpc-reply>"#;
        let value = xml_to_json(xml).unwrap();
        let reply = &value["rpc-reply"];
        assert_eq!(reply["@id"], json!("7"));
        assert_eq!(reply["interface"].as_array().unwrap().len(), 2);
        assert_eq!(reply["interface"][1]["name"], json!(["eth1"]));
    }

    #[test]
    fn test_xml_parse_error() {
        assert!(xml_to_json("<open>").is_err());
    }
}
