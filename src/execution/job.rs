//! Service Jobs
//!
//! The action a service performs against one device (or once, without a
//! device), looked up by the service's `type`:
//! - `command`: sends a command over the cached device connection
//! - `shell`: runs a bash script locally with the device exported
//! - `script`: runs a rhai script in the expression sandbox
//! - `workflow`: walks the workflow's members along its edges

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::{Arc, PoisonError, RwLock};

use log::{debug, warn};
use serde_json::{json, Map, Value};

use super::runner::Runner;
use crate::error::{EngineError, Result};
use crate::expression::is_truthy;
use crate::inventory::Device;
use crate::run::ResultMap;

/// The unit of work a service performs.
///
/// Implementations return the job's result map; `success` defaults to true
/// when absent. Errors are turned into failed results by the caller.
pub trait ServiceJob: Send + Sync {
    fn run(&self, runner: &Runner, device: Option<&Device>) -> Result<ResultMap>;
}

/// Job implementations keyed by service type.
pub struct JobRegistry {
    jobs: RwLock<HashMap<String, Arc<dyn ServiceJob>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
        }
    }

    /// Registry holding the built-in job kinds.
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register("command", Arc::new(ConnectionCommandJob));
        registry.register("shell", Arc::new(ShellJob));
        registry.register("script", Arc::new(ScriptJob));
        registry.register("workflow", Arc::new(WorkflowJob));
        registry
    }

    pub fn register(&self, kind: &str, job: Arc<dyn ServiceJob>) {
        self.jobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind.to_string(), job);
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn ServiceJob>> {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(kind)
            .cloned()
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn require_device<'a>(runner: &Runner, device: Option<&'a Device>) -> Result<&'a Device> {
    device.ok_or_else(|| {
        EngineError::Job(format!(
            "Service '{}' needs a device; use the 'per_device' run method",
            runner.service().name
        ))
    })
}

/// Sends the substituted `command` over the device's cached connection.
pub struct ConnectionCommandJob;

impl ServiceJob for ConnectionCommandJob {
    fn run(&self, runner: &Runner, device: Option<&Device>) -> Result<ResultMap> {
        let device = require_device(runner, device)?;
        let command = runner.sub(&runner.service().command, Some(device), Map::new())?;

        let mut results = ResultMap::new();
        results.insert("command".into(), json!(command));
        if runner.dry_run() {
            results.insert("result".into(), json!(""));
            results.insert("success".into(), json!(true));
            return Ok(results);
        }

        let output = runner.connection(device)?.send(&command)?;
        results.insert("result".into(), json!(output));
        results.insert("success".into(), json!(true));
        Ok(results)
    }
}

/// Runs the substituted `script` with bash.
///
/// `DEVICE_NAME`, `DEVICE_IP` and `DEVICE_PORT` are exported when the job
/// runs against a device.
pub struct ShellJob;

impl ServiceJob for ShellJob {
    fn run(&self, runner: &Runner, device: Option<&Device>) -> Result<ResultMap> {
        let script = runner.sub(&runner.service().script, device, Map::new())?;

        let mut results = ResultMap::new();
        if runner.dry_run() {
            results.insert("result".into(), json!(format!("[DRY RUN] {}", script)));
            results.insert("success".into(), json!(true));
            return Ok(results);
        }

        let label = format!(
            "{}_{}",
            runner.service().id,
            device.map(|d| d.name.as_str()).unwrap_or("once")
        );
        let script_path = create_execution_script(&label, &script)?;
        let output = execute_with_bash(&script_path, device);

        if let Err(e) = fs::remove_file(&script_path) {
            warn!("Failed to clean up script {}: {}", script_path.display(), e);
        }
        let output = output?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();
        debug!("Shell job '{}' exited with {:?}", label, output.status.code());

        results.insert("result".into(), json!(stdout));
        results.insert("return_code".into(), json!(output.status.code()));
        if !stderr.is_empty() {
            results.insert("error".into(), json!(stderr));
        }
        results.insert("success".into(), json!(output.status.success()));
        Ok(results)
    }
}

/// Writes a temporary bash script for one job.
fn create_execution_script(label: &str, command_text: &str) -> Result<PathBuf> {
    let script_dir = std::env::temp_dir().join("fleetrunner_scripts");
    fs::create_dir_all(&script_dir)?;

    let safe_label: String = label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '-' })
        .collect();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    let script_path = script_dir.join(format!("job_{}_{}.sh", safe_label, &suffix[..8]));
    let mut file = File::create(&script_path)?;

    writeln!(file, "#!/bin/bash")?;
    writeln!(file, "set -e")?;
    writeln!(file, "{}", command_text)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&script_path, fs::Permissions::from_mode(0o755))?;
    }

    Ok(script_path)
}

fn execute_with_bash(script_path: &Path, device: Option<&Device>) -> Result<Output> {
    let mut cmd = Command::new("bash");
    cmd.arg(script_path);
    if let Some(device) = device {
        cmd.env("DEVICE_NAME", &device.name)
            .env("DEVICE_IP", &device.ip_address)
            .env("DEVICE_PORT", device.port.to_string());
    }
    Ok(cmd.output()?)
}

/// Runs `script` in the expression sandbox.
///
/// The script reports through its `result` and `success` variables.
pub struct ScriptJob;

impl ServiceJob for ScriptJob {
    fn run(&self, runner: &Runner, device: Option<&Device>) -> Result<ResultMap> {
        let outcome = runner.exec(&runner.service().script, device, Map::new())?;

        let mut results = ResultMap::new();
        results.insert(
            "result".into(),
            outcome.variables.get("result").cloned().unwrap_or(Value::Null),
        );
        let success = outcome.variables.get("success").map(is_truthy).unwrap_or(true);
        results.insert("success".into(), json!(success));
        if outcome.exited {
            results.insert("early_exit".into(), json!(true));
        }
        Ok(results)
    }
}

/// Runs a workflow service's members.
pub struct WorkflowJob;

impl ServiceJob for WorkflowJob {
    fn run(&self, runner: &Runner, device: Option<&Device>) -> Result<ResultMap> {
        runner.run_workflow(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_defaults() {
        let registry = JobRegistry::with_defaults();
        for kind in ["command", "shell", "script", "workflow"] {
            assert!(registry.get(kind).is_some(), "missing {}", kind);
        }
        assert!(registry.get("netmiko").is_none());
    }

    #[test]
    fn test_register_replaces_kind() {
        struct Noop;
        impl ServiceJob for Noop {
            fn run(&self, _: &Runner, _: Option<&Device>) -> Result<ResultMap> {
                Ok(ResultMap::new())
            }
        }
        let registry = JobRegistry::new();
        registry.register("noop", Arc::new(Noop));
        assert!(registry.get("noop").is_some());
    }

    #[test]
    fn test_script_file_is_executable() {
        let path = create_execution_script("7_r1/x", "echo hello").unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("#!/bin/bash\nset -e\n"));
        assert!(path.file_name().unwrap().to_string_lossy().starts_with("job_7_r1-x_"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }
        fs::remove_file(path).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_bash_exports_device() {
        let device = Device::new(1, "r1", "10.0.0.1");
        let path = create_execution_script("env", "echo \"$DEVICE_NAME $DEVICE_IP\"").unwrap();
        let output = execute_with_bash(&path, Some(&device)).unwrap();
        fs::remove_file(path).unwrap();
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "r1 10.0.0.1");
    }
}
