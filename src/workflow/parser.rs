//! Fleet Parser
//!
//! Loads devices, pools, users, credentials and services from one YAML
//! file and validates them as a whole.

use std::fs;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use super::model::Service;
use super::validator::validate_fleet;
use crate::error::{EngineError, Result};
use crate::inventory::{Credential, Device, Pool, User};

/// Everything a fleet file declares.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetDefinition {
    pub devices: Vec<Device>,
    pub pools: Vec<Pool>,
    pub users: Vec<User>,
    pub credentials: Vec<Credential>,
    pub services: Vec<Service>,
}

/// Parses and validates a fleet definition from YAML text.
pub fn parse_fleet(yaml_content: &str) -> Result<FleetDefinition> {
    let fleet: FleetDefinition = serde_yaml::from_str(yaml_content).map_err(|e| {
        EngineError::Config(format!(
            "Failed to parse fleet YAML: {}. Check the file format.",
            e
        ))
    })?;

    info!(
        "Parsed {} devices, {} pools, {} services",
        fleet.devices.len(),
        fleet.pools.len(),
        fleet.services.len()
    );

    validate_fleet(&fleet).map_err(EngineError::Config)?;
    Ok(fleet)
}

/// Loads a fleet definition from a YAML file.
///
/// # Example
///
/// ```rust,no_run
/// use fleetrunner::workflow::load_fleet;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let fleet = load_fleet("fleet.yaml")?;
///     println!("Loaded {} services", fleet.services.len());
///     Ok(())
/// }
/// ```
pub fn load_fleet(path: &str) -> Result<FleetDefinition> {
    info!("Loading fleet from: {}", path);

    let yaml_content = fs::read_to_string(path).map_err(|e| {
        EngineError::Config(format!(
            "Failed to read fleet file '{}': {}. Check that the file exists and is readable.",
            path, e
        ))
    })?;

    debug!("YAML content loaded ({} bytes)", yaml_content.len());
    parse_fleet(&yaml_content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    const FLEET: &str = r#"
devices:
  - { id: 1, name: r1, ip_address: 10.0.0.1 }
  - { id: 2, name: r2, ip_address: 10.0.0.2, properties: { site: lab } }
pools:
  - { id: 1, name: lab, devices: [1, 2] }
users:
  - { name: admin, is_admin: true }
  - { name: operator, allowed_devices: [1] }
credentials:
  - { name: default, username: netops, password: secret }
services:
  - id: 1
    name: show_version
    type: command
    command: show version
    target_pools: 1
  - id: 2
    name: audit
    type: workflow
    run_method: once
    workflow:
      services: [1]
"#;

    #[test]
    fn test_parse_fleet() {
        let fleet = parse_fleet(FLEET).unwrap();
        assert_eq!(fleet.devices.len(), 2);
        assert_eq!(fleet.devices[1].properties["site"], "lab");
        assert_eq!(fleet.users[1].allowed_devices, Some(vec![1]));
        assert_eq!(fleet.services[0].target_pools, vec![1]);
        assert!(fleet.services[1].is_workflow());
    }

    #[test]
    fn test_parse_invalid_yaml() {
        let result = parse_fleet("devices: [");
        assert!(matches!(result, Err(EngineError::Config(_))));
    }

    #[test]
    fn test_parse_rejects_invalid_reference() {
        let yaml = "services:\n  - { id: 1, name: a, target_devices: [5] }\n";
        let err = parse_fleet(yaml).unwrap_err();
        assert!(err.to_string().contains("unknown device 5"));
    }

    #[test]
    fn test_load_fleet_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fleet.yaml");
        fs::write(&path, FLEET).unwrap();

        let fleet = load_fleet(path.to_str().unwrap()).unwrap();
        assert_eq!(fleet.pools[0].devices, vec![1, 2]);
    }

    #[test]
    fn test_load_missing_file() {
        let err = load_fleet("/nonexistent/fleet.yaml").unwrap_err();
        assert!(err.to_string().contains("Failed to read fleet file"));
    }

    #[test]
    fn test_empty_fleet() {
        let fleet = parse_fleet("{}").unwrap();
        assert!(fleet.services.is_empty());
    }
}
