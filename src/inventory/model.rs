//! Inventory Records
//!
//! Devices, pools, users and credentials as the engine sees them. The
//! persistent store owning these records is an external collaborator;
//! only the fields the execution engine reads are modeled.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

pub type DeviceId = u64;
pub type PoolId = u64;
pub type ServiceId = u64;

fn default_port() -> u16 {
    22
}

fn default_driver() -> String {
    "loopback".to_string()
}

/// A network device that services run against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,

    #[serde(default)]
    pub ip_address: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Name of the driver used to reach the device
    #[serde(default = "default_driver")]
    pub driver: String,

    /// Free-form properties usable in device queries
    #[serde(default)]
    pub properties: Map<String, Value>,

    /// Canned command responses answered by the loopback driver
    #[serde(default)]
    pub responses: HashMap<String, String>,
}

impl Device {
    pub fn new(id: DeviceId, name: impl Into<String>, ip_address: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            ip_address: ip_address.into(),
            port: default_port(),
            driver: default_driver(),
            properties: Map::new(),
            responses: HashMap::new(),
        }
    }

    pub fn with_property(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }

    pub fn with_response(mut self, command: &str, output: &str) -> Self {
        self.responses.insert(command.to_string(), output.to_string());
        self
    }

    /// Looks up a property by name, built-in fields first.
    pub fn property(&self, name: &str) -> Option<Value> {
        match name {
            "id" => Some(json!(self.id)),
            "name" => Some(json!(self.name)),
            "ip_address" => Some(json!(self.ip_address)),
            "port" => Some(json!(self.port)),
            "driver" => Some(json!(self.driver)),
            other => self.properties.get(other).cloned(),
        }
    }

    /// Property rendered the way device queries compare it.
    pub fn property_text(&self, name: &str) -> Option<String> {
        self.property(name).map(|value| match value {
            Value::String(text) => text,
            other => other.to_string(),
        })
    }

    /// Flat JSON view exposed to user expressions.
    pub fn to_value(&self) -> Value {
        let mut object = self.properties.clone();
        object.insert("id".into(), json!(self.id));
        object.insert("name".into(), json!(self.name));
        object.insert("ip_address".into(), json!(self.ip_address));
        object.insert("port".into(), json!(self.port));
        object.insert("driver".into(), json!(self.driver));
        Value::Object(object)
    }
}

/// A named group of devices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pool {
    pub id: PoolId,
    pub name: String,
    #[serde(default)]
    pub devices: Vec<DeviceId>,
}

/// A user that can trigger runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub name: String,

    #[serde(default)]
    pub is_admin: bool,

    /// Devices this user may target. `None` means every device.
    #[serde(default)]
    pub allowed_devices: Option<Vec<DeviceId>>,
}

/// Login material for a set of devices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub name: String,
    pub username: String,

    #[serde(default)]
    pub password: String,

    /// Enable / privileged-mode secret
    #[serde(default)]
    pub secret: Option<String>,

    /// Devices the credential applies to. Empty means every device.
    #[serde(default)]
    pub devices: Vec<DeviceId>,

    /// Users allowed to use the credential. Empty means every user.
    #[serde(default)]
    pub users: Vec<String>,
}

impl Credential {
    pub fn applies_to(&self, user: &str, device: &Device) -> bool {
        (self.devices.is_empty() || self.devices.contains(&device.id))
            && (self.users.is_empty() || self.users.iter().any(|u| u == user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_builtin_properties() {
        let device = Device::new(3, "edge-1", "10.0.0.3").with_property("site", "paris");
        assert_eq!(device.property_text("name").as_deref(), Some("edge-1"));
        assert_eq!(device.property_text("id").as_deref(), Some("3"));
        assert_eq!(device.property_text("site").as_deref(), Some("paris"));
        assert!(device.property("vendor").is_none());
    }

    #[test]
    fn test_device_to_value() {
        let device = Device::new(1, "r1", "192.0.2.1");
        let value = device.to_value();
        assert_eq!(value["name"], "r1");
        assert_eq!(value["port"], 22);
    }

    #[test]
    fn test_device_yaml_defaults() {
        let device: Device = serde_yaml::from_str("id: 4\nname: sw4\n").unwrap();
        assert_eq!(device.driver, "loopback");
        assert_eq!(device.port, 22);
        assert!(device.ip_address.is_empty());
    }

    #[test]
    fn test_credential_scope() {
        let device = Device::new(1, "r1", "192.0.2.1");
        let other = Device::new(2, "r2", "192.0.2.2");
        let credential = Credential {
            name: "lab".into(),
            username: "netops".into(),
            password: "pw".into(),
            secret: None,
            devices: vec![1],
            users: vec!["alice".into()],
        };
        assert!(credential.applies_to("alice", &device));
        assert!(!credential.applies_to("alice", &other));
        assert!(!credential.applies_to("bob", &device));
    }
}
