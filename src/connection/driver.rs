//! Driver contract for reaching devices.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::inventory::{Credential, Device};

/// Protocol family a connection speaks. Each has its own cache space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    #[default]
    Cli,
    Api,
    Netconf,
}

impl Protocol {
    pub const ALL: [Protocol; 3] = [Protocol::Cli, Protocol::Api, Protocol::Netconf];

    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Cli => "cli",
            Protocol::Api => "api",
            Protocol::Netconf => "netconf",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Login material handed to a driver.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub secret: Option<String>,
}

impl From<Credential> for Credentials {
    fn from(credential: Credential) -> Self {
        Self {
            username: credential.username,
            password: credential.password,
            secret: credential.secret,
        }
    }
}

/// An open session with one device.
pub trait Session: Send {
    /// Sends a command and returns the raw response.
    fn send(&mut self, command: &str) -> Result<String>;

    /// Cheap liveness probe.
    fn is_alive(&mut self) -> bool;

    fn close(&mut self) -> Result<()>;
}

/// Opens sessions for one protocol.
pub trait DeviceDriver: Send + Sync {
    fn protocol(&self) -> Protocol;

    fn name(&self) -> &str;

    fn open(&self, device: &Device, credentials: &Credentials) -> Result<Box<dyn Session>>;
}
