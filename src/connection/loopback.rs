//! Loopback driver: answers commands from the device's canned responses.
//!
//! Used by the CLI when no real transport is configured and by tests to
//! observe how many sessions were opened and closed.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::driver::{Credentials, DeviceDriver, Protocol, Session};
use crate::error::{EngineError, Result};
use crate::inventory::{Device, DeviceId};

#[derive(Debug, Clone)]
pub struct LoopbackDriver {
    protocol: Protocol,
    opened: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
    unreachable: HashSet<DeviceId>,
    /// Remaining `open` calls that fail before sessions open normally
    open_failures: Arc<AtomicUsize>,
    open_delay: Option<Duration>,
    close_delay: Option<Duration>,
}

impl LoopbackDriver {
    pub fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            opened: Arc::new(AtomicUsize::new(0)),
            closed: Arc::new(AtomicUsize::new(0)),
            unreachable: HashSet::new(),
            open_failures: Arc::new(AtomicUsize::new(0)),
            open_delay: None,
            close_delay: None,
        }
    }

    /// Makes `open` fail for the given device.
    pub fn with_unreachable(mut self, device: DeviceId) -> Self {
        self.unreachable.insert(device);
        self
    }

    /// Makes the next `count` calls to `open` fail, whatever the device.
    pub fn with_open_failures(self, count: usize) -> Self {
        self.open_failures.store(count, Ordering::SeqCst);
        self
    }

    /// Makes every `open` block for `delay`.
    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = Some(delay);
        self
    }

    /// Makes every `close` block for `delay`.
    pub fn with_close_delay(mut self, delay: Duration) -> Self {
        self.close_delay = Some(delay);
        self
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

impl DeviceDriver for LoopbackDriver {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn name(&self) -> &str {
        "loopback"
    }

    fn open(&self, device: &Device, _credentials: &Credentials) -> Result<Box<dyn Session>> {
        if let Some(delay) = self.open_delay {
            thread::sleep(delay);
        }
        let flaky = self
            .open_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if flaky || self.unreachable.contains(&device.id) {
            return Err(EngineError::Connection {
                device: device.name.clone(),
                message: "host unreachable".to_string(),
            });
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(LoopbackSession {
            device: device.clone(),
            alive: AtomicBool::new(true),
            closed: Arc::clone(&self.closed),
            close_delay: self.close_delay,
        }))
    }
}

struct LoopbackSession {
    device: Device,
    alive: AtomicBool,
    closed: Arc<AtomicUsize>,
    close_delay: Option<Duration>,
}

impl Session for LoopbackSession {
    fn send(&mut self, command: &str) -> Result<String> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(EngineError::Connection {
                device: self.device.name.clone(),
                message: "session closed".to_string(),
            });
        }
        Ok(self
            .device
            .responses
            .get(command)
            .cloned()
            .unwrap_or_else(|| format!("{}# {}", self.device.name, command)))
    }

    fn is_alive(&mut self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn close(&mut self) -> Result<()> {
        if let Some(delay) = self.close_delay {
            thread::sleep(delay);
        }
        if self.alive.swap(false, Ordering::SeqCst) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canned_and_echo_responses() {
        let driver = LoopbackDriver::new(Protocol::Cli);
        let device = Device::new(1, "r1", "10.0.0.1").with_response("show version", "IOS 15.2");
        let mut session = driver.open(&device, &Credentials::default()).unwrap();

        assert_eq!(session.send("show version").unwrap(), "IOS 15.2");
        assert_eq!(session.send("show clock").unwrap(), "r1# show clock");
        assert_eq!(driver.opened(), 1);
    }

    #[test]
    fn test_close_counts_once() {
        let driver = LoopbackDriver::new(Protocol::Cli);
        let device = Device::new(1, "r1", "10.0.0.1");
        let mut session = driver.open(&device, &Credentials::default()).unwrap();

        session.close().unwrap();
        session.close().unwrap();
        assert_eq!(driver.closed(), 1);
        assert!(!session.is_alive());
        assert!(session.send("x").is_err());
    }

    #[test]
    fn test_open_failures_run_out() {
        let driver = LoopbackDriver::new(Protocol::Cli).with_open_failures(1);
        let device = Device::new(1, "r1", "10.0.0.1");
        assert!(driver.open(&device, &Credentials::default()).is_err());
        assert!(driver.open(&device, &Credentials::default()).is_ok());
        assert_eq!(driver.opened(), 1);
    }

    #[test]
    fn test_unreachable_device() {
        let driver = LoopbackDriver::new(Protocol::Api).with_unreachable(2);
        let result = driver.open(&Device::new(2, "r2", "10.0.0.2"), &Credentials::default());
        assert!(matches!(result, Err(EngineError::Connection { .. })));
    }
}
