//! Connection Cache
//!
//! Open sessions indexed by protocol, runtime, device and connection name.
//! - Reuses a cached session while its liveness probe passes
//! - Enforces the parallel connection threshold per run
//! - Closes everything a run opened when the run finalizes

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, warn};

use super::driver::{Credentials, DeviceDriver, Protocol, Session};
use crate::error::{EngineError, Result};
use crate::inventory::Device;
use crate::lock;
use crate::logs::{Severity, RUN_TARGET};
use crate::settings::ConnectionSettings;

/// A cached session and what opened it.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub session: Arc<Mutex<Box<dyn Session>>>,
    pub opened_at: DateTime<Utc>,
    pub driver: String,
    pub name: String,
    pub device: String,
    pub protocol: Protocol,
}

impl ConnectionHandle {
    /// Sends a command over the session.
    pub fn send(&self, command: &str) -> Result<String> {
        lock(&self.session).send(command)
    }

    fn is_alive(&self) -> bool {
        lock(&self.session).is_alive()
    }

    fn close(&self) {
        if let Err(e) = lock(&self.session).close() {
            warn!("Error closing {} connection to {}: {}", self.protocol, self.device, e);
        }
    }
}

/// Parameters of one cache lookup.
pub struct ConnectionRequest<'a> {
    pub runtime: &'a str,
    pub protocol: Protocol,
    pub device: &'a Device,
    pub credentials: &'a Credentials,
    pub name: &'a str,
    /// Discard any cached session and open a fresh one
    pub force_new: bool,
}

type DeviceConnections = HashMap<String, HashMap<String, ConnectionHandle>>;
type ConnectionTable = HashMap<Protocol, HashMap<String, DeviceConnections>>;

/// Process-wide connection cache shared by every run.
pub struct ConnectionCache {
    settings: ConnectionSettings,
    drivers: RwLock<HashMap<Protocol, Arc<dyn DeviceDriver>>>,
    connections: Mutex<ConnectionTable>,
    /// Sessions being opened, per runtime. Always locked after `connections`.
    pending: Mutex<HashMap<String, usize>>,
}

/// A threshold slot held while a session opens, given back on drop.
struct Reservation<'a> {
    pending: &'a Mutex<HashMap<String, usize>>,
    runtime: &'a str,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        let mut pending = lock(self.pending);
        if let Some(count) = pending.get_mut(self.runtime) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                pending.remove(self.runtime);
            }
        }
    }
}

fn live_count(connections: &ConnectionTable, runtime: &str) -> usize {
    connections
        .values()
        .filter_map(|runs| runs.get(runtime))
        .flat_map(|devices| devices.values())
        .map(|names| names.len())
        .sum()
}

impl ConnectionCache {
    pub fn new(settings: ConnectionSettings) -> Self {
        Self {
            settings,
            drivers: RwLock::new(HashMap::new()),
            connections: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn register_driver(&self, driver: Arc<dyn DeviceDriver>) {
        let protocol = driver.protocol();
        debug!("Registered {} driver '{}'", protocol, driver.name());
        self.drivers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(protocol, driver);
    }

    /// Cached session, if any.
    pub fn get(
        &self,
        runtime: &str,
        protocol: Protocol,
        device: &str,
        name: &str,
    ) -> Option<ConnectionHandle> {
        lock(&self.connections)
            .get(&protocol)?
            .get(runtime)?
            .get(device)?
            .get(name)
            .cloned()
    }

    fn take(&self, runtime: &str, protocol: Protocol, device: &str, name: &str) -> Option<ConnectionHandle> {
        lock(&self.connections)
            .get_mut(&protocol)?
            .get_mut(runtime)?
            .get_mut(device)?
            .remove(name)
    }

    /// Returns a usable session and whether it was freshly opened.
    pub fn acquire(&self, request: ConnectionRequest<'_>) -> Result<(ConnectionHandle, bool)> {
        let device = request.device.name.as_str();

        if request.force_new {
            if let Some(stale) = self.take(request.runtime, request.protocol, device, request.name) {
                debug!("Closing {} connection to {} before reopening", request.protocol, device);
                stale.close();
            }
        } else if let Some(cached) = self.get(request.runtime, request.protocol, device, request.name) {
            if cached.is_alive() {
                return Ok((cached, false));
            }
            debug!("Cached {} connection to {} is dead", request.protocol, device);
            self.take(request.runtime, request.protocol, device, request.name);
            cached.close();
        }

        let reservation = self.reserve_slot(request.runtime)?;

        let driver = self
            .drivers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&request.protocol)
            .cloned()
            .ok_or_else(|| EngineError::MissingDriver(request.protocol.to_string()))?;

        let session = driver.open(request.device, request.credentials)?;
        let handle = ConnectionHandle {
            session: Arc::new(Mutex::new(session)),
            opened_at: Utc::now(),
            driver: driver.name().to_string(),
            name: request.name.to_string(),
            device: device.to_string(),
            protocol: request.protocol,
        };

        lock(&self.connections)
            .entry(request.protocol)
            .or_default()
            .entry(request.runtime.to_string())
            .or_default()
            .entry(device.to_string())
            .or_default()
            .insert(request.name.to_string(), handle.clone());
        drop(reservation);
        Ok((handle, true))
    }

    /// Checks the threshold against open and opening sessions, then counts
    /// the caller as opening. Both happen under the `connections` lock so
    /// concurrent workers of one run see each other.
    fn reserve_slot<'a>(&'a self, runtime: &'a str) -> Result<Reservation<'a>> {
        let connections = lock(&self.connections);
        let mut pending = lock(&self.pending);
        let open = live_count(&connections, runtime) + pending.get(runtime).copied().unwrap_or(0);

        if self.settings.enforce_threshold && open >= self.settings.threshold {
            let severity = Severity::parse(&self.settings.log_level).unwrap_or(Severity::Warning);
            let error = EngineError::ConnectionThreshold(open);
            log::log!(target: RUN_TARGET, severity.level(), "RUNTIME {} - {}", runtime, error);
            if self.settings.raise_exception {
                return Err(error);
            }
        }
        *pending.entry(runtime.to_string()).or_insert(0) += 1;
        Ok(Reservation {
            pending: &self.pending,
            runtime,
        })
    }

    /// Number of sessions a run currently holds, across protocols.
    pub fn open_count(&self, runtime: &str) -> usize {
        live_count(&lock(&self.connections), runtime)
    }

    /// Closes every session a run holds to one device.
    ///
    /// Returns the protocol of each closed session.
    pub fn close_device(&self, runtime: &str, device: &str) -> Vec<Protocol> {
        let mut closing = Vec::new();
        {
            let mut connections = lock(&self.connections);
            for protocol in Protocol::ALL {
                let removed = connections
                    .get_mut(&protocol)
                    .and_then(|runs| runs.get_mut(runtime))
                    .and_then(|devices| devices.remove(device));
                if let Some(names) = removed {
                    if !names.is_empty() {
                        closing.push((protocol, names));
                    }
                }
            }
        }

        let mut protocols = Vec::new();
        for (protocol, names) in closing {
            for handle in names.values() {
                handle.close();
                protocols.push(protocol);
            }
        }
        protocols
    }

    /// Closes every session of a run in parallel, waiting at most `timeout`.
    ///
    /// Entries leave the cache before closing starts, so a second call is a
    /// no-op. Returns the protocol of each released session.
    pub fn release_all(&self, runtime: &str, timeout: Duration) -> Vec<Protocol> {
        let mut handles = Vec::new();
        {
            let mut connections = lock(&self.connections);
            for runs in connections.values_mut() {
                if let Some(devices) = runs.remove(runtime) {
                    for names in devices.into_values() {
                        handles.extend(names.into_values());
                    }
                }
            }
        }
        let protocols: Vec<Protocol> = handles.iter().map(|h| h.protocol).collect();
        if handles.is_empty() {
            return protocols;
        }

        let total = handles.len();
        let (tx, rx) = mpsc::channel();
        for handle in handles {
            let tx = tx.clone();
            thread::spawn(move || {
                handle.close();
                let _ = tx.send(format!("{} ({})", handle.device, handle.protocol));
            });
        }
        drop(tx);

        let deadline = Instant::now() + timeout;
        let mut closed = 0;
        while closed < total {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok(label) => {
                    debug!("Closed connection to {}", label);
                    closed += 1;
                }
                Err(_) => break,
            }
        }
        if closed < total {
            warn!(
                "RUNTIME {} - {} of {} connections did not close within {:?}",
                runtime,
                total - closed,
                total,
                timeout
            );
        }
        protocols
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::LoopbackDriver;

    fn cache_with(driver: &LoopbackDriver, settings: ConnectionSettings) -> ConnectionCache {
        let cache = ConnectionCache::new(settings);
        cache.register_driver(Arc::new(driver.clone()));
        cache
    }

    fn request<'a>(runtime: &'a str, device: &'a Device, creds: &'a Credentials) -> ConnectionRequest<'a> {
        ConnectionRequest {
            runtime,
            protocol: Protocol::Cli,
            device,
            credentials: creds,
            name: "default",
            force_new: false,
        }
    }

    #[test]
    fn test_reuses_live_session() {
        let driver = LoopbackDriver::new(Protocol::Cli);
        let cache = cache_with(&driver, ConnectionSettings::default());
        let device = Device::new(1, "r1", "10.0.0.1");
        let creds = Credentials::default();

        let (_, opened) = cache.acquire(request("rt", &device, &creds)).unwrap();
        assert!(opened);
        let (_, opened) = cache.acquire(request("rt", &device, &creds)).unwrap();
        assert!(!opened);
        assert_eq!(driver.opened(), 1);
        assert_eq!(cache.open_count("rt"), 1);
    }

    #[test]
    fn test_force_new_closes_previous() {
        let driver = LoopbackDriver::new(Protocol::Cli);
        let cache = cache_with(&driver, ConnectionSettings::default());
        let device = Device::new(1, "r1", "10.0.0.1");
        let creds = Credentials::default();

        cache.acquire(request("rt", &device, &creds)).unwrap();
        let mut fresh = request("rt", &device, &creds);
        fresh.force_new = true;
        let (_, opened) = cache.acquire(fresh).unwrap();

        assert!(opened);
        assert_eq!(driver.opened(), 2);
        assert_eq!(driver.closed(), 1);
        assert_eq!(cache.open_count("rt"), 1);
    }

    #[test]
    fn test_dead_session_reopened() {
        let driver = LoopbackDriver::new(Protocol::Cli);
        let cache = cache_with(&driver, ConnectionSettings::default());
        let device = Device::new(1, "r1", "10.0.0.1");
        let creds = Credentials::default();

        let (handle, _) = cache.acquire(request("rt", &device, &creds)).unwrap();
        lock(&handle.session).close().unwrap();
        let (_, opened) = cache.acquire(request("rt", &device, &creds)).unwrap();
        assert!(opened);
        assert_eq!(driver.opened(), 2);
    }

    #[test]
    fn test_threshold_raises_when_configured() {
        let driver = LoopbackDriver::new(Protocol::Cli);
        let settings = ConnectionSettings {
            enforce_threshold: true,
            threshold: 1,
            raise_exception: true,
            ..ConnectionSettings::default()
        };
        let cache = cache_with(&driver, settings);
        let creds = Credentials::default();
        let r1 = Device::new(1, "r1", "10.0.0.1");
        let r2 = Device::new(2, "r2", "10.0.0.2");

        cache.acquire(request("rt", &r1, &creds)).unwrap();
        let err = cache.acquire(request("rt", &r2, &creds)).err().unwrap();
        assert_eq!(err.to_string(), "Too many connections open in parallel (1)");
        // Other runs are counted separately.
        assert!(cache.acquire(request("rt2", &r2, &creds)).is_ok());
    }

    #[test]
    fn test_threshold_holds_for_concurrent_opens() {
        let driver = LoopbackDriver::new(Protocol::Cli).with_open_delay(Duration::from_millis(100));
        let settings = ConnectionSettings {
            enforce_threshold: true,
            threshold: 1,
            raise_exception: true,
            ..ConnectionSettings::default()
        };
        let cache = Arc::new(cache_with(&driver, settings));

        let workers: Vec<_> = (1..=3)
            .map(|id| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    let device = Device::new(id, &format!("r{}", id), "10.0.0.1");
                    let creds = Credentials::default();
                    cache.acquire(request("rt", &device, &creds)).is_ok()
                })
            })
            .collect();
        let opened = workers
            .into_iter()
            .map(|w| w.join().unwrap())
            .filter(|ok| *ok)
            .count();

        assert_eq!(opened, 1);
        assert_eq!(driver.opened(), 1);
        assert_eq!(cache.open_count("rt"), 1);
    }

    #[test]
    fn test_failed_open_gives_slot_back() {
        let driver = LoopbackDriver::new(Protocol::Cli).with_open_failures(1);
        let settings = ConnectionSettings {
            enforce_threshold: true,
            threshold: 1,
            raise_exception: true,
            ..ConnectionSettings::default()
        };
        let cache = cache_with(&driver, settings);
        let device = Device::new(1, "r1", "10.0.0.1");
        let creds = Credentials::default();

        assert!(matches!(
            cache.acquire(request("rt", &device, &creds)),
            Err(EngineError::Connection { .. })
        ));
        assert!(cache.acquire(request("rt", &device, &creds)).is_ok());
    }

    #[test]
    fn test_threshold_only_logs_by_default() {
        let driver = LoopbackDriver::new(Protocol::Cli);
        let settings = ConnectionSettings {
            enforce_threshold: true,
            threshold: 1,
            ..ConnectionSettings::default()
        };
        let cache = cache_with(&driver, settings);
        let creds = Credentials::default();
        cache.acquire(request("rt", &Device::new(1, "r1", "a"), &creds)).unwrap();
        assert!(cache.acquire(request("rt", &Device::new(2, "r2", "b"), &creds)).is_ok());
    }

    #[test]
    fn test_missing_driver() {
        let cache = ConnectionCache::new(ConnectionSettings::default());
        let device = Device::new(1, "r1", "10.0.0.1");
        let creds = Credentials::default();
        let err = cache.acquire(request("rt", &device, &creds)).err().unwrap();
        assert!(matches!(err, EngineError::MissingDriver(_)));
    }

    #[test]
    fn test_close_device() {
        let driver = LoopbackDriver::new(Protocol::Cli);
        let cache = cache_with(&driver, ConnectionSettings::default());
        let device = Device::new(1, "r1", "10.0.0.1");
        let creds = Credentials::default();
        cache.acquire(request("rt", &device, &creds)).unwrap();

        assert_eq!(cache.close_device("rt", "r1"), vec![Protocol::Cli]);
        assert!(cache.close_device("rt", "r1").is_empty());
        assert_eq!(driver.closed(), 1);
    }

    #[test]
    fn test_release_all_is_idempotent() {
        let driver = LoopbackDriver::new(Protocol::Cli);
        let cache = cache_with(&driver, ConnectionSettings::default());
        let creds = Credentials::default();
        for id in 1..=3 {
            let device = Device::new(id, format!("r{}", id), "10.0.0.1");
            cache.acquire(request("rt", &device, &creds)).unwrap();
        }

        assert_eq!(cache.release_all("rt", Duration::from_secs(5)).len(), 3);
        assert!(cache.release_all("rt", Duration::from_secs(5)).is_empty());
        assert_eq!(driver.closed(), 3);
        assert_eq!(cache.open_count("rt"), 0);
    }

    #[test]
    fn test_release_all_bounded_by_timeout() {
        let driver = LoopbackDriver::new(Protocol::Cli).with_close_delay(Duration::from_millis(500));
        let cache = cache_with(&driver, ConnectionSettings::default());
        let creds = Credentials::default();
        cache.acquire(request("rt", &Device::new(1, "r1", "a"), &creds)).unwrap();

        let start = Instant::now();
        assert_eq!(cache.release_all("rt", Duration::from_millis(50)), vec![Protocol::Cli]);
        assert!(start.elapsed() < Duration::from_millis(400));
        assert_eq!(cache.open_count("rt"), 0);
    }
}
