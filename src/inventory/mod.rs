//! Inventory Module
//!
//! Device, pool, user and credential records plus the [`Inventory`] trait
//! through which the engine reads them.
//!
//! - [`model`]: Record types
//! - [`memory`]: In-memory implementation loaded from a fleet file

pub mod memory;
pub mod model;

use std::collections::HashSet;

pub use memory::MemoryInventory;
pub use model::{Credential, Device, DeviceId, Pool, PoolId, ServiceId, User};

use crate::workflow::Service;

/// Read access to the persistent record store.
///
/// Implementations must be safe to share across worker threads.
pub trait Inventory: Send + Sync {
    fn device(&self, id: DeviceId) -> Option<Device>;

    fn devices(&self) -> Vec<Device>;

    /// Finds the first device whose `property` renders as `value`.
    fn find_device(&self, property: &str, value: &str) -> Option<Device>;

    fn pool(&self, id: PoolId) -> Option<Pool>;

    fn pool_by_name(&self, name: &str) -> Option<Pool>;

    fn service(&self, id: ServiceId) -> Option<Service>;

    fn service_by_name(&self, name: &str) -> Option<Service>;

    fn user(&self, name: &str) -> Option<User>;

    /// Credential the given user should use against the device.
    fn credential(&self, user: &str, device: &Device) -> Option<Credential>;

    /// Member devices of a pool. Unknown members are ignored.
    fn pool_devices(&self, id: PoolId) -> Vec<Device> {
        self.pool(id)
            .map(|pool| pool.devices.iter().filter_map(|d| self.device(*d)).collect())
            .unwrap_or_default()
    }

    /// Devices the user may target. Unknown users may target nothing.
    fn allowed_targets(&self, user: &str) -> HashSet<DeviceId> {
        match self.user(user) {
            Some(User {
                allowed_devices: Some(ids),
                is_admin: false,
                ..
            }) => ids.into_iter().collect(),
            Some(_) => self.devices().into_iter().map(|d| d.id).collect(),
            None => HashSet::new(),
        }
    }
}
