//! In-memory inventory backed by a parsed fleet definition.

use std::collections::HashMap;

use log::debug;

use super::model::{Credential, Device, DeviceId, Pool, PoolId, ServiceId, User};
use super::Inventory;
use crate::workflow::{FleetDefinition, Service};

/// Inventory holding every record in process memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryInventory {
    devices: HashMap<DeviceId, Device>,
    pools: HashMap<PoolId, Pool>,
    services: HashMap<ServiceId, Service>,
    users: HashMap<String, User>,
    credentials: Vec<Credential>,
}

impl MemoryInventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fleet(fleet: FleetDefinition) -> Self {
        let mut inventory = Self::new();
        for device in fleet.devices {
            inventory.add_device(device);
        }
        for pool in fleet.pools {
            inventory.add_pool(pool);
        }
        for service in fleet.services {
            inventory.add_service(service);
        }
        for user in fleet.users {
            inventory.add_user(user);
        }
        inventory.credentials = fleet.credentials;
        debug!(
            "Inventory loaded: {} devices, {} pools, {} services",
            inventory.devices.len(),
            inventory.pools.len(),
            inventory.services.len()
        );
        inventory
    }

    pub fn add_device(&mut self, device: Device) {
        self.devices.insert(device.id, device);
    }

    pub fn add_pool(&mut self, pool: Pool) {
        self.pools.insert(pool.id, pool);
    }

    pub fn add_service(&mut self, service: Service) {
        self.services.insert(service.id, service);
    }

    pub fn add_user(&mut self, user: User) {
        self.users.insert(user.name.clone(), user);
    }

    pub fn add_credential(&mut self, credential: Credential) {
        self.credentials.push(credential);
    }
}

impl Inventory for MemoryInventory {
    fn device(&self, id: DeviceId) -> Option<Device> {
        self.devices.get(&id).cloned()
    }

    fn devices(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self.devices.values().cloned().collect();
        devices.sort_by_key(|d| d.id);
        devices
    }

    fn find_device(&self, property: &str, value: &str) -> Option<Device> {
        self.devices
            .values()
            .find(|d| d.property_text(property).as_deref() == Some(value))
            .cloned()
    }

    fn pool(&self, id: PoolId) -> Option<Pool> {
        self.pools.get(&id).cloned()
    }

    fn pool_by_name(&self, name: &str) -> Option<Pool> {
        self.pools.values().find(|p| p.name == name).cloned()
    }

    fn service(&self, id: ServiceId) -> Option<Service> {
        self.services.get(&id).cloned()
    }

    fn service_by_name(&self, name: &str) -> Option<Service> {
        self.services.values().find(|s| s.name == name).cloned()
    }

    fn user(&self, name: &str) -> Option<User> {
        self.users.get(name).cloned()
    }

    fn credential(&self, user: &str, device: &Device) -> Option<Credential> {
        self.credentials
            .iter()
            .find(|c| c.applies_to(user, device))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn inventory() -> MemoryInventory {
        let mut inventory = MemoryInventory::new();
        inventory.add_device(Device::new(1, "r1", "10.0.0.1"));
        inventory.add_device(Device::new(2, "r2", "10.0.0.2"));
        inventory.add_device(Device::new(3, "r3", "10.0.0.3"));
        inventory.add_pool(Pool {
            id: 10,
            name: "core".into(),
            devices: vec![2, 3, 99],
        });
        inventory.add_user(User {
            name: "admin".into(),
            is_admin: true,
            allowed_devices: None,
        });
        inventory.add_user(User {
            name: "operator".into(),
            is_admin: false,
            allowed_devices: Some(vec![1]),
        });
        inventory
    }

    #[test]
    fn test_find_device_by_property() {
        let inventory = inventory();
        assert_eq!(inventory.find_device("ip_address", "10.0.0.2").map(|d| d.id), Some(2));
        assert_eq!(inventory.find_device("name", "r3").map(|d| d.id), Some(3));
        assert!(inventory.find_device("name", "r9").is_none());
    }

    #[test]
    fn test_pool_devices_skips_unknown_members() {
        let inventory = inventory();
        let ids: Vec<DeviceId> = inventory.pool_devices(10).iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![2, 3]);
        assert!(inventory.pool_devices(11).is_empty());
    }

    #[test]
    fn test_allowed_targets() {
        let inventory = inventory();
        assert_eq!(inventory.allowed_targets("admin").len(), 3);
        assert_eq!(inventory.allowed_targets("operator"), HashSet::from([1]));
        assert!(inventory.allowed_targets("ghost").is_empty());
    }
}
