//! Device registry - the local view of who is in the group
//!
//! Each process keeps its own registry. Registries held by the owner and
//! by members are independent caches kept in step by protocol messages;
//! nothing here is shared or persisted.

use std::collections::HashMap;

use crate::device::{Device, DeviceKey};

/// Known peers keyed by `(name, id)`
#[derive(Debug, Clone, Default)]
pub struct Registry {
    devices: HashMap<DeviceKey, Device>,
}

impl Registry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a device or refresh the address and port of a known one.
    ///
    /// Returns `true` when the identity was not registered before.
    pub fn upsert(&mut self, device: Device) -> bool {
        let key = device.key();
        match self.devices.get_mut(&key) {
            Some(existing) => {
                existing.address = device.address;
                existing.listen_port = device.listen_port;
                false
            }
            None => {
                tracing::debug!(device = %key, "Registered device");
                self.devices.insert(key, device);
                true
            }
        }
    }

    /// Upsert every device in `devices`. Never removes entries.
    pub fn merge(&mut self, devices: impl IntoIterator<Item = Device>) -> usize {
        devices
            .into_iter()
            .filter(|device| self.upsert(device.clone()))
            .count()
    }

    /// Remove a device, returning it if it was present
    pub fn remove(&mut self, key: &DeviceKey) -> Option<Device> {
        self.devices.remove(key)
    }

    /// Remove every device carrying this identifier
    pub fn remove_id(&mut self, id: &str) -> Vec<Device> {
        let keys: Vec<DeviceKey> = self
            .devices
            .keys()
            .filter(|key| key.id == id)
            .cloned()
            .collect();
        keys.iter().filter_map(|key| self.devices.remove(key)).collect()
    }

    /// Check if a device is registered
    pub fn contains(&self, key: &DeviceKey) -> bool {
        self.devices.contains_key(key)
    }

    /// Check if any device with this identifier is registered
    pub fn contains_id(&self, id: &str) -> bool {
        self.devices.keys().any(|key| key.id == id)
    }

    pub fn get(&self, key: &DeviceKey) -> Option<&Device> {
        self.devices.get(key)
    }

    /// Snapshot of every registered device
    pub fn all(&self) -> Vec<Device> {
        self.devices.values().cloned().collect()
    }

    /// Snapshot of every registered device except `key`
    pub fn except(&self, key: &DeviceKey) -> Vec<Device> {
        self.devices
            .iter()
            .filter(|(k, _)| *k != key)
            .map(|(_, device)| device.clone())
            .collect()
    }

    pub fn clear(&mut self) {
        self.devices.clear();
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
