use std::collections::BTreeMap;
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

use crate::identity::NodeId;

/// Global identity of a MIDI endpoint: the node that owns it, plus an id
/// that is unique only within that node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceKey {
    pub owner: NodeId,
    pub device_id: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    Local,
    Remote,
}

#[derive(Debug, Clone)]
pub struct Device {
    pub key: DeviceKey,
    pub name: String,
    pub is_input: bool,
    pub is_output: bool,
    pub provenance: Provenance,
    pub last_seen_us: u64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeviceRegistryError {
    #[error("device id {device_id} is already registered to a remote node")]
    DeviceIdInUse { device_id: u16 },
}

/// Catalog of MIDI endpoints, local and remote, indexed by [`DeviceKey`].
pub struct DeviceRegistry {
    local_node: NodeId,
    devices: RwLock<BTreeMap<DeviceKey, Device>>,
    next_local_id: RwLock<u16>,
}

impl DeviceRegistry {
    pub fn new(local_node: NodeId) -> Self {
        Self {
            local_node,
            devices: RwLock::new(BTreeMap::new()),
            next_local_id: RwLock::new(1),
        }
    }

    /// Registers a local device. Passing `device_id = 0` allocates the next
    /// free id (ids are assigned sequentially, skipping ones already in
    /// use). Fails if the id is already claimed by a remote device.
    pub fn register_local(
        &self,
        device_id: u16,
        name: impl Into<String>,
        is_input: bool,
        is_output: bool,
    ) -> Result<DeviceKey, DeviceRegistryError> {
        let mut devices = self.devices.write().unwrap();
        let id = if device_id == 0 {
            self.allocate_id(&devices)
        } else {
            device_id
        };
        let key = DeviceKey { owner: self.local_node, device_id: id };
        if let Some(existing) = devices.get(&key) {
            if existing.provenance == Provenance::Remote {
                return Err(DeviceRegistryError::DeviceIdInUse { device_id: id });
            }
        }
        devices.insert(
            key,
            Device {
                key,
                name: name.into(),
                is_input,
                is_output,
                provenance: Provenance::Local,
                last_seen_us: now_us(),
            },
        );
        Ok(key)
    }

    fn allocate_id(&self, devices: &BTreeMap<DeviceKey, Device>) -> u16 {
        let mut next = self.next_local_id.write().unwrap();
        loop {
            let candidate = *next;
            *next = next.wrapping_add(1).max(1);
            let key = DeviceKey { owner: self.local_node, device_id: candidate };
            if !devices.contains_key(&key) {
                return candidate;
            }
        }
    }

    /// Idempotent update for a device learned from a peer; refreshes
    /// `last_seen_us` on repeat calls.
    pub fn register_remote(
        &self,
        owner: NodeId,
        device_id: u16,
        name: impl Into<String>,
        is_input: bool,
        is_output: bool,
    ) -> DeviceKey {
        let key = DeviceKey { owner, device_id };
        let mut devices = self.devices.write().unwrap();
        devices.insert(
            key,
            Device {
                key,
                name: name.into(),
                is_input,
                is_output,
                provenance: Provenance::Remote,
                last_seen_us: now_us(),
            },
        );
        key
    }

    pub fn forget_node(&self, owner: NodeId) -> Vec<DeviceKey> {
        let mut devices = self.devices.write().unwrap();
        let keys: Vec<DeviceKey> = devices
            .keys()
            .filter(|k| k.owner == owner)
            .copied()
            .collect();
        for key in &keys {
            devices.remove(key);
        }
        keys
    }

    pub fn get(&self, key: DeviceKey) -> Option<Device> {
        self.devices.read().unwrap().get(&key).cloned()
    }

    pub fn list_local(&self) -> Vec<Device> {
        self.devices
            .read()
            .unwrap()
            .values()
            .filter(|d| d.provenance == Provenance::Local)
            .cloned()
            .collect()
    }

    pub fn list_remote(&self) -> Vec<Device> {
        self.devices
            .read()
            .unwrap()
            .values()
            .filter(|d| d.provenance == Provenance::Remote)
            .cloned()
            .collect()
    }

    pub fn count(&self) -> usize {
        self.devices.read().unwrap().len()
    }
}

fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn register_local_allocates_sequential_ids() {
        let registry = DeviceRegistry::new(Uuid::new_v4());
        let a = registry.register_local(0, "in-a", true, false).unwrap();
        let b = registry.register_local(0, "in-b", true, false).unwrap();
        assert_ne!(a.device_id, b.device_id);
    }

    #[test]
    fn register_local_rejects_collision_with_remote() {
        let owner = Uuid::new_v4();
        let registry = DeviceRegistry::new(owner);
        // a remote advertisement can in principle claim any device id,
        // including one that collides with this node's own id space.
        registry.register_remote(owner, 5, "remote-out", false, true);
        let result = registry.register_local(5, "local-in", true, false);
        assert_eq!(result, Err(DeviceRegistryError::DeviceIdInUse { device_id: 5 }));
    }

    #[test]
    fn register_remote_twice_refreshes_last_seen() {
        let registry = DeviceRegistry::new(Uuid::new_v4());
        let peer = Uuid::new_v4();
        let first = registry.register_remote(peer, 3, "peer-dev", true, true);
        std::thread::sleep(std::time::Duration::from_millis(1));
        registry.register_remote(peer, 3, "peer-dev", true, true);
        let device = registry.get(first).unwrap();
        assert_eq!(device.name, "peer-dev");
    }

    #[test]
    fn forget_node_removes_only_its_devices() {
        let registry = DeviceRegistry::new(Uuid::new_v4());
        let peer_a = Uuid::new_v4();
        let peer_b = Uuid::new_v4();
        registry.register_remote(peer_a, 1, "a", true, true);
        registry.register_remote(peer_b, 1, "b", true, true);
        registry.forget_node(peer_a);
        assert!(registry.get(DeviceKey { owner: peer_a, device_id: 1 }).is_none());
        assert!(registry.get(DeviceKey { owner: peer_b, device_id: 1 }).is_some());
    }
}
