use std::collections::HashMap;
use std::sync::RwLock;

use thiserror::Error;

use crate::identity::NodeId;

/// 32-bit compressed form of a [`NodeId`], carried in packet headers instead
/// of the full 128 bits. Lossy: recovering the NodeId requires a registry
/// lookup, and distinct ids can collide.
pub type NodeHash = u32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("node hash {hash:#010x} already registered to a different node")]
    HashCollision { hash: NodeHash, existing: NodeId, incoming: NodeId },
}

pub fn fold_node_id(node_id: NodeId) -> NodeHash {
    let bytes = node_id.as_bytes();
    let hi = u64::from_be_bytes(bytes[0..8].try_into().unwrap());
    let lo = u64::from_be_bytes(bytes[8..16].try_into().unwrap());
    let folded = hi ^ lo;
    ((folded >> 32) as u32) ^ (folded as u32)
}

/// Bidirectional NodeId <-> NodeHash map, shared across the mesh's
/// transport and router components.
pub struct UuidRegistry {
    by_hash: RwLock<HashMap<NodeHash, NodeId>>,
}

impl UuidRegistry {
    pub fn new() -> Self {
        Self { by_hash: RwLock::new(HashMap::new()) }
    }

    pub fn register(&self, node_id: NodeId) -> Result<NodeHash, RegistryError> {
        let hash = fold_node_id(node_id);
        let mut map = self.by_hash.write().unwrap();
        match map.get(&hash) {
            Some(existing) if *existing != node_id => Err(RegistryError::HashCollision {
                hash,
                existing: *existing,
                incoming: node_id,
            }),
            _ => {
                map.insert(hash, node_id);
                Ok(hash)
            }
        }
    }

    pub fn lookup_by_hash(&self, hash: NodeHash) -> Option<NodeId> {
        self.by_hash.read().unwrap().get(&hash).copied()
    }

    pub fn forget(&self, node_id: NodeId) {
        let hash = fold_node_id(node_id);
        let mut map = self.by_hash.write().unwrap();
        if map.get(&hash) == Some(&node_id) {
            map.remove(&hash);
        }
    }
}

impl Default for UuidRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn register_then_lookup_round_trips() {
        let registry = UuidRegistry::new();
        let id = Uuid::new_v4();
        let hash = registry.register(id).unwrap();
        assert_eq!(registry.lookup_by_hash(hash), Some(id));
    }

    #[test]
    fn registering_same_id_twice_is_not_a_collision() {
        let registry = UuidRegistry::new();
        let id = Uuid::new_v4();
        registry.register(id).unwrap();
        assert!(registry.register(id).is_ok());
    }

    #[test]
    fn collision_is_detected_for_distinct_ids_sharing_a_hash() {
        let registry = UuidRegistry::new();
        let a = Uuid::new_v4();
        let a_bytes: u128 = a.as_u128();
        // XORing both 64-bit halves by the same delta preserves hi^lo, so b
        // folds identically to a while remaining a distinct 128-bit value.
        let delta: u128 = (0x1111_1111_1111_1111u64 as u128) << 64 | 0x1111_1111_1111_1111u64 as u128;
        let b = Uuid::from_u128(a_bytes ^ delta);
        assert_ne!(a, b);
        assert_eq!(fold_node_id(a), fold_node_id(b));

        registry.register(a).unwrap();
        let err = registry.register(b).unwrap_err();
        assert!(matches!(err, RegistryError::HashCollision { .. }));
    }

    #[test]
    fn forget_allows_hash_reuse() {
        let registry = UuidRegistry::new();
        let id = Uuid::new_v4();
        registry.register(id).unwrap();
        registry.forget(id);
        assert_eq!(registry.lookup_by_hash(fold_node_id(id)), None);
    }
}
