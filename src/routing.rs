use std::collections::HashMap;
use std::sync::RwLock;

use crate::identity::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Local,
    Remote(NodeId),
}

/// Maps every local [`crate::device_registry::DeviceKey`]'s device id to
/// where a message addressed to it should actually go.
pub struct RoutingTable {
    routes: RwLock<HashMap<u16, Route>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self { routes: RwLock::new(HashMap::new()) }
    }

    pub fn set_route(&self, device_id: u16, route: Route) {
        self.routes.write().unwrap().insert(device_id, route);
    }

    pub fn remove_route(&self, device_id: u16) {
        self.routes.write().unwrap().remove(&device_id);
    }

    pub fn lookup(&self, device_id: u16) -> Option<Route> {
        self.routes.read().unwrap().get(&device_id).copied()
    }

    pub fn routes_for_node(&self, node: NodeId) -> Vec<u16> {
        self.routes
            .read()
            .unwrap()
            .iter()
            .filter(|(_, route)| matches!(route, Route::Remote(n) if *n == node))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Bulk replace every route pointing at `node`, used when a peer
    /// publishes (or re-publishes) its device list.
    pub fn replace_node_routes(&self, node: NodeId, device_ids: &[u16]) {
        let mut routes = self.routes.write().unwrap();
        routes.retain(|_, route| !matches!(route, Route::Remote(n) if *n == node));
        for id in device_ids {
            routes.insert(*id, Route::Remote(node));
        }
    }

    pub fn clear(&self) {
        self.routes.write().unwrap().clear();
    }
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::new()
    }
}
