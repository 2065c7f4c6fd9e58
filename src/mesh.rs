use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::device_registry::{DeviceKey, DeviceRegistry, DeviceRegistryError};
use crate::identity::{NodeId, NodeIdentity};
use crate::instance::{InstanceDirectory, InstanceError};
use crate::packet::{Packet, PacketFlags};
use crate::router::{LocalOutputSink, MidiRouter, RouterCommand, RouterStats};
use crate::routing::RoutingTable;
use crate::rules::{ForwardingRule, RuleEngine, RuleError};
use crate::transport::reliable::{ReliableConfig, ReliableStats, ReliableTransport};
use crate::transport::reorder::ReorderBuffer;
use crate::transport::udp::{TransportError, TransportStats, UdpTransport};
use crate::uuid_registry::{fold_node_id, NodeHash, UuidRegistry};

#[derive(Debug, Error)]
pub enum MeshError {
    #[error(transparent)]
    Instance(#[from] InstanceError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Device(#[from] DeviceRegistryError),
    #[error(transparent)]
    Rule(#[from] RuleError),
}

#[derive(Debug, Default, Serialize)]
pub struct MeshStats {
    pub transport: TransportStatsView,
    pub reliable: ReliableStatsView,
    pub router: RouterStatsView,
}

#[derive(Debug, Default, Serialize)]
pub struct TransportStatsView {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub send_errors: u64,
    pub receive_errors: u64,
    pub invalid_packets: u64,
}

impl From<TransportStats> for TransportStatsView {
    fn from(s: TransportStats) -> Self {
        Self {
            packets_sent: s.packets_sent,
            packets_received: s.packets_received,
            bytes_sent: s.bytes_sent,
            bytes_received: s.bytes_received,
            send_errors: s.send_errors,
            receive_errors: s.receive_errors,
            invalid_packets: s.invalid_packets,
        }
    }
}

#[derive(Debug, Default, Serialize)]
pub struct ReliableStatsView {
    pub reliable_acked: u64,
    pub reliable_failed: u64,
    pub retries: u64,
    pub timeouts: u64,
}

impl From<ReliableStats> for ReliableStatsView {
    fn from(s: ReliableStats) -> Self {
        Self {
            reliable_acked: s.reliable_acked,
            reliable_failed: s.reliable_failed,
            retries: s.retries,
            timeouts: s.timeouts,
        }
    }
}

#[derive(Debug, Default, Serialize)]
pub struct RouterStatsView {
    pub messages_routed: u64,
    pub messages_delivered_local: u64,
    pub messages_forwarded: u64,
    pub messages_dropped: u64,
    pub loops_detected: u64,
    pub routing_errors: u64,
}

impl From<RouterStats> for RouterStatsView {
    fn from(s: RouterStats) -> Self {
        Self {
            messages_routed: s.messages_routed,
            messages_delivered_local: s.messages_delivered_local,
            messages_forwarded: s.messages_forwarded,
            messages_dropped: s.messages_dropped,
            loops_detected: s.loops_detected,
            routing_errors: s.routing_errors,
        }
    }
}

/// Cheaply-clonable, enqueue-only API for a running [`MeshNode`]. This is
/// the only surface collaborators (driver bindings, discovery, CLI) should
/// touch; it never locks shared routing state directly.
#[derive(Clone)]
pub struct MeshHandle {
    local_node: NodeId,
    devices: Arc<DeviceRegistry>,
    routes: Arc<RoutingTable>,
    router: Arc<MidiRouter>,
}

impl MeshHandle {
    pub fn local_node(&self) -> NodeId {
        self.local_node
    }

    pub fn submit_local_midi(&self, device: DeviceKey, bytes: Vec<u8>) {
        self.router.submit(RouterCommand::LocalMidiIn { device, bytes });
    }

    pub fn add_rule(&self, rule: ForwardingRule) -> Result<(), RuleError> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.router.submit(RouterCommand::AddRule { rule, reply: tx });
        rx.recv().unwrap_or(Ok(()))
    }

    pub fn remove_rule(&self, source: DeviceKey, dest: DeviceKey) {
        self.router.submit(RouterCommand::RemoveRule { source, dest });
    }

    pub fn register_local_device(
        &self,
        device_id: u16,
        name: impl Into<String>,
        is_input: bool,
        is_output: bool,
    ) -> Result<DeviceKey, DeviceRegistryError> {
        let key = self.devices.register_local(device_id, name, is_input, is_output)?;
        self.routes.set_route(key.device_id, crate::routing::Route::Local);
        Ok(key)
    }

    pub fn register_peer_address(&self, node: NodeId, addr: SocketAddr) {
        self.router.submit(RouterCommand::RegisterPeerAddress { node, addr });
    }

    /// Records that messages addressed to `device_id` must be tunneled to
    /// `node` rather than delivered to a local endpoint. Used when wiring a
    /// rule whose destination lives on a peer, or when replicating a peer's
    /// advertised device list.
    pub fn route_to_remote(&self, device_id: u16, node: NodeId) {
        self.routes.set_route(device_id, crate::routing::Route::Remote(node));
    }
}

const STALE_FLUSH_TICK: Duration = Duration::from_millis(50);
const STALE_GAP_TIMEOUT: Duration = Duration::from_millis(250);

/// One [`ReorderBuffer`] per peer, created lazily on that peer's first
/// packet. A peer that has not been heard from recently simply never gets
/// an entry; nothing in this crate ages entries out on its own, since
/// deciding a peer is gone is a discovery-layer concern.
///
/// Owns a periodic thread, mirroring [`ReliableTransport`]'s own retry
/// timer, that calls [`ReorderBuffer::flush_stale`] on every live peer
/// buffer so a gap that is never going to be filled does not stall that
/// peer's delivery forever.
struct PeerReorderBuffers {
    buffers: Mutex<HashMap<NodeHash, Arc<ReorderBuffer>>>,
    running: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl PeerReorderBuffers {
    /// Starts the flush timer immediately; packets it forces past a stuck
    /// gap are submitted to `router` just like any other inbound packet.
    fn start(router: Arc<MidiRouter>) -> Arc<Self> {
        let this = Arc::new(Self {
            buffers: Mutex::new(HashMap::new()),
            running: AtomicBool::new(true),
            thread: Mutex::new(None),
        });

        // Weak, not Arc: the thread must never be what keeps this alive,
        // or stop()/Drop could never run to signal it to exit.
        let weak = Arc::downgrade(&this);
        let handle = std::thread::Builder::new()
            .name("reorder-flush-timer".to_string())
            .spawn(move || loop {
                let Some(this) = weak.upgrade() else { break };
                if !this.running.load(Ordering::Relaxed) {
                    break;
                }
                this.flush_stale_all(&router);
                drop(this);
                std::thread::sleep(STALE_FLUSH_TICK);
            })
            .expect("failed to spawn reorder flush timer");
        *this.thread.lock().unwrap() = Some(handle);
        this
    }

    fn flush_stale_all(&self, router: &MidiRouter) {
        let snapshot: Vec<(NodeHash, Arc<ReorderBuffer>)> =
            self.buffers.lock().unwrap().iter().map(|(hash, buf)| (*hash, buf.clone())).collect();
        for (peer_hash, buffer) in snapshot {
            for ready in buffer.flush_stale(STALE_GAP_TIMEOUT) {
                router.submit(RouterCommand::NetworkPacketIn { packet: ready, peer_hash });
            }
        }
    }

    fn buffer_for(&self, peer_hash: NodeHash, first_sequence: u16) -> Arc<ReorderBuffer> {
        self.buffers
            .lock()
            .unwrap()
            .entry(peer_hash)
            .or_insert_with(|| Arc::new(ReorderBuffer::new(first_sequence)))
            .clone()
    }

    fn forget(&self, peer_hash: NodeHash) {
        self.buffers.lock().unwrap().remove(&peer_hash);
    }

    fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.thread.lock().unwrap().take() {
            handle.join().ok();
        }
    }
}

impl Drop for PeerReorderBuffers {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Owns one identity, one instance directory, the shared registries, the
/// transports, and the router for a single process. This is the entry
/// point collaborators construct once to stand up a node in the mesh.
pub struct MeshNode {
    identity: NodeIdentity,
    instance: InstanceDirectory,
    devices: Arc<DeviceRegistry>,
    routes: Arc<RoutingTable>,
    rules: Arc<RuleEngine>,
    registry: Arc<UuidRegistry>,
    udp: Arc<UdpTransport>,
    reliable: Arc<ReliableTransport>,
    router: Arc<MidiRouter>,
    reorder: Arc<PeerReorderBuffers>,
}

impl MeshNode {
    pub fn start_ephemeral(port: u16, local_output: LocalOutputSink) -> Result<Self, MeshError> {
        Self::start(NodeIdentity::new_ephemeral(), port, local_output)
    }

    pub fn start_persistent(config_dir: &Path, port: u16, local_output: LocalOutputSink) -> Result<Self, MeshError> {
        Self::start(NodeIdentity::new_persistent(config_dir), port, local_output)
    }

    fn start(identity: NodeIdentity, port: u16, local_output: LocalOutputSink) -> Result<Self, MeshError> {
        let node_id = identity.node_id();
        let instance = InstanceDirectory::acquire(node_id)?;

        let devices = Arc::new(DeviceRegistry::new(node_id));
        let routes = Arc::new(RoutingTable::new());
        let rules = Arc::new(RuleEngine::new());
        let registry = Arc::new(UuidRegistry::new());
        registry.register(node_id).ok();

        let udp = Arc::new(UdpTransport::bind(port)?);
        udp.start()?;
        let reliable = ReliableTransport::new(udp.clone(), ReliableConfig::default());

        let router = Arc::new(MidiRouter::start(
            node_id,
            devices.clone(),
            routes.clone(),
            rules.clone(),
            Some(registry.clone()),
            udp.clone(),
            reliable.clone(),
            local_output,
        ));

        let reorder = PeerReorderBuffers::start(router.clone());
        let local_hash = fold_node_id(node_id);
        wire_udp_to_router(&udp, &registry, &router, &reliable, &reorder, local_hash);

        info!(node_id = %node_id, name = identity.name(), addr = %udp.local_addr(), "mesh node started");

        Ok(Self { identity, instance, devices, routes, rules, registry, udp, reliable, router, reorder })
    }

    /// Drops a departed peer's device advertisements and its per-peer
    /// reorder state. Nothing in this crate calls this on its own since
    /// detecting peer departure is outside its scope; it exists for a
    /// discovery layer built on top to call.
    pub fn forget_peer(&self, node: NodeId) {
        self.devices.forget_node(node);
        self.registry.forget(node);
        self.reorder.forget(fold_node_id(node));
        self.routes.replace_node_routes(node, &[]);
    }

    pub fn handle(&self) -> MeshHandle {
        MeshHandle {
            local_node: self.identity.node_id(),
            devices: self.devices.clone(),
            routes: self.routes.clone(),
            router: self.router.clone(),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.identity.node_id()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.udp.local_addr()
    }

    pub fn stats(&self) -> MeshStats {
        MeshStats {
            transport: self.udp.stats().into(),
            reliable: self.reliable.stats().into(),
            router: self.router.stats().into(),
        }
    }

    pub fn shutdown(self) {
        self.udp.stop();
        self.reorder.stop();
        self.router.stop();
        self.reliable.stop();
        drop(self.instance);
    }
}

/// Splices the UDP receive callback into ack/nack handling, the per-peer
/// reorder buffer, and the router: ack/nack frames are consumed by the
/// reliable layer and go no further, a reliably-flagged data frame is
/// acked immediately on arrival (independent of whether it is in-sequence),
/// and every data frame passes through its peer's [`ReorderBuffer`] before
/// reaching the router so the router only ever sees packets in sequence.
fn wire_udp_to_router(
    udp: &Arc<UdpTransport>,
    registry: &Arc<UuidRegistry>,
    router: &Arc<MidiRouter>,
    reliable: &Arc<ReliableTransport>,
    reorder: &Arc<PeerReorderBuffers>,
    local_hash: NodeHash,
) {
    let registry = registry.clone();
    let router = router.clone();
    let reliable = reliable.clone();
    let reorder = reorder.clone();
    let udp_for_ack = udp.clone();
    udp.set_on_packet_received(Box::new(move |packet, addr| {
        let peer_hash = packet.source_hash;
        let _ = registry.lookup_by_hash(peer_hash);

        if packet.is_ack() {
            reliable.handle_ack(peer_hash, packet.sequence);
            return;
        }
        if packet.is_nack() {
            reliable.handle_nack(peer_hash, packet.sequence);
            return;
        }

        if packet.flags.contains(PacketFlags::RELIABLE) {
            let mut ack = Packet::ack(local_hash, peer_hash, packet.sequence);
            if let Err(err) = udp_for_ack.send_packet(&mut ack, addr) {
                tracing::warn!(error = %err, "failed to send ack");
            }
        }

        let buffer = reorder.buffer_for(peer_hash, packet.sequence);
        for ready in buffer.receive(packet) {
            router.submit(RouterCommand::NetworkPacketIn { packet: ready, peer_hash });
        }
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn two_node_single_hop_forwards_note_on() {
        let (a_tx, a_rx) = mpsc::channel();
        let node_a = MeshNode::start_ephemeral(0, Box::new(move |k, b| { a_tx.send((k, b.to_vec())).ok(); })).unwrap();
        let (b_tx, b_rx) = mpsc::channel();
        let node_b = MeshNode::start_ephemeral(0, Box::new(move |k, b| { b_tx.send((k, b.to_vec())).ok(); })).unwrap();

        let handle_a = node_a.handle();
        let handle_b = node_b.handle();

        let src = handle_a.register_local_device(2, "a-in", true, false).unwrap();
        let dest = handle_b.register_local_device(5, "b-out", false, true).unwrap();

        handle_a.register_peer_address(node_b.node_id(), node_b.local_addr());
        handle_a.route_to_remote(dest.device_id, node_b.node_id());
        handle_a.add_rule(ForwardingRule { source: src, dest, channel_filter: None, message_type_filter: None }).unwrap();

        handle_a.submit_local_midi(src, vec![0x90, 0x3C, 0x64]);

        let (key, bytes) = b_rx.recv_timeout(Duration::from_secs(2)).expect("node B never received the forwarded note");
        assert_eq!(key, dest);
        assert_eq!(bytes, vec![0x90, 0x3C, 0x64]);
        let _ = a_rx.try_recv();

        node_a.shutdown();
        node_b.shutdown();
    }
}
