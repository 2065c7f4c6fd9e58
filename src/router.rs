use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Receiver, Sender};
use thread_priority::{ThreadBuilder, ThreadPriority};
use tracing::{trace, warn};

use crate::device_registry::{DeviceKey, DeviceRegistry};
use crate::identity::NodeId;
use crate::packet::{ForwardingContext, Packet, MAX_HOPS};
use crate::routing::{Route, RoutingTable};
use crate::rules::{ForwardingRule, RuleEngine, RuleError};
use crate::transport::reliable::ReliableTransport;
use crate::transport::udp::UdpTransport;
use crate::uuid_registry::{NodeHash, UuidRegistry};

#[derive(Debug, Default, Clone, Copy)]
pub struct RouterStats {
    pub messages_routed: u64,
    pub messages_delivered_local: u64,
    pub messages_forwarded: u64,
    pub messages_dropped: u64,
    pub loops_detected: u64,
    pub routing_errors: u64,
}

#[derive(Default)]
struct Counters {
    messages_routed: AtomicU64,
    messages_delivered_local: AtomicU64,
    messages_forwarded: AtomicU64,
    messages_dropped: AtomicU64,
    loops_detected: AtomicU64,
    routing_errors: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> RouterStats {
        RouterStats {
            messages_routed: self.messages_routed.load(Ordering::Relaxed),
            messages_delivered_local: self.messages_delivered_local.load(Ordering::Relaxed),
            messages_forwarded: self.messages_forwarded.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            loops_detected: self.loops_detected.load(Ordering::Relaxed),
            routing_errors: self.routing_errors.load(Ordering::Relaxed),
        }
    }
}

/// Where a resolved remote destination should be sent.
pub struct PeerAddress {
    pub node: NodeId,
    pub addr: SocketAddr,
}

pub enum RouterCommand {
    LocalMidiIn { device: DeviceKey, bytes: Vec<u8> },
    NetworkPacketIn { packet: Packet, peer_hash: NodeHash },
    AddRule { rule: ForwardingRule, reply: Sender<Result<(), RuleError>> },
    RemoveRule { source: DeviceKey, dest: DeviceKey },
    RegisterPeerAddress { node: NodeId, addr: SocketAddr },
}

/// Emits a MIDI message to a local output device. The concrete binding to
/// the host's MIDI driver lives outside this crate; this is the seam the
/// router calls through.
pub type LocalOutputSink = Box<dyn Fn(DeviceKey, &[u8]) + Send + Sync>;

struct Worker {
    local_node: NodeId,
    devices: Arc<DeviceRegistry>,
    routes: Arc<RoutingTable>,
    rules: Arc<RuleEngine>,
    registry: Option<Arc<UuidRegistry>>,
    udp: Arc<UdpTransport>,
    reliable: Arc<ReliableTransport>,
    peer_addrs: HashMap<NodeId, SocketAddr>,
    local_output: LocalOutputSink,
    counters: Arc<Counters>,
    commands: Receiver<RouterCommand>,
}

/// Single-threaded staged dispatcher: all routing decisions are serialized
/// through one worker thread draining a command queue, so a rule change
/// observed by one message is observed by every subsequent message.
pub struct MidiRouter {
    commands: Mutex<Option<Sender<RouterCommand>>>,
    counters: Arc<Counters>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl MidiRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        local_node: NodeId,
        devices: Arc<DeviceRegistry>,
        routes: Arc<RoutingTable>,
        rules: Arc<RuleEngine>,
        registry: Option<Arc<UuidRegistry>>,
        udp: Arc<UdpTransport>,
        reliable: Arc<ReliableTransport>,
        local_output: LocalOutputSink,
    ) -> Self {
        let (tx, rx) = unbounded();
        let counters = Arc::new(Counters::default());
        let worker_counters = counters.clone();

        let mut worker = Worker {
            local_node,
            devices,
            routes,
            rules,
            registry,
            udp,
            reliable,
            peer_addrs: HashMap::new(),
            local_output,
            counters: worker_counters,
            commands: rx,
        };

        let handle = ThreadBuilder::default()
            .name("midi-router")
            .priority(ThreadPriority::Max)
            .spawn(move |priority_result| {
                if let Err(err) = priority_result {
                    warn!(?err, "failed to elevate router thread priority, continuing at default");
                }
                worker.run();
            })
            .expect("failed to spawn midi router thread");

        Self { commands: Mutex::new(Some(tx)), counters, handle: Mutex::new(Some(handle)) }
    }

    pub fn submit(&self, command: RouterCommand) {
        if let Some(tx) = self.commands.lock().unwrap().as_ref() {
            tx.send(command).ok();
        }
    }

    pub fn stats(&self) -> RouterStats {
        self.counters.snapshot()
    }

    pub fn stop(&self) {
        self.commands.lock().unwrap().take();
        if let Some(handle) = self.handle.lock().unwrap().take() {
            handle.join().ok();
        }
    }
}

impl Drop for MidiRouter {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Worker {
    fn run(&mut self) {
        while let Ok(command) = self.commands.recv() {
            match command {
                RouterCommand::LocalMidiIn { device, bytes } => self.handle_local_midi(device, bytes),
                RouterCommand::NetworkPacketIn { packet, peer_hash } => {
                    self.handle_network_packet(packet, peer_hash)
                }
                RouterCommand::AddRule { rule, reply } => {
                    let result = self.rules.add_rule(rule);
                    reply.send(result).ok();
                }
                RouterCommand::RemoveRule { source, dest } => self.rules.remove_rule(source, dest),
                RouterCommand::RegisterPeerAddress { node, addr } => {
                    self.peer_addrs.insert(node, addr);
                }
            }
        }
    }

    fn handle_local_midi(&mut self, src: DeviceKey, bytes: Vec<u8>) {
        self.counters.messages_routed.fetch_add(1, Ordering::Relaxed);
        let status = match bytes.first() {
            Some(b) => *b,
            None => return,
        };

        let matching_rules = self.rules.rules_for(src);
        if matching_rules.is_empty() {
            if matches!(self.routes.lookup(src.device_id), Some(Route::Local) | None) {
                (self.local_output)(src, &bytes);
                self.counters.messages_delivered_local.fetch_add(1, Ordering::Relaxed);
            }
            return;
        }

        for rule in matching_rules.iter().filter(|r| r.matches(status)) {
            self.dispatch_to(rule.dest, &bytes, None, src);
        }
    }

    fn handle_network_packet(&mut self, packet: Packet, peer_hash: NodeHash) {
        self.counters.messages_routed.fetch_add(1, Ordering::Relaxed);
        let dest_key = DeviceKey { owner: self.local_node, device_id: packet.device_id };

        if let Some(context) = &packet.context {
            if context.contains(self.local_node_hash(), packet.device_id) {
                self.counters.loops_detected.fetch_add(1, Ordering::Relaxed);
                self.counters.messages_dropped.fetch_add(1, Ordering::Relaxed);
                trace!(device_id = packet.device_id, "dropping packet: loop detected via visited set");
                return;
            }
            if context.hop_count >= MAX_HOPS {
                self.counters.messages_dropped.fetch_add(1, Ordering::Relaxed);
                trace!(hop_count = context.hop_count, "dropping packet: hop limit exceeded");
                return;
            }
        }

        match self.routes.lookup(packet.device_id) {
            Some(Route::Local) | None => {
                (self.local_output)(dest_key, &packet.payload);
                self.counters.messages_delivered_local.fetch_add(1, Ordering::Relaxed);
            }
            Some(Route::Remote(_)) => {
                self.counters.routing_errors.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }

        let next_context = packet
            .context
            .clone()
            .map(|c| c.extend(self.local_node_hash(), packet.device_id))
            .unwrap_or_else(|| ForwardingContext::fresh(dest_key, self.local_node_hash()));

        let rules = self.rules.rules_for(dest_key);
        let status = packet.payload.first().copied();
        for rule in rules.iter().filter(|r| status.is_some_and(|s| r.matches(s))) {
            self.dispatch_with_context(rule.dest, &packet.payload, next_context.clone(), dest_key);
        }

        let _ = peer_hash;
    }

    /// Builds the context for a message that has not been forwarded before:
    /// `origin` (always a local device) is the sole initial visited entry,
    /// so the first hop's receiver never sees its own address pre-marked as
    /// visited.
    fn dispatch_to(&mut self, dest: DeviceKey, bytes: &[u8], context: Option<ForwardingContext>, origin: DeviceKey) {
        let context = context.unwrap_or_else(|| ForwardingContext::fresh(origin, self.local_node_hash()));
        self.dispatch_with_context(dest, bytes, context, origin);
    }

    fn dispatch_with_context(
        &mut self,
        dest: DeviceKey,
        bytes: &[u8],
        context: ForwardingContext,
        _origin: DeviceKey,
    ) {
        if context.hop_count > MAX_HOPS {
            self.counters.messages_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        match self.routes.lookup(dest.device_id) {
            Some(Route::Local) | None => {
                (self.local_output)(dest, bytes);
                self.counters.messages_delivered_local.fetch_add(1, Ordering::Relaxed);
            }
            Some(Route::Remote(node)) => {
                let Some(addr) = self.peer_addrs.get(&node).copied() else {
                    self.counters.routing_errors.fetch_add(1, Ordering::Relaxed);
                    return;
                };
                let dest_hash = self
                    .registry
                    .as_ref()
                    .and_then(|r| r.register(node).ok())
                    .unwrap_or(0);
                let mut packet = Packet::data(self.local_node_hash(), dest_hash, 0, dest.device_id, bytes.to_vec());
                packet.set_context(context);

                if packet.is_reliable() {
                    self.reliable.send_reliable(packet, addr, Box::new(|| {}), Box::new(|| {}));
                } else if let Err(err) = self.udp.send_packet(&mut packet, addr) {
                    warn!(error = %err, "unreliable forward send failed");
                }
                self.counters.messages_forwarded.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn local_node_hash(&self) -> NodeHash {
        self.node_hash_for(self.local_node)
    }

    fn node_hash_for(&self, node: NodeId) -> NodeHash {
        self.registry
            .as_ref()
            .and_then(|r| r.register(node).ok())
            .unwrap_or(crate::uuid_registry::fold_node_id(node))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uuid_registry::fold_node_id;
    use std::sync::mpsc;
    use uuid::Uuid;

    fn make_router(local_node: NodeId, sink: impl Fn(DeviceKey, &[u8]) + Send + Sync + 'static) -> MidiRouter {
        let devices = Arc::new(DeviceRegistry::new(local_node));
        let routes = Arc::new(RoutingTable::new());
        let rules = Arc::new(RuleEngine::new());
        let registry = Arc::new(UuidRegistry::new());
        registry.register(local_node).unwrap();
        let udp = Arc::new(UdpTransport::bind(0).unwrap());
        udp.start().unwrap();
        let reliable = ReliableTransport::new(udp.clone(), Default::default());
        MidiRouter::start(local_node, devices, routes, rules, Some(registry), udp, reliable, Box::new(sink))
    }

    #[test]
    fn local_message_with_no_rules_goes_direct_to_output() {
        let local_node = Uuid::new_v4();
        let (tx, rx) = mpsc::channel();
        let router = make_router(local_node, move |key, bytes| {
            tx.send((key, bytes.to_vec())).ok();
        });
        let src = DeviceKey { owner: local_node, device_id: 1 };
        router.submit(RouterCommand::LocalMidiIn { device: src, bytes: vec![0x90, 0x3C, 0x64] });

        let (key, bytes) = rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap();
        assert_eq!(key, src);
        assert_eq!(bytes, vec![0x90, 0x3C, 0x64]);
        assert_eq!(router.stats().messages_delivered_local, 1);
    }

    #[test]
    fn local_rule_forwards_to_local_destination() {
        let local_node = Uuid::new_v4();
        let (tx, rx) = mpsc::channel();
        let router = make_router(local_node, move |key, bytes| {
            tx.send((key, bytes.to_vec())).ok();
        });
        let src = DeviceKey { owner: local_node, device_id: 1 };
        let dest = DeviceKey { owner: local_node, device_id: 2 };

        let (reply_tx, reply_rx) = crossbeam_channel::unbounded();
        router.submit(RouterCommand::AddRule {
            rule: ForwardingRule { source: src, dest, channel_filter: None, message_type_filter: None },
            reply: reply_tx,
        });
        reply_rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap().unwrap();

        router.submit(RouterCommand::LocalMidiIn { device: src, bytes: vec![0xB0, 0x07, 0x40] });
        let (key, bytes) = rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap();
        assert_eq!(key, dest);
        assert_eq!(bytes, vec![0xB0, 0x07, 0x40]);
    }

    #[test]
    fn inbound_packet_carrying_self_in_visited_set_is_dropped() {
        let local_node = Uuid::new_v4();
        let router = make_router(local_node, |_, _| panic!("should never reach local output"));
        let dest_key = DeviceKey { owner: local_node, device_id: 5 };
        let local_hash = fold_node_id(local_node);

        let mut packet = Packet::data(99, local_hash, 0, 5, vec![0x90, 0x40, 0x7F]);
        packet.set_context(ForwardingContext::fresh(dest_key, local_hash));
        router.submit(RouterCommand::NetworkPacketIn { packet, peer_hash: 99 });

        std::thread::sleep(std::time::Duration::from_millis(100));
        assert_eq!(router.stats().loops_detected, 1);
        assert_eq!(router.stats().messages_dropped, 1);
    }

    #[test]
    fn inbound_packet_at_hop_limit_is_dropped() {
        let local_node = Uuid::new_v4();
        let router = make_router(local_node, |_, _| panic!("should never reach local output"));
        let dest_key = DeviceKey { owner: local_node, device_id: 5 };

        let mut packet = Packet::data(99, fold_node_id(local_node), 0, 5, vec![0x90, 0x40, 0x7F]);
        let mut ctx = ForwardingContext::fresh(dest_key, 1);
        ctx.hop_count = MAX_HOPS;
        packet.set_context(ctx);
        router.submit(RouterCommand::NetworkPacketIn { packet, peer_hash: 99 });

        std::thread::sleep(std::time::Duration::from_millis(100));
        assert_eq!(router.stats().messages_dropped, 1);
    }
}
