use std::sync::mpsc;
use std::time::Duration;

use midimesh::{ForwardingRule, MeshNode};

fn start_node(port: u16) -> (MeshNode, mpsc::Receiver<(midimesh::DeviceKey, Vec<u8>)>) {
    let (tx, rx) = mpsc::channel();
    let node = MeshNode::start_ephemeral(
        port,
        Box::new(move |key, bytes| {
            tx.send((key, bytes.to_vec())).ok();
        }),
    )
    .expect("failed to start mesh node");
    (node, rx)
}

#[test]
fn three_node_chain_forwards_across_two_hops() {
    let (node_a, _a_rx) = start_node(0);
    let (node_b, _b_rx) = start_node(0);
    let (node_c, c_rx) = start_node(0);

    let handle_a = node_a.handle();
    let handle_b = node_b.handle();
    let handle_c = node_c.handle();

    let a2 = handle_a.register_local_device(2, "a-in", true, false).unwrap();
    let b5 = handle_b.register_local_device(5, "b-thru", true, true).unwrap();
    let c7 = handle_c.register_local_device(7, "c-out", false, true).unwrap();

    handle_a.register_peer_address(node_b.node_id(), node_b.local_addr());
    handle_a.route_to_remote(b5.device_id, node_b.node_id());
    handle_a
        .add_rule(ForwardingRule { source: a2, dest: b5, channel_filter: None, message_type_filter: None })
        .unwrap();

    handle_b.register_peer_address(node_c.node_id(), node_c.local_addr());
    handle_b.route_to_remote(c7.device_id, node_c.node_id());
    handle_b
        .add_rule(ForwardingRule { source: b5, dest: c7, channel_filter: None, message_type_filter: None })
        .unwrap();

    handle_a.submit_local_midi(a2, vec![0xB0, 0x07, 0x7F]);

    let (key, bytes) = c_rx.recv_timeout(Duration::from_secs(2)).expect("node C never received the relayed message");
    assert_eq!(key, c7);
    assert_eq!(bytes, vec![0xB0, 0x07, 0x7F]);

    node_a.shutdown();
    node_b.shutdown();
    node_c.shutdown();
}

#[test]
fn rule_cycle_within_one_node_is_rejected_at_configuration_time() {
    // Local rule-cycle detection only sees the rules configured on a single
    // node's own engine; a cycle entirely local to node A is exactly what it
    // can and must catch before any message is ever sent.
    let (node_a, _a_rx) = start_node(0);
    let handle_a = node_a.handle();

    let a2 = handle_a.register_local_device(2, "in", true, false).unwrap();
    let a3 = handle_a.register_local_device(3, "thru", true, true).unwrap();

    handle_a
        .add_rule(ForwardingRule { source: a2, dest: a3, channel_filter: None, message_type_filter: None })
        .unwrap();
    let result =
        handle_a.add_rule(ForwardingRule { source: a3, dest: a2, channel_filter: None, message_type_filter: None });

    assert!(result.is_err(), "a rule closing a local cycle must be rejected at insertion time");

    node_a.shutdown();
}

#[test]
fn two_node_forwarding_loop_is_caught_by_the_network_wide_context_check() {
    // Each node's rule engine only knows its own rules, so a cycle that
    // spans two nodes (A -> B -> A) cannot be rejected at configuration
    // time; it is caught instead when the returning packet's forwarding
    // context already lists the originating device as visited.
    let (node_a, a_rx) = start_node(0);
    let (node_b, _b_rx) = start_node(0);

    let handle_a = node_a.handle();
    let handle_b = node_b.handle();

    let a2 = handle_a.register_local_device(2, "a-in", true, false).unwrap();
    let b5 = handle_b.register_local_device(5, "b-thru", true, true).unwrap();

    handle_a.register_peer_address(node_b.node_id(), node_b.local_addr());
    handle_a.route_to_remote(b5.device_id, node_b.node_id());
    handle_a
        .add_rule(ForwardingRule { source: a2, dest: b5, channel_filter: None, message_type_filter: None })
        .unwrap();

    handle_b.register_peer_address(node_a.node_id(), node_a.local_addr());
    handle_b.route_to_remote(a2.device_id, node_a.node_id());
    handle_b
        .add_rule(ForwardingRule { source: b5, dest: a2, channel_filter: None, message_type_filter: None })
        .unwrap();

    handle_a.submit_local_midi(a2, vec![0x90, 0x3C, 0x64]);

    // B forwards back to a2 and the returning packet's visited set already
    // names (A, a2), so A drops it on arrival instead of delivering it
    // locally or forwarding it a third time.
    let _ = a_rx.recv_timeout(Duration::from_millis(500));
    std::thread::sleep(Duration::from_millis(200));

    assert_eq!(node_a.stats().router.loops_detected, 1);

    node_a.shutdown();
    node_b.shutdown();
}

#[test]
fn sysex_message_is_delivered_reliably_and_exactly_once() {
    let (node_a, _a_rx) = start_node(0);
    let (node_b, b_rx) = start_node(0);

    let handle_a = node_a.handle();
    let handle_b = node_b.handle();

    let a2 = handle_a.register_local_device(2, "a-in", true, false).unwrap();
    let b9 = handle_b.register_local_device(9, "b-out", false, true).unwrap();

    handle_a.register_peer_address(node_b.node_id(), node_b.local_addr());
    handle_a.route_to_remote(b9.device_id, node_b.node_id());
    handle_a
        .add_rule(ForwardingRule { source: a2, dest: b9, channel_filter: None, message_type_filter: None })
        .unwrap();

    let sysex = vec![0xF0, 0x7E, 0x00, 0x06, 0x01, 0xF7];
    handle_a.submit_local_midi(a2, sysex.clone());

    let (key, bytes) = b_rx.recv_timeout(Duration::from_secs(2)).expect("sysex was never delivered");
    assert_eq!(key, b9);
    assert_eq!(bytes, sysex);
    assert!(b_rx.recv_timeout(Duration::from_millis(200)).is_err(), "sysex delivered more than once");

    node_a.shutdown();
    node_b.shutdown();
}
