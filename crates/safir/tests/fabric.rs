//! End-to-end scenarios driving two or three [`Communication`] instances
//! against each other directly, bypassing sockets: each side's outbound
//! datagrams are fed straight into the other side's `handle_datagram`.

use std::time::{Duration, Instant};

use safir_core::{CommunicationConfig, Node, NodeId, NodeTypeConfig, NodeTypeId, TypeId};
use safir_transport::send::Admission;
use safir_wire::{CommonHeader, DeliveryGuarantee, MessageHeader, NodeDescriptor, SendMethod};
use safir::{Communication, FacadeEvent};

/// Builds a raw acked multi-receiver datagram: `MessageHeader` followed
/// directly by `payload`, matching what a `DataSender` would have put on
/// the wire for a broadcast send at the given sequence number.
fn multi_receiver_datagram(
    from: i64,
    to: i64,
    data_type: i64,
    sequence_number: u64,
    payload: &[u8],
) -> Vec<u8> {
    let header = MessageHeader {
        common: CommonHeader {
            sender_id: from,
            receiver_id: to,
            data_type,
        },
        send_method: SendMethod::MultiReceiver,
        delivery_guarantee: DeliveryGuarantee::Acked,
        ack_now: true,
        sequence_number,
        total_content_size: payload.len() as u32,
        fragment_offset: 0,
        fragment_content_size: payload.len() as u32,
        fragment_number: 0,
        number_of_fragments: 1,
    };
    let mut bytes = header.encode().to_vec();
    bytes.extend_from_slice(payload);
    bytes
}

fn descriptor(id: i64, node_type: i64, addr: &str) -> NodeDescriptor {
    NodeDescriptor {
        name: format!("n{id}"),
        node_id: id,
        node_type_id: node_type,
        control_address: addr.to_owned(),
        data_address: addr.to_owned(),
    }
}

fn node(id: i64, node_type: i64, addr: &str, system: bool) -> Node {
    let mut n = Node::new(format!("n{id}"), NodeId(id), NodeTypeId(node_type), addr);
    n.is_system_node = system;
    n
}

fn ordinary(id: i64, addr: &str, config: CommunicationConfig) -> Communication {
    let type_config = NodeTypeConfig::new("ordinary");
    Communication::new(NodeId(id), descriptor(id, 1, addr), NodeTypeId(1), &type_config, config).unwrap()
}

#[test]
fn single_message_single_receiver_acked() {
    let mut a = ordinary(1, "127.0.0.1:10001", CommunicationConfig::default());
    let mut b = ordinary(2, "127.0.0.1:10002", CommunicationConfig::default());
    a.add_node(node(2, 1, "127.0.0.1:10002", true));
    b.add_node(node(1, 1, "127.0.0.1:10001", true));

    assert_eq!(
        a.send(NodeId(2), TypeId(7), DeliveryGuarantee::Acked, b"hello world").unwrap(),
        Admission::Accepted
    );

    let now = Instant::now();
    let batch = a.tick(now);
    assert_eq!(batch.datagrams.len(), 1);

    let events = b.handle_datagram(&batch.datagrams[0].bytes).unwrap();
    let delivered: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            FacadeEvent::Delivered(m) => Some(m.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].payload, b"hello world");

    let ack = events
        .into_iter()
        .find_map(|e| match e {
            FacadeEvent::SendAck { to: NodeId(1), ack } => Some(ack),
            _ => None,
        })
        .expect("B must ack the last fragment of a single-fragment send");

    // Feeding B's ack back to A must drain A's send queue.
    let events = a.handle_datagram(&ack.encode()).unwrap();
    assert!(events.is_empty());
    let empty_batch = a.tick(now + Duration::from_secs(1));
    assert!(
        empty_batch.datagrams.is_empty(),
        "acked message must not be retransmitted once acknowledged"
    );
    assert_eq!(b.number_of_undelivered_messages(), 1);
}

#[test]
fn large_fragmented_message_survives_two_dropped_fragments() {
    let mut small_fragment_cfg = CommunicationConfig::default();
    small_fragment_cfg.fragment_size = safir_wire::MessageHeader::ENCODE_LEN + 16; // 16-byte fragments
    small_fragment_cfg.sliding_window_size = 64;

    let mut a = ordinary(1, "127.0.0.1:10001", small_fragment_cfg.clone());
    let mut b = ordinary(2, "127.0.0.1:10002", small_fragment_cfg);
    a.add_node(node(2, 1, "127.0.0.1:10002", true));
    b.add_node(node(1, 1, "127.0.0.1:10001", true));

    let payload: Vec<u8> = (0u8..200).collect();
    assert_eq!(
        a.send(NodeId(2), TypeId(9), DeliveryGuarantee::Acked, &payload).unwrap(),
        Admission::Accepted
    );

    let now = Instant::now();
    let batch = a.tick(now);
    assert!(batch.datagrams.len() > 2, "message should fragment into several datagrams");

    // Drop fragments 2 and 5 (arbitrary, mid-stream) to exercise the
    // sliding window's selective-repeat retransmit path.
    let mut delivered = Vec::new();
    for (i, dg) in batch.datagrams.iter().enumerate() {
        if i == 2 || i == 5 {
            continue;
        }
        for event in b.handle_datagram(&dg.bytes).unwrap() {
            if let FacadeEvent::Delivered(m) = event {
                delivered.push(m);
            }
        }
    }
    assert!(delivered.is_empty(), "reassembly must stay blocked on the missing fragments");

    // After the retry timeout, A retransmits every still-unacked fragment
    // (no ack has reached it yet, since B never got a chance to ack_now).
    let later = now + Duration::from_millis(600);
    let retransmit_batch = a.tick(later);
    assert!(!retransmit_batch.datagrams.is_empty());

    for dg in &retransmit_batch.datagrams {
        for event in b.handle_datagram(&dg.bytes).unwrap() {
            if let FacadeEvent::Delivered(m) = event {
                delivered.push(m);
            }
        }
    }
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].payload, payload);
}

#[test]
fn broadcast_to_two_system_nodes_reaches_both() {
    let cfg = CommunicationConfig::default();
    let mut a = ordinary(1, "127.0.0.1:10001", cfg.clone());
    let mut b = ordinary(2, "127.0.0.1:10002", cfg.clone());
    let mut c = ordinary(3, "127.0.0.1:10003", cfg);

    a.add_node(node(2, 1, "127.0.0.1:10002", true));
    a.add_node(node(3, 1, "127.0.0.1:10003", true));
    b.add_node(node(1, 1, "127.0.0.1:10001", true));
    c.add_node(node(1, 1, "127.0.0.1:10001", true));

    assert_eq!(
        a.send_to_node_type(NodeTypeId(1), TypeId(3), DeliveryGuarantee::Unacked, b"gossip")
            .unwrap(),
        Admission::Accepted
    );

    let now = Instant::now();
    let batch = a.tick(now);
    // No multicast group configured for this node type: broadcast falls
    // back to one unicast datagram per system peer.
    assert_eq!(batch.datagrams.len(), 2);

    let mut delivered_to_b = false;
    let mut delivered_to_c = false;
    for dg in &batch.datagrams {
        let events_b = b.handle_datagram(&dg.bytes).unwrap();
        if events_b.iter().any(|e| matches!(e, FacadeEvent::Delivered(_))) {
            delivered_to_b = true;
        }
        let events_c = c.handle_datagram(&dg.bytes).unwrap();
        if events_c.iter().any(|e| matches!(e, FacadeEvent::Delivered(_))) {
            delivered_to_c = true;
        }
    }
    assert!(delivered_to_b);
    assert!(delivered_to_c);
}

#[test]
fn multicast_broadcast_reaches_both_receivers_with_one_datagram() {
    let cfg = CommunicationConfig::default();
    let multicast_type = NodeTypeConfig {
        use_multicast: true,
        multicast_address: Some("239.0.0.1:9000".to_owned()),
        ..NodeTypeConfig::new("multicast-peers")
    };

    let mut a = Communication::new(
        NodeId(1),
        descriptor(1, 9, "127.0.0.1:10001"),
        NodeTypeId(9),
        &NodeTypeConfig::new("coordinator"),
        cfg.clone(),
    )
    .unwrap();
    a.register_peer_type(NodeTypeId(1), &multicast_type);
    a.add_node(node(2, 1, "127.0.0.1:10002", true));
    a.add_node(node(3, 1, "127.0.0.1:10003", true));

    let mut b = Communication::new(
        NodeId(2),
        descriptor(2, 1, "127.0.0.1:10002"),
        NodeTypeId(1),
        &multicast_type,
        cfg.clone(),
    )
    .unwrap();
    let mut c = Communication::new(
        NodeId(3),
        descriptor(3, 1, "127.0.0.1:10003"),
        NodeTypeId(1),
        &multicast_type,
        cfg,
    )
    .unwrap();
    b.add_node(node(1, 9, "127.0.0.1:10001", true));
    c.add_node(node(1, 9, "127.0.0.1:10001", true));

    assert_eq!(
        a.send_to_node_type(NodeTypeId(1), TypeId(3), DeliveryGuarantee::Acked, b"multicast hello")
            .unwrap(),
        Admission::Accepted
    );

    let now = Instant::now();
    let batch = a.tick(now);
    // One multicast group configured: a broadcast collapses to exactly one
    // datagram on the wire instead of one per system peer.
    assert_eq!(batch.datagrams.len(), 1);

    let mut acks_from = Vec::new();
    for target in [&mut b, &mut c] {
        for event in target.handle_datagram(&batch.datagrams[0].bytes).unwrap() {
            if let FacadeEvent::SendAck { to: NodeId(1), ack } = event {
                acks_from.push(ack);
            }
        }
    }
    assert_eq!(acks_from.len(), 2, "both multicast listeners must each ack");

    for ack in acks_from {
        let events = a.handle_datagram(&ack.encode()).unwrap();
        assert!(events.is_empty());
    }
    let drained = a.tick(now + Duration::from_secs(1));
    assert!(
        drained.datagrams.is_empty(),
        "queue drains only once both multicast receivers have acked"
    );
}

#[test]
fn exclusion_between_two_ordinary_nodes_is_permanent_and_drops_sends() {
    let cfg = CommunicationConfig::default();
    let mut a = ordinary(1, "127.0.0.1:10001", cfg.clone());
    a.add_node(node(2, 1, "127.0.0.1:10002", true));

    let events = a.exclude_node(Instant::now(), NodeId(2));
    assert!(events.iter().any(|e| matches!(e, FacadeEvent::NodeExcluded(NodeId(2)))));

    // The node table no longer knows about peer 2, so a subsequent send is
    // rejected exactly as for any other unknown node.
    let err = a.send(NodeId(2), TypeId(1), DeliveryGuarantee::Acked, b"x").unwrap_err();
    assert!(matches!(err, safir::FacadeError::UnknownNode(NodeId(2))));
}

#[test]
fn exclusion_by_a_light_node_is_time_limited() {
    let mut cfg = CommunicationConfig::default();
    cfg.light_nodes_exclude_time_limit = Duration::from_millis(50);

    let light_type = NodeTypeConfig {
        is_light_node: true,
        ..NodeTypeConfig::new("light")
    };
    let mut light = Communication::new(
        NodeId(9),
        descriptor(9, 9, "127.0.0.1:10009"),
        NodeTypeId(9),
        &light_type,
        cfg,
    )
    .unwrap();
    let ordinary_type = NodeTypeConfig::new("ordinary");
    light.register_peer_type(NodeTypeId(1), &ordinary_type);
    light.add_node(node(2, 1, "127.0.0.1:10002", true));

    // Register node 2 with the discoverer too (normally the product of an
    // earlier Discover/NodeInfo exchange), so exclusion has an address to
    // reseed from once the light node's exclusion window expires.
    let info = safir_wire::NodeInfo {
        sent_from_id: 2,
        sent_to_id: 9,
        sent_from_node: descriptor(2, 1, "127.0.0.1:10002"),
        nodes: Vec::new(),
        number_of_packets: 1,
        packet_number: 0,
    };
    let mut node_info_bytes = CommonHeader {
        sender_id: 2,
        receiver_id: 9,
        data_type: safir_wire::common::data_type::CONTROL_DATA,
    }
    .encode()
    .to_vec();
    node_info_bytes.extend_from_slice(&safir_wire::Envelope::NodeInfo(info).encode());
    light.handle_datagram(&node_info_bytes).unwrap();

    let now = Instant::now();
    let events = light.exclude_node(now, NodeId(2));
    assert!(events.iter().any(|e| matches!(e, FacadeEvent::NodeExcluded(NodeId(2)))));

    // Immediately after exclusion, sends to node 2 are rejected like any
    // other unknown node.
    let err = light.send(NodeId(2), TypeId(1), DeliveryGuarantee::Acked, b"x").unwrap_err();
    assert!(matches!(err, safir::FacadeError::UnknownNode(NodeId(2))));

    // After the exclusion window elapses, the discoverer reseeds node 2's
    // address and a fresh Discover is emitted towards it.
    let later = now + Duration::from_millis(60);
    let batch = light.tick(later);
    assert!(batch.discovers.iter().any(|(addr, _)| addr == "127.0.0.1:10002"));
}

#[test]
fn late_joiner_ignores_pre_welcome_traffic_then_delivers_from_the_welcome_seq() {
    let mut c = ordinary(10, "127.0.0.1:10010", CommunicationConfig::default());

    // A's multi-receiver Acked channel toward C has carried traffic since
    // before C joined (sequence 43), so C has no welcome yet: the message
    // is silently dropped, not even acked.
    let stale = multi_receiver_datagram(1, 10, 7, 43, b"too early");
    let events = c.handle_datagram(&stale).unwrap();
    assert!(events.is_empty(), "pre-welcome traffic must not be delivered or acked");

    // A catches C up with an explicit welcome at sequence 44: the payload
    // is the id of the node being welcomed (C itself), establishing the
    // channel's baseline.
    let welcome = multi_receiver_datagram(
        1,
        10,
        safir_wire::common::data_type::WELCOME,
        44,
        &10i64.to_le_bytes(),
    );
    let events = c.handle_datagram(&welcome).unwrap();
    assert!(
        !events.iter().any(|e| matches!(e, FacadeEvent::Delivered(_))),
        "the welcome itself never counts as a delivered message"
    );
    assert!(events.iter().any(|e| matches!(e, FacadeEvent::SendAck { .. })));

    // Everything from the welcome sequence onward now delivers normally.
    let fresh = multi_receiver_datagram(1, 10, 7, 45, b"now current");
    let events = c.handle_datagram(&fresh).unwrap();
    let delivered: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            FacadeEvent::Delivered(m) => Some(m.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].payload, b"now current");
}
