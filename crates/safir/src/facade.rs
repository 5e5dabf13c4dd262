//! The `Communication` type: one node's view of the fabric.
//!
//! Dispatches every inbound datagram by `dataType`, as a plain synchronous
//! struct in the style of `safir-transport`'s components: all socket I/O
//! and timer scheduling are the caller's responsibility (via `safir-net`),
//! so this type stays unit-testable without a runtime.

use std::time::Instant;

use ahash::HashMap;
use safir_core::{CommunicationConfig, Node, NodeId, NodeTable, NodeTypeConfig, NodeTypeId, TypeId};
use safir_discovery::{Discoverer, DiscovererConfig, DiscoveryEvent};
use safir_net::HeartbeatSender;
use safir_transport::{
    recv::DeliveredMessage,
    send::{Admission, OutboundDatagram},
    DataSender, DeliveryHandler,
};
use safir_wire::{
    Ack, CommonHeader, DataType, DeliveryGuarantee, Discover, Envelope, MessageHeader, NodeInfo,
};
use tracing::{debug, trace, trace_span};

use crate::error::FacadeError;

/// Per-remote-node-type sending state: each node type may configure a
/// different `retryTimeout`, so acked/unacked senders are kept one pair per
/// type rather than a single global instance.
#[derive(Debug)]
struct TypeSenders {
    acked: DataSender,
    unacked: DataSender,
}

/// Application-visible outcome of dispatching one inbound datagram or one
/// timer tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FacadeEvent {
    GotReceiveFrom(NodeId),
    NewNode(safir_wire::NodeDescriptor),
    NodeExcluded(NodeId),
    Delivered(DeliveredMessage),
    SendAck { to: NodeId, ack: Ack },
    SendControlData { to: NodeId, envelope: Envelope },
}

impl From<DiscoveryEvent> for FacadeEvent {
    fn from(event: DiscoveryEvent) -> Self {
        match event {
            DiscoveryEvent::NewNode(descriptor) => Self::NewNode(descriptor),
            DiscoveryEvent::NodeExcluded(id) => Self::NodeExcluded(id),
        }
    }
}

/// Everything a [`Communication::tick`] call produced: datagrams the
/// caller must actually write to a socket, plus higher-level events for the
/// application's registered callbacks.
#[derive(Debug, Default)]
pub struct OutboundBatch {
    pub datagrams: Vec<OutboundDatagram>,
    pub heartbeats: Vec<(NodeTypeId, CommonHeader)>,
    pub discovers: Vec<(String, Discover)>,
    pub events: Vec<FacadeEvent>,
}

/// One node's full view of the fabric: identity, known peers, the
/// reliable/unacked send and receive engines, the gossip discoverer, and
/// per-node-type heartbeat timers.
#[derive(Debug)]
pub struct Communication {
    my_id: NodeId,
    my_node_type: NodeTypeId,
    config: CommunicationConfig,
    nodes: NodeTable,
    delivery: DeliveryHandler,
    discoverer: Discoverer,
    senders: HashMap<NodeTypeId, TypeSenders>,
    heartbeats: HashMap<NodeTypeId, HeartbeatSender>,
}

impl Communication {
    /// Validates `my_id != 0` (zero is reserved for broadcast) per the
    /// fabric's construction-time configuration error.
    pub fn new(
        my_id: NodeId,
        my_descriptor: safir_wire::NodeDescriptor,
        my_node_type: NodeTypeId,
        my_type_config: &NodeTypeConfig,
        config: CommunicationConfig,
    ) -> Result<Self, FacadeError> {
        if my_id.is_broadcast() {
            return Err(FacadeError::Config(safir_core::ConfigError::ZeroNodeId));
        }
        let discoverer_config = DiscovererConfig {
            is_light_node: my_type_config.is_light_node,
            light_node_types: ahash::HashSet::default(),
            light_nodes_exclude_time_limit: config.light_nodes_exclude_time_limit,
            fragment_size: config.fragment_size,
        };
        let mut communication = Self {
            my_id,
            my_node_type,
            delivery: DeliveryHandler::new(my_id, config.sliding_window_size),
            discoverer: Discoverer::new(my_descriptor, my_node_type, discoverer_config),
            nodes: NodeTable::new(),
            senders: HashMap::default(),
            heartbeats: HashMap::default(),
            config,
        };
        communication.register_peer_type(my_node_type, my_type_config);
        Ok(communication)
    }

    /// Registers (or re-registers) the per-node-type settings governing
    /// how this node talks to peers of `type_id`: retry timing, heartbeat
    /// cadence, and whether that type is a lightNode class (which the
    /// discoverer must never pair with another lightNode class).
    pub fn register_peer_type(&mut self, type_id: NodeTypeId, type_config: &NodeTypeConfig) {
        if type_config.is_light_node {
            self.discoverer.config_mut().light_node_types.insert(type_id);
        }
        self.senders.insert(
            type_id,
            TypeSenders {
                acked: DataSender::new(
                    self.my_id,
                    type_id,
                    DeliveryGuarantee::Acked,
                    self.config.fragment_size,
                    self.config.send_queue_size,
                    self.config.sliding_window_size,
                    type_config.retry_timeout,
                    type_config.use_multicast,
                ),
                unacked: DataSender::new(
                    self.my_id,
                    type_id,
                    DeliveryGuarantee::Unacked,
                    self.config.fragment_size,
                    self.config.send_queue_size,
                    self.config.sliding_window_size,
                    type_config.retry_timeout,
                    type_config.use_multicast,
                ),
            },
        );
        self.heartbeats
            .insert(type_id, HeartbeatSender::new(self.my_id, type_config.heartbeat_interval));
    }

    #[must_use]
    pub fn my_id(&self) -> NodeId {
        self.my_id
    }

    /// `AddNode`: registers a peer's identity. The caller must have called
    /// `register_peer_type` for `node.node_type_id` first (via discovery or
    /// explicit static configuration) or sends to it will fail to route.
    pub fn add_node(&mut self, node: Node) {
        if !self.nodes.contains(node.node_id) {
            self.nodes.insert(node);
        }
    }

    pub fn include_node(&mut self, id: NodeId) {
        self.nodes.include(id);
    }

    /// `ExcludeNode`: drops the peer from the node table and every sender's
    /// receiver bookkeeping, then routes to the discoverer's exclusion
    /// branches (permanent for ordinary peers, time-limited for lightNode
    /// peers excluding others, none at all when an ordinary node excludes a
    /// lightNode).
    pub fn exclude_node(&mut self, now: Instant, id: NodeId) -> Vec<FacadeEvent> {
        let target_type = self.nodes.get(id).map(|n| n.node_type_id).unwrap_or(self.my_node_type);
        self.nodes.erase(id);
        if let Some(senders) = self.senders.get_mut(&target_type) {
            senders.acked.remove_node(id);
            senders.unacked.remove_node(id);
        }
        self.discoverer
            .exclude_node(now, id, target_type)
            .into_iter()
            .map(FacadeEvent::from)
            .collect()
    }

    pub fn inject_seeds(&mut self, addresses: impl IntoIterator<Item = String>) {
        for address in addresses {
            self.discoverer.inject_seed(address);
        }
    }

    /// `SendToNode`.
    pub fn send(
        &mut self,
        to: NodeId,
        data_type: TypeId,
        guarantee: DeliveryGuarantee,
        payload: &[u8],
    ) -> Result<Admission, FacadeError> {
        let node_type = self
            .nodes
            .get(to)
            .map(|n| n.node_type_id)
            .ok_or(FacadeError::UnknownNode(to))?;
        let senders = self
            .senders
            .get_mut(&node_type)
            .ok_or(FacadeError::UnknownNodeType(node_type))?;
        let sender = match guarantee {
            DeliveryGuarantee::Acked => &mut senders.acked,
            DeliveryGuarantee::Unacked => &mut senders.unacked,
        };
        Ok(sender.add_to_send_queue(to, payload, data_type.0))
    }

    /// `SendToNodeType`: broadcasts to every current system node of
    /// `node_type`.
    pub fn send_to_node_type(
        &mut self,
        node_type: NodeTypeId,
        data_type: TypeId,
        guarantee: DeliveryGuarantee,
        payload: &[u8],
    ) -> Result<Admission, FacadeError> {
        let senders = self
            .senders
            .get_mut(&node_type)
            .ok_or(FacadeError::UnknownNodeType(node_type))?;
        let sender = match guarantee {
            DeliveryGuarantee::Acked => &mut senders.acked,
            DeliveryGuarantee::Unacked => &mut senders.unacked,
        };
        Ok(sender.add_to_send_queue(NodeId::BROADCAST, payload, data_type.0))
    }

    #[must_use]
    pub fn number_of_undelivered_messages(&self) -> usize {
        self.delivery.number_of_undelivered_messages()
    }

    pub fn mark_consumed(&mut self, count: usize) {
        self.delivery.mark_consumed(count);
    }

    /// Decodes one inbound datagram and dispatches it by `dataType`:
    /// discards self-originated traffic, routes heartbeats to liveness,
    /// acks to the matching sender, control data to the discoverer, and
    /// everything else to the delivery handler.
    pub fn handle_datagram(&mut self, bytes: &[u8]) -> Result<Vec<FacadeEvent>, FacadeError> {
        let span = trace_span!("handle_datagram");
        let _span = span.enter();

        let common = CommonHeader::decode(bytes)?;
        if common.sender_id == self.my_id.0 {
            return Ok(Vec::new());
        }
        let sender = NodeId(common.sender_id);
        let mut events = Vec::new();

        match common.kind() {
            DataType::Heartbeat => {
                if let Some(node) = self.nodes.get(sender) {
                    if node.is_system_node {
                        events.push(FacadeEvent::GotReceiveFrom(sender));
                    }
                }
            }
            DataType::Ack => {
                let ack = Ack::decode(bytes, self.config.sliding_window_size)?;
                let node_type = self.nodes.get(sender).map(|n| n.node_type_id);
                if let Some(node_type) = node_type {
                    if let Some(senders) = self.senders.get_mut(&node_type) {
                        senders
                            .acked
                            .handle_ack(sender, ack.send_method, ack.sequence_number, &ack.missing);
                    }
                }
            }
            DataType::ControlData => {
                let envelope = Envelope::decode(&bytes[CommonHeader::ENCODE_LEN..])?;
                events.extend(self.handle_control_data(sender, envelope)?);
            }
            DataType::Welcome | DataType::Application(_) => {
                let header = MessageHeader::decode(bytes)?;
                let payload = &bytes[MessageHeader::ENCODE_LEN..];
                let outcome = self.delivery.receive(sender, &header, payload)?;
                if outcome.ack_now {
                    let ack = self.delivery.build_ack(sender, header.send_method);
                    events.push(FacadeEvent::SendAck { to: sender, ack });
                }
                events.extend(outcome.delivered.into_iter().map(FacadeEvent::Delivered));
            }
        }
        Ok(events)
    }

    fn handle_control_data(&mut self, sender: NodeId, envelope: Envelope) -> Result<Vec<FacadeEvent>, FacadeError> {
        match envelope {
            Envelope::Discover(discover) => {
                let sender_address = self
                    .nodes
                    .get(sender)
                    .map(|n| n.unicast_endpoint.clone())
                    .unwrap_or_default();
                let (discovered, pages) = self.discoverer.handle_discover(&sender_address, &discover)?;
                let mut events = self.fold_discovery_events(discovered);
                events.extend(pages.into_iter().map(|page: NodeInfo| FacadeEvent::SendControlData {
                    to: sender,
                    envelope: Envelope::NodeInfo(page),
                }));
                Ok(events)
            }
            Envelope::NodeInfo(info) => {
                let discovered = self.discoverer.handle_node_info(&info)?;
                Ok(self.fold_discovery_events(discovered))
            }
        }
    }

    /// Registers every newly-discovered node in the node table and converts
    /// each [`DiscoveryEvent`] into its [`FacadeEvent`] counterpart.
    fn fold_discovery_events(&mut self, discovered: Vec<DiscoveryEvent>) -> Vec<FacadeEvent> {
        let mut events = Vec::with_capacity(discovered.len());
        for event in discovered {
            if let DiscoveryEvent::NewNode(descriptor) = &event {
                let mut node = Node::new(
                    descriptor.name.clone(),
                    NodeId(descriptor.node_id),
                    NodeTypeId(descriptor.node_type_id),
                    descriptor.control_address.clone(),
                );
                node.multicast_endpoint = if descriptor.data_address.is_empty() {
                    None
                } else {
                    Some(descriptor.data_address.clone())
                };
                self.add_node(node);
                debug!(peer = descriptor.node_id, "discovered new node");
            }
            events.push(FacadeEvent::from(event));
        }
        events
    }

    /// Drives every timer-driven component: flushes each sender's queue,
    /// retransmits timed-out acked messages, fires due heartbeats, and
    /// advances the discoverer's gossip timer.
    pub fn tick(&mut self, now: Instant) -> OutboundBatch {
        let mut batch = OutboundBatch::default();
        for senders in self.senders.values_mut() {
            batch.datagrams.extend(senders.acked.handle_send_queue(now, &mut self.nodes));
            batch.datagrams.extend(senders.unacked.handle_send_queue(now, &mut self.nodes));
            let (retransmitted, notified) = senders.acked.retransmit_unacked(now);
            for peer in notified {
                trace!(peer = peer.0, "retransmit notification");
            }
            batch.datagrams.extend(retransmitted);
        }
        for (type_id, heartbeat) in &mut self.heartbeats {
            if heartbeat.due(now) {
                batch.heartbeats.push((*type_id, heartbeat.fire(now)));
            }
        }
        let (discovery_events, discovers) = self.discoverer.tick(now);
        batch.events.extend(discovery_events.into_iter().map(FacadeEvent::from));
        batch.discovers = discovers;
        batch
    }
}
