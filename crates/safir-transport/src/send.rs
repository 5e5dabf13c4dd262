//! Per-node-type send queue: fragmentation, sliding-window dispatch, ack
//! bookkeeping, retransmission, and queue-not-full notification.
//!
//! A slot-per-fragment record plus an explicit-loop dispatch pass, in the
//! style of `aeronet_transport::send::{TransportSend, flush_on}`.

use std::{collections::VecDeque, sync::Arc, time::Instant};

use ahash::HashMap;
use safir_core::{NodeId, NodeTable, NodeTypeId};
use safir_wire::{message::fragment_data_size, CommonHeader, DeliveryGuarantee, MessageHeader, SendMethod};
use tracing::{debug, trace, trace_span};

/// Where one already-addressed datagram should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Unicast(NodeId),
    Multicast,
}

/// A fully encoded outbound datagram, handed to whatever owns the actual
/// socket. Kept abstract here so the send logic is unit-testable without a
/// network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundDatagram {
    pub destination: Destination,
    pub bytes: Vec<u8>,
}

/// Bookkeeping for one receiver of one queued fragment.
#[derive(Debug, Clone, Copy)]
struct ReceiverState {
    send_method: SendMethod,
    sequence_number: u64,
    send_time: Option<Instant>,
}

/// One fragment of one user send, still pending full transmission/ack.
#[derive(Debug)]
struct QueuedFragment {
    sender_id: NodeId,
    data_type: i64,
    payload: Arc<[u8]>,
    fragment_offset: u32,
    fragment_content_size: u32,
    fragment_number: u16,
    number_of_fragments: u16,
    send_to_all_system_nodes: bool,
    /// Populated once addressed (empty until `HandleSendQueue` assigns a
    /// sequence number and sends); for `SingleReceiver` sends this has at
    /// most one entry.
    receivers: HashMap<NodeId, ReceiverState>,
}

/// Per-node-type reliable/best-effort sender, one instance per
/// `(NodeTypeId, DeliveryGuarantee)` pair.
#[derive(Debug)]
pub struct DataSender {
    guarantee: DeliveryGuarantee,
    sender_id: NodeId,
    /// The peer node type this sender addresses: a broadcast send only
    /// reaches system nodes of this type, never peers of some other type
    /// that happen to share the same node table.
    peer_node_type: NodeTypeId,
    fragment_data_size: usize,
    send_queue_size: usize,
    sliding_window_size: usize,
    retry_timeout: std::time::Duration,
    /// Whether this node type has a multicast group configured: when set,
    /// `SendToNodeType` broadcasts collapse to one multicast datagram
    /// instead of one unicast datagram per system peer.
    use_multicast: bool,
    queue_not_full_notification_limit: usize,
    queue: VecDeque<QueuedFragment>,
    first_unhandled_index: usize,
    queue_not_full_latch: bool,
    last_sent_multi_receiver_seq: u64,
}

/// Outcome of [`DataSender::add_to_send_queue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    Rejected,
}

impl DataSender {
    #[must_use]
    pub fn new(
        sender_id: NodeId,
        peer_node_type: NodeTypeId,
        guarantee: DeliveryGuarantee,
        fragment_size: usize,
        send_queue_size: usize,
        sliding_window_size: usize,
        retry_timeout: std::time::Duration,
        use_multicast: bool,
    ) -> Self {
        Self {
            guarantee,
            sender_id,
            peer_node_type,
            fragment_data_size: fragment_data_size(fragment_size),
            send_queue_size,
            sliding_window_size,
            retry_timeout,
            use_multicast,
            // notify once back under 75% full, no separate config knob needed.
            queue_not_full_notification_limit: send_queue_size * 3 / 4,
            queue: VecDeque::new(),
            first_unhandled_index: 0,
            queue_not_full_latch: false,
            last_sent_multi_receiver_seq: 0,
        }
    }

    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn queue_not_full_latched(&self) -> bool {
        self.queue_not_full_latch
    }

    /// `AddToSendQueue`. `to_id == NodeId::BROADCAST` means "all system
    /// nodes". Returns [`Admission::Rejected`] (and latches the
    /// queue-not-full notification) if admitting this message's fragments
    /// would exceed `send_queue_size` and the queue is not currently empty.
    /// A single message that alone exceeds capacity is still admitted when
    /// the queue is empty, so fragmentation never partially fails (the
    /// "extension" region, see the crate's design notes).
    pub fn add_to_send_queue(&mut self, to_id: NodeId, payload: &[u8], data_type: i64) -> Admission {
        let total_fragments = payload.len().div_ceil(self.fragment_data_size).max(1);
        let would_be_size = self.queue.len() + total_fragments;
        if would_be_size > self.send_queue_size && !self.queue.is_empty() {
            self.queue_not_full_latch = true;
            trace!(to_id = to_id.0, total_fragments, "send queue full, rejecting");
            return Admission::Rejected;
        }

        let payload: Arc<[u8]> = Arc::from(payload);
        let send_to_all = to_id.is_broadcast();
        for i in 0..total_fragments {
            let offset = i * self.fragment_data_size;
            let len = (payload.len() - offset).min(self.fragment_data_size);
            let mut receivers = HashMap::default();
            if !send_to_all {
                receivers.insert(
                    to_id,
                    ReceiverState {
                        send_method: SendMethod::SingleReceiver,
                        sequence_number: 0,
                        send_time: None,
                    },
                );
            }
            self.queue.push_back(QueuedFragment {
                sender_id: self.sender_id,
                data_type,
                payload: Arc::clone(&payload),
                fragment_offset: u32::try_from(offset).expect("fragment offset fits in u32"),
                fragment_content_size: u32::try_from(len).expect("fragment length fits in u32"),
                fragment_number: u16::try_from(i).expect("fragment count fits in u16"),
                number_of_fragments: u16::try_from(total_fragments)
                    .expect("fragment count fits in u16"),
                send_to_all_system_nodes: send_to_all,
                receivers,
            });
        }
        Admission::Accepted
    }

    /// `HandleSendQueue`: assigns sequence numbers and produces the
    /// datagrams to actually write to the network. The caller is
    /// responsible for writing each returned [`OutboundDatagram`] via
    /// whichever socket owns this node-type.
    pub fn handle_send_queue(&mut self, now: Instant, nodes: &mut NodeTable) -> Vec<OutboundDatagram> {
        let span = trace_span!("handle_send_queue");
        let _span = span.enter();

        let mut out = Vec::new();
        let has_multicast_writer = self.use_multicast;
        let system_peers: Vec<NodeId> = nodes
            .iter_system_nodes()
            .filter(|n| n.node_type_id == self.peer_node_type)
            .map(|n| n.node_id)
            .collect();

        while self.first_unhandled_index < self.sliding_window_size
            && self.first_unhandled_index < self.queue.len()
        {
            let index = self.first_unhandled_index;
            let fragment = &mut self.queue[index];

            if fragment.send_to_all_system_nodes {
                self.last_sent_multi_receiver_seq += 1;
                let seq = self.last_sent_multi_receiver_seq;
                let header = build_header(
                    fragment,
                    fragment.sender_id,
                    NodeId::BROADCAST,
                    SendMethod::MultiReceiver,
                    seq,
                    self.guarantee,
                );
                if has_multicast_writer {
                    out.push(OutboundDatagram {
                        destination: Destination::Multicast,
                        bytes: encode(&header, &fragment.payload, fragment.fragment_offset, fragment.fragment_content_size),
                    });
                } else {
                    for &peer in &system_peers {
                        out.push(OutboundDatagram {
                            destination: Destination::Unicast(peer),
                            bytes: encode(&header, &fragment.payload, fragment.fragment_offset, fragment.fragment_content_size),
                        });
                    }
                }
                for &peer in &system_peers {
                    fragment.receivers.insert(
                        peer,
                        ReceiverState {
                            send_method: SendMethod::MultiReceiver,
                            sequence_number: seq,
                            send_time: Some(now),
                        },
                    );
                }
            } else {
                let peer_ids: Vec<NodeId> = fragment.receivers.keys().copied().collect();
                for peer_id in peer_ids {
                    if let Some(peer) = nodes.get_mut(peer_id) {
                        peer.last_sent_unicast_seq += 1;
                        let seq = peer.last_sent_unicast_seq;
                        let header = build_header(
                            fragment,
                            fragment.sender_id,
                            peer_id,
                            SendMethod::SingleReceiver,
                            seq,
                            self.guarantee,
                        );
                        out.push(OutboundDatagram {
                            destination: Destination::Unicast(peer_id),
                            bytes: encode(&header, &fragment.payload, fragment.fragment_offset, fragment.fragment_content_size),
                        });
                        if let Some(state) = fragment.receivers.get_mut(&peer_id) {
                            state.sequence_number = seq;
                            state.send_time = Some(now);
                        }
                    } else {
                        fragment.receivers.remove(&peer_id);
                    }
                }
            }

            match self.guarantee {
                DeliveryGuarantee::Acked => {
                    self.first_unhandled_index += 1;
                }
                DeliveryGuarantee::Unacked => {
                    self.queue.remove(index);
                    // index stays at first_unhandled_index; next loop
                    // iteration picks up the item that shifted into it.
                }
            }
        }
        out
    }

    /// `HandleAck`: removes receiver entries satisfied by the given ack,
    /// then dequeues any items whose receiver set has become empty.
    pub fn handle_ack(
        &mut self,
        acker: NodeId,
        ack_send_method: SendMethod,
        biggest_seq: u64,
        missing: &[bool],
    ) {
        if self.guarantee != DeliveryGuarantee::Acked {
            return;
        }
        for index in 0..self.first_unhandled_index.min(self.queue.len()) {
            let fragment = &mut self.queue[index];
            let Some(state) = fragment.receivers.get(&acker) else {
                continue;
            };
            if state.send_method != ack_send_method || state.sequence_number > biggest_seq {
                continue;
            }
            let distance = biggest_seq - state.sequence_number;
            let is_missing = missing
                .get(usize::try_from(distance).unwrap_or(usize::MAX))
                .copied()
                .unwrap_or(false);
            if !is_missing {
                fragment.receivers.remove(&acker);
            }
        }
        self.remove_completed_messages();
    }

    /// `RemoveCompletedMessages`: dequeues leading items with no remaining
    /// receivers and, if the queue-not-full latch is set and the queue has
    /// drained enough, clears it.
    fn remove_completed_messages(&mut self) {
        let mut removed = 0;
        while let Some(front) = self.queue.front() {
            if front.receivers.is_empty() {
                self.queue.pop_front();
                removed += 1;
            } else {
                break;
            }
        }
        self.first_unhandled_index = self.first_unhandled_index.saturating_sub(removed);
        self.notify_queue_not_full();
    }

    fn notify_queue_not_full(&mut self) -> bool {
        if self.queue_not_full_latch && self.queue.len() <= self.queue_not_full_notification_limit
        {
            // clear the latch before the caller invokes the callback, so a
            // re-entrant `add_to_send_queue` from within the callback can't
            // race with a stale latched state.
            self.queue_not_full_latch = false;
            return true;
        }
        false
    }

    /// `RetransmitUnackedMessages`: scans sent-but-unacked items older than
    /// `retry_timeout` and re-emits them unicast to every still-unacked
    /// receiver, preserving the original send method. Returns the
    /// datagrams to send plus the set of receivers notified of a
    /// retransmit, for the caller to forward to the facade's
    /// `retransmitTo` callback.
    pub fn retransmit_unacked(&mut self, now: Instant) -> (Vec<OutboundDatagram>, Vec<NodeId>) {
        if self.guarantee != DeliveryGuarantee::Acked {
            return (Vec::new(), Vec::new());
        }
        let mut out = Vec::new();
        let mut notified = Vec::new();
        for index in 0..self.first_unhandled_index.min(self.queue.len()) {
            let fragment = &mut self.queue[index];
            let receiver_ids: Vec<NodeId> = fragment.receivers.keys().copied().collect();
            for peer_id in receiver_ids {
                let send = {
                    let state = fragment.receivers.get(&peer_id).unwrap();
                    match state.send_time {
                        Some(sent_at) if now.duration_since(sent_at) > self.retry_timeout => true,
                        _ => false,
                    }
                };
                if !send {
                    continue;
                }
                let state = *fragment.receivers.get(&peer_id).unwrap();
                let header = build_header_from_state(fragment, fragment.sender_id, peer_id, state);
                out.push(OutboundDatagram {
                    destination: Destination::Unicast(peer_id),
                    bytes: encode(&header, &fragment.payload, fragment.fragment_offset, fragment.fragment_content_size),
                });
                fragment.receivers.get_mut(&peer_id).unwrap().send_time = Some(now);
                notified.push(peer_id);
                debug!(peer = peer_id.0, seq = state.sequence_number, "retransmitting");
            }
        }
        (out, notified)
    }

    /// `removeNode`: drops every receiver entry referencing `id`, then
    /// sweeps for newly-completed messages.
    pub fn remove_node(&mut self, id: NodeId) {
        for fragment in &mut self.queue {
            fragment.receivers.remove(&id);
        }
        self.remove_completed_messages();
    }
}

fn build_header(
    fragment: &QueuedFragment,
    sender_id: NodeId,
    receiver_id: NodeId,
    send_method: SendMethod,
    sequence_number: u64,
    guarantee: DeliveryGuarantee,
) -> MessageHeader {
    MessageHeader {
        common: CommonHeader {
            sender_id: sender_id.0,
            receiver_id: receiver_id.0,
            data_type: fragment.data_type,
        },
        send_method,
        delivery_guarantee: guarantee,
        ack_now: fragment.fragment_number + 1 == fragment.number_of_fragments,
        sequence_number,
        total_content_size: u32::try_from(fragment.payload.len()).unwrap_or(u32::MAX),
        fragment_offset: fragment.fragment_offset,
        fragment_content_size: fragment.fragment_content_size,
        fragment_number: fragment.fragment_number,
        number_of_fragments: fragment.number_of_fragments,
    }
}

fn build_header_from_state(
    fragment: &QueuedFragment,
    sender_id: NodeId,
    receiver_id: NodeId,
    state: ReceiverState,
) -> MessageHeader {
    build_header(
        fragment,
        sender_id,
        receiver_id,
        state.send_method,
        state.sequence_number,
        DeliveryGuarantee::Acked,
    )
}

fn encode(header: &MessageHeader, payload: &[u8], offset: u32, len: u32) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(MessageHeader::ENCODE_LEN + len as usize);
    bytes.extend_from_slice(&header.encode());
    bytes.extend_from_slice(&payload[offset as usize..offset as usize + len as usize]);
    bytes
}
