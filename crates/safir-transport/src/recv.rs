//! Per-peer, per-channel receive windows: in-order reassembly, duplicate
//! suppression, welcome handling, and ack generation.
//!
//! A bounded sliding window with selective-repeat acks, addressed by a
//! fixed-size `missing` bitmap and a lazily-allocated shared reassembly
//! buffer per in-flight message.

use std::sync::{Arc, Mutex};

use ahash::HashMap;
use safir_core::{NodeId, ProtocolViolation};
use safir_wire::{
    common::data_type, Ack, CommonHeader, DeliveryGuarantee, MessageHeader, SendMethod,
};
use tracing::{trace, warn};

const WELCOME_SENTINEL: u64 = u64::MAX;

#[derive(Debug, Clone)]
struct Slot {
    free: bool,
    data_type: i64,
    sequence_number: u64,
    fragment_number: u16,
    number_of_fragments: u16,
    buffer: Option<Arc<Mutex<Vec<u8>>>>,
    total_content_size: u32,
}

impl Slot {
    fn free() -> Self {
        Self {
            free: true,
            data_type: 0,
            sequence_number: 0,
            fragment_number: 0,
            number_of_fragments: 0,
            buffer: None,
            total_content_size: 0,
        }
    }
}

/// One of the four logical receive channels of a peer.
#[derive(Debug)]
struct Channel {
    welcome_seq: u64,
    last_in_sequence: u64,
    biggest_sequence: u64,
    window: Vec<Slot>,
}

impl Channel {
    fn new(window_size: usize) -> Self {
        Self {
            welcome_seq: WELCOME_SENTINEL,
            last_in_sequence: 0,
            biggest_sequence: 0,
            window: vec![Slot::free(); window_size],
        }
    }

    fn force_insert_reset(&mut self, last_in_sequence: u64) {
        for slot in &mut self.window {
            *slot = Slot::free();
        }
        self.last_in_sequence = last_in_sequence;
    }
}

#[derive(Debug)]
struct PeerChannels {
    acked_single: Channel,
    acked_multi: Channel,
    unacked_single: Channel,
    unacked_multi: Channel,
}

impl PeerChannels {
    fn new(window_size: usize) -> Self {
        Self {
            acked_single: Channel::new(window_size),
            acked_multi: Channel::new(window_size),
            unacked_single: Channel::new(window_size),
            unacked_multi: Channel::new(window_size),
        }
    }

    fn get_mut(&mut self, guarantee: DeliveryGuarantee, send_method: SendMethod) -> &mut Channel {
        match (guarantee, send_method) {
            (DeliveryGuarantee::Acked, SendMethod::SingleReceiver) => &mut self.acked_single,
            (DeliveryGuarantee::Acked, SendMethod::MultiReceiver) => &mut self.acked_multi,
            (DeliveryGuarantee::Unacked, SendMethod::SingleReceiver) => &mut self.unacked_single,
            (DeliveryGuarantee::Unacked, SendMethod::MultiReceiver) => &mut self.unacked_multi,
        }
    }
}

/// A fully reassembled application message, ready for the application
/// callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredMessage {
    pub sender: NodeId,
    pub data_type: i64,
    pub sequence_number: u64,
    pub payload: Vec<u8>,
}

/// Outcome of feeding one datagram through [`DeliveryHandler::receive`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReceiveOutcome {
    pub ack_now: bool,
    pub delivered: Vec<DeliveredMessage>,
}

/// Per-peer, per-channel receive engine. One instance serves every peer;
/// internally it owns one [`PeerChannels`] per peer.
#[derive(Debug)]
pub struct DeliveryHandler {
    my_id: NodeId,
    window_size: usize,
    peers: HashMap<NodeId, PeerChannels>,
    undelivered_count: usize,
}

impl DeliveryHandler {
    #[must_use]
    pub fn new(my_id: NodeId, window_size: usize) -> Self {
        Self {
            my_id,
            window_size,
            peers: HashMap::default(),
            undelivered_count: 0,
        }
    }

    #[must_use]
    pub fn number_of_undelivered_messages(&self) -> usize {
        self.undelivered_count
    }

    /// Called by the application/delivery executor once it has consumed a
    /// batch of delivered messages, so the receive-side backpressure
    /// predicate can unblock.
    pub fn mark_consumed(&mut self, count: usize) {
        self.undelivered_count = self.undelivered_count.saturating_sub(count);
    }

    fn peer_mut(&mut self, peer: NodeId) -> &mut PeerChannels {
        self.peers
            .entry(peer)
            .or_insert_with(|| PeerChannels::new(self.window_size))
    }

    /// `ReceivedApplicationData`: dispatches a decoded header+payload to the
    /// acked or unacked path and returns whether (and what) to deliver and
    /// acknowledge.
    pub fn receive(
        &mut self,
        peer: NodeId,
        header: &MessageHeader,
        payload: &[u8],
    ) -> Result<ReceiveOutcome, ProtocolViolation> {
        let window_size = self.window_size;
        let my_id = self.my_id;
        let is_welcome = header.common.data_type == data_type::WELCOME;
        let channel = self
            .peer_mut(peer)
            .get_mut(header.delivery_guarantee, header.send_method);

        // Channels other than Acked-MultiReceiver don't require an
        // explicit welcome handshake: the first data message establishes
        // the baseline.
        let requires_explicit_welcome = matches!(
            (header.delivery_guarantee, header.send_method),
            (DeliveryGuarantee::Acked, SendMethod::MultiReceiver)
        );
        if channel.welcome_seq == WELCOME_SENTINEL && !requires_explicit_welcome && !is_welcome {
            channel.welcome_seq = header.sequence_number;
            channel.last_in_sequence = header.sequence_number.saturating_sub(1);
            channel.biggest_sequence = channel.last_in_sequence;
        }

        if is_welcome {
            match welcome_target(payload) {
                Some(target) => handle_welcome(channel, peer, header.sequence_number, target, my_id)?,
                None => warn!(peer = peer.0, "welcome payload too short to carry a target node id"),
            }
        }

        let s = header.sequence_number;
        let outcome = match header.delivery_guarantee {
            DeliveryGuarantee::Acked => {
                handle_acked_message(channel, peer, header, payload, window_size)?
            }
            DeliveryGuarantee::Unacked => {
                let delivered = handle_unacked_message(channel, peer, header, payload);
                ReceiveOutcome {
                    ack_now: false,
                    delivered,
                }
            }
        };
        trace!(peer = peer.0, seq = s, delivered = outcome.delivered.len(), "received");
        self.undelivered_count += outcome.delivered.len();
        Ok(outcome)
    }

    /// `SendAck`: builds the ack for a peer's acked channel of the given
    /// send method. Returns `None` if nothing has ever been received on
    /// that channel (no meaningful `biggestSequence` yet).
    #[must_use]
    pub fn build_ack(&mut self, peer: NodeId, send_method: SendMethod) -> Ack {
        let window_size = self.window_size;
        let my_id = self.my_id;
        let channel = self
            .peer_mut(peer)
            .get_mut(DeliveryGuarantee::Acked, send_method);
        let missing = (0..window_size)
            .map(|i| {
                let Some(seq) = channel.biggest_sequence.checked_sub(i as u64) else {
                    return false;
                };
                if seq <= channel.last_in_sequence {
                    return false;
                }
                let Some(index) = seq
                    .checked_sub(channel.last_in_sequence + 1)
                    .and_then(|d| usize::try_from(d).ok())
                else {
                    return false;
                };
                index >= window_size || channel.window[index].free
            })
            .collect();
        Ack {
            common: CommonHeader {
                sender_id: my_id.0,
                receiver_id: peer.0,
                data_type: data_type::ACK,
            },
            send_method,
            sequence_number: channel.biggest_sequence,
            missing,
        }
    }
}

/// The welcome payload is a bare little-endian node id: the peer being
/// welcomed onto this channel. Every system node sees every welcome sent
/// on a multi-receiver channel, whether or not it is the one being welcomed.
fn welcome_target(payload: &[u8]) -> Option<NodeId> {
    payload.get(..8)?.try_into().ok().map(i64::from_le_bytes).map(NodeId)
}

fn handle_welcome(
    channel: &mut Channel,
    peer: NodeId,
    s: u64,
    target: NodeId,
    my_id: NodeId,
) -> Result<(), ProtocolViolation> {
    if target != my_id {
        // Not for us: leave welcome_seq untouched. The normal acked-message
        // handling below still folds this sequence number into the window
        // (and acks it only if we were already welcomed at or before it).
        return Ok(());
    }
    if channel.welcome_seq == WELCOME_SENTINEL {
        channel.welcome_seq = s;
        channel.last_in_sequence = s.saturating_sub(1);
        channel.biggest_sequence = s;
        Ok(())
    } else if channel.welcome_seq == s {
        Ok(())
    } else {
        Err(ProtocolViolation::DuplicateDistinctWelcome {
            peer,
            first: channel.welcome_seq,
            second: s,
        })
    }
}

fn handle_acked_message(
    channel: &mut Channel,
    peer: NodeId,
    header: &MessageHeader,
    payload: &[u8],
    window_size: usize,
) -> Result<ReceiveOutcome, ProtocolViolation> {
    let s = header.sequence_number;
    channel.biggest_sequence = channel.biggest_sequence.max(s);

    if s < channel.welcome_seq {
        return Ok(ReceiveOutcome {
            ack_now: false,
            delivered: Vec::new(),
        });
    }
    if s <= channel.last_in_sequence {
        return Ok(ReceiveOutcome {
            ack_now: true,
            delivered: Vec::new(),
        });
    }
    if s == channel.last_in_sequence + 1 {
        insert(channel, peer, header, payload, window_size)?;
        let delivered = deliver(channel, peer);
        return Ok(ReceiveOutcome {
            ack_now: header.ack_now,
            delivered,
        });
    }
    if s <= channel.last_in_sequence + window_size as u64 {
        insert(channel, peer, header, payload, window_size)?;
        let delivered = deliver(channel, peer);
        return Ok(ReceiveOutcome {
            ack_now: true,
            delivered,
        });
    }

    warn!(
        peer = peer.0,
        sequence = s,
        last_in_sequence = channel.last_in_sequence,
        window = window_size,
        "acked sequence beyond window"
    );
    Err(ProtocolViolation::SequenceBeyondWindow {
        peer,
        sequence: s,
        last_in_sequence: channel.last_in_sequence,
        window: window_size,
    })
}

fn handle_unacked_message(
    channel: &mut Channel,
    peer: NodeId,
    header: &MessageHeader,
    payload: &[u8],
) -> Vec<DeliveredMessage> {
    let s = header.sequence_number;
    if s == channel.last_in_sequence + 1 {
        if insert(channel, peer, header, payload, channel.window.len()).is_ok() {
            return deliver(channel, peer);
        }
        return Vec::new();
    }
    if s > channel.last_in_sequence + 1 {
        let window_size = channel.window.len();
        channel.force_insert_reset(channel.last_in_sequence);
        if header.fragment_number == 0 {
            channel.last_in_sequence = s - 1;
            if insert(channel, peer, header, payload, window_size).is_ok() {
                return deliver(channel, peer);
            }
        } else if header.fragment_number < header.number_of_fragments {
            channel.last_in_sequence =
                s + u64::from(header.number_of_fragments - header.fragment_number) - 1;
        } else {
            warn!(
                peer = peer.0,
                sequence = s,
                fragment_number = header.fragment_number,
                number_of_fragments = header.number_of_fragments,
                "corrupt fragment indices, dropping datagram"
            );
        }
    }
    // s < last_in_sequence + 1: stale, dropped.
    Vec::new()
}

/// `CalculateIndices` + `Insert`.
fn insert(
    channel: &mut Channel,
    peer: NodeId,
    header: &MessageHeader,
    payload: &[u8],
    window_size: usize,
) -> Result<(), ProtocolViolation> {
    if header.fragment_number >= header.number_of_fragments {
        warn!(
            peer = peer.0,
            sequence = header.sequence_number,
            fragment_number = header.fragment_number,
            number_of_fragments = header.number_of_fragments,
            "corrupt fragment indices, dropping datagram"
        );
        return Ok(());
    }

    let s = header.sequence_number;
    let current_index = usize::try_from(s - channel.last_in_sequence - 1).unwrap_or(usize::MAX);
    if current_index >= window_size {
        return Err(ProtocolViolation::SequenceBeyondWindow {
            peer,
            sequence: s,
            last_in_sequence: channel.last_in_sequence,
            window: window_size,
        });
    }

    let existing = &channel.window[current_index];
    if !existing.free {
        if existing.sequence_number == s {
            return Ok(()); // duplicate
        }
        return Err(ProtocolViolation::SlotCollision {
            peer,
            held: existing.sequence_number,
            incoming: s,
        });
    }

    let first_index = current_index.saturating_sub(header.fragment_number as usize);
    let last_index = (current_index
        + usize::from(header.number_of_fragments - header.fragment_number - 1))
    .min(window_size - 1);

    let buffer = channel.window[first_index..=last_index]
        .iter()
        .find_map(|slot| slot.buffer.clone())
        .unwrap_or_else(|| Arc::new(Mutex::new(vec![0u8; header.total_content_size as usize])));

    {
        let mut guard = buffer.lock().expect("reassembly buffer mutex poisoned");
        let start = header.fragment_offset as usize;
        let end = start + header.fragment_content_size as usize;
        if end <= guard.len() {
            guard[start..end].copy_from_slice(payload);
        }
    }

    for slot in &mut channel.window[first_index..=last_index] {
        slot.buffer = Some(Arc::clone(&buffer));
    }

    channel.window[current_index] = Slot {
        free: false,
        data_type: header.common.data_type,
        sequence_number: s,
        fragment_number: header.fragment_number,
        number_of_fragments: header.number_of_fragments,
        buffer: Some(buffer),
        total_content_size: header.total_content_size,
    };
    Ok(())
}

/// `Deliver`: slides the window while slot 0 is populated, advancing
/// `lastInSequence`, and posts fully-received non-welcome messages.
fn deliver(channel: &mut Channel, peer: NodeId) -> Vec<DeliveredMessage> {
    let mut delivered = Vec::new();
    while !channel.window.first().map_or(true, |s| s.free) {
        let slot = channel.window.remove(0);
        channel.last_in_sequence += 1;
        if slot.fragment_number + 1 == slot.number_of_fragments && slot.data_type != data_type::WELCOME
        {
            if let Some(buffer) = &slot.buffer {
                let payload = buffer.lock().expect("reassembly buffer mutex poisoned").clone();
                delivered.push(DeliveredMessage {
                    sender: peer,
                    data_type: slot.data_type,
                    sequence_number: slot.sequence_number,
                    payload,
                });
            }
        }
        channel.window.push(Slot::free());
    }
    delivered
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(seq: u64, frag_num: u16, frag_total: u16, total_size: u32, ack_now: bool) -> MessageHeader {
        MessageHeader {
            common: CommonHeader {
                sender_id: 1,
                receiver_id: 2,
                data_type: 42,
            },
            send_method: SendMethod::SingleReceiver,
            delivery_guarantee: DeliveryGuarantee::Acked,
            ack_now,
            sequence_number: seq,
            total_content_size: total_size,
            fragment_offset: 0,
            fragment_content_size: total_size,
            fragment_number: frag_num,
            number_of_fragments: frag_total,
        }
    }

    #[test]
    fn first_message_establishes_baseline_and_delivers() {
        let mut handler = DeliveryHandler::new(NodeId(2), 64);
        let h = header(1, 0, 1, 5, true);
        let outcome = handler.receive(NodeId(1), &h, b"hello").unwrap();
        assert_eq!(outcome.delivered.len(), 1);
        assert_eq!(outcome.delivered[0].payload, b"hello");
        assert!(outcome.ack_now);
    }

    #[test]
    fn duplicate_already_delivered_is_acked_without_redelivery() {
        let mut handler = DeliveryHandler::new(NodeId(2), 64);
        let h = header(1, 0, 1, 5, true);
        handler.receive(NodeId(1), &h, b"hello").unwrap();
        let outcome = handler.receive(NodeId(1), &h, b"hello").unwrap();
        assert!(outcome.delivered.is_empty());
        assert!(outcome.ack_now);
    }

    #[test]
    fn out_of_order_within_window_inserts_and_delivers_once_gap_fills() {
        let mut handler = DeliveryHandler::new(NodeId(2), 64);
        let h1 = header(1, 0, 1, 5, true);
        handler.receive(NodeId(1), &h1, b"first").unwrap();
        let h3 = header(3, 0, 1, 5, true);
        let outcome = handler.receive(NodeId(1), &h3, b"third").unwrap();
        assert!(outcome.delivered.is_empty());
        assert!(outcome.ack_now);
        let h2 = header(2, 0, 1, 5, true);
        let outcome = handler.receive(NodeId(1), &h2, b"secnd").unwrap();
        assert_eq!(outcome.delivered.len(), 2);
        assert_eq!(outcome.delivered[0].payload, b"secnd");
        assert_eq!(outcome.delivered[1].payload, b"third");
    }

    #[test]
    fn beyond_window_is_a_protocol_violation() {
        let mut handler = DeliveryHandler::new(NodeId(2), 4);
        handler.receive(NodeId(1), &header(1, 0, 1, 1, true), b"a").unwrap();
        let result = handler.receive(NodeId(1), &header(100, 0, 1, 1, true), b"b");
        assert!(matches!(
            result,
            Err(ProtocolViolation::SequenceBeyondWindow { .. })
        ));
    }

    #[test]
    fn fragmented_message_delivers_whole_reassembled_buffer() {
        let mut handler = DeliveryHandler::new(NodeId(2), 64);
        let mut h1 = header(1, 0, 2, 10, false);
        h1.fragment_content_size = 5;
        let mut h2 = header(2, 1, 2, 10, true);
        h2.fragment_offset = 5;
        h2.fragment_content_size = 5;
        let outcome1 = handler.receive(NodeId(1), &h1, b"hello").unwrap();
        assert!(outcome1.delivered.is_empty());
        let outcome2 = handler.receive(NodeId(1), &h2, b"world").unwrap();
        assert_eq!(outcome2.delivered.len(), 1);
        assert_eq!(outcome2.delivered[0].payload, b"helloworld");
    }

    #[test]
    fn second_distinct_welcome_is_a_protocol_violation() {
        let mut handler = DeliveryHandler::new(NodeId(2), 64);
        let mut h = header(5, 0, 1, 1, true);
        h.send_method = SendMethod::MultiReceiver;
        h.common.data_type = data_type::WELCOME;
        let payload = 2i64.to_le_bytes(); // welcome is for us (NodeId(2))
        handler.receive(NodeId(1), &h, &payload).unwrap();
        h.sequence_number = 9;
        let result = handler.receive(NodeId(1), &h, &payload);
        assert!(matches!(
            result,
            Err(ProtocolViolation::DuplicateDistinctWelcome { .. })
        ));
    }

    #[test]
    fn welcome_meant_for_another_node_does_not_bind_or_crash() {
        // B (NodeId(3)) has already been welcomed at seq 10. A third node's
        // welcome (targeting NodeId(99), not B) passes through at seq 44:
        // B must neither rebind its own welcome_seq nor treat this as a
        // duplicate-distinct-welcome violation.
        let mut handler = DeliveryHandler::new(NodeId(3), 64);
        let mut welcome_for_us = header(10, 0, 1, 1, true);
        welcome_for_us.send_method = SendMethod::MultiReceiver;
        welcome_for_us.common.data_type = data_type::WELCOME;
        handler.receive(NodeId(1), &welcome_for_us, &3i64.to_le_bytes()).unwrap();

        let mut welcome_for_other = header(44, 0, 1, 1, true);
        welcome_for_other.send_method = SendMethod::MultiReceiver;
        welcome_for_other.common.data_type = data_type::WELCOME;
        let outcome = handler
            .receive(NodeId(1), &welcome_for_other, &99i64.to_le_bytes())
            .unwrap();
        assert!(outcome.delivered.is_empty(), "a welcome never delivers as application data");
    }

    #[test]
    fn unacked_gap_resyncs_mid_message() {
        let mut handler = DeliveryHandler::new(NodeId(2), 64);
        let mut first = header(1, 0, 1, 5, false);
        first.delivery_guarantee = DeliveryGuarantee::Unacked;
        let outcome = handler.receive(NodeId(1), &first, b"hello").unwrap();
        assert_eq!(outcome.delivered.len(), 1);

        // a gap, and we've joined mid-message at fragment 1 of 3 starting
        // at seq 10: resync lastInSequence to the next message boundary
        // (10 + (3-1) - 1 = 11) without delivering anything.
        let mut mid_gap = header(10, 1, 3, 9, false);
        mid_gap.delivery_guarantee = DeliveryGuarantee::Unacked;
        let outcome = handler.receive(NodeId(1), &mid_gap, b"frag").unwrap();
        assert!(outcome.delivered.is_empty());

        let mut next = header(12, 0, 1, 3, false);
        next.delivery_guarantee = DeliveryGuarantee::Unacked;
        let outcome = handler.receive(NodeId(1), &next, b"abc").unwrap();
        assert_eq!(outcome.delivered.len(), 1);
    }

    #[test]
    fn unacked_gap_with_corrupt_fragment_indices_is_dropped_not_panicking() {
        let mut handler = DeliveryHandler::new(NodeId(2), 64);
        let mut first = header(1, 0, 1, 5, false);
        first.delivery_guarantee = DeliveryGuarantee::Unacked;
        handler.receive(NodeId(1), &first, b"hello").unwrap();

        // fragment_number >= number_of_fragments is structurally corrupt;
        // this must not underflow, just drop the datagram.
        let mut corrupt = header(10, 3, 3, 9, false);
        corrupt.delivery_guarantee = DeliveryGuarantee::Unacked;
        let outcome = handler.receive(NodeId(1), &corrupt, b"frag").unwrap();
        assert!(outcome.delivered.is_empty());
    }

    #[test]
    fn acked_message_with_corrupt_fragment_indices_is_dropped_not_panicking() {
        let mut handler = DeliveryHandler::new(NodeId(2), 64);
        let h = header(1, 2, 2, 5, true);
        let outcome = handler.receive(NodeId(1), &h, b"hello").unwrap();
        assert!(outcome.delivered.is_empty(), "a corrupt fragment must never be reassembled");
    }
}
