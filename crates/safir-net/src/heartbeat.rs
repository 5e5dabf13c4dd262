//! C7 Heartbeat: periodic liveness beacons, one instance per node type.

use std::time::{Duration, Instant};

use safir_core::NodeId;
use safir_wire::{common::data_type, CommonHeader};

/// Emits a `HeartbeatType` datagram (common header only) to every system
/// peer on a fixed interval. Carries no payload and no sequence number:
/// absence of heartbeats is observed elsewhere, this component only sends.
#[derive(Debug)]
pub struct HeartbeatSender {
    sender_id: NodeId,
    interval: Duration,
    last_sent: Option<Instant>,
}

impl HeartbeatSender {
    #[must_use]
    pub fn new(sender_id: NodeId, interval: Duration) -> Self {
        Self {
            sender_id,
            interval,
            last_sent: None,
        }
    }

    /// Whether `interval` has elapsed since the last beacon (or this is the
    /// first tick).
    #[must_use]
    pub fn due(&self, now: Instant) -> bool {
        match self.last_sent {
            None => true,
            Some(last) => now.duration_since(last) >= self.interval,
        }
    }

    /// Marks a beacon as sent at `now` and returns the header to encode and
    /// write to every system peer (via multicast if the node type has a
    /// multicast writer, else unicast to each peer individually).
    pub fn fire(&mut self, now: Instant) -> CommonHeader {
        self.last_sent = Some(now);
        CommonHeader {
            sender_id: self.sender_id.0,
            receiver_id: NodeId::BROADCAST.0,
            data_type: data_type::HEARTBEAT,
        }
    }
}
