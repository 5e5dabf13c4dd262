use derive_more::{Display, Error};

use crate::ids::{NodeId, NodeTypeId};

/// Fatal at construction time; the process should not start with an
/// invalid configuration.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[display("node id must be non-zero (0 is reserved for broadcast)")]
    ZeroNodeId,
    #[display(
        "unicast endpoint {unicast} and multicast endpoint {multicast} have different IP versions"
    )]
    MixedIpVersions { unicast: String, multicast: String },
    #[display(
        "node type {ours} and peer node type {theirs} are both configured as light nodes; \
         two light nodes must never discover each other"
    )]
    LightNodeToLightNodeDiscovery {
        ours: NodeTypeId,
        theirs: NodeTypeId,
    },
}

/// A self- or peer-corruption condition detected at runtime: the window
/// state is logged in full and the error is expected to propagate to
/// process supervision rather than be silently absorbed.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[display(
        "peer {peer} sent sequence {sequence} beyond the window \
         (lastInSequence={last_in_sequence}, window={window})"
    )]
    SequenceBeyondWindow {
        peer: NodeId,
        sequence: u64,
        last_in_sequence: u64,
        window: usize,
    },
    #[display(
        "receive slot collision for peer {peer}: slot held sequence {held}, \
         got conflicting sequence {incoming}"
    )]
    SlotCollision {
        peer: NodeId,
        held: u64,
        incoming: u64,
    },
    #[display("peer {peer} sent a second distinct welcome (first={first}, second={second})")]
    DuplicateDistinctWelcome { peer: NodeId, first: u64, second: u64 },
    #[display("node {node} was already present in the node table")]
    DuplicateAddNode { node: NodeId },
}
