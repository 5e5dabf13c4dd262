use ahash::HashMap;

use crate::ids::{NodeId, NodeTypeId};

/// A known peer's identity and reachability.
///
/// Per-channel receive windows are not stored here: DataSender and
/// DeliveryHandler each own a logically identical table of peers
/// (populated and kept consistent by the facade), and each attaches its
/// own strand-local state to its copy of the entry. This table is the
/// shared, identity-only projection both strands start from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub name: String,
    pub node_id: NodeId,
    pub node_type_id: NodeTypeId,
    pub unicast_endpoint: String,
    pub multicast_endpoint: Option<String>,
    pub is_system_node: bool,
    pub is_seed: bool,
    pub last_sent_unicast_seq: u64,
}

impl Node {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        node_id: NodeId,
        node_type_id: NodeTypeId,
        unicast_endpoint: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            node_id,
            node_type_id,
            unicast_endpoint: unicast_endpoint.into(),
            multicast_endpoint: None,
            is_system_node: false,
            is_seed: false,
            last_sent_unicast_seq: 0,
        }
    }
}

/// `insert`/`erase`/`get`/`iter`/`include` over known peers, keyed by
/// [`NodeId`]. Duplicate insertion is a fatal programmer error: the caller
/// is expected to check `contains` first.
#[derive(Debug, Default)]
pub struct NodeTable {
    nodes: HashMap<NodeId, Node>,
}

impl NodeTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Panics
    /// Panics if `node.node_id` is already present; duplicate insertion is
    /// a programmer error, not a recoverable condition.
    pub fn insert(&mut self, node: Node) {
        let id = node.node_id;
        let previous = self.nodes.insert(id, node);
        assert!(
            previous.is_none(),
            "duplicate insertion of node {id} into node table"
        );
    }

    pub fn erase(&mut self, id: NodeId) -> Option<Node> {
        self.nodes.remove(&id)
    }

    #[must_use]
    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&id)
    }

    #[must_use]
    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn iter_system_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values().filter(|n| n.is_system_node)
    }

    /// Marks a node as a system node (`includeNode`). No-op if unknown.
    pub fn include(&mut self, id: NodeId) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.is_system_node = true;
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
