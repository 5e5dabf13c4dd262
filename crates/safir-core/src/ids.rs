use derive_more::Display;

/// A unique, non-zero node identity. `NodeId::BROADCAST` (zero) is reserved
/// to mean "all system nodes" when used as a send target; it never appears
/// as the identity of a real node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
pub struct NodeId(pub i64);

impl NodeId {
    pub const BROADCAST: Self = Self(0);

    #[must_use]
    pub fn is_broadcast(self) -> bool {
        self == Self::BROADCAST
    }
}

/// Names a configured class of nodes sharing retry timing and multicast
/// policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
pub struct NodeTypeId(pub i64);

/// Names an application payload kind (`DataTypeIdentifier`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
pub struct TypeId(pub i64);
