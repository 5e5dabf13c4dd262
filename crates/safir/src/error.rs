use derive_more::{Display, Error, From};
use safir_core::{ConfigError, NodeId, NodeTypeId, ProtocolViolation};
use safir_wire::DecodeError;

/// The facade's error type: construction/routing mistakes plus whatever
/// bubbles up from the lower layers it composes.
#[derive(Debug, Display, Error, From, Clone, PartialEq, Eq)]
pub enum FacadeError {
    Config(ConfigError),
    Protocol(ProtocolViolation),
    Decode(DecodeError),
    #[display("node type {_0} has not been registered with register_peer_type")]
    #[from(ignore)]
    #[error(ignore)]
    UnknownNodeType(NodeTypeId),
    #[display("node {_0} is not in the node table")]
    #[from(ignore)]
    #[error(ignore)]
    UnknownNode(NodeId),
}
