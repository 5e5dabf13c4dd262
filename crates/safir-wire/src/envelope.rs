//! The Discoverer's control-data envelope.
//!
//! Wire encoding is the same hand-rolled fixed/length-prefixed little-endian
//! discipline used throughout this crate rather than a schema-compiler
//! format, since no other part of the fabric needs one.

use crate::{require_len, DecodeError};

fn encode_string(buf: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    let len = u16::try_from(bytes.len()).expect("address/name strings fit in u16");
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(bytes);
}

fn decode_string(buf: &[u8], offset: &mut usize) -> Result<String, DecodeError> {
    require_len(buf, *offset + 2)?;
    let len = u16::from_le_bytes(buf[*offset..*offset + 2].try_into().unwrap()) as usize;
    *offset += 2;
    require_len(buf, *offset + len)?;
    let s = std::str::from_utf8(&buf[*offset..*offset + len])
        .map_err(|_| DecodeError::InvalidUtf8)?
        .to_owned();
    *offset += len;
    Ok(s)
}

/// Identity and reachability of one node, as gossiped by the Discoverer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDescriptor {
    pub name: String,
    pub node_id: i64,
    pub node_type_id: i64,
    pub control_address: String,
    pub data_address: String,
}

impl NodeDescriptor {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        encode_string(buf, &self.name);
        buf.extend_from_slice(&self.node_id.to_le_bytes());
        buf.extend_from_slice(&self.node_type_id.to_le_bytes());
        encode_string(buf, &self.control_address);
        encode_string(buf, &self.data_address);
    }

    fn decode_from(buf: &[u8], offset: &mut usize) -> Result<Self, DecodeError> {
        let name = decode_string(buf, offset)?;
        require_len(buf, *offset + 16)?;
        let node_id = i64::from_le_bytes(buf[*offset..*offset + 8].try_into().unwrap());
        *offset += 8;
        let node_type_id = i64::from_le_bytes(buf[*offset..*offset + 8].try_into().unwrap());
        *offset += 8;
        let control_address = decode_string(buf, offset)?;
        let data_address = decode_string(buf, offset)?;
        Ok(Self {
            name,
            node_id,
            node_type_id,
            control_address,
            data_address,
        })
    }

    /// The sentinel descriptor used to advertise a seed address rather than
    /// a concretely known node.
    #[must_use]
    pub fn is_seed_sentinel(&self) -> bool {
        self.node_id == 0 && self.name == "seed"
    }
}

/// `{from, sentToId}`: a unicast probe asking the recipient to identify
/// itself and reply with a [`NodeInfo`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discover {
    pub from: NodeDescriptor,
    pub sent_to_id: i64,
}

/// A (possibly paginated) reply listing the nodes the sender knows about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub sent_from_id: i64,
    pub sent_to_id: i64,
    pub sent_from_node: NodeDescriptor,
    pub nodes: Vec<NodeDescriptor>,
    pub number_of_packets: i32,
    pub packet_number: i32,
}

/// The envelope's `oneof`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    Discover(Discover),
    NodeInfo(NodeInfo),
}

const TAG_DISCOVER: u8 = 0;
const TAG_NODE_INFO: u8 = 1;

impl Envelope {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Self::Discover(d) => {
                buf.push(TAG_DISCOVER);
                d.from.encode_into(&mut buf);
                buf.extend_from_slice(&d.sent_to_id.to_le_bytes());
            }
            Self::NodeInfo(n) => {
                buf.push(TAG_NODE_INFO);
                buf.extend_from_slice(&n.sent_from_id.to_le_bytes());
                buf.extend_from_slice(&n.sent_to_id.to_le_bytes());
                n.sent_from_node.encode_into(&mut buf);
                let count = u32::try_from(n.nodes.len()).expect("node list fits in u32");
                buf.extend_from_slice(&count.to_le_bytes());
                for node in &n.nodes {
                    node.encode_into(&mut buf);
                }
                buf.extend_from_slice(&n.number_of_packets.to_le_bytes());
                buf.extend_from_slice(&n.packet_number.to_le_bytes());
            }
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        require_len(buf, 1)?;
        let mut offset = 1;
        match buf[0] {
            TAG_DISCOVER => {
                let from = NodeDescriptor::decode_from(buf, &mut offset)?;
                require_len(buf, offset + 8)?;
                let sent_to_id = i64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap());
                Ok(Self::Discover(Discover { from, sent_to_id }))
            }
            TAG_NODE_INFO => {
                require_len(buf, offset + 16)?;
                let sent_from_id = i64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap());
                offset += 8;
                let sent_to_id = i64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap());
                offset += 8;
                let sent_from_node = NodeDescriptor::decode_from(buf, &mut offset)?;
                require_len(buf, offset + 4)?;
                let count =
                    u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap()) as usize;
                offset += 4;
                let mut nodes = Vec::with_capacity(count);
                for _ in 0..count {
                    nodes.push(NodeDescriptor::decode_from(buf, &mut offset)?);
                }
                require_len(buf, offset + 8)?;
                let number_of_packets =
                    i32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap());
                offset += 4;
                let packet_number =
                    i32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap());
                Ok(Self::NodeInfo(NodeInfo {
                    sent_from_id,
                    sent_to_id,
                    sent_from_node,
                    nodes,
                    number_of_packets,
                    packet_number,
                }))
            }
            value => Err(DecodeError::InvalidDiscriminant {
                name: "Envelope",
                value,
            }),
        }
    }
}

/// Conservative fixed upper bounds used for `NodeInfo` pagination math,
/// sized generously above the variable-length encoding above (short
/// names/addresses in practice).
pub const NODE_INFO_PER_NODE_SIZE: usize = 100;
pub const NODE_INFO_FIXED_SIZE: usize = 130;

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(id: i64) -> NodeDescriptor {
        NodeDescriptor {
            name: format!("node-{id}"),
            node_id: id,
            node_type_id: 7,
            control_address: "127.0.0.1:10000".to_owned(),
            data_address: "127.0.0.1:10001".to_owned(),
        }
    }

    #[test]
    fn round_trip_discover() {
        let env = Envelope::Discover(Discover {
            from: descriptor(1),
            sent_to_id: 2,
        });
        assert_eq!(Envelope::decode(&env.encode()).unwrap(), env);
    }

    #[test]
    fn round_trip_node_info_with_pagination() {
        let env = Envelope::NodeInfo(NodeInfo {
            sent_from_id: 1,
            sent_to_id: 2,
            sent_from_node: descriptor(1),
            nodes: vec![descriptor(3), descriptor(4)],
            number_of_packets: 2,
            packet_number: 0,
        });
        assert_eq!(Envelope::decode(&env.encode()).unwrap(), env);
    }

    #[test]
    fn round_trip_empty_node_info() {
        let env = Envelope::NodeInfo(NodeInfo {
            sent_from_id: 5,
            sent_to_id: 6,
            sent_from_node: descriptor(5),
            nodes: vec![],
            number_of_packets: 1,
            packet_number: 0,
        });
        assert_eq!(Envelope::decode(&env.encode()).unwrap(), env);
    }

    #[test]
    fn seed_sentinel_detection() {
        let seed = NodeDescriptor {
            name: "seed".to_owned(),
            node_id: 0,
            node_type_id: 0,
            control_address: "127.0.0.1:10000".to_owned(),
            data_address: String::new(),
        };
        assert!(seed.is_seed_sentinel());
        assert!(!descriptor(1).is_seed_sentinel());
    }
}
