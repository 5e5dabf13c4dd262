//! Fixed-layout, little-endian wire encoding for the communication fabric.
//!
//! Every type here is a pure value type: no sockets, no async, no allocation
//! beyond what decoding a variable-length payload requires. Callers read a
//! `&[u8]` off the wire, decode it with the types in this crate, and hand the
//! resulting structured value to whichever strand owns it.

pub mod ack;
pub mod common;
pub mod envelope;
pub mod message;

pub use ack::Ack;
pub use common::{CommonHeader, DataType};
pub use envelope::{Discover, Envelope, NodeDescriptor, NodeInfo, NODE_INFO_FIXED_SIZE, NODE_INFO_PER_NODE_SIZE};
pub use message::{DeliveryGuarantee, MessageHeader, SendMethod};

use derive_more::{Display, Error};

/// Failure to decode a value from a byte slice that is too short or
/// otherwise malformed.
///
/// These are recoverable transport conditions (see the communication
/// subsystem's error handling design): the caller logs and discards the
/// datagram rather than propagating a fatal error.
#[derive(Debug, Display, Error, PartialEq, Eq, Clone)]
pub enum DecodeError {
    #[display("buffer too short: need at least {need} bytes, got {got}")]
    TooShort { need: usize, got: usize },
    #[display("invalid enum discriminant {value} for {name}")]
    InvalidDiscriminant { name: &'static str, value: u8 },
    #[display("string field is not valid utf-8")]
    InvalidUtf8,
}

pub(crate) fn require_len(buf: &[u8], need: usize) -> Result<(), DecodeError> {
    if buf.len() < need {
        Err(DecodeError::TooShort {
            need,
            got: buf.len(),
        })
    } else {
        Ok(())
    }
}
