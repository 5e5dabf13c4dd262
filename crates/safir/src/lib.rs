//! C8 Communication Facade: composes datagram I/O, the reliable/unacked
//! send and receive engines, the gossip discoverer, and heartbeats into the
//! public surface applications actually call.

pub mod error;
pub mod facade;

pub use error::FacadeError;
pub use facade::{Communication, FacadeEvent, OutboundBatch};
