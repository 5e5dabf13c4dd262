//! Datagram I/O (C1) and heartbeat beacons (C7): the only two components
//! that touch an actual socket. Everything else in the fabric deals in
//! `Vec<u8>` and `SocketAddr`.

pub mod heartbeat;
pub mod socket;

pub use heartbeat::HeartbeatSender;
pub use socket::{DatagramSocket, RecvOutcome};
