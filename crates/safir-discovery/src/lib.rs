//! Gossip-based peer discovery (C4 `Discoverer`): seeds, reported, and
//! incomplete node tracking, paginated `NodeInfo` exchange, and time-scoped
//! exclusion of lightNode peers.
//!
//! A plain synchronous struct in the style of `safir-transport`'s
//! `DataSender`/`DeliveryHandler`: all I/O and timer scheduling live one
//! layer up, so the gossip logic itself stays unit-testable.

pub mod discoverer;

pub use discoverer::{DiscovererConfig, DiscoveryEvent, Discoverer, ExcludedEntry, SeedId};
