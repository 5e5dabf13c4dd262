//! The reliable/unacked send and receive engines: [`send::DataSender`] (C5)
//! and [`recv::DeliveryHandler`] (C6).
//!
//! Both are plain, synchronous structs: the "strand" framing described in
//! the crate's design notes (one `tokio` task owning an `mpsc` inbox,
//! serializing all access) lives in [`strand`], one layer up, so the
//! core logic here stays unit-testable without a runtime.

pub mod recv;
pub mod send;
pub mod strand;

pub use recv::{DeliveredMessage, DeliveryHandler};
pub use send::DataSender;
