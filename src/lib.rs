//! Layered reliable-communication stack over unreliable datagrams.
//!
//! Four composed layers, each depending only on the one below:
//!
//! - **[`link`]**: stubborn point-to-point delivery with deduplication
//! - **[`urb`]**: uniform reliable broadcast via majority witnessing
//! - **[`fifo`]**: per-originator FIFO ordering on top of URB
//! - **[`lattice`]**: multi-shot lattice agreement, built on the link directly
//!
//! The [`node::Node`] driver owns all four layers plus the transport and
//! wires them together. Layers are pure state machines that return the
//! datagrams to transmit, so every protocol rule is testable without I/O;
//! the only asynchrony lives in the driver's event loop.

#![warn(clippy::pedantic)]

pub mod config;
pub mod directory;
pub mod fifo;
pub mod lattice;
pub mod link;
pub mod message;
pub mod node;
pub mod output;
pub mod transport;
pub mod urb;

pub use config::Mode;
pub use directory::{Directory, Host, ProcessId};
pub use link::{Outgoing, PerfectLink};
pub use message::{Envelope, Kind};
pub use node::Node;
pub use output::OutputLog;
pub use transport::{Transport, UdpTransport};
