//! Core structures of the Cync LAN protocol.
//!
//! This crate owns everything that is pure about the protocol: the packet
//! model, the byte-exact codec with its checksum, the wire-level message id
//! generator, and the timeout configuration every other layer derives its
//! deadlines from. Nothing in here performs IO; the framer, queues and the
//! reliable transport live in the sibling crates.

pub mod config;
pub mod error;
pub mod msgid;
pub mod packet;

pub use config::TimeoutConfig;
pub use error::PacketDecodeError;
pub use packet::{Endpoint, MsgId, Packet, PacketType, MAX_PACKET_SIZE};
