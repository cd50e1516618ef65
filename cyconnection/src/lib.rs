//! The reliable device transport of cync-lan.
//!
//! A [`CyncTransport`] converses with one Cync device over its long-lived
//! TCP session using the device's native acknowledgment packets: handshake,
//! heartbeat, ack correlation, retries, deduplication and reconnection all
//! live here. The codec ([`cybase`]), the framer and queues
//! ([`cyinterface`]) and the reliability primitives ([`cyrecovery`]) are
//! pure; this crate is where they meet the socket.

mod router;

pub mod config;
pub mod error;
pub mod registry;
pub mod state;
pub mod transport;

pub use config::TransportConfig;
pub use error::{
    AckTimeoutError, ConnectError, CyncConnectionError, DuplicatePacketError, HandshakeError,
    PacketReceiveError,
};
pub use state::ConnectionState;
pub use transport::{CyncTransport, SendResult, TrackedPacket};
