//! The LAN-side control plane for Cync smart lighting devices.
//!
//! Cync bulbs and switches hold a long-lived TCP session and speak a
//! proprietary framed protocol over it. This workspace rebuilds the
//! cloud side of that conversation natively in async Rust:
//!
//! - [`cybase`]: the packet model, byte-exact codec and checksum;
//! - [`cyinterface`]: stream framing hardened against hostile input, and
//!   the bounded receive queue;
//! - `cyrecovery`: pending-ack journal, dedup cache and retry backoff;
//! - [`cyconnection`]: the reliable transport with handshake, heartbeats,
//!   ack correlation and reconnection;
//! - [`cyevent`]: the abstract metrics, event and observer surfaces.
//!
//! This crate ties them together behind [`CyncClient`], the entry point
//! applications use to connect device transports.

mod client;

pub use client::{send_group, CyncClient, CyncClientBuilder};
pub use cybase::{
    packet::{Endpoint, MsgId, Packet, PacketType},
    PacketDecodeError, TimeoutConfig,
};
pub use cyconnection::{
    ConnectError, ConnectionState, CyncConnectionError, CyncTransport, DuplicatePacketError,
    HandshakeError, PacketReceiveError, SendResult, TrackedPacket, TransportConfig,
};
pub use cyevent::{Direction, EventSink, MetricsSink, Observers, PacketObserver};
pub use cyinterface::{BoundedQueue, OverflowPolicy, PacketFramingError, QueueFullError};
