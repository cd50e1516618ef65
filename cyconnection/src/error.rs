use std::time::Duration;

use cybase::{error::CyncProtocolError, packet::MsgId, PacketDecodeError};
use thiserror::Error;
use uuid::Uuid;

/// Connection-level failures.
#[derive(Debug, Error)]
pub enum CyncConnectionError {
    #[error("transport for device {device_id} is not connected")]
    NotConnected { device_id: String },
    #[error("device {device_id} already has a live transport")]
    ParallelConnection { device_id: String },
    #[error("read on device {device_id} connection failed: {source}")]
    ReadFailed {
        device_id: String,
        source: std::io::Error,
    },
}

impl CyncConnectionError {
    /// Stable tag used as the `reason` metric label.
    pub fn reason(&self) -> &'static str {
        match self {
            CyncConnectionError::NotConnected { .. } => "not_connected",
            CyncConnectionError::ParallelConnection { .. } => "parallel_connection",
            CyncConnectionError::ReadFailed { .. } => "read_failed",
        }
    }
}

/// The 0x23/0x28 exchange failed on every attempt.
#[derive(Debug, Error)]
#[error("handshake with device {device_id} failed after {attempts} attempts: {reason}")]
pub struct HandshakeError {
    pub device_id: String,
    pub reason: String,
    pub attempts: u32,
}

/// Why `connect` did not produce a connected transport.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error(transparent)]
    Connection(#[from] CyncConnectionError),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
}

/// A reception that is a retransmission of something already delivered.
///
/// Normal during peer retries; the ack was still sent, callers typically
/// log and continue. `correlation_id` names the first delivery of this
/// content.
#[derive(Debug, Clone, Error)]
#[error("duplicate packet {dedup_key}, first delivered as {correlation_id}")]
pub struct DuplicatePacketError {
    pub dedup_key: String,
    pub correlation_id: Uuid,
}

/// Why `recv_reliable` returned no packet.
#[derive(Debug, Error)]
pub enum PacketReceiveError {
    #[error(transparent)]
    Duplicate(#[from] DuplicatePacketError),
    #[error("received packet failed to decode: {0}")]
    Decode(#[from] PacketDecodeError),
    #[error(transparent)]
    Connection(#[from] CyncConnectionError),
    #[error("transport closed while receiving")]
    Closed,
}

impl PacketReceiveError {
    /// Stable tag used as the `reason` metric label.
    pub fn reason(&self) -> &'static str {
        match self {
            PacketReceiveError::Duplicate(_) => "duplicate",
            PacketReceiveError::Decode(_) => "decode",
            PacketReceiveError::Connection(error) => error.reason(),
            PacketReceiveError::Closed => "closed",
        }
    }
}

/// One send attempt saw no ack in time. Consumed by the retry loop; only
/// logged, never surfaced.
#[derive(Debug, Clone, Error)]
#[error("no ack for msg id {msg_id:02x?} within {timeout:?}, {retries} retries so far")]
pub struct AckTimeoutError {
    pub msg_id: MsgId,
    pub timeout: Duration,
    pub retries: u32,
}

impl CyncProtocolError for CyncConnectionError {}
impl CyncProtocolError for HandshakeError {}
impl CyncProtocolError for ConnectError {}
impl CyncProtocolError for DuplicatePacketError {}
impl CyncProtocolError for PacketReceiveError {}
impl CyncProtocolError for AckTimeoutError {}
