//! The Cync packet model.
//!
//! Every packet on the wire is `type:u8 | flags:u16 | length_hi:u8 |
//! length_lo:u8 | body[length]`. Data-bearing packets (0x73, 0x83) frame an
//! inner payload between two 0x7E markers with a one-byte checksum right
//! before the closing marker; the other types carry either an endpoint
//! echo or nothing at all.

use bytes::Bytes;
use getset::{CopyGetters, Getters};

pub mod checksum;
pub mod codec;

pub use checksum::calculate_checksum;

/// Width of the fixed packet header.
pub const HEADER_SIZE: usize = 5;
/// Upper bound on the declared body length of any packet.
pub const MAX_PACKET_SIZE: usize = 4096;
/// The byte framing the inner payload of data-bearing packets.
pub const FRAME_MARKER: u8 = 0x7E;
/// Width of the device endpoint identifier at body offset zero.
pub const ENDPOINT_SIZE: usize = 5;
/// Width of the wire-level message id.
pub const MSG_ID_SIZE: usize = 2;

/// The 5-byte connection identifier a device reports at bytes 5..10 of
/// every non-heartbeat packet.
pub type Endpoint = [u8; ENDPOINT_SIZE];

/// The 2-byte wire-level message id matching 0x7B acks to 0x73 sends.
pub type MsgId = [u8; MSG_ID_SIZE];

/// The closed set of packet types the core recognizes.
///
/// Requests pair with acks as 0x23↔0x28, 0x43↔0x48, 0x73↔0x7B, 0x83↔0x88
/// and 0xD3↔0xD8. Any other discriminant is a decode error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Device hello carrying endpoint and auth material.
    Handshake = 0x23,
    /// Cloud reply to a hello.
    HandshakeAck = 0x28,
    /// Device attribute report, opaque body.
    DeviceInfo = 0x43,
    /// Reply to a device attribute report.
    InfoAck = 0x48,
    /// Framed data command.
    Data = 0x73,
    /// Ack for a data command, echoing its msg id.
    DataAck = 0x7B,
    /// Framed status broadcast.
    Status = 0x83,
    /// Ack for a status broadcast.
    StatusAck = 0x88,
    /// Keepalive probe.
    Heartbeat = 0xD3,
    /// Keepalive reply.
    HeartbeatAck = 0xD8,
}

impl PacketType {
    /// Map a wire discriminant back to its type, if recognized.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x23 => Some(Self::Handshake),
            0x28 => Some(Self::HandshakeAck),
            0x43 => Some(Self::DeviceInfo),
            0x48 => Some(Self::InfoAck),
            0x73 => Some(Self::Data),
            0x7B => Some(Self::DataAck),
            0x83 => Some(Self::Status),
            0x88 => Some(Self::StatusAck),
            0xD3 => Some(Self::Heartbeat),
            0xD8 => Some(Self::HeartbeatAck),
            _ => None,
        }
    }

    /// The ack type paired with this request type, if it is a request.
    pub fn ack_type(self) -> Option<Self> {
        match self {
            Self::Handshake => Some(Self::HandshakeAck),
            Self::DeviceInfo => Some(Self::InfoAck),
            Self::Data => Some(Self::DataAck),
            Self::Status => Some(Self::StatusAck),
            Self::Heartbeat => Some(Self::HeartbeatAck),
            _ => None,
        }
    }

    /// Whether this type frames its payload between 0x7E markers.
    pub fn is_data_bearing(self) -> bool {
        matches!(self, Self::Data | Self::Status)
    }

    /// Whether this type acknowledges another packet.
    pub fn is_ack(self) -> bool {
        matches!(
            self,
            Self::HandshakeAck
                | Self::InfoAck
                | Self::DataAck
                | Self::StatusAck
                | Self::HeartbeatAck
        )
    }
}

/// The variant-specific content of a decoded packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketBody {
    /// 0x23: endpoint plus unframed auth material.
    Handshake { endpoint: Endpoint, auth_code: Bytes },
    /// 0x73 and 0x83: marker-framed payload with its verified checksum.
    Framed {
        endpoint: Endpoint,
        msg_id: MsgId,
        payload: Bytes,
        checksum_valid: bool,
    },
    /// 0x7B and 0x88: the request's endpoint and msg id echoed back.
    Echo { endpoint: Endpoint, msg_id: MsgId },
    /// 0x28, 0x43 and 0x48: endpoint plus an opaque remainder.
    Addressed { endpoint: Endpoint, body: Bytes },
    /// 0xD3 and 0xD8: header only.
    Bare,
}

/// One decoded packet.
///
/// `raw` always holds the full on-wire bytes, so `raw.len() == 5 + length`
/// for every value the decoder returns.
#[derive(Debug, Clone, PartialEq, Eq, Getters, CopyGetters)]
pub struct Packet {
    /// The recognized type discriminant.
    #[getset(get_copy = "pub")]
    packet_type: PacketType,
    /// Declared body length, `header[3] * 256 + header[4]`.
    #[getset(get_copy = "pub")]
    length: u16,
    /// The full on-wire bytes this value was decoded from.
    #[getset(get = "pub")]
    raw: Bytes,
    /// Variant-specific content.
    #[getset(get = "pub")]
    body: PacketBody,
}

impl Packet {
    pub(crate) fn new(packet_type: PacketType, length: u16, raw: Bytes, body: PacketBody) -> Self {
        Self {
            packet_type,
            length,
            raw,
            body,
        }
    }

    /// The endpoint this packet names, absent only for heartbeats.
    pub fn endpoint(&self) -> Option<&Endpoint> {
        match &self.body {
            PacketBody::Handshake { endpoint, .. }
            | PacketBody::Framed { endpoint, .. }
            | PacketBody::Echo { endpoint, .. }
            | PacketBody::Addressed { endpoint, .. } => Some(endpoint),
            PacketBody::Bare => None,
        }
    }

    /// The wire-level msg id, present on 0x73, 0x7B, 0x83 and 0x88.
    pub fn msg_id(&self) -> Option<MsgId> {
        match &self.body {
            PacketBody::Framed { msg_id, .. } | PacketBody::Echo { msg_id, .. } => Some(*msg_id),
            _ => None,
        }
    }

    /// The inner payload between the frame markers, for data-bearing types.
    pub fn payload(&self) -> Option<&Bytes> {
        match &self.body {
            PacketBody::Framed { payload, .. } => Some(payload),
            _ => None,
        }
    }

    /// Whether the framed checksum verified; vacuously true for unframed
    /// types.
    pub fn checksum_valid(&self) -> bool {
        match &self.body {
            PacketBody::Framed { checksum_valid, .. } => *checksum_valid,
            _ => true,
        }
    }
}
