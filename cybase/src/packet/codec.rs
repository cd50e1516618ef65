//! Byte-exact encoders and the decoder for every recognized packet type.

use bytes::{BufMut, Bytes, BytesMut};
use nom::{
    number::complete::{be_u16, u8 as byte},
    IResult,
};

use super::{
    checksum, Endpoint, MsgId, Packet, PacketBody, PacketType, ENDPOINT_SIZE, FRAME_MARKER,
    HEADER_SIZE, MAX_PACKET_SIZE, MSG_ID_SIZE,
};
use crate::error::PacketDecodeError;

/// Framing overhead of a 0x73 body: endpoint, msg id, padding, two markers
/// and the checksum byte.
const DATA_OVERHEAD: usize = ENDPOINT_SIZE + MSG_ID_SIZE + 4;
/// Framing overhead of a 0x83 body: as 0x73, minus the padding byte.
const STATUS_OVERHEAD: usize = ENDPOINT_SIZE + MSG_ID_SIZE + 3;

/// Largest inner payload a 0x73 packet can carry.
pub const MAX_DATA_PAYLOAD: usize = MAX_PACKET_SIZE - DATA_OVERHEAD;

fn put_header(buf: &mut BytesMut, packet_type: PacketType, body_len: usize) {
    debug_assert!(body_len <= MAX_PACKET_SIZE);
    buf.put_u8(packet_type as u8);
    buf.put_u16(0); // flags, always zero on the wire
    buf.put_u8((body_len >> 8) as u8);
    buf.put_u8((body_len & 0xFF) as u8);
}

/// Encode a 0x23 device hello: endpoint at bytes 5..10, auth material as
/// the unframed remainder.
pub fn encode_handshake(endpoint: &Endpoint, auth_code: &[u8]) -> Bytes {
    let body_len = ENDPOINT_SIZE + auth_code.len();
    assert!(body_len <= MAX_PACKET_SIZE, "auth material too large");
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + body_len);
    put_header(&mut buf, PacketType::Handshake, body_len);
    buf.put_slice(endpoint);
    buf.put_slice(auth_code);
    buf.freeze()
}

/// Encode a 0x28 reply to a hello.
pub fn encode_hello_ack(endpoint: &Endpoint) -> Bytes {
    encode_addressed(PacketType::HandshakeAck, endpoint)
}

/// Encode a 0x48 reply to a device attribute report.
pub fn encode_info_ack(endpoint: &Endpoint) -> Bytes {
    encode_addressed(PacketType::InfoAck, endpoint)
}

fn encode_addressed(packet_type: PacketType, endpoint: &Endpoint) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + ENDPOINT_SIZE);
    put_header(&mut buf, packet_type, ENDPOINT_SIZE);
    buf.put_slice(endpoint);
    buf.freeze()
}

/// Encode a 0x73 data command.
///
/// Layout: `header(5) | endpoint(5) | msg_id(2) | padding(1, 0x00) | 0x7E |
/// payload | checksum | 0x7E`.
pub fn encode_data_packet(endpoint: &Endpoint, msg_id: MsgId, payload: &[u8]) -> Bytes {
    encode_framed(PacketType::Data, endpoint, msg_id, payload, true)
}

/// Encode a 0x83 status broadcast, which differs from 0x73 only by the
/// absent padding byte between the msg id and the opening marker.
pub fn encode_status_broadcast(endpoint: &Endpoint, msg_id: MsgId, payload: &[u8]) -> Bytes {
    encode_framed(PacketType::Status, endpoint, msg_id, payload, false)
}

fn encode_framed(
    packet_type: PacketType,
    endpoint: &Endpoint,
    msg_id: MsgId,
    payload: &[u8],
    padded: bool,
) -> Bytes {
    let overhead = if padded { DATA_OVERHEAD } else { STATUS_OVERHEAD };
    let body_len = overhead + payload.len();
    assert!(body_len <= MAX_PACKET_SIZE, "payload too large for one packet");
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + body_len);
    put_header(&mut buf, packet_type, body_len);
    buf.put_slice(endpoint);
    buf.put_slice(&msg_id);
    if padded {
        buf.put_u8(0x00);
    }
    let start = buf.len();
    buf.put_u8(FRAME_MARKER);
    buf.put_slice(payload);
    buf.put_u8(0x00); // checksum, patched once the span is complete
    buf.put_u8(FRAME_MARKER);
    let end = buf.len() - 1;
    buf[end - 1] = checksum::sum_span(&buf, start, end);
    buf.freeze()
}

/// Encode a 0x7B ack, echoing the request's endpoint and msg id at the
/// request's byte positions.
pub fn encode_data_ack(endpoint: &Endpoint, msg_id: MsgId) -> Bytes {
    encode_echo(PacketType::DataAck, endpoint, msg_id)
}

/// Encode a 0x88 ack for a status broadcast.
pub fn encode_status_ack(endpoint: &Endpoint, msg_id: MsgId) -> Bytes {
    encode_echo(PacketType::StatusAck, endpoint, msg_id)
}

fn encode_echo(packet_type: PacketType, endpoint: &Endpoint, msg_id: MsgId) -> Bytes {
    let body_len = ENDPOINT_SIZE + MSG_ID_SIZE;
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + body_len);
    put_header(&mut buf, packet_type, body_len);
    buf.put_slice(endpoint);
    buf.put_slice(&msg_id);
    buf.freeze()
}

/// Encode a 0xD3 keepalive probe, header only.
pub fn encode_heartbeat() -> Bytes {
    encode_bare(PacketType::Heartbeat)
}

/// Encode a 0xD8 keepalive reply, header only.
pub fn encode_heartbeat_ack() -> Bytes {
    encode_bare(PacketType::HeartbeatAck)
}

fn encode_bare(packet_type: PacketType) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE);
    put_header(&mut buf, packet_type, 0);
    buf.freeze()
}

struct RawHeader {
    packet_type: u8,
    length: u16,
}

fn parse_header(input: &[u8]) -> IResult<&[u8], RawHeader> {
    let (input, packet_type) = byte(input)?;
    let (input, _flags) = be_u16(input)?;
    let (input, length_hi) = byte(input)?;
    let (input, length_lo) = byte(input)?;
    let length = u16::from(length_hi) * 256 + u16::from(length_lo);
    Ok((
        input,
        RawHeader {
            packet_type,
            length,
        },
    ))
}

/// Decode one complete packet from `input`.
///
/// `input` must hold at least the packet's declared extent; trailing bytes
/// past the extent are ignored. Marker location and checksum verification
/// happen strictly within the extent, never against the whole buffer.
pub fn decode_packet(input: &[u8]) -> Result<Packet, PacketDecodeError> {
    let (_, header) = parse_header(input).map_err(|_| PacketDecodeError::too_short(input))?;
    let packet_type = PacketType::from_byte(header.packet_type)
        .ok_or_else(|| PacketDecodeError::unknown_type(header.packet_type, input))?;
    let length = header.length as usize;
    if length > MAX_PACKET_SIZE {
        return Err(PacketDecodeError::invalid_length(length, input));
    }
    let extent = HEADER_SIZE + length;
    if input.len() < extent {
        return Err(PacketDecodeError::too_short(input));
    }
    let raw = Bytes::copy_from_slice(&input[..extent]);

    let body = match packet_type {
        PacketType::Handshake => {
            let endpoint = read_endpoint(&raw)?;
            let auth_code = raw.slice(HEADER_SIZE + ENDPOINT_SIZE..);
            PacketBody::Handshake {
                endpoint,
                auth_code,
            }
        }
        PacketType::Data | PacketType::Status => decode_framed(packet_type, &raw)?,
        PacketType::DataAck | PacketType::StatusAck => {
            let endpoint = read_endpoint(&raw)?;
            let msg_id = read_msg_id(&raw)?;
            PacketBody::Echo { endpoint, msg_id }
        }
        PacketType::HandshakeAck | PacketType::DeviceInfo | PacketType::InfoAck => {
            let endpoint = read_endpoint(&raw)?;
            let body = raw.slice(HEADER_SIZE + ENDPOINT_SIZE..);
            PacketBody::Addressed { endpoint, body }
        }
        PacketType::Heartbeat | PacketType::HeartbeatAck => PacketBody::Bare,
    };

    Ok(Packet::new(packet_type, header.length, raw, body))
}

fn read_endpoint(raw: &[u8]) -> Result<Endpoint, PacketDecodeError> {
    let Some(bytes) = raw.get(HEADER_SIZE..HEADER_SIZE + ENDPOINT_SIZE) else {
        return Err(PacketDecodeError::too_short(raw));
    };
    let mut endpoint = Endpoint::default();
    endpoint.copy_from_slice(bytes);
    Ok(endpoint)
}

fn read_msg_id(raw: &[u8]) -> Result<MsgId, PacketDecodeError> {
    let at = HEADER_SIZE + ENDPOINT_SIZE;
    let Some(bytes) = raw.get(at..at + MSG_ID_SIZE) else {
        return Err(PacketDecodeError::too_short(raw));
    };
    Ok([bytes[0], bytes[1]])
}

fn decode_framed(packet_type: PacketType, raw: &Bytes) -> Result<PacketBody, PacketDecodeError> {
    let endpoint = read_endpoint(raw)?;
    let msg_id = read_msg_id(raw)?;

    // The opening marker sits at a fixed offset past the padding byte (0x73)
    // or the msg id (0x83); the closing marker is the packet's last byte.
    let start = checksum::opening_marker_offset(packet_type).expect("only framed types reach here");
    let end = raw.len() - 1;
    if end < start + 2
        || raw.get(start) != Some(&FRAME_MARKER)
        || raw.get(end) != Some(&FRAME_MARKER)
    {
        return Err(PacketDecodeError::missing_markers(raw));
    }

    let stored = raw[end - 1];
    let computed = checksum::sum_span(raw, start, end);
    if computed != stored {
        return Err(PacketDecodeError::InvalidChecksum { computed, stored });
    }

    Ok(PacketBody::Framed {
        endpoint,
        msg_id,
        payload: raw.slice(start + 1..end - 1),
        checksum_valid: true,
    })
}
