use thiserror::Error;

/// Marker for every error the cync-lan protocol stack raises.
///
/// Sibling crates implement this for their own error types, so callers can
/// bound generic handling on one trait.
pub trait CyncProtocolError: std::error::Error {}

impl CyncProtocolError for PacketDecodeError {}

/// How many offending bytes an error value may carry.
///
/// Auth material travels in packet payloads, so error values never embed a
/// full buffer.
pub const PREVIEW_LEN: usize = 16;

/// Hex rendering of at most the first [`PREVIEW_LEN`] bytes of `bytes`.
pub fn preview(bytes: &[u8]) -> String {
    hex::encode(&bytes[..bytes.len().min(PREVIEW_LEN)])
}

/// Everything that can go wrong while decoding one packet.
///
/// Each variant corresponds to one `reason` label on the
/// `tcp_comm_decode_errors_total` counter, see [`PacketDecodeError::reason`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketDecodeError {
    #[error("packet truncated at {got} bytes, input starts with {preview}")]
    TooShort { got: usize, preview: String },
    #[error("declared length {length} exceeds the packet cap, input starts with {preview}")]
    InvalidLength { length: usize, preview: String },
    #[error("unrecognized packet type {packet_type:#04x}, input starts with {preview}")]
    UnknownType { packet_type: u8, preview: String },
    #[error("framed packet lacks its two 0x7e markers, input starts with {preview}")]
    MissingMarkers { preview: String },
    #[error("checksum mismatch, computed {computed:#04x} but packet stores {stored:#04x}")]
    InvalidChecksum { computed: u8, stored: u8 },
}

impl PacketDecodeError {
    /// Stable tag used as the `reason` metric label.
    pub fn reason(&self) -> &'static str {
        match self {
            PacketDecodeError::TooShort { .. } => "too_short",
            PacketDecodeError::InvalidLength { .. } => "invalid_length",
            PacketDecodeError::UnknownType { .. } => "unknown_type",
            PacketDecodeError::MissingMarkers { .. } => "missing_0x7e_markers",
            PacketDecodeError::InvalidChecksum { .. } => "invalid_checksum",
        }
    }

    pub(crate) fn too_short(input: &[u8]) -> Self {
        Self::TooShort {
            got: input.len(),
            preview: preview(input),
        }
    }

    pub(crate) fn invalid_length(length: usize, input: &[u8]) -> Self {
        Self::InvalidLength {
            length,
            preview: preview(input),
        }
    }

    pub(crate) fn unknown_type(packet_type: u8, input: &[u8]) -> Self {
        Self::UnknownType {
            packet_type,
            preview: preview(input),
        }
    }

    pub(crate) fn missing_markers(input: &[u8]) -> Self {
        Self::MissingMarkers {
            preview: preview(input),
        }
    }
}
