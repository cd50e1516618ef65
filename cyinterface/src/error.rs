use cybase::error::CyncProtocolError;
use thiserror::Error;

use crate::queue::OverflowPolicy;

/// Framing-level failures.
///
/// The framer recovers from all of these on its own (fast-forward or
/// discard); the values exist so recoveries carry a stable `reason` label
/// and a loggable rendering.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketFramingError {
    #[error("declared length {length} exceeds the {max}-byte packet cap")]
    InvalidLength { length: usize, max: usize },
    #[error("payload of {size} bytes cannot fit one packet")]
    PacketTooLarge { size: usize },
    #[error("framing recovery budget exhausted, discarding {discarded} buffered bytes")]
    BufferOverflow { discarded: usize },
}

impl PacketFramingError {
    /// Stable tag used as the `reason` metric label.
    pub fn reason(&self) -> &'static str {
        match self {
            PacketFramingError::InvalidLength { .. } => "invalid_length",
            PacketFramingError::PacketTooLarge { .. } => "packet_too_large",
            PacketFramingError::BufferOverflow { .. } => "buffer_overflow",
        }
    }
}

/// Raised by [`crate::BoundedQueue::try_put`] when the queue is full.
#[derive(Debug, Clone, Error)]
#[error("queue {queue_name} is full at {queue_size} items under {policy:?}")]
pub struct QueueFullError {
    pub queue_name: String,
    pub policy: OverflowPolicy,
    pub queue_size: usize,
}

impl CyncProtocolError for PacketFramingError {}
impl CyncProtocolError for QueueFullError {}
