//! Packet extraction from a TCP byte stream.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use cybase::packet::{HEADER_SIZE, MAX_PACKET_SIZE};
use cyevent::{
    metrics::{names, NoopMetrics},
    MetricsSink,
};

use crate::error::PacketFramingError;

/// Fewest fast-forward attempts one `feed` call is granted.
const MIN_RECOVERY_ATTEMPTS: usize = 100;
/// Most fast-forward attempts one `feed` call is granted.
const MAX_RECOVERY_ATTEMPTS: usize = 1000;

/// Accumulates stream bytes and yields complete packets.
///
/// A header declaring more than [`MAX_PACKET_SIZE`] bytes advances the
/// buffer by exactly one header width and retries, so corrupt input is
/// scanned once, never quadratically. The number of such fast-forwards per
/// call is bounded by `clamp(buffer_len / 5, 100, 1000)`; past that the
/// whole buffer is discarded and the event logged once.
pub struct StreamFramer {
    buffer: BytesMut,
    metrics: Arc<dyn MetricsSink>,
    discards: u64,
}

impl Default for StreamFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamFramer {
    pub fn new() -> Self {
        Self::with_metrics(Arc::new(NoopMetrics))
    }

    pub fn with_metrics(metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            buffer: BytesMut::new(),
            metrics,
            discards: 0,
        }
    }

    /// Append stream bytes, then extract every complete packet in arrival
    /// order. Incomplete trailing data stays buffered for the next call.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(bytes);

        let mut packets = Vec::new();
        let budget = (self.buffer.len() / HEADER_SIZE)
            .clamp(MIN_RECOVERY_ATTEMPTS, MAX_RECOVERY_ATTEMPTS);
        let mut attempts = 0;

        while self.buffer.len() >= HEADER_SIZE {
            let length = usize::from(self.buffer[3]) * 256 + usize::from(self.buffer[4]);
            if length > MAX_PACKET_SIZE {
                let error = PacketFramingError::InvalidLength {
                    length,
                    max: MAX_PACKET_SIZE,
                };
                self.metrics.incr_counter(
                    names::FRAMING_ERRORS_TOTAL,
                    &[("reason", error.reason())],
                    1,
                );
                attempts += 1;
                if attempts >= budget {
                    self.discard_buffer();
                    break;
                }
                _ = self.buffer.split_to(HEADER_SIZE);
                continue;
            }

            let extent = HEADER_SIZE + length;
            if self.buffer.len() < extent {
                break;
            }
            packets.push(self.buffer.split_to(extent).freeze());
        }

        packets
    }

    fn discard_buffer(&mut self) {
        let error = PacketFramingError::BufferOverflow {
            discarded: self.buffer.len(),
        };
        tracing::warn!(%error, "stream framing lost sync");
        self.metrics.incr_counter(
            names::FRAMING_ERRORS_TOTAL,
            &[("reason", error.reason())],
            1,
        );
        self.buffer.clear();
        self.discards += 1;
    }

    /// Bytes currently waiting for the rest of their packet.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// How many times the whole buffer has been discarded.
    pub fn discards(&self) -> u64 {
        self.discards
    }
}

#[cfg(test)]
mod tests {
    use cybase::packet::codec::{encode_data_packet, encode_heartbeat};

    use super::*;

    const ENDPOINT: [u8; 5] = [1, 2, 3, 4, 5];

    #[test]
    fn reassembles_across_arbitrary_read_boundaries() {
        let first = encode_data_packet(&ENDPOINT, [0, 1], b"first");
        let second = encode_heartbeat();
        let mut stream = first.to_vec();
        stream.extend_from_slice(&second);

        for split in 1..stream.len() {
            let mut framer = StreamFramer::new();
            let mut packets = framer.feed(&stream[..split]);
            packets.extend(framer.feed(&stream[split..]));
            assert_eq!(packets.len(), 2, "split at {split}");
            assert_eq!(packets[0], first);
            assert_eq!(packets[1], second);
            assert_eq!(framer.buffered(), 0);
        }
    }

    #[test]
    fn exactly_five_bytes_waits_for_the_body() {
        let packet = encode_data_packet(&ENDPOINT, [0, 1], b"x");
        let mut framer = StreamFramer::new();
        assert!(framer.feed(&packet[..HEADER_SIZE]).is_empty());
        assert_eq!(framer.buffered(), HEADER_SIZE);
        let packets = framer.feed(&packet[HEADER_SIZE..]);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0], packet);
    }

    #[test]
    fn oversized_declared_length_fast_forwards_one_header() {
        // 0x10 0x01 declares 4097; the valid heartbeat follows five bytes in.
        let mut stream = vec![0x73, 0x00, 0x00, 0x10, 0x01];
        stream.extend_from_slice(&encode_heartbeat());
        let mut framer = StreamFramer::new();
        let packets = framer.feed(&stream);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0], encode_heartbeat());
    }

    #[test]
    fn corrupt_prefix_is_discarded_once_then_stream_recovers() {
        let mut framer = StreamFramer::new();
        // every 5-byte window of 0xFF declares length 0xFFFF
        assert!(framer.feed(&[0xFF; 600]).is_empty());
        assert!(framer.buffered() <= HEADER_SIZE);
        assert_eq!(framer.discards(), 1);

        let packet = encode_data_packet(&ENDPOINT, [0, 1], b"recovered");
        let packets = framer.feed(&packet);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0], packet);
        assert_eq!(framer.buffered(), 0);
        assert_eq!(framer.discards(), 1);
    }

    #[test]
    fn all_invalid_lengths_leave_at_most_one_header_buffered() {
        let mut framer = StreamFramer::new();
        assert!(framer.feed(&[0xFF; 303]).is_empty());
        assert!(framer.buffered() <= HEADER_SIZE);
    }

    #[test]
    fn zero_length_packets_are_complete_at_five_bytes() {
        let mut framer = StreamFramer::new();
        let packets = framer.feed(&encode_heartbeat());
        assert_eq!(packets.len(), 1);
        assert_eq!(framer.buffered(), 0);
    }
}
