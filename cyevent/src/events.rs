//! Structured transport events.
//!
//! Events carry the identifiers a log pipeline needs to reconstruct a
//! session: the device id, the correlation id of the send or reception, and
//! hex-rendered wire identifiers. Payload bytes never appear in an event.

use serde::Serialize;
use serde_with::{hex::Hex, serde_as};

/// One loggable moment in a transport's life.
#[serde_as]
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TransportEvent {
    ConnectionStateChanged {
        device_id: String,
        from: &'static str,
        to: &'static str,
    },
    HandshakeCompleted {
        device_id: String,
        #[serde_as(as = "Hex")]
        endpoint: Vec<u8>,
    },
    PacketSent {
        device_id: String,
        correlation_id: String,
        packet_type: u8,
        #[serde_as(as = "Hex")]
        msg_id: Vec<u8>,
        attempt: u32,
    },
    PacketReceived {
        device_id: String,
        correlation_id: String,
        packet_type: u8,
        dedup_key: String,
    },
    MessageAbandoned {
        device_id: String,
        correlation_id: String,
        reason: &'static str,
    },
    ReconnectTriggered {
        device_id: String,
        reason: String,
    },
}

/// Where transport events go.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &TransportEvent);
}

/// Discards every event.
#[derive(Debug, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _: &TransportEvent) {}
}

/// Serializes each event to one JSON line on the `cyevent` tracing target.
#[derive(Debug, Default)]
pub struct JsonLogSink;

impl EventSink for JsonLogSink {
    fn emit(&self, event: &TransportEvent) {
        match serde_json::to_string(event) {
            Ok(line) => tracing::info!(target: "cyevent", "{line}"),
            Err(error) => tracing::warn!(target: "cyevent", "unserializable event: {error}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_hex_identifiers() {
        let event = TransportEvent::PacketSent {
            device_id: "bedroom-1".into(),
            correlation_id: "018f0e7a".into(),
            packet_type: 0x73,
            msg_id: vec![0xBE, 0xEF],
            attempt: 0,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"packet_sent\""));
        assert!(json.contains("\"msg_id\":\"beef\""));
        assert!(json.contains("\"packet_type\":115"));
    }
}
