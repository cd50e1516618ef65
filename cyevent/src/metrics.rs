//! The abstract metrics surface.
//!
//! Counters, gauges and histograms are addressed by name and label set;
//! the exposition format belongs to the surrounding application.

use std::{
    collections::HashMap,
    fmt::Write,
    sync::Mutex,
};

/// Label pairs attached to one observation.
pub type Labels<'a> = &'a [(&'static str, &'a str)];

/// Every metric series the core emits, by name.
pub mod names {
    pub const PACKET_SENT_TOTAL: &str = "tcp_comm_packet_sent_total";
    pub const PACKET_RECV_TOTAL: &str = "tcp_comm_packet_recv_total";
    pub const PACKET_LATENCY_SECONDS: &str = "tcp_comm_packet_latency_seconds";
    pub const PACKET_RETRANSMIT_TOTAL: &str = "tcp_comm_packet_retransmit_total";
    pub const DECODE_ERRORS_TOTAL: &str = "tcp_comm_decode_errors_total";
    pub const FRAMING_ERRORS_TOTAL: &str = "tcp_comm_framing_errors_total";
    pub const ACK_RECEIVED_TOTAL: &str = "tcp_comm_ack_received_total";
    pub const ACK_TIMEOUT_TOTAL: &str = "tcp_comm_ack_timeout_total";
    pub const IDEMPOTENT_DROP_TOTAL: &str = "tcp_comm_idempotent_drop_total";
    pub const RETRY_ATTEMPTS_TOTAL: &str = "tcp_comm_retry_attempts_total";
    pub const MESSAGE_ABANDONED_TOTAL: &str = "tcp_comm_message_abandoned_total";
    pub const CONNECTION_STATE: &str = "tcp_comm_connection_state";
    pub const HANDSHAKE_TOTAL: &str = "tcp_comm_handshake_total";
    pub const RECONNECTION_TOTAL: &str = "tcp_comm_reconnection_total";
    pub const HEARTBEAT_TOTAL: &str = "tcp_comm_heartbeat_total";
    pub const DEDUP_CACHE_SIZE: &str = "tcp_comm_dedup_cache_size";
    pub const DEDUP_CACHE_HITS_TOTAL: &str = "tcp_comm_dedup_cache_hits_total";
    pub const DEDUP_CACHE_EVICTIONS_TOTAL: &str = "tcp_comm_dedup_cache_evictions_total";
    pub const STATE_LOCK_HOLD_SECONDS: &str = "tcp_comm_state_lock_hold_seconds";
    pub const RECV_QUEUE_SIZE: &str = "tcp_comm_recv_queue_size";
    pub const QUEUE_FULL_TOTAL: &str = "tcp_comm_queue_full_total";
    pub const QUEUE_DROPPED_TOTAL: &str = "tcp_comm_queue_dropped_total";
    pub const QUEUE_POLICY_SWITCH_TOTAL: &str = "tcp_comm_queue_policy_switch_total";
}

/// Abstract recorder for the metric series in [`names`].
pub trait MetricsSink: Send + Sync {
    fn incr_counter(&self, name: &'static str, labels: Labels<'_>, value: u64);
    fn set_gauge(&self, name: &'static str, labels: Labels<'_>, value: f64);
    fn observe_histogram(&self, name: &'static str, labels: Labels<'_>, value: f64);
}

/// Discards every observation.
#[derive(Debug, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn incr_counter(&self, _: &'static str, _: Labels<'_>, _: u64) {}
    fn set_gauge(&self, _: &'static str, _: Labels<'_>, _: f64) {}
    fn observe_histogram(&self, _: &'static str, _: Labels<'_>, _: f64) {}
}

/// In-memory recorder for tests: series are flattened to
/// `name{k="v",...}` keys with labels in the order given.
#[derive(Debug, Default)]
pub struct MemoryMetrics {
    counters: Mutex<HashMap<String, u64>>,
    gauges: Mutex<HashMap<String, f64>>,
    histograms: Mutex<HashMap<String, Vec<f64>>>,
}

fn series_key(name: &str, labels: Labels<'_>) -> String {
    let mut key = String::from(name);
    if !labels.is_empty() {
        key.push('{');
        for (i, (label, value)) in labels.iter().enumerate() {
            if i > 0 {
                key.push(',');
            }
            _ = write!(key, "{label}=\"{value}\"");
        }
        key.push('}');
    }
    key
}

impl MemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter series, zero if never incremented.
    pub fn counter(&self, name: &str, labels: Labels<'_>) -> u64 {
        self.counters
            .lock()
            .unwrap()
            .get(&series_key(name, labels))
            .copied()
            .unwrap_or(0)
    }

    /// Sum of a counter across all label sets.
    pub fn counter_sum(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .unwrap()
            .iter()
            .filter(|(key, _)| key.starts_with(name))
            .map(|(_, value)| value)
            .sum()
    }

    pub fn gauge(&self, name: &str, labels: Labels<'_>) -> Option<f64> {
        self.gauges
            .lock()
            .unwrap()
            .get(&series_key(name, labels))
            .copied()
    }

    /// Number of samples observed for a histogram series.
    pub fn histogram_count(&self, name: &str, labels: Labels<'_>) -> usize {
        self.histograms
            .lock()
            .unwrap()
            .get(&series_key(name, labels))
            .map(Vec::len)
            .unwrap_or(0)
    }
}

impl MetricsSink for MemoryMetrics {
    fn incr_counter(&self, name: &'static str, labels: Labels<'_>, value: u64) {
        *self
            .counters
            .lock()
            .unwrap()
            .entry(series_key(name, labels))
            .or_insert(0) += value;
    }

    fn set_gauge(&self, name: &'static str, labels: Labels<'_>, value: f64) {
        self.gauges
            .lock()
            .unwrap()
            .insert(series_key(name, labels), value);
    }

    fn observe_histogram(&self, name: &'static str, labels: Labels<'_>, value: f64) {
        self.histograms
            .lock()
            .unwrap()
            .entry(series_key(name, labels))
            .or_default()
            .push(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_per_label_set() {
        let metrics = MemoryMetrics::new();
        let labels = [("device_id", "abc"), ("outcome", "success")];
        metrics.incr_counter(names::PACKET_SENT_TOTAL, &labels, 1);
        metrics.incr_counter(names::PACKET_SENT_TOTAL, &labels, 2);
        metrics.incr_counter(names::PACKET_SENT_TOTAL, &[("device_id", "other")], 1);

        assert_eq!(metrics.counter(names::PACKET_SENT_TOTAL, &labels), 3);
        assert_eq!(metrics.counter_sum(names::PACKET_SENT_TOTAL), 4);
    }

    #[test]
    fn gauges_overwrite_and_histograms_append() {
        let metrics = MemoryMetrics::new();
        metrics.set_gauge(names::DEDUP_CACHE_SIZE, &[], 3.0);
        metrics.set_gauge(names::DEDUP_CACHE_SIZE, &[], 5.0);
        assert_eq!(metrics.gauge(names::DEDUP_CACHE_SIZE, &[]), Some(5.0));

        metrics.observe_histogram(names::STATE_LOCK_HOLD_SECONDS, &[], 0.001);
        metrics.observe_histogram(names::STATE_LOCK_HOLD_SECONDS, &[], 0.002);
        assert_eq!(metrics.histogram_count(names::STATE_LOCK_HOLD_SECONDS, &[]), 2);
    }
}
