use std::time::Duration;

use cybase::TimeoutConfig;
use cyinterface::OverflowPolicy;

/// Everything a transport needs to know besides its peer.
///
/// Production constructs this from a [`TimeoutConfig`] (itself derived from
/// the measured p99 ack latency); the literal knobs exist for tests.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// All deadlines, derived from one measured input.
    pub timeouts: TimeoutConfig,
    /// Attempts one `send_reliable` call makes before abandoning.
    pub max_retries: u32,
    /// Dial-plus-handshake attempts per connect or reconnect.
    pub connect_attempts: u32,
    /// Inbound queue depth between the router and `recv_reliable`.
    pub queue_capacity: usize,
    /// Inbound queue overflow policy.
    pub queue_policy: OverflowPolicy,
    /// How long the router waits to enqueue one inbound packet.
    pub queue_put_timeout: Duration,
    /// Dedup cache bounds.
    pub dedup_max_size: usize,
    pub dedup_ttl: Duration,
}

impl TransportConfig {
    pub fn from_timeouts(timeouts: TimeoutConfig) -> Self {
        Self {
            timeouts,
            max_retries: 3,
            connect_attempts: 5,
            queue_capacity: 256,
            queue_policy: OverflowPolicy::Block,
            queue_put_timeout: Duration::from_secs(1),
            dedup_max_size: 1000,
            dedup_ttl: Duration::from_secs(300),
        }
    }

    /// Production entry point: one measured input drives every deadline.
    pub fn from_p99_ack_latency(p99: Duration) -> Self {
        Self::from_timeouts(TimeoutConfig::from_p99_ack_latency(p99))
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::from_timeouts(TimeoutConfig::default())
    }
}
