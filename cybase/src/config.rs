//! Timeout configuration derived from one measured input.
//!
//! Every deadline in the transport is a multiple of the observed p99 ack
//! round-trip, so recalibrating against a new fleet measurement means
//! changing exactly one value. Production code constructs transports from
//! [`TimeoutConfig::from_p99_ack_latency`]; tests may pin literals through
//! the `with_*` setters.

use std::time::Duration;

use getset::CopyGetters;

/// Floor for the heartbeat ack deadline.
const HEARTBEAT_ACK_FLOOR: Duration = Duration::from_secs(10);
/// Cadence of router-issued keepalive probes.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);
/// Retry backoff base delay.
const BACKOFF_BASE: Duration = Duration::from_millis(250);
/// Retry backoff ceiling.
const BACKOFF_MAX: Duration = Duration::from_secs(5);
/// Uniform jitter added to every backoff delay, plus or minus.
const BACKOFF_JITTER: Duration = Duration::from_millis(100);

/// All transport deadlines, computed from `p99_ack_latency`.
///
/// | Deadline | Formula | Default (p99 = 800ms) |
/// |---|---|---|
/// | ack wait | p99 × 2.5 | 2.0s |
/// | send IO | = ack wait | 2.0s |
/// | handshake | ack wait × 2.5 | 5.0s |
/// | heartbeat ack | max(ack wait × 3, 10s) | 10s |
/// | cleanup sweep | ack wait × 15 | 30s |
#[derive(Debug, Clone, Copy, PartialEq, Eq, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct TimeoutConfig {
    /// How long one `send_reliable` attempt waits for its ack.
    ack_wait: Duration,
    /// Network write deadline on the send path.
    send_io: Duration,
    /// Deadline for the 0x23/0x28 exchange.
    handshake: Duration,
    /// How long a heartbeat may stay unacknowledged before reconnecting.
    heartbeat_ack: Duration,
    /// Period of the pending-table safety-net sweep.
    cleanup_sweep: Duration,
    /// Cadence of router-issued heartbeats.
    heartbeat_interval: Duration,
    /// Retry backoff base delay.
    backoff_base: Duration,
    /// Retry backoff ceiling.
    backoff_max: Duration,
    /// Uniform jitter applied to every backoff delay.
    backoff_jitter: Duration,
}

impl TimeoutConfig {
    /// Derive every deadline from the measured p99 ack round-trip.
    pub fn from_p99_ack_latency(p99: Duration) -> Self {
        let ack_wait = p99.mul_f64(2.5);
        Self {
            ack_wait,
            send_io: ack_wait,
            handshake: ack_wait.mul_f64(2.5),
            heartbeat_ack: (ack_wait * 3).max(HEARTBEAT_ACK_FLOOR),
            cleanup_sweep: ack_wait * 15,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            backoff_base: BACKOFF_BASE,
            backoff_max: BACKOFF_MAX,
            backoff_jitter: BACKOFF_JITTER,
        }
    }

    /// Pin the ack wait (and the send IO deadline tied to it).
    pub fn with_ack_wait(mut self, ack_wait: Duration) -> Self {
        self.ack_wait = ack_wait;
        self.send_io = ack_wait;
        self
    }

    pub fn with_handshake(mut self, handshake: Duration) -> Self {
        self.handshake = handshake;
        self
    }

    /// Pin the heartbeat cadence and its ack deadline.
    pub fn with_heartbeat(mut self, interval: Duration, ack: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.heartbeat_ack = ack;
        self
    }

    pub fn with_cleanup_sweep(mut self, cleanup_sweep: Duration) -> Self {
        self.cleanup_sweep = cleanup_sweep;
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration, jitter: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_max = max;
        self.backoff_jitter = jitter;
        self
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self::from_p99_ack_latency(Duration::from_millis(800))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_calibration_table() {
        let config = TimeoutConfig::default();
        assert_eq!(config.ack_wait(), Duration::from_secs(2));
        assert_eq!(config.send_io(), Duration::from_secs(2));
        assert_eq!(config.handshake(), Duration::from_secs(5));
        assert_eq!(config.heartbeat_ack(), Duration::from_secs(10));
        assert_eq!(config.cleanup_sweep(), Duration::from_secs(30));
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(60));
    }

    #[test]
    fn heartbeat_ack_never_drops_below_its_floor() {
        let config = TimeoutConfig::from_p99_ack_latency(Duration::from_millis(40));
        assert_eq!(config.heartbeat_ack(), Duration::from_secs(10));

        let slow = TimeoutConfig::from_p99_ack_latency(Duration::from_secs(2));
        assert_eq!(slow.heartbeat_ack(), Duration::from_secs(15));
    }

    #[test]
    fn literal_overrides_stay_local() {
        let config = TimeoutConfig::default().with_ack_wait(Duration::from_millis(100));
        assert_eq!(config.ack_wait(), Duration::from_millis(100));
        assert_eq!(config.send_io(), Duration::from_millis(100));
        assert_eq!(config.handshake(), Duration::from_secs(5));
    }
}
