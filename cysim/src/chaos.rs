//! Chaos injection for the simulated device's responses.

use std::{collections::HashSet, time::Duration};

use derive_builder::Builder;
use rand::Rng;

/// Fault knobs applied to every data-plane response, each independently
/// settable. The deterministic `drop_pattern` takes precedence over the
/// probabilistic `drop_rate` when non-empty, so CI failures replay exactly.
#[derive(Debug, Clone, Default, Builder)]
#[builder(default)]
pub struct ChaosConfig {
    /// Mean additive latency before every response.
    pub latency_mean: Duration,
    /// Uniform spread around `latency_mean`, plus or minus.
    pub latency_variance: Duration,
    /// Probability in [0, 1] of losing a response.
    pub drop_rate: f64,
    /// 1-indexed response numbers to drop.
    pub drop_pattern: HashSet<u64>,
    /// Probability in [0, 1] of sending a response twice.
    pub duplicate_rate: f64,
    /// Probability in [0, 1] of delaying a response past its successors.
    pub reorder_rate: f64,
    /// Extra delay a reordered response receives.
    pub reorder_delay: Duration,
    /// Probability in [0, 1] of corrupting a response.
    pub corrupt_rate: f64,
    /// How many bytes a corrupted response has flipped.
    pub corrupt_bytes: usize,
}

impl ChaosConfig {
    pub fn builder() -> ChaosConfigBuilder {
        ChaosConfigBuilder::default()
    }
}

/// What to do with one particular response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ResponsePlan {
    pub drop: bool,
    pub duplicate: bool,
    pub corrupt: bool,
    pub delay: Duration,
}

/// Rolls a [`ResponsePlan`] per response, tracking the 1-indexed counter
/// the drop pattern is matched against. One dice per connection.
#[derive(Debug, Default)]
pub(crate) struct ChaosDice {
    sent: u64,
}

impl ChaosDice {
    pub(crate) fn plan(&mut self, config: &ChaosConfig) -> ResponsePlan {
        self.sent += 1;
        let mut rng = rand::rng();

        let drop = if config.drop_pattern.is_empty() {
            config.drop_rate > 0.0 && rng.random_bool(config.drop_rate.clamp(0.0, 1.0))
        } else {
            config.drop_pattern.contains(&self.sent)
        };

        let mut delay = config.latency_mean;
        if !config.latency_variance.is_zero() {
            let spread = config.latency_variance.as_millis() as u64;
            let offset = rng.random_range(0..=spread * 2);
            delay = Duration::from_millis(
                (delay.as_millis() as u64 + offset).saturating_sub(spread),
            );
        }
        if config.reorder_rate > 0.0 && rng.random_bool(config.reorder_rate.clamp(0.0, 1.0)) {
            delay += config.reorder_delay;
        }

        ResponsePlan {
            drop,
            duplicate: config.duplicate_rate > 0.0
                && rng.random_bool(config.duplicate_rate.clamp(0.0, 1.0)),
            corrupt: config.corrupt_rate > 0.0
                && rng.random_bool(config.corrupt_rate.clamp(0.0, 1.0)),
            delay,
        }
    }
}

/// Flip `count` distinct randomly chosen bytes of `frame`.
pub(crate) fn corrupt(frame: &mut [u8], count: usize) {
    if frame.is_empty() {
        return;
    }
    let mut rng = rand::rng();
    let mut positions: Vec<usize> = (0..frame.len()).collect();
    for _ in 0..count.max(1).min(frame.len()) {
        let pick = rng.random_range(0..positions.len());
        let at = positions.swap_remove(pick);
        frame[at] ^= 0xFF;
    }
}
