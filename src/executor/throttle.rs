//! Rate shaping against the backend quota
//!
//! Cloud Spanner admin quotas are averaged over a window, so batches that
//! start together must not hit the backend together. Each batch waits a
//! randomized delay first; the wait gives way to cancellation.

use rand::Rng;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::ThrottleConfig;
use crate::models::Batch;
use crate::utils::rng::SharedRng;

/// How a throttled wait ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wait {
    Elapsed,
    Abandoned,
}

/// Randomized, cancellable delays
#[derive(Clone, Debug)]
pub struct RateShaper {
    config: ThrottleConfig,
    enabled: bool,
    rng: SharedRng,
}

impl RateShaper {
    /// Throttling is skipped entirely against the emulator
    pub fn new(config: ThrottleConfig, use_emulator: bool, rng: SharedRng) -> Self {
        Self {
            config,
            enabled: !use_emulator,
            rng,
        }
    }

    /// Delay before a batch: millisecond jitter plus a whole-second base
    pub fn batch_delay(&self) -> Duration {
        if !self.enabled {
            return Duration::ZERO;
        }
        let jitter_max = self.config.jitter_max_ms;
        let span = self.config.base_span_secs();
        let (jitter_ms, extra_secs) = self.rng.with(|rng| {
            let jitter_ms = if jitter_max > 0 {
                rng.random_range(0..jitter_max)
            } else {
                0
            };
            let extra_secs = if span > 0 {
                rng.random_range(0..span)
            } else {
                0
            };
            (jitter_ms, extra_secs)
        });
        let base = Duration::from_secs(self.config.base_min_secs + extra_secs);
        Duration::from_millis(jitter_ms) + base
    }

    /// Delay before creating a backend instance
    pub fn provision_delay(&self) -> Duration {
        if !self.enabled {
            return Duration::ZERO;
        }
        let jitter_max = self.config.provision_jitter_ms;
        let jitter_ms = if jitter_max > 0 {
            self.rng.with(|rng| rng.random_range(0..jitter_max))
        } else {
            0
        };
        Duration::from_millis(self.config.provision_min_ms + jitter_ms)
    }

    pub async fn wait_before_batch(&self, batch: &Batch, cancel: &CancellationToken) -> Wait {
        let delay = self.batch_delay();
        if !delay.is_zero() {
            info!("Batch {}: throttled for {:?}", batch.index(), delay);
        }
        wait_cancellable(delay, cancel).await
    }

    pub async fn wait_before_provision(&self, cancel: &CancellationToken) -> Wait {
        let delay = self.provision_delay();
        if !delay.is_zero() {
            info!("Provisioning throttled for {:?}", delay);
        }
        wait_cancellable(delay, cancel).await
    }
}

async fn wait_cancellable(delay: Duration, cancel: &CancellationToken) -> Wait {
    if cancel.is_cancelled() {
        return Wait::Abandoned;
    }
    if delay.is_zero() {
        return Wait::Elapsed;
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            debug!("Throttled wait cancelled");
            Wait::Abandoned
        }
        _ = sleep(delay) => Wait::Elapsed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn shaper(config: ThrottleConfig) -> RateShaper {
        RateShaper::new(config, false, SharedRng::seeded(17))
    }

    #[test]
    fn test_batch_delay_range() {
        let config = ThrottleConfig::default();
        let s = shaper(config.clone());
        let min = Duration::from_secs(config.base_min_secs);
        let max = Duration::from_secs(config.base_min_secs + config.base_span_secs())
            + Duration::from_millis(config.jitter_max_ms);

        let delays: Vec<Duration> = (0..500).map(|_| s.batch_delay()).collect();
        assert!(delays.iter().all(|d| *d >= min && *d < max));
        // Randomized, not constant.
        assert!(delays.iter().any(|d| *d != delays[0]));
    }

    #[test]
    fn test_provision_delay_range() {
        let config = ThrottleConfig::default();
        let s = shaper(config.clone());
        for _ in 0..200 {
            let d = s.provision_delay();
            assert!(d >= Duration::from_millis(config.provision_min_ms));
            let max = config.provision_min_ms + config.provision_jitter_ms;
            assert!(d < Duration::from_millis(max));
        }
    }

    #[test]
    fn test_emulator_disables_delays() {
        let s = RateShaper::new(ThrottleConfig::default(), true, SharedRng::seeded(1));
        assert_eq!(s.batch_delay(), Duration::ZERO);
        assert_eq!(s.provision_delay(), Duration::ZERO);
    }

    #[test]
    fn test_zero_width_ranges() {
        let s = shaper(ThrottleConfig {
            jitter_max_ms: 0,
            base_min_secs: 2,
            spread_factor: 0,
            ..Default::default()
        });
        assert_eq!(s.batch_delay(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_wait_is_cancellable() {
        let s = shaper(ThrottleConfig {
            base_min_secs: 3600,
            ..Default::default()
        });
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let batch = Batch::new(1, vec!["basic".into()]);
        assert_eq!(s.wait_before_batch(&batch, &cancel).await, Wait::Abandoned);
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_already_cancelled_abandons_even_without_delay() {
        let s = RateShaper::new(ThrottleConfig::default(), true, SharedRng::seeded(1));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let batch = Batch::new(1, vec!["basic".into()]);
        assert_eq!(s.wait_before_batch(&batch, &cancel).await, Wait::Abandoned);
    }

    #[tokio::test]
    async fn test_disabled_wait_elapses_immediately() {
        let s = RateShaper::new(ThrottleConfig::default(), true, SharedRng::seeded(1));
        let cancel = CancellationToken::new();
        assert_eq!(s.wait_before_provision(&cancel).await, Wait::Elapsed);
    }
}
