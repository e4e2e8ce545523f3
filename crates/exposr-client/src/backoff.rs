//! Reconnection delay with randomized growth and a jittered cap

use rand::Rng;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::Cancelled;

/// Backoff configuration
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry, and after a successful connection
    pub initial: Duration,
    /// Cap before jitter
    pub max: Duration,
    /// Each delay is the previous one multiplied by a factor drawn from
    /// `[growth_min, growth_max)`
    pub growth_min: f64,
    pub growth_max: f64,
    /// Random amount in `[0, max_jitter)` added to the cap
    pub max_jitter: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(1000),
            max: Duration::from_millis(5000),
            growth_min: 1.10,
            growth_max: 1.15,
            max_jitter: Duration::from_millis(100),
        }
    }
}

/// Per-slot retry delay state
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    current: Duration,
    attempt: usize,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            current: config.initial,
            config,
            attempt: 0,
        }
    }

    /// Delay to wait now. Advances the state for the next call.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.attempt += 1;

        let mut rng = rand::thread_rng();
        let growth = if self.config.growth_max > self.config.growth_min {
            rng.gen_range(self.config.growth_min..self.config.growth_max)
        } else {
            self.config.growth_min
        };
        let jitter_ms = self.config.max_jitter.as_millis() as u64;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rng.gen_range(0..jitter_ms))
        } else {
            Duration::ZERO
        };

        let grown = Duration::from_secs_f64(self.current.as_secs_f64() * growth);
        self.current = grown.min(self.config.max + jitter);

        delay
    }

    /// Sleep for [`next_delay`](Self::next_delay), or until `cancel` fires.
    pub async fn wait(&mut self, cancel: &CancellationToken) -> Result<(), Cancelled> {
        let delay = self.next_delay();
        debug!(
            "Waiting {}ms before reconnection attempt {}",
            delay.as_millis(),
            self.attempt
        );

        tokio::select! {
            _ = cancel.cancelled() => Err(Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// Reset backoff (call after successful connection)
    pub fn reset(&mut self) {
        self.current = self.config.initial;
        self.attempt = 0;
    }

    /// Get current attempt number
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    /// Delay the next call to `next_delay` will return
    pub fn current(&self) -> Duration {
        self.current
    }
}
