//! Retry/backoff policy shared by the downloader's fetch loop and the
//! inserter's publish loop: fetch failures are retried
//! indefinitely, insert failures are retried with exponential backoff.

use crate::capability::RandomSource;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(300),
            multiplier: 2,
        }
    }
}

impl BackoffPolicy {
    /// Delay before the `attempt`-th retry (0-based), with up to 20% jitter
    /// added to avoid synchronized retry storms across identities.
    pub fn delay_for_attempt(&self, attempt: u32, random: &Arc<dyn RandomSource>) -> Duration {
        let scaled = self
            .initial
            .saturating_mul(self.multiplier.saturating_pow(attempt.min(16)));
        let base = scaled.min(self.max);
        let jitter_ms = random.next_bounded((base.as_millis() as u64 / 5).max(1));
        base + Duration::from_millis(jitter_ms)
    }
}
