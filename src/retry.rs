use std::time::Duration;
use tracing::warn;

use crate::config::RetrySettings;

const MAX_DELAY: Duration = Duration::from_secs(300);

/// Bounded attempt counter with exponential delay between tries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub attempts: u32,
    pub base: Duration,
}

impl Backoff {
    pub fn new(attempts: u32, base: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            base,
        }
    }

    /// Delay to wait after the `failed`-th failed try (1-based).
    pub fn delay(&self, failed: u32) -> Duration {
        let factor = 1u32 << failed.saturating_sub(1).min(16);
        self.base.saturating_mul(factor).min(MAX_DELAY)
    }
}

/// Backoff state keyed by failure kind.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub transient: Backoff,
    pub persistence: Backoff,
    pub rate_limit_cooldown: Duration,
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            transient: Backoff::new(
                settings.transient_attempts,
                Duration::from_millis(settings.transient_backoff_ms),
            ),
            persistence: Backoff::new(
                settings.persistence_attempts,
                Duration::from_millis(settings.persistence_backoff_ms),
            ),
            rate_limit_cooldown: Duration::from_secs(settings.rate_limit_cooldown_secs),
        }
    }
}

/// Runs `op` until it succeeds or the backoff is exhausted.
/// On exhaustion returns the number of tries made and the last error.
pub async fn with_backoff<T, E, F>(label: &str, backoff: Backoff, mut op: F) -> Result<T, (u32, E)>
where
    E: std::fmt::Display,
    F: FnMut() -> Result<T, E>,
{
    let mut tries = 0;
    loop {
        tries += 1;
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if tries < backoff.attempts => {
                let delay = backoff.delay(tries);
                warn!(op = label, attempt = tries, error = %e, ?delay, "retrying after failure");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err((tries, e)),
        }
    }
}
