//! Bounded retry with exponential backoff

use crate::config::RetryConfig;
use adaptest_common::{Error, Result};
use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Delay schedule derived from [`RetryConfig`]
#[derive(Debug, Clone)]
pub struct Backoff {
    config: RetryConfig,
}

impl Backoff {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts.max(1)
    }

    /// Delay before retry number `attempt` (1 = first retry), without jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let ms = self.config.base_delay_ms as f64 * self.config.multiplier.max(1.0).powi(exp);
        Duration::from_millis(ms.min(self.config.max_delay_ms as f64) as u64)
    }

    /// Delay with jitter applied, still capped at `max_delay_ms`
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let jitter = self.config.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || base.is_zero() {
            return base;
        }
        let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
        let ms = (base.as_millis() as f64 * factor).min(self.config.max_delay_ms as f64);
        Duration::from_millis(ms as u64)
    }
}

/// Run `op` until it succeeds or the attempt budget is spent.
///
/// The inner result carries the last failure when every attempt failed.
/// The outer error is `Cancelled` if `cancel` fires while waiting.
pub async fn retry<T, E, F, Fut>(
    backoff: &Backoff,
    cancel: &CancellationToken,
    label: &str,
    mut op: F,
) -> Result<std::result::Result<T, E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: Display,
{
    let max = backoff.max_attempts();
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!("{} succeeded on attempt {}", label, attempt);
                }
                return Ok(Ok(value));
            }
            Err(e) if attempt >= max => {
                warn!("{} failed after {} attempt(s): {}", label, attempt, e);
                return Ok(Err(e));
            }
            Err(e) => {
                let delay = backoff.delay(attempt);
                warn!(
                    "{} attempt {}/{} failed: {} (retrying in {:?})",
                    label, attempt, max, e, delay
                );
                sleep_or_cancel(delay, cancel).await?;
                attempt += 1;
            }
        }
    }
}

/// Sleep for `delay` unless `cancel` fires first
pub async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(Error::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}
