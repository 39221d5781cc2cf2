//! Exponential backoff with a cap and jitter
//!
//! One policy shared by every RPC boundary and the watcher runner:
//! `initial * 2^attempt`, capped, then scaled by a random factor in
//! `[1 - jitter, 1 + jitter]`.

use rand::Rng;
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;

use crate::error::RpcError;

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    pub initial_ms: u64,
    pub max_ms: u64,
    /// Fraction of the delay randomized either way (0.0 - 1.0)
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_ms: 1_000,
            max_ms: 30_000,
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    pub fn new(initial: Duration, max: Duration, jitter: f64) -> Self {
        Self {
            initial_ms: initial.as_millis() as u64,
            max_ms: max.as_millis() as u64,
            jitter,
        }
    }

    /// Un-jittered delay before retry number `attempt` (0-based)
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        let ms = self.initial_ms.saturating_mul(factor).min(self.max_ms.max(self.initial_ms));
        Duration::from_millis(ms)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return base;
        }
        let scale = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
        base.mul_f64(scale)
    }

    /// Run `op` until it succeeds, fails permanently, or `max_attempts` is used up.
    /// Only transient errors are retried.
    pub async fn retry<T, F, Fut>(&self, label: &str, max_attempts: u32, mut op: F) -> Result<T, RpcError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RpcError>>,
    {
        let max_attempts = max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(v) => {
                    if attempt > 0 {
                        tracing::info!("[BACKOFF] {} succeeded after {} retries", label, attempt);
                    }
                    return Ok(v);
                }
                Err(e) if e.is_transient() && attempt + 1 < max_attempts => {
                    let delay = self.delay(attempt);
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "[BACKOFF] {} failed, retrying: {}",
                        label,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
