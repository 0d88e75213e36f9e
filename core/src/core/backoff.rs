/// Retry policy for transport-level engine failures.
///
/// Only `EngineUnreachable` is retried. The engine answering with an error is
/// final. Callers with non-repeatable calls narrow this further through
/// [`RetryPolicy::run_if`].
///
/// Backoff: base → 2·base → 4·base → ... capped at MAX_DELAY_MS, each step
/// with up to 10% random jitter so concurrent probes do not retry in lockstep.

use std::fmt::Display;
use std::future::Future;

use log::warn;
use rand::Rng;
use tokio::time::{sleep, Duration};

use crate::error::{Result, ScanError};

const MAX_DELAY_MS: u64 = 10_000;
const MAX_EXPONENT: u32 = 6;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Zero is treated as one.
    pub attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay_ms: 500,
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            attempts,
            base_delay_ms,
        }
    }

    /// Delay before retry number `retry` (1-based), without jitter.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(MAX_EXPONENT);
        let ms = self.base_delay_ms.saturating_mul(1u64 << exp).min(MAX_DELAY_MS);
        Duration::from_millis(ms)
    }

    fn jittered(&self, retry: u32) -> Duration {
        let delay = self.delay_for(retry);
        let spread = delay.as_millis() as u64 / 10;
        if spread == 0 {
            return delay;
        }
        let extra = rand::rng().random_range(0..=spread);
        delay + Duration::from_millis(extra)
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent. The last error is returned unchanged.
    pub async fn run<T, F, Fut>(&self, operation: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run_if(operation, op, |e: &ScanError| e.is_retryable()).await
    }

    /// Like [`RetryPolicy::run`], but `retryable` decides which failures are
    /// worth another attempt.
    pub async fn run_if<T, E, F, Fut, P>(&self, operation: &str, mut op: F, retryable: P) -> std::result::Result<T, E>
    where
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if retryable(&e) && attempt < attempts => {
                    let delay = self.jittered(attempt);
                    warn!(
                        "{} failed (attempt {}/{}): {}; retrying in {:?}",
                        operation, attempt, attempts, e, delay
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
