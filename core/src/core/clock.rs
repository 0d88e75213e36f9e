/// Time source for the orchestrator's polling waits.
///
/// Polling is the only place a run suspends. Routing every wait through a
/// `Clock` keeps the loop cooperative (no busy-spin) in production and lets
/// tests replay a whole phase in virtual time.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering::SeqCst};

use async_trait::async_trait;
use tokio::time::{Duration, Instant};

#[async_trait]
pub trait Clock: Send + Sync {
    /// Monotonic time since the clock was created.
    fn elapsed(&self) -> Duration;

    async fn sleep(&self, duration: Duration);
}

/// Real time, backed by the tokio timer.
pub struct TokioClock {
    origin: Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for TokioClock {
    fn elapsed(&self) -> Duration {
        self.origin.elapsed()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Virtual time: `sleep` advances the clock instantly.
#[derive(Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
    sleeps: AtomicU32,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, duration: Duration) {
        self.now_ms.fetch_add(duration.as_millis() as u64, SeqCst);
    }

    /// Number of `sleep` calls made so far.
    pub fn sleeps(&self) -> u32 {
        self.sleeps.load(SeqCst)
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn elapsed(&self) -> Duration {
        Duration::from_millis(self.now_ms.load(SeqCst))
    }

    async fn sleep(&self, duration: Duration) {
        self.sleeps.fetch_add(1, SeqCst);
        self.advance(duration);
        tokio::task::yield_now().await;
    }
}
