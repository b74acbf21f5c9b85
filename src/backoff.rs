//! Retry pacing for remote calls.
//!
//! Backoff progress is plain data ([`BackoffState`]) and all waiting goes
//! through a [`Clock`], so sessions stay cancellable and tests never sleep.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};

#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Clock that advances instantly and remembers every requested sleep.
#[derive(Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
    sleeps: Arc<Mutex<Vec<Duration>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
            sleeps: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn advance(&self, duration: Duration) {
        let mut now = self.now.lock();
        *now += chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero());
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().clone()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }

    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().push(duration);
        self.advance(duration);
        tokio::task::yield_now().await;
    }
}

#[derive(Clone)]
pub struct BackoffPolicy {
    base: Duration,
    cap: Duration,
    max_retries: u32,
    jitter_ms: u64,
    rng: Arc<Mutex<StdRng>>,
}

impl std::fmt::Debug for BackoffPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackoffPolicy")
            .field("base", &self.base)
            .field("cap", &self.cap)
            .field("max_retries", &self.max_retries)
            .field("jitter_ms", &self.jitter_ms)
            .finish()
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration, max_retries: u32) -> Self {
        Self {
            base,
            cap: cap.max(base),
            max_retries,
            jitter_ms: 0,
            rng: Arc::new(Mutex::new(StdRng::from_entropy())),
        }
    }

    pub fn with_jitter(mut self, jitter_ms: u64, rng: StdRng) -> Self {
        self.jitter_ms = jitter_ms;
        self.rng = Arc::new(Mutex::new(rng));
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Delay before retry number `attempt` (1-based): base * 2^(attempt-1), capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let scaled = self.base.saturating_mul(1_u32 << exponent);
        let jitter = if self.jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(self.rng.lock().gen_range(0..self.jitter_ms))
        };
        scaled.min(self.cap) + jitter
    }

    pub fn start(&self) -> BackoffState {
        BackoffState::default()
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(2), Duration::from_secs(60), 5)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackoffState {
    pub attempt: u32,
    pub next_allowed_at: Option<DateTime<Utc>>,
}

impl BackoffState {
    /// Registers a failure. Returns the wait before the next attempt, or
    /// `None` once the retry budget is spent. A server-provided hint wins
    /// when it is longer than the computed delay.
    pub fn record_failure(
        &mut self,
        policy: &BackoffPolicy,
        now: DateTime<Utc>,
        hint: Option<Duration>,
    ) -> Option<Duration> {
        if self.attempt >= policy.max_retries {
            return None;
        }
        self.attempt += 1;
        let mut delay = policy.delay_for(self.attempt);
        if let Some(hint) = hint {
            delay = delay.max(hint.min(policy.cap));
        }
        self.next_allowed_at =
            Some(now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero()));
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
        self.next_allowed_at = None;
    }

    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        self.next_allowed_at
            .and_then(|at| (at - now).to_std().ok())
            .unwrap_or(Duration::ZERO)
    }
}
