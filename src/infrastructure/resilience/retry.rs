//! Adaptive retry policy for adapter calls.
//!
//! Strategy arithmetic and the adaptation envelope: a recent-window success
//! rate above 80% shrinks the base delay (and may drop an attempt), below
//! 50% grows the delay and may add one, bounded by the configured limits.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::domain::errors::{AdapterError, CollectError};

const ADAPTATION_WINDOW: usize = 100;
const MIN_JITTERED_DELAY: Duration = Duration::from_millis(100);
const MIN_ADAPTIVE_BASE_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryStrategy {
    Fixed,
    Linear,
    Exponential,
    Fibonacci,
    Adaptive,
}

impl std::str::FromStr for RetryStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fixed" => Ok(RetryStrategy::Fixed),
            "linear" => Ok(RetryStrategy::Linear),
            "exponential" => Ok(RetryStrategy::Exponential),
            "fibonacci" => Ok(RetryStrategy::Fibonacci),
            "adaptive" => Ok(RetryStrategy::Adaptive),
            other => Err(format!("unknown retry strategy '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_s: f64,
    pub max_delay_s: f64,
    pub strategy: RetryStrategy,
    pub backoff_multiplier: f64,
    pub jitter: bool,
    /// Fraction of the delay used as the jitter bound (0.0-1.0).
    pub jitter_range: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_s: 1.0,
            max_delay_s: 60.0,
            strategy: RetryStrategy::Exponential,
            backoff_multiplier: 2.0,
            jitter: true,
            jitter_range: 0.1,
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_secs_f64(self.base_delay_s)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_secs_f64(self.max_delay_s)
    }
}

#[derive(Debug, Clone)]
pub struct RetryStatus {
    pub strategy: RetryStrategy,
    pub max_attempts: u32,
    pub adaptive_max_attempts: u32,
    pub adaptive_base_delay: Duration,
    pub total_cycles: u64,
    pub successful_cycles: u64,
    pub failed_cycles: u64,
    pub total_retries: u64,
}

struct RetryInner {
    recent: VecDeque<bool>,
    recent_delays: VecDeque<f64>,
    adaptive_base_delay: Duration,
    adaptive_max_attempts: u32,
    total_cycles: u64,
    successful_cycles: u64,
    failed_cycles: u64,
    total_retries: u64,
}

impl RetryInner {
    fn recent_success_rate(&self) -> Option<f64> {
        if self.recent.is_empty() {
            return None;
        }
        let ok = self.recent.iter().filter(|s| **s).count();
        Some(ok as f64 * 100.0 / self.recent.len() as f64)
    }

    fn push_outcome(&mut self, success: bool) {
        if self.recent.len() == ADAPTATION_WINDOW {
            self.recent.pop_front();
        }
        self.recent.push_back(success);
    }

    fn push_delay(&mut self, delay: Duration) {
        if self.recent_delays.len() == ADAPTATION_WINDOW {
            self.recent_delays.pop_front();
        }
        self.recent_delays.push_back(delay.as_secs_f64());
    }
}

pub struct RetryPolicy {
    name: String,
    config: RetryConfig,
    inner: Mutex<RetryInner>,
}

impl RetryPolicy {
    pub fn new(name: impl Into<String>, config: RetryConfig) -> Self {
        let inner = RetryInner {
            recent: VecDeque::with_capacity(ADAPTATION_WINDOW),
            recent_delays: VecDeque::with_capacity(ADAPTATION_WINDOW),
            adaptive_base_delay: config.base_delay(),
            adaptive_max_attempts: config.max_attempts,
            total_cycles: 0,
            successful_cycles: 0,
            failed_cycles: 0,
            total_retries: 0,
        };
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(inner),
        }
    }

    /// Run `op` until it succeeds, a non-retryable error surfaces, or the
    /// attempt budget is spent. A `CircuitOpen` result never retries.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, CollectError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, CollectError>>,
    {
        let max_attempts = {
            let mut inner = self.inner.lock().await;
            inner.total_cycles += 1;
            inner.adaptive_max_attempts.max(1)
        };

        let started = Instant::now();
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(
                            "RetryPolicy [{}]: succeeded after {} attempts",
                            self.name, attempt
                        );
                    }
                    self.on_cycle_success(attempt, started.elapsed()).await;
                    return Ok(value);
                }
                Err(err) => {
                    let retryable = match &err {
                        CollectError::CircuitOpen { .. } => false,
                        CollectError::Adapter(e) => e.is_retryable(),
                    };

                    if !retryable {
                        warn!(
                            "RetryPolicy [{}]: non-retryable error on attempt {}: {}",
                            self.name, attempt, err
                        );
                        self.on_cycle_failure(attempt).await;
                        return Err(err);
                    }

                    if attempt >= max_attempts {
                        warn!(
                            "RetryPolicy [{}]: giving up after {} attempts: {}",
                            self.name, attempt, err
                        );
                        self.on_cycle_failure(attempt).await;
                        return Err(err);
                    }

                    let mut delay = self.compute_delay(attempt).await;
                    // honor the venue's Retry-After when it asks for more
                    if let CollectError::Adapter(AdapterError::RateLimit {
                        retry_after_s: Some(after),
                    }) = &err
                    {
                        delay = delay.max(Duration::from_secs(*after));
                    }
                    warn!(
                        "RetryPolicy [{}]: attempt {} failed ({}), retrying in {:?}",
                        self.name, attempt, err, delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Backoff before the attempt following `attempt` (1-based).
    pub async fn compute_delay(&self, attempt: u32) -> Duration {
        let mut inner = self.inner.lock().await;
        let base = inner.adaptive_base_delay.as_secs_f64();
        let max = self.config.max_delay_s;

        let raw = match self.config.strategy {
            RetryStrategy::Fixed => base,
            RetryStrategy::Linear => base * attempt as f64,
            RetryStrategy::Exponential => {
                base * self.config.backoff_multiplier.powi(attempt as i32 - 1)
            }
            RetryStrategy::Fibonacci => base * fibonacci(attempt) as f64,
            RetryStrategy::Adaptive => {
                if inner.recent_delays.len() < 10 {
                    base * self.config.backoff_multiplier.powi(attempt as i32 - 1)
                } else {
                    let avg: f64 = inner.recent_delays.iter().sum::<f64>()
                        / inner.recent_delays.len() as f64;
                    let multiplier = match inner.recent_success_rate() {
                        Some(rate) if rate > 80.0 => 0.8,
                        Some(rate) if rate > 60.0 => 1.0,
                        _ => 1.5,
                    };
                    avg * multiplier * attempt as f64
                }
            }
        };

        let mut delay = raw.min(max);

        if self.config.jitter {
            let bound = delay * self.config.jitter_range;
            let jitter = rand::rng().random_range(-bound..=bound);
            delay = (delay + jitter).max(MIN_JITTERED_DELAY.as_secs_f64());
        }

        let delay = Duration::from_secs_f64(delay);
        inner.push_delay(delay);
        delay
    }

    async fn on_cycle_success(&self, attempts: u32, elapsed: Duration) {
        let mut inner = self.inner.lock().await;
        inner.successful_cycles += 1;
        inner.total_retries += (attempts - 1) as u64;
        inner.push_outcome(true);

        if self.config.strategy != RetryStrategy::Adaptive {
            return;
        }

        if attempts == 1 && elapsed < Duration::from_secs(5) {
            inner.adaptive_base_delay = Duration::from_secs_f64(
                (inner.adaptive_base_delay.as_secs_f64() * 0.9)
                    .max(MIN_ADAPTIVE_BASE_DELAY.as_secs_f64()),
            );
        }

        if inner.recent.len() > 50 && inner.recent_success_rate().is_some_and(|r| r > 80.0) {
            inner.adaptive_max_attempts = inner.adaptive_max_attempts.saturating_sub(1).max(2);
        }
    }

    async fn on_cycle_failure(&self, attempts: u32) {
        let mut inner = self.inner.lock().await;
        inner.failed_cycles += 1;
        inner.total_retries += (attempts - 1) as u64;
        inner.push_outcome(false);

        if self.config.strategy != RetryStrategy::Adaptive {
            return;
        }

        inner.adaptive_base_delay = Duration::from_secs_f64(
            (inner.adaptive_base_delay.as_secs_f64() * 1.2).min(self.config.max_delay_s / 4.0),
        );

        if inner.recent.len() > 20 && inner.recent_success_rate().is_some_and(|r| r < 50.0) {
            inner.adaptive_max_attempts =
                (inner.adaptive_max_attempts + 1).min(self.config.max_attempts * 2);
        }
    }

    pub async fn status(&self) -> RetryStatus {
        let inner = self.inner.lock().await;
        RetryStatus {
            strategy: self.config.strategy,
            max_attempts: self.config.max_attempts,
            adaptive_max_attempts: inner.adaptive_max_attempts,
            adaptive_base_delay: inner.adaptive_base_delay,
            total_cycles: inner.total_cycles,
            successful_cycles: inner.successful_cycles,
            failed_cycles: inner.failed_cycles,
            total_retries: inner.total_retries,
        }
    }
}

fn fibonacci(n: u32) -> u64 {
    if n <= 2 {
        return 1;
    }
    let (mut a, mut b) = (1u64, 1u64);
    for _ in 3..=n {
        let next = a + b;
        a = b;
        b = next;
    }
    b
}
