use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,   // Normal operation - requests pass through
    Open,     // Failure threshold breached - reject all requests
    HalfOpen, // Testing if service recovered - allow limited requests
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl Serialize for CircuitState {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Wall time spent Open before the next call may probe.
    pub recovery_timeout_s: f64,
    /// Consecutive HalfOpen successes required to close.
    pub success_threshold: u32,
    /// Per-call deadline applied inside the breaker.
    pub timeout_s: f64,
    /// Ceiling for the adaptive failure threshold.
    pub max_failure_threshold: u32,
    /// Multiplier applied to the recovery timeout on every open.
    pub backoff_multiplier: f64,
    pub max_recovery_timeout_s: f64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_s: 60.0,
            success_threshold: 3,
            timeout_s: 30.0,
            max_failure_threshold: 20,
            backoff_multiplier: 1.5,
            max_recovery_timeout_s: 300.0,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.recovery_timeout_s)
    }

    pub fn max_recovery_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.max_recovery_timeout_s)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_s)
    }
}

/// Read-only view of the breaker, safe to hand out.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStatus {
    pub state: CircuitState,
    pub failures: u32,
    pub opens: u64,
    pub closes: u64,
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    #[serde(skip)]
    pub current_failure_threshold: u32,
    #[serde(skip)]
    pub current_recovery_timeout: Duration,
}

struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    halfopen_successes: u32,
    opened_at: Option<Instant>,
    current_failure_threshold: u32,
    current_recovery_timeout: Duration,
    total_calls: u64,
    successful_calls: u64,
    failed_calls: u64,
    circuit_opens: u64,
    circuit_closes: u64,
}

/// Circuit breaker for protecting against cascading failures.
///
/// Each open adapts the parameters upward (higher failure threshold, longer
/// recovery timeout); a clean HalfOpen -> Closed transition resets them to
/// the configured values.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    #[error("circuit breaker [{name}] is open, retry in {retry_in_ms}ms")]
    Open { name: String, retry_in_ms: u64 },

    #[error(transparent)]
    Inner(E),
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let inner = BreakerInner {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            halfopen_successes: 0,
            opened_at: None,
            current_failure_threshold: config.failure_threshold,
            current_recovery_timeout: config.recovery_timeout(),
            total_calls: 0,
            successful_calls: 0,
            failed_calls: 0,
            circuit_opens: 0,
            circuit_closes: 0,
        };
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(inner),
        }
    }

    /// Execute a future with circuit breaker protection. Every failure
    /// counts toward the consecutive-failure threshold.
    pub async fn call<F, T, E>(&self, f: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: std::future::Future<Output = Result<T, E>>,
    {
        self.call_classified(f, |_| true).await
    }

    /// Like `call`, but failures for which `counts` returns false leave the
    /// breaker state untouched: a permanently rejected request says nothing
    /// about the venue's availability.
    pub async fn call_classified<F, T, E>(
        &self,
        f: F,
        counts: impl Fn(&E) -> bool,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: std::future::Future<Output = Result<T, E>>,
    {
        {
            let mut inner = self.inner.lock().await;
            inner.total_calls += 1;

            if inner.state == CircuitState::Open {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= inner.current_recovery_timeout {
                    info!(
                        "CircuitBreaker [{}]: Transitioning Open -> HalfOpen (recovery timeout elapsed)",
                        self.name
                    );
                    inner.state = CircuitState::HalfOpen;
                    inner.halfopen_successes = 0;
                } else {
                    let retry_in = inner.current_recovery_timeout - elapsed;
                    return Err(CircuitBreakerError::Open {
                        name: self.name.clone(),
                        retry_in_ms: retry_in.as_millis() as u64,
                    });
                }
            }
        }

        match f.await {
            Ok(result) => {
                self.on_success().await;
                Ok(result)
            }
            Err(e) => {
                if counts(&e) {
                    self.on_failure().await;
                }
                Err(CircuitBreakerError::Inner(e))
            }
        }
    }

    /// Whether a call issued now would be admitted. Does not transition.
    pub async fn is_call_permitted(&self) -> bool {
        let inner = self.inner.lock().await;
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => inner
                .opened_at
                .map(|at| at.elapsed() >= inner.current_recovery_timeout)
                .unwrap_or(true),
        }
    }

    async fn on_success(&self) {
        let mut inner = self.inner.lock().await;
        inner.successful_calls += 1;
        inner.consecutive_failures = 0;

        match inner.state {
            CircuitState::HalfOpen => {
                inner.halfopen_successes += 1;
                if inner.halfopen_successes >= self.config.success_threshold {
                    info!(
                        "CircuitBreaker [{}]: Transitioning HalfOpen -> Closed ({} successes)",
                        self.name, inner.halfopen_successes
                    );
                    inner.state = CircuitState::Closed;
                    inner.halfopen_successes = 0;
                    inner.opened_at = None;
                    inner.circuit_closes += 1;
                    // Clean close: adaptive parameters go back to configured values
                    inner.current_failure_threshold = self.config.failure_threshold;
                    inner.current_recovery_timeout = self.config.recovery_timeout();
                }
            }
            CircuitState::Closed => {}
            CircuitState::Open => {
                warn!(
                    "CircuitBreaker [{}]: Success recorded in Open state (unexpected)",
                    self.name
                );
            }
        }
    }

    async fn on_failure(&self) {
        let mut inner = self.inner.lock().await;
        inner.failed_calls += 1;
        inner.consecutive_failures += 1;

        match inner.state {
            CircuitState::Closed => {
                if inner.consecutive_failures >= inner.current_failure_threshold {
                    let failures = inner.consecutive_failures;
                    Self::transition_to_open(&self.name, &self.config, &mut inner);
                    error!(
                        "CircuitBreaker [{}]: Transitioning Closed -> Open ({} failures)",
                        self.name, failures
                    );
                }
            }
            CircuitState::HalfOpen => {
                // Any failure during recovery reopens immediately
                Self::transition_to_open(&self.name, &self.config, &mut inner);
                warn!(
                    "CircuitBreaker [{}]: Transitioning HalfOpen -> Open (failure during recovery)",
                    self.name
                );
            }
            CircuitState::Open => {}
        }
    }

    fn transition_to_open(name: &str, config: &CircuitBreakerConfig, inner: &mut BreakerInner) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.halfopen_successes = 0;
        inner.circuit_opens += 1;

        inner.current_failure_threshold =
            (inner.current_failure_threshold + 2).min(config.max_failure_threshold);
        inner.current_recovery_timeout = Duration::from_secs_f64(
            (inner.current_recovery_timeout.as_secs_f64() * config.backoff_multiplier)
                .min(config.max_recovery_timeout_s),
        );

        info!(
            "CircuitBreaker [{}]: adapted parameters: failure_threshold={}, recovery_timeout={:?}",
            name, inner.current_failure_threshold, inner.current_recovery_timeout
        );
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    pub async fn status(&self) -> CircuitBreakerStatus {
        let inner = self.inner.lock().await;
        CircuitBreakerStatus {
            state: inner.state,
            failures: inner.consecutive_failures,
            opens: inner.circuit_opens,
            closes: inner.circuit_closes,
            total_calls: inner.total_calls,
            successful_calls: inner.successful_calls,
            failed_calls: inner.failed_calls,
            current_failure_threshold: inner.current_failure_threshold,
            current_recovery_timeout: inner.current_recovery_timeout,
        }
    }
}
