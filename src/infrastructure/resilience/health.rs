//! Exchange health tracking fed by periodic probe results.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

const RECENT_WINDOW: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Unknown => "unknown",
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }
}

impl Serialize for HealthStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HealthCheckConfig {
    pub check_interval_s: f64,
    pub timeout_s: f64,
    /// Consecutive failures before Unhealthy.
    pub failure_threshold: u32,
    /// Consecutive successes before Healthy.
    pub recovery_threshold: u32,
    /// Consecutive failures before Degraded.
    pub degraded_threshold: u32,
    pub min_check_interval_s: f64,
    pub max_check_interval_s: f64,
    pub adaptive_scaling: bool,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            check_interval_s: 120.0,
            timeout_s: 30.0,
            failure_threshold: 3,
            recovery_threshold: 2,
            degraded_threshold: 1,
            min_check_interval_s: 30.0,
            max_check_interval_s: 300.0,
            adaptive_scaling: true,
        }
    }
}

impl HealthCheckConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs_f64(self.check_interval_s)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_s)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub total_checks: u64,
    pub uptime_pct: f64,
}

struct HealthInner {
    status: HealthStatus,
    consecutive_failures: u32,
    consecutive_successes: u32,
    total_checks: u64,
    successful_checks: u64,
    failed_checks: u64,
    recent: VecDeque<bool>,
    current_interval: Duration,
}

impl HealthInner {
    fn uptime_pct(&self) -> f64 {
        if self.recent.is_empty() {
            return 0.0;
        }
        let ok = self.recent.iter().filter(|s| **s).count();
        ok as f64 * 100.0 / self.recent.len() as f64
    }
}

/// Status machine driven by probe outcomes. The probe loop itself lives in
/// the resilience wrapper; this type only owns the bookkeeping so it stays
/// trivially testable.
pub struct HealthMonitor {
    name: String,
    config: HealthCheckConfig,
    inner: Mutex<HealthInner>,
}

impl HealthMonitor {
    pub fn new(name: impl Into<String>, config: HealthCheckConfig) -> Self {
        let inner = HealthInner {
            status: HealthStatus::Unknown,
            consecutive_failures: 0,
            consecutive_successes: 0,
            total_checks: 0,
            successful_checks: 0,
            failed_checks: 0,
            recent: VecDeque::with_capacity(RECENT_WINDOW),
            current_interval: config.check_interval(),
        };
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(inner),
        }
    }

    /// Fold one probe outcome into the status machine.
    pub async fn record(&self, healthy: bool) -> HealthStatus {
        let mut inner = self.inner.lock().await;
        inner.total_checks += 1;
        if inner.recent.len() == RECENT_WINDOW {
            inner.recent.pop_front();
        }
        inner.recent.push_back(healthy);

        let old_status = inner.status;

        if healthy {
            inner.successful_checks += 1;
            inner.consecutive_successes += 1;
            inner.consecutive_failures = 0;

            if inner.consecutive_successes >= self.config.recovery_threshold {
                inner.status = HealthStatus::Healthy;
            } else if inner.status == HealthStatus::Unhealthy {
                inner.status = HealthStatus::Degraded;
            }

            if self.config.adaptive_scaling && inner.status == HealthStatus::Healthy {
                inner.current_interval = Duration::from_secs_f64(
                    (inner.current_interval.as_secs_f64() * 1.1)
                        .min(self.config.max_check_interval_s),
                );
            }
        } else {
            inner.failed_checks += 1;
            inner.consecutive_failures += 1;
            inner.consecutive_successes = 0;

            if inner.consecutive_failures >= self.config.failure_threshold {
                inner.status = HealthStatus::Unhealthy;
            } else if inner.consecutive_failures >= self.config.degraded_threshold {
                inner.status = HealthStatus::Degraded;
            }

            if self.config.adaptive_scaling {
                inner.current_interval = Duration::from_secs_f64(
                    (inner.current_interval.as_secs_f64() * 0.8)
                        .max(self.config.min_check_interval_s),
                );
            }
        }

        if old_status != inner.status {
            if healthy {
                info!(
                    "HealthMonitor [{}]: status changed {} -> {}",
                    self.name,
                    old_status.as_str(),
                    inner.status.as_str()
                );
            } else {
                warn!(
                    "HealthMonitor [{}]: status changed {} -> {} (consecutive failures: {})",
                    self.name,
                    old_status.as_str(),
                    inner.status.as_str(),
                    inner.consecutive_failures
                );
            }
        }

        inner.status
    }

    pub async fn status(&self) -> HealthStatus {
        self.inner.lock().await.status
    }

    pub async fn current_interval(&self) -> Duration {
        self.inner.lock().await.current_interval
    }

    pub fn probe_timeout(&self) -> Duration {
        self.config.probe_timeout()
    }

    pub async fn snapshot(&self) -> HealthSnapshot {
        let inner = self.inner.lock().await;
        HealthSnapshot {
            status: inner.status,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            total_checks: inner.total_checks,
            uptime_pct: inner.uptime_pct(),
        }
    }
}
