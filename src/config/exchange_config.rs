//! Per-exchange settings, including the resilience component parameters.

use std::time::Duration;

use serde::Deserialize;

use crate::infrastructure::resilience::circuit_breaker::CircuitBreakerConfig;
use crate::infrastructure::resilience::health::HealthCheckConfig;
use crate::infrastructure::resilience::retry::RetryConfig;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApiCredentials {
    #[serde(alias = "apiKey")]
    pub api_key: String,
    #[serde(default)]
    pub secret: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExchangeConfig {
    pub enabled: bool,
    /// Per-call deadline applied by the resilience wrapper.
    pub timeout_s: f64,
    /// Requests per minute hint; venues without a hint use their defaults.
    pub rate_limit: Option<u32>,
    pub sandbox: bool,
    pub circuit_breaker: CircuitBreakerConfig,
    pub retry: RetryConfig,
    pub health_check: HealthCheckConfig,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_s: 30.0,
            rate_limit: None,
            sandbox: false,
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryConfig::default(),
            health_check: HealthCheckConfig::default(),
        }
    }
}

impl ExchangeConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_s)
    }

    pub fn validate(&self, name: &str) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.timeout_s > 0.0,
            "exchange '{name}': timeout_s must be positive"
        );
        anyhow::ensure!(
            self.circuit_breaker.failure_threshold > 0,
            "exchange '{name}': circuit_breaker.failure_threshold must be positive"
        );
        anyhow::ensure!(
            self.circuit_breaker.success_threshold > 0,
            "exchange '{name}': circuit_breaker.success_threshold must be positive"
        );
        anyhow::ensure!(
            self.circuit_breaker.backoff_multiplier >= 1.0,
            "exchange '{name}': circuit_breaker.backoff_multiplier must be >= 1.0"
        );
        anyhow::ensure!(
            self.retry.max_attempts > 0,
            "exchange '{name}': retry.max_attempts must be positive"
        );
        anyhow::ensure!(
            self.retry.base_delay_s > 0.0 && self.retry.max_delay_s >= self.retry.base_delay_s,
            "exchange '{name}': retry delays must satisfy 0 < base_delay_s <= max_delay_s"
        );
        anyhow::ensure!(
            self.health_check.check_interval_s > 0.0,
            "exchange '{name}': health_check.check_interval_s must be positive"
        );
        anyhow::ensure!(
            self.health_check.failure_threshold > 0 && self.health_check.recovery_threshold > 0,
            "exchange '{name}': health_check thresholds must be positive"
        );
        Ok(())
    }
}
