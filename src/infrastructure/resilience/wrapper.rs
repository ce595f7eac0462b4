//! Resilient wrapper around a single exchange adapter.
//!
//! Composition order for every call: retry around breaker around the
//! deadline-bound adapter operation. A lone transient failure costs a retry,
//! not a circuit trip; when the circuit is open the retry loop observes the
//! rejection and stops immediately.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::ExchangeConfig;
use crate::domain::errors::{AdapterError, CollectError};
use crate::domain::ports::ExchangeAdapter;
use crate::domain::types::{ExchangeId, FundingRate, Symbol, Ticker};
use crate::infrastructure::resilience::circuit_breaker::{
    CircuitBreaker, CircuitBreakerError, CircuitBreakerStatus, CircuitState,
};
use crate::infrastructure::resilience::health::{HealthMonitor, HealthSnapshot, HealthStatus};
use crate::infrastructure::resilience::retry::RetryPolicy;

/// Read-only wrapper status for monitoring and the statistics payload.
#[derive(Debug, Clone, Serialize)]
pub struct ExchangeStatus {
    pub exchange: ExchangeId,
    pub circuit: CircuitBreakerStatus,
    pub health: HealthSnapshot,
}

pub struct ResilientExchange {
    id: ExchangeId,
    adapter: Arc<dyn ExchangeAdapter>,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    health: HealthMonitor,
    /// Serializes calls for this exchange; no two operations overlap.
    call_lock: Mutex<()>,
    call_timeout: Duration,
}

impl ResilientExchange {
    pub fn new(adapter: Arc<dyn ExchangeAdapter>, config: &ExchangeConfig) -> Self {
        let id = adapter.id().clone();
        Self {
            breaker: CircuitBreaker::new(id.as_str(), config.circuit_breaker.clone()),
            retry: RetryPolicy::new(id.as_str(), config.retry.clone()),
            health: HealthMonitor::new(id.as_str(), config.health_check.clone()),
            call_lock: Mutex::new(()),
            call_timeout: config.call_timeout(),
            id,
            adapter,
        }
    }

    pub fn id(&self) -> &ExchangeId {
        &self.id
    }

    pub fn supports_funding(&self) -> bool {
        self.adapter.supports_funding()
    }

    /// Initialization goes through the retry policy but not the breaker:
    /// a slow boot should not pre-open the circuit.
    pub async fn initialize(&self) -> Result<(), CollectError> {
        let _guard = self.call_lock.lock().await;
        self.retry
            .run(|| {
                let adapter = Arc::clone(&self.adapter);
                async move { adapter.initialize().await.map_err(CollectError::from) }
            })
            .await
    }

    pub async fn list_futures_symbols(&self) -> Result<Vec<Symbol>, CollectError> {
        let adapter = Arc::clone(&self.adapter);
        self.execute(move || {
            let adapter = Arc::clone(&adapter);
            async move { adapter.list_futures_symbols().await }
        })
        .await
    }

    pub async fn fetch_tickers(
        &self,
        symbols: Option<&[Symbol]>,
    ) -> Result<HashMap<Symbol, Ticker>, CollectError> {
        let adapter = Arc::clone(&self.adapter);
        let symbols: Option<Vec<Symbol>> = symbols.map(<[Symbol]>::to_vec);
        self.execute(move || {
            let adapter = Arc::clone(&adapter);
            let symbols = symbols.clone();
            async move { adapter.fetch_tickers(symbols.as_deref()).await }
        })
        .await
    }

    pub async fn fetch_funding_rates(
        &self,
        symbols: Option<&[Symbol]>,
    ) -> Result<HashMap<Symbol, FundingRate>, CollectError> {
        if !self.adapter.supports_funding() {
            debug!("Exchange [{}]: funding rates not supported, returning empty", self.id);
            return Ok(HashMap::new());
        }
        let adapter = Arc::clone(&self.adapter);
        let symbols: Option<Vec<Symbol>> = symbols.map(<[Symbol]>::to_vec);
        self.execute(move || {
            let adapter = Arc::clone(&adapter);
            let symbols = symbols.clone();
            async move { adapter.fetch_funding_rates(symbols.as_deref()).await }
        })
        .await
    }

    async fn execute<T, F, Fut>(&self, op: F) -> Result<T, CollectError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, AdapterError>>,
    {
        let _guard = self.call_lock.lock().await;
        self.retry
            .run(|| async {
                let outcome = self
                    .breaker
                    .call_classified(
                        async {
                            match tokio::time::timeout(self.call_timeout, op()).await {
                                Ok(result) => result,
                                Err(_) => Err(AdapterError::Timeout {
                                    elapsed_ms: self.call_timeout.as_millis() as u64,
                                }),
                            }
                        },
                        AdapterError::is_retryable,
                    )
                    .await;

                match outcome {
                    Ok(value) => Ok(value),
                    Err(CircuitBreakerError::Open { retry_in_ms, .. }) => {
                        Err(CollectError::CircuitOpen {
                            exchange: self.id.clone(),
                            retry_in_ms,
                        })
                    }
                    Err(CircuitBreakerError::Inner(e)) => Err(CollectError::Adapter(e)),
                }
            })
            .await
    }

    /// One probe with the health-check deadline applied.
    pub async fn run_probe(&self) -> bool {
        match tokio::time::timeout(self.health.probe_timeout(), self.adapter.probe()).await {
            Ok(ok) => ok,
            Err(_) => false,
        }
    }

    /// Background probe loop. The interval is re-read every cycle so
    /// adaptive scaling takes effect immediately.
    pub fn spawn_health_task(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let wrapper = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let interval = wrapper.health.current_interval().await;
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        let healthy = wrapper.run_probe().await;
                        wrapper.health.record(healthy).await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!("Exchange [{}]: health probe loop stopped", wrapper.id);
        })
    }

    pub async fn health_status(&self) -> HealthStatus {
        self.health.status().await
    }

    /// Feed one probe outcome into the health machine. The background task
    /// uses this; callers driving probes on their own schedule can too.
    pub async fn record_probe_result(&self, healthy: bool) -> HealthStatus {
        self.health.record(healthy).await
    }

    pub async fn circuit_state(&self) -> CircuitState {
        self.breaker.state().await
    }

    /// Whether the collector should schedule this exchange for a round:
    /// not Unhealthy and the breaker admits calls.
    pub async fn is_available(&self) -> bool {
        self.health.status().await != HealthStatus::Unhealthy
            && self.breaker.is_call_permitted().await
    }

    pub async fn status(&self) -> ExchangeStatus {
        ExchangeStatus {
            exchange: self.id.clone(),
            circuit: self.breaker.status().await,
            health: self.health.snapshot().await,
        }
    }

    pub async fn close(&self) {
        self.adapter.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::errors::AdapterError;
    use crate::infrastructure::mock::{MockExchangeAdapter, ticker};
    use crate::infrastructure::resilience::retry::{RetryConfig, RetryStrategy};
    use rust_decimal_macros::dec;
    use std::sync::atomic::Ordering;

    fn fast_config(failure_threshold: u32, max_attempts: u32) -> ExchangeConfig {
        let mut config = ExchangeConfig::default();
        config.circuit_breaker.failure_threshold = failure_threshold;
        config.circuit_breaker.recovery_timeout_s = 0.05;
        config.retry = RetryConfig {
            max_attempts,
            base_delay_s: 0.001,
            max_delay_s: 0.002,
            strategy: RetryStrategy::Fixed,
            jitter: false,
            ..RetryConfig::default()
        };
        config
    }

    #[tokio::test]
    async fn test_fetch_passes_through() {
        let adapter = MockExchangeAdapter::new("binance");
        adapter
            .set_ticker(ticker(
                "binance",
                "BTC/USDT:USDT",
                dec!(50000),
                dec!(50001),
                dec!(50000),
            ))
            .await;

        let wrapper = ResilientExchange::new(adapter.clone(), &fast_config(5, 3));
        let tickers = wrapper.fetch_tickers(None).await.unwrap();
        assert_eq!(tickers.len(), 1);
        assert_eq!(adapter.fetch_ticker_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried_not_tripped() {
        let adapter = MockExchangeAdapter::new("binance");
        adapter
            .set_ticker(ticker(
                "binance",
                "BTC/USDT:USDT",
                dec!(50000),
                dec!(50001),
                dec!(50000),
            ))
            .await;
        adapter
            .fail_times(2, AdapterError::Network("reset".into()))
            .await;

        let wrapper = ResilientExchange::new(adapter.clone(), &fast_config(5, 3));
        let tickers = wrapper.fetch_tickers(None).await.unwrap();
        assert_eq!(tickers.len(), 1);
        assert_eq!(adapter.fetch_ticker_calls.load(Ordering::SeqCst), 3);
        assert_eq!(wrapper.circuit_state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_repeated_failures_open_circuit_and_reject() {
        let adapter = MockExchangeAdapter::new("bybit");
        adapter
            .fail_always(AdapterError::Network("down".into()))
            .await;

        // threshold 3, attempts 3: one fetch cycle opens the breaker
        let wrapper = ResilientExchange::new(adapter.clone(), &fast_config(3, 3));
        let result = wrapper.fetch_tickers(None).await;
        assert!(matches!(result, Err(CollectError::Adapter(_))));
        assert_eq!(wrapper.circuit_state().await, CircuitState::Open);
        assert!(!wrapper.is_available().await);

        // next cycle is rejected without touching the adapter
        let calls_before = adapter.fetch_ticker_calls.load(Ordering::SeqCst);
        let result = wrapper.fetch_tickers(None).await;
        assert!(matches!(result, Err(CollectError::CircuitOpen { .. })));
        assert_eq!(adapter.fetch_ticker_calls.load(Ordering::SeqCst), calls_before);
    }

    #[tokio::test]
    async fn test_non_retryable_does_single_attempt() {
        let adapter = MockExchangeAdapter::new("binance");
        adapter.fail_always(AdapterError::Auth("bad key".into())).await;

        let wrapper = ResilientExchange::new(adapter.clone(), &fast_config(5, 3));
        let result = wrapper.fetch_tickers(None).await;
        assert!(matches!(
            result,
            Err(CollectError::Adapter(AdapterError::Auth(_)))
        ));
        assert_eq!(adapter.fetch_ticker_calls.load(Ordering::SeqCst), 1);

        // a permanent rejection leaves the breaker untouched
        let status = wrapper.status().await;
        assert_eq!(status.circuit.state, CircuitState::Closed);
        assert_eq!(status.circuit.failures, 0);
        assert_eq!(status.circuit.failed_calls, 0);
    }

    #[tokio::test]
    async fn test_call_deadline_maps_to_timeout_error() {
        let adapter = MockExchangeAdapter::new("binance");
        adapter.set_delay(Duration::from_millis(200)).await;

        let mut config = fast_config(5, 1);
        config.timeout_s = 0.01;
        let wrapper = ResilientExchange::new(adapter, &config);

        let result = wrapper.fetch_tickers(None).await;
        assert!(matches!(
            result,
            Err(CollectError::Adapter(AdapterError::Timeout { .. }))
        ));
        assert_eq!(wrapper.status().await.circuit.failed_calls, 1);
    }

    #[tokio::test]
    async fn test_unsupported_funding_returns_empty_without_calls() {
        let adapter = MockExchangeAdapter::new_without_funding("htx");
        let wrapper = ResilientExchange::new(adapter.clone(), &fast_config(5, 3));

        // adapter would fail, but the wrapper never asks it
        adapter
            .fail_always(AdapterError::Network("down".into()))
            .await;
        let rates = wrapper.fetch_funding_rates(None).await.unwrap();
        assert!(rates.is_empty());
        assert_eq!(adapter.fetch_funding_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_probe_timeout_counts_as_failure() {
        let adapter = MockExchangeAdapter::new("binance");
        adapter.set_delay(Duration::from_millis(100)).await;

        let mut config = fast_config(5, 3);
        config.health_check.timeout_s = 0.01;
        let wrapper = ResilientExchange::new(adapter, &config);

        assert!(!wrapper.run_probe().await);
    }
}
