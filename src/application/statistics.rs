//! Pipeline counters: per-exchange collection outcomes and publish results.
//!
//! Two tiers: cumulative counters backing the `get_statistics` control
//! command, and interval counters the reporting loop logs and resets.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tracing::info;

use crate::domain::types::ExchangeId;

#[derive(Debug, Clone, Serialize)]
pub struct StatisticsSnapshot {
    pub exchange_success: BTreeMap<String, u64>,
    pub exchange_errors: BTreeMap<String, u64>,
    pub rabbitmq_published: u64,
    pub rabbitmq_failed: u64,
}

#[derive(Default)]
struct CounterSet {
    exchange_success: Mutex<HashMap<ExchangeId, u64>>,
    exchange_errors: Mutex<HashMap<ExchangeId, u64>>,
    rabbitmq_published: AtomicU64,
    rabbitmq_failed: AtomicU64,
}

impl CounterSet {
    fn bump(map: &Mutex<HashMap<ExchangeId, u64>>, exchange: &ExchangeId) {
        let mut map = map.lock().unwrap_or_else(|e| e.into_inner());
        *map.entry(exchange.clone()).or_insert(0) += 1;
    }

    fn to_sorted(map: &Mutex<HashMap<ExchangeId, u64>>) -> BTreeMap<String, u64> {
        map.lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect()
    }
}

#[derive(Default)]
pub struct Statistics {
    cumulative: CounterSet,
    interval: CounterSet,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, exchange: &ExchangeId) {
        CounterSet::bump(&self.cumulative.exchange_success, exchange);
        CounterSet::bump(&self.interval.exchange_success, exchange);
    }

    pub fn record_error(&self, exchange: &ExchangeId) {
        CounterSet::bump(&self.cumulative.exchange_errors, exchange);
        CounterSet::bump(&self.interval.exchange_errors, exchange);
    }

    pub fn record_published(&self) {
        self.cumulative.rabbitmq_published.fetch_add(1, Ordering::Relaxed);
        self.interval.rabbitmq_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_publish_failed(&self) {
        self.cumulative.rabbitmq_failed.fetch_add(1, Ordering::Relaxed);
        self.interval.rabbitmq_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Cumulative counters for the control plane.
    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            exchange_success: CounterSet::to_sorted(&self.cumulative.exchange_success),
            exchange_errors: CounterSet::to_sorted(&self.cumulative.exchange_errors),
            rabbitmq_published: self.cumulative.rabbitmq_published.load(Ordering::Relaxed),
            rabbitmq_failed: self.cumulative.rabbitmq_failed.load(Ordering::Relaxed),
        }
    }

    /// Log the interval counters and reset them.
    pub fn report_and_reset(&self, interval_s: u64) {
        let success = CounterSet::to_sorted(&self.interval.exchange_success);
        let errors = CounterSet::to_sorted(&self.interval.exchange_errors);

        info!("=== Statistics (last {interval_s}s) ===");
        let mut exchanges: Vec<&String> = success.keys().chain(errors.keys()).collect();
        exchanges.sort();
        exchanges.dedup();
        if exchanges.is_empty() {
            info!("No data collected yet");
        } else {
            for exchange in exchanges {
                info!(
                    "{exchange}: {} success, {} errors",
                    success.get(exchange).copied().unwrap_or(0),
                    errors.get(exchange).copied().unwrap_or(0)
                );
            }
        }
        info!(
            "RabbitMQ: {} published, {} failed",
            self.interval.rabbitmq_published.load(Ordering::Relaxed),
            self.interval.rabbitmq_failed.load(Ordering::Relaxed)
        );

        self.interval
            .exchange_success
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.interval
            .exchange_errors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.interval.rabbitmq_published.store(0, Ordering::Relaxed);
        self.interval.rabbitmq_failed.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = Statistics::new();
        let binance = ExchangeId::new("binance");
        let bybit = ExchangeId::new("bybit");

        stats.record_success(&binance);
        stats.record_success(&binance);
        stats.record_error(&bybit);
        stats.record_published();
        stats.record_publish_failed();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.exchange_success.get("binance"), Some(&2));
        assert_eq!(snapshot.exchange_errors.get("bybit"), Some(&1));
        assert_eq!(snapshot.rabbitmq_published, 1);
        assert_eq!(snapshot.rabbitmq_failed, 1);
    }

    #[test]
    fn test_report_resets_interval_but_not_cumulative() {
        let stats = Statistics::new();
        let binance = ExchangeId::new("binance");

        stats.record_success(&binance);
        stats.record_published();
        stats.report_and_reset(60);

        stats.record_success(&binance);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.exchange_success.get("binance"), Some(&2));
        assert_eq!(snapshot.rabbitmq_published, 1);
    }
}
