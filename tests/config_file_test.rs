//! The shipped example configuration must always load and validate.

use futurescan::application::batch::BatchStrategy;
use futurescan::config::AppConfig;
use futurescan::infrastructure::resilience::RetryStrategy;
use std::path::Path;

#[test]
fn test_example_config_loads_and_validates() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config.example.toml");
    let config = AppConfig::load(Some(&path), None).unwrap();

    assert_eq!(config.environment, "development");
    assert_eq!(config.exchanges.len(), 5);
    assert_eq!(config.ticker_interval_s, 30);
    assert_eq!(config.funding_rate_interval_s, 300);
    assert_eq!(config.batch.strategy, BatchStrategy::Hybrid);
    assert_eq!(config.rabbitmq.data_exchange, "futures.data");

    let bybit = config.exchange_config("bybit");
    assert_eq!(bybit.circuit_breaker.failure_threshold, 5);
    assert_eq!(bybit.retry.strategy, RetryStrategy::Exponential);
    assert!(bybit.health_check.adaptive_scaling);

    // exchanges without an override section fall back to defaults
    let binance = config.exchange_config("binance");
    assert_eq!(binance.timeout_s, 30.0);
    assert!(binance.enabled);
}

#[test]
fn test_environment_flag_overrides_file_value() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config.example.toml");
    let config = AppConfig::load(Some(&path), Some("staging")).unwrap();
    assert_eq!(config.environment, "staging");
}
