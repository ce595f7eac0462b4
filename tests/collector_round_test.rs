//! End-to-end collection rounds over scripted adapters: fan-out, partial
//! failure, circuit-open exclusion, caching, and round isolation.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use futurescan::application::batch::BatchConfig;
use futurescan::application::collector::Collector;
use futurescan::application::publisher::Publisher;
use futurescan::application::shared_state::SharedSymbolSet;
use futurescan::application::statistics::Statistics;
use futurescan::config::ExchangeConfig;
use futurescan::domain::errors::AdapterError;
use futurescan::domain::types::Symbol;
use futurescan::infrastructure::cache::{CacheConfig, CollectorCache};
use futurescan::infrastructure::mock::{MockBusSink, MockExchangeAdapter, ticker};
use futurescan::infrastructure::resilience::{CircuitState, ResilientExchange};
use futurescan::infrastructure::resilience::retry::{RetryConfig, RetryStrategy};
use rust_decimal_macros::dec;

const CADENCE: Duration = Duration::from_secs(30);

fn fast_exchange_config() -> ExchangeConfig {
    let mut config = ExchangeConfig::default();
    config.circuit_breaker.failure_threshold = 3;
    config.circuit_breaker.recovery_timeout_s = 60.0;
    config.retry = RetryConfig {
        max_attempts: 3,
        base_delay_s: 0.001,
        max_delay_s: 0.002,
        strategy: RetryStrategy::Fixed,
        jitter: false,
        ..RetryConfig::default()
    };
    config
}

struct Harness {
    adapters: Vec<Arc<MockExchangeAdapter>>,
    wrappers: Vec<Arc<ResilientExchange>>,
    collector: Collector,
    shared_symbols: Arc<SharedSymbolSet>,
    statistics: Arc<Statistics>,
}

fn harness(exchange_ids: &[&str]) -> Harness {
    harness_with(exchange_ids, fast_exchange_config())
}

fn harness_with(exchange_ids: &[&str], exchange_config: ExchangeConfig) -> Harness {
    let statistics = Arc::new(Statistics::new());
    let shared_symbols = Arc::new(SharedSymbolSet::new([]));
    let cache = Arc::new(CollectorCache::new(&CacheConfig::default()));

    let adapters: Vec<Arc<MockExchangeAdapter>> = exchange_ids
        .iter()
        .map(|id| MockExchangeAdapter::new(id))
        .collect();
    let wrappers: Vec<Arc<ResilientExchange>> = adapters
        .iter()
        .map(|adapter| {
            Arc::new(ResilientExchange::new(adapter.clone(), &exchange_config))
        })
        .collect();

    let collector = Collector::new(
        wrappers.clone(),
        cache,
        Arc::clone(&shared_symbols),
        Arc::clone(&statistics),
    );

    Harness {
        adapters,
        wrappers,
        collector,
        shared_symbols,
        statistics,
    }
}

fn publisher(sink: Arc<MockBusSink>, statistics: Arc<Statistics>) -> Publisher {
    Publisher::new(
        sink,
        BatchConfig::default(),
        statistics,
        "futurescan test".to_string(),
        "test".to_string(),
    )
}

async fn seed_btc(adapter: &MockExchangeAdapter, exchange: &str) {
    adapter
        .set_ticker(ticker(
            exchange,
            "BTC/USDT:USDT",
            dec!(50000),
            dec!(50001),
            dec!(50000),
        ))
        .await;
}

#[tokio::test]
async fn test_s1_two_exchanges_one_message() {
    let h = harness(&["binance", "bybit"]);
    seed_btc(&h.adapters[0], "binance").await;
    seed_btc(&h.adapters[1], "bybit").await;

    let snapshot = h.collector.collect_tickers(CADENCE).await;
    assert_eq!(snapshot.stats.queried, 2);
    assert_eq!(snapshot.stats.succeeded, 2);
    assert_eq!(snapshot.stats.failed, 0);

    let sink = MockBusSink::new();
    let publisher = publisher(sink.clone(), h.statistics.clone());
    assert!(publisher.submit(&snapshot).await);
    publisher.drain_now().await;

    let published = sink.published().await;
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].routing_key, "snapshot.tickers");

    let body = published[0].json();
    assert_eq!(body["type"], "tickers");
    assert_eq!(body["collection_stats"]["successful_exchanges"], 2);
    assert_eq!(body["collection_stats"]["failed_exchanges"], 0);
    let btc = &body["data"]["binance"]["BTC/USDT:USDT"];
    assert_eq!(btc["bid"].as_f64().unwrap(), 50000.0);
    assert_eq!(btc["ask"].as_f64().unwrap(), 50001.0);
    assert!(body["data"]["bybit"]["BTC/USDT:USDT"].is_object());
}

#[tokio::test]
async fn test_s2_failing_exchange_keeps_stable_schema() {
    // two attempts per cycle keeps the failure count below the breaker
    // threshold of three
    let mut config = fast_exchange_config();
    config.retry.max_attempts = 2;
    let h = harness_with(&["binance", "bybit"], config);
    seed_btc(&h.adapters[0], "binance").await;
    h.adapters[1]
        .fail_times(2, AdapterError::Network("connection reset".into()))
        .await;

    let snapshot = h.collector.collect_tickers(CADENCE).await;
    assert_eq!(snapshot.stats.succeeded, 1);
    assert_eq!(snapshot.stats.failed, 1);

    // Only retry attempts were spent; the circuit stays closed below threshold
    assert_eq!(
        h.wrappers[1].circuit_state().await,
        CircuitState::Closed
    );

    let sink = MockBusSink::new();
    let publisher = publisher(sink.clone(), h.statistics.clone());
    publisher.submit(&snapshot).await;
    publisher.drain_now().await;

    let body = sink.published().await[0].json();
    assert!(body["data"]["binance"]["BTC/USDT:USDT"].is_object());
    // bybit is present with an empty sub-map, never missing
    assert_eq!(body["data"]["bybit"], serde_json::json!({}));
    assert_eq!(body["collection_stats"]["successful_exchanges"], 1);
    assert_eq!(body["collection_stats"]["failed_exchanges"], 1);
}

#[tokio::test]
async fn test_s3_open_circuit_excludes_exchange_from_next_round() {
    let h = harness(&["binance", "bybit"]);
    seed_btc(&h.adapters[0], "binance").await;
    h.adapters[1]
        .fail_always(AdapterError::Network("down".into()))
        .await;

    // Round 1: three retry attempts fail, reaching the breaker threshold
    let snapshot = h.collector.collect_tickers(CADENCE).await;
    assert_eq!(snapshot.stats.failed, 1);
    assert_eq!(h.wrappers[1].circuit_state().await, CircuitState::Open);

    let status = h.wrappers[1].status().await;
    assert_eq!(status.circuit.opens, 1);

    // Round 2: the collector skips bybit without touching the adapter
    let calls_before = h.adapters[1].fetch_ticker_calls.load(Ordering::SeqCst);
    let snapshot = h.collector.collect_tickers(CADENCE).await;
    assert_eq!(
        h.adapters[1].fetch_ticker_calls.load(Ordering::SeqCst),
        calls_before
    );
    assert_eq!(snapshot.stats.failed, 1);
    assert!(snapshot.data[h.wrappers[1].id()].is_empty());
    assert!(!snapshot.data[h.wrappers[0].id()].is_empty());
}

#[tokio::test]
async fn test_unhealthy_exchange_is_excluded_but_keeps_its_key() {
    let h = harness(&["binance", "bybit"]);
    seed_btc(&h.adapters[0], "binance").await;
    seed_btc(&h.adapters[1], "bybit").await;

    // three failed probes push bybit to Unhealthy
    for _ in 0..3 {
        h.wrappers[1].record_probe_result(false).await;
    }
    assert!(!h.wrappers[1].is_available().await);

    let snapshot = h.collector.collect_tickers(CADENCE).await;
    assert_eq!(snapshot.stats.succeeded, 1);
    assert_eq!(snapshot.stats.failed, 1);
    assert!(snapshot.data[h.wrappers[1].id()].is_empty());
    assert_eq!(h.adapters[1].fetch_ticker_calls.load(Ordering::SeqCst), 0);

    // two good probes recover it through Degraded, which is collectable
    h.wrappers[1].record_probe_result(true).await;
    h.wrappers[1].record_probe_result(true).await;
    assert!(h.wrappers[1].is_available().await);
}

#[tokio::test]
async fn test_second_round_within_ttl_is_served_from_cache() {
    let h = harness(&["binance"]);
    seed_btc(&h.adapters[0], "binance").await;

    let first = h.collector.collect_tickers(CADENCE).await;
    assert_eq!(first.stats.cached, 0);
    let second = h.collector.collect_tickers(CADENCE).await;
    assert_eq!(second.stats.cached, 1);
    assert_eq!(second.stats.succeeded, 1);

    assert_eq!(h.adapters[0].fetch_ticker_calls.load(Ordering::SeqCst), 1);
    assert_eq!(first.data, second.data);
}

#[tokio::test]
async fn test_round_uses_symbol_set_read_at_start() {
    let h = harness(&["binance"]);
    seed_btc(&h.adapters[0], "binance").await;
    h.adapters[0]
        .set_ticker(ticker(
            "binance",
            "ETH/USDT:USDT",
            dec!(3000),
            dec!(3001),
            dec!(3000),
        ))
        .await;
    h.adapters[0].set_delay(Duration::from_millis(100)).await;

    h.shared_symbols
        .add(Symbol::parse("BTC/USDT:USDT").unwrap())
        .await;

    let collector = h.collector;
    let shared = Arc::clone(&h.shared_symbols);
    let round = tokio::spawn(async move { collector.collect_tickers(CADENCE).await });

    // Mutate the working set while the round is in flight
    tokio::time::sleep(Duration::from_millis(20)).await;
    shared
        .replace([Symbol::parse("ETH/USDT:USDT").unwrap()])
        .await;

    let snapshot = round.await.unwrap();
    let binance = &snapshot.data[&futurescan::domain::types::ExchangeId::new("binance")];
    assert!(binance.contains_key(&Symbol::parse("BTC/USDT:USDT").unwrap()));
    assert!(!binance.contains_key(&Symbol::parse("ETH/USDT:USDT").unwrap()));
}

#[tokio::test]
async fn test_empty_symbol_set_fetches_full_universe() {
    let h = harness(&["binance"]);
    seed_btc(&h.adapters[0], "binance").await;
    h.adapters[0]
        .set_ticker(ticker(
            "binance",
            "ETH/USDT:USDT",
            dec!(3000),
            dec!(3001),
            dec!(3000),
        ))
        .await;

    assert!(h.shared_symbols.is_empty().await);
    let snapshot = h.collector.collect_tickers(CADENCE).await;
    let binance = &snapshot.data[h.wrappers[0].id()];
    assert_eq!(binance.len(), 2);
}

#[tokio::test]
async fn test_funding_round_with_unsupporting_venue() {
    let statistics = Arc::new(Statistics::new());
    let shared_symbols = Arc::new(SharedSymbolSet::new([]));
    let cache = Arc::new(CollectorCache::new(&CacheConfig::default()));

    let binance = MockExchangeAdapter::new("binance");
    binance
        .set_funding(futurescan::infrastructure::mock::funding_rate(
            "binance",
            "BTC/USDT:USDT",
            dec!(0.0001),
        ))
        .await;
    let htx = MockExchangeAdapter::new_without_funding("htx");

    let wrappers: Vec<Arc<ResilientExchange>> = vec![
        Arc::new(ResilientExchange::new(binance, &fast_exchange_config())),
        Arc::new(ResilientExchange::new(htx, &fast_exchange_config())),
    ];
    let collector = Collector::new(wrappers, cache, shared_symbols, statistics);

    let snapshot = collector.collect_funding_rates(CADENCE).await;
    // both exchanges succeed; the unsupporting one contributes an empty map
    assert_eq!(snapshot.stats.succeeded, 2);
    assert_eq!(snapshot.stats.failed, 0);
    assert_eq!(
        snapshot.data[&futurescan::domain::types::ExchangeId::new("binance")].len(),
        1
    );
    assert!(snapshot.data[&futurescan::domain::types::ExchangeId::new("htx")].is_empty());
}
