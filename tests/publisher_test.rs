//! Change suppression, at-least-once delivery, and dead-letter behavior of
//! the batching publisher.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futurescan::application::batch::BatchConfig;
use futurescan::application::publisher::Publisher;
use futurescan::application::statistics::Statistics;
use futurescan::domain::types::{
    CollectionStats, DataKind, ExchangeId, Snapshot, Symbol, Ticker, now_ms,
};
use futurescan::infrastructure::mock::MockBusSink;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use uuid::Uuid;

fn snapshot_with_bid(bid: Decimal) -> Snapshot<Ticker> {
    let exchange = ExchangeId::new("binance");
    let symbol = Symbol::parse("BTC/USDT:USDT").unwrap();
    let mut by_symbol = BTreeMap::new();
    by_symbol.insert(
        symbol.clone(),
        Ticker {
            exchange: exchange.clone(),
            symbol,
            timestamp_ms: now_ms(),
            bid: Some(bid),
            ask: Some(bid + dec!(1)),
            last: Some(bid),
            volume_24h: None,
        },
    );
    let mut data = BTreeMap::new();
    data.insert(exchange, by_symbol);

    Snapshot {
        kind: DataKind::Tickers,
        round_id: Uuid::new_v4(),
        timestamp_ms: now_ms(),
        data,
        stats: CollectionStats {
            queried: 1,
            succeeded: 1,
            failed: 0,
            cached: 0,
            elapsed: Duration::from_millis(12),
        },
    }
}

fn publisher(sink: Arc<MockBusSink>, config: BatchConfig) -> (Publisher, Arc<Statistics>) {
    let statistics = Arc::new(Statistics::new());
    let publisher = Publisher::new(
        sink,
        config,
        Arc::clone(&statistics),
        "futurescan test".to_string(),
        "test".to_string(),
    );
    (publisher, statistics)
}

#[tokio::test]
async fn test_s4_identical_snapshot_is_suppressed() {
    let sink = MockBusSink::new();
    let (publisher, _) = publisher(sink.clone(), BatchConfig::default());

    let snapshot = snapshot_with_bid(dec!(50000));
    assert!(publisher.submit(&snapshot).await);
    publisher.drain_now().await;
    assert_eq!(sink.count().await, 1);

    // identical content, different timestamps: suppressed
    let identical = snapshot_with_bid(dec!(50000));
    assert!(!publisher.submit(&identical).await);
    publisher.drain_now().await;
    assert_eq!(sink.count().await, 1);
    assert_eq!(publisher.suppressed_count(), 1);

    // one bid changed: published again
    let changed = snapshot_with_bid(dec!(50001));
    assert!(publisher.submit(&changed).await);
    publisher.drain_now().await;
    assert_eq!(sink.count().await, 2);
}

#[tokio::test]
async fn test_double_submit_before_flush_publishes_once() {
    let sink = MockBusSink::new();
    let (publisher, _) = publisher(sink.clone(), BatchConfig::default());

    let snapshot = snapshot_with_bid(dec!(50000));
    assert!(publisher.submit(&snapshot).await);
    assert!(!publisher.submit(&snapshot_with_bid(dec!(50000))).await);
    publisher.drain_now().await;
    assert_eq!(sink.count().await, 1);
}

#[tokio::test]
async fn test_at_least_once_failed_publish_retries_with_new_data() {
    let sink = MockBusSink::new();
    let (publisher, statistics) = publisher(sink.clone(), BatchConfig::default());

    sink.fail_times(1);
    publisher.submit(&snapshot_with_bid(dec!(50000))).await;
    publisher.drain_now().await;
    assert_eq!(sink.count().await, 0);

    // retry queue flushes on the next cycle and the broker sees the data
    publisher.flush_now().await;
    assert_eq!(sink.count().await, 1);
    let body = sink.published().await[0].json();
    assert_eq!(
        body["data"]["binance"]["BTC/USDT:USDT"]["bid"]
            .as_f64()
            .unwrap(),
        50000.0
    );

    let stats = statistics.snapshot();
    assert_eq!(stats.rabbitmq_failed, 1);
    assert_eq!(stats.rabbitmq_published, 1);
}

#[tokio::test]
async fn test_dead_letter_clears_suppression_so_change_is_not_lost() {
    let sink = MockBusSink::new();
    let config = BatchConfig {
        max_retries: 1,
        ..BatchConfig::default()
    };
    let (publisher, _) = publisher(sink.clone(), config);

    sink.fail_times(10);
    publisher.submit(&snapshot_with_bid(dec!(50000))).await;
    publisher.drain_now().await; // attempt 1 fails, requeued
    publisher.flush_now().await; // attempt 2 fails, dead-lettered
    assert_eq!(publisher.dead_letter_count().await, 1);
    assert_eq!(sink.count().await, 0);

    // same content again: without the fingerprint reset this would be
    // suppressed and the change lost for good
    sink.fail_times(0);
    assert!(publisher.submit(&snapshot_with_bid(dec!(50000))).await);
    publisher.drain_now().await;
    assert_eq!(sink.count().await, 1);
}

#[tokio::test]
async fn test_kinds_are_fingerprinted_independently() {
    let sink = MockBusSink::new();
    let (publisher, _) = publisher(sink.clone(), BatchConfig::default());

    let tickers = snapshot_with_bid(dec!(50000));
    let funding: Snapshot<futurescan::domain::types::FundingRate> = Snapshot {
        kind: DataKind::FundingRates,
        round_id: Uuid::new_v4(),
        timestamp_ms: now_ms(),
        data: BTreeMap::new(),
        stats: CollectionStats::default(),
    };

    assert!(publisher.submit(&tickers).await);
    assert!(publisher.submit(&funding).await);
    publisher.drain_now().await;

    let published = sink.published().await;
    assert_eq!(published.len(), 2);
    let keys: Vec<&str> = published.iter().map(|m| m.routing_key.as_str()).collect();
    assert!(keys.contains(&"snapshot.tickers"));
    assert!(keys.contains(&"snapshot.funding_rates"));
}

#[tokio::test]
async fn test_batch_collapses_to_newest_snapshot_per_kind() {
    let sink = MockBusSink::new();
    let (publisher, _) = publisher(sink.clone(), BatchConfig::default());

    publisher.submit(&snapshot_with_bid(dec!(50000))).await;
    publisher.submit(&snapshot_with_bid(dec!(50001))).await;
    publisher.submit(&snapshot_with_bid(dec!(50002))).await;
    publisher.drain_now().await;

    // one message, carrying the newest data
    let published = sink.published().await;
    assert_eq!(published.len(), 1);
    let body = published[0].json();
    assert_eq!(
        body["data"]["binance"]["BTC/USDT:USDT"]["bid"]
            .as_f64()
            .unwrap(),
        50002.0
    );
}

#[tokio::test]
async fn test_wire_envelope_shape() {
    let sink = MockBusSink::new();
    let (publisher, _) = publisher(sink.clone(), BatchConfig::default());

    publisher.submit(&snapshot_with_bid(dec!(50000))).await;
    publisher.drain_now().await;

    let body = sink.published().await[0].json();
    assert_eq!(body["type"], "tickers");
    assert_eq!(body["source"], "futurescan test");
    assert_eq!(body["environment"], "test");
    assert!(body["timestamp"].is_i64());
    assert_eq!(body["collection_stats"]["exchanges_queried"], 1);
    assert!(body["collection_stats"]["collection_time"].is_f64());
}
