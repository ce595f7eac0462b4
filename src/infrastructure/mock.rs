//! In-memory doubles for the adapter and bus seams, used by unit and
//! integration tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::{Mutex, RwLock};

use crate::domain::errors::{AdapterError, TransportError};
use crate::domain::ports::{BusSink, ExchangeAdapter};
use crate::domain::types::{ExchangeId, FundingRate, Symbol, Ticker, now_ms};

/// Scripted exchange adapter. Serves fixed data, optionally failing or
/// delaying calls to exercise the resilience stack.
pub struct MockExchangeAdapter {
    id: ExchangeId,
    tickers: RwLock<HashMap<Symbol, Ticker>>,
    funding: RwLock<HashMap<Symbol, FundingRate>>,
    fail_always: RwLock<Option<AdapterError>>,
    fail_next: Mutex<(u32, Option<AdapterError>)>,
    delay: RwLock<Option<Duration>>,
    supports_funding: bool,
    probe_ok: AtomicBool,
    pub initialize_calls: AtomicU64,
    pub fetch_ticker_calls: AtomicU64,
    pub fetch_funding_calls: AtomicU64,
    pub probe_calls: AtomicU64,
    pub close_calls: AtomicU64,
}

impl MockExchangeAdapter {
    pub fn new(id: &str) -> Arc<Self> {
        Self::build(id, true)
    }

    /// A venue that does not report funding for its perpetuals.
    pub fn new_without_funding(id: &str) -> Arc<Self> {
        Self::build(id, false)
    }

    fn build(id: &str, supports_funding: bool) -> Arc<Self> {
        Arc::new(Self {
            id: ExchangeId::new(id),
            tickers: RwLock::new(HashMap::new()),
            funding: RwLock::new(HashMap::new()),
            fail_always: RwLock::new(None),
            fail_next: Mutex::new((0, None)),
            delay: RwLock::new(None),
            supports_funding,
            probe_ok: AtomicBool::new(true),
            initialize_calls: AtomicU64::new(0),
            fetch_ticker_calls: AtomicU64::new(0),
            fetch_funding_calls: AtomicU64::new(0),
            probe_calls: AtomicU64::new(0),
            close_calls: AtomicU64::new(0),
        })
    }

    pub async fn set_ticker(&self, ticker: Ticker) {
        self.tickers
            .write()
            .await
            .insert(ticker.symbol.clone(), ticker);
    }

    pub async fn set_funding(&self, rate: FundingRate) {
        self.funding.write().await.insert(rate.symbol.clone(), rate);
    }

    /// Every subsequent call fails with a clone of `err`.
    pub async fn fail_always(&self, err: AdapterError) {
        *self.fail_always.write().await = Some(err);
    }

    pub async fn clear_failures(&self) {
        *self.fail_always.write().await = None;
        *self.fail_next.lock().await = (0, None);
    }

    /// The next `n` calls fail with a clone of `err`, then recover.
    pub async fn fail_times(&self, n: u32, err: AdapterError) {
        *self.fail_next.lock().await = (n, Some(err));
    }

    pub async fn set_delay(&self, delay: Duration) {
        *self.delay.write().await = Some(delay);
    }

    pub fn set_probe_ok(&self, ok: bool) {
        self.probe_ok.store(ok, Ordering::SeqCst);
    }

    async fn gate(&self) -> Result<(), AdapterError> {
        if let Some(delay) = *self.delay.read().await {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.fail_always.read().await.clone() {
            return Err(err);
        }
        let mut next = self.fail_next.lock().await;
        if next.0 > 0 {
            next.0 -= 1;
            if let Some(err) = next.1.clone() {
                return Err(err);
            }
        }
        Ok(())
    }

    fn filter<T: Clone>(all: &HashMap<Symbol, T>, symbols: Option<&[Symbol]>) -> HashMap<Symbol, T> {
        match symbols {
            None => all.clone(),
            Some(wanted) => wanted
                .iter()
                .filter_map(|s| all.get(s).map(|v| (s.clone(), v.clone())))
                .collect(),
        }
    }
}

#[async_trait]
impl ExchangeAdapter for MockExchangeAdapter {
    fn id(&self) -> &ExchangeId {
        &self.id
    }

    async fn initialize(&self) -> Result<(), AdapterError> {
        self.initialize_calls.fetch_add(1, Ordering::SeqCst);
        self.gate().await
    }

    async fn list_futures_symbols(&self) -> Result<Vec<Symbol>, AdapterError> {
        self.gate().await?;
        Ok(self.tickers.read().await.keys().cloned().collect())
    }

    async fn fetch_tickers(
        &self,
        symbols: Option<&[Symbol]>,
    ) -> Result<HashMap<Symbol, Ticker>, AdapterError> {
        self.fetch_ticker_calls.fetch_add(1, Ordering::SeqCst);
        self.gate().await?;
        Ok(Self::filter(&*self.tickers.read().await, symbols))
    }

    async fn fetch_funding_rates(
        &self,
        symbols: Option<&[Symbol]>,
    ) -> Result<HashMap<Symbol, FundingRate>, AdapterError> {
        self.fetch_funding_calls.fetch_add(1, Ordering::SeqCst);
        self.gate().await?;
        Ok(Self::filter(&*self.funding.read().await, symbols))
    }

    fn supports_funding(&self) -> bool {
        self.supports_funding
    }

    async fn probe(&self) -> bool {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = *self.delay.read().await {
            tokio::time::sleep(delay).await;
        }
        self.probe_ok.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
    }
}

/// Convenience constructor for test tickers.
pub fn ticker(exchange: &str, symbol: &str, bid: Decimal, ask: Decimal, last: Decimal) -> Ticker {
    Ticker {
        exchange: ExchangeId::new(exchange),
        symbol: Symbol::parse(symbol).unwrap(),
        timestamp_ms: now_ms(),
        bid: Some(bid),
        ask: Some(ask),
        last: Some(last),
        volume_24h: None,
    }
}

/// Convenience constructor for test funding rates.
pub fn funding_rate(exchange: &str, symbol: &str, rate: Decimal) -> FundingRate {
    FundingRate {
        exchange: ExchangeId::new(exchange),
        symbol: Symbol::parse(symbol).unwrap(),
        timestamp_ms: now_ms(),
        funding_rate: rate,
        next_funding_time_ms: None,
        mark_price: None,
    }
}

#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub routing_key: String,
    pub body: Vec<u8>,
    pub correlation_id: Option<String>,
}

impl PublishedMessage {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).expect("published body is not JSON")
    }
}

/// Recording bus sink with optional scripted failures.
#[derive(Default)]
pub struct MockBusSink {
    published: Mutex<Vec<PublishedMessage>>,
    fail_next: AtomicU32,
}

impl MockBusSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The next `n` publishes fail.
    pub fn fail_times(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub async fn published(&self) -> Vec<PublishedMessage> {
        self.published.lock().await.clone()
    }

    pub async fn count(&self) -> usize {
        self.published.lock().await.len()
    }
}

#[async_trait]
impl BusSink for MockBusSink {
    async fn publish(
        &self,
        routing_key: &str,
        body: Vec<u8>,
        correlation_id: Option<&str>,
    ) -> Result<(), TransportError> {
        if self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(TransportError::Publish("scripted failure".into()));
        }
        self.published.lock().await.push(PublishedMessage {
            routing_key: routing_key.to_string(),
            body,
            correlation_id: correlation_id.map(str::to_string),
        });
        Ok(())
    }
}
