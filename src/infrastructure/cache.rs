//! TTL cache fronting the collector. One cache per data kind: tickers age
//! out quickly, funding rates live longer. Entries are keyed by
//! `(exchange, symbols-fingerprint)` so a changed working set never serves
//! stale shapes.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use moka::future::Cache;
use serde::Deserialize;

use crate::domain::fingerprint::Fingerprint;
use crate::domain::types::{ExchangeId, FundingRate, Symbol, Ticker};

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    pub ticker_ttl_s: u64,
    pub funding_ttl_s: u64,
    /// Entry cap per kind.
    pub max_size: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ticker_ttl_s: 30,
            funding_ttl_s: 300,
            max_size: 1000,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.ticker_ttl_s > 0, "cache.ticker_ttl_s must be positive");
        anyhow::ensure!(
            self.funding_ttl_s > 0,
            "cache.funding_ttl_s must be positive"
        );
        anyhow::ensure!(self.max_size > 0, "cache.max_size must be positive");
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// One kind's cache. Values are shared immutable maps; callers never get a
/// handle they could mutate in place.
pub struct KindCache<T: Clone + Send + Sync + 'static> {
    cache: Cache<(ExchangeId, u128), Arc<BTreeMap<Symbol, T>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<T: Clone + Send + Sync + 'static> KindCache<T> {
    fn new(ttl: Duration, max_size: u64) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(max_size)
                .time_to_live(ttl)
                .build(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub async fn get(
        &self,
        exchange: &ExchangeId,
        symbols_fp: Fingerprint,
    ) -> Option<Arc<BTreeMap<Symbol, T>>> {
        let entry = self
            .cache
            .get(&(exchange.clone(), symbols_fp.as_u128()))
            .await;
        match &entry {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        entry
    }

    pub async fn put(
        &self,
        exchange: &ExchangeId,
        symbols_fp: Fingerprint,
        value: BTreeMap<Symbol, T>,
    ) {
        self.cache
            .insert((exchange.clone(), symbols_fp.as_u128()), Arc::new(value))
            .await;
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

/// The collector-facing pair of kind caches.
pub struct CollectorCache {
    pub tickers: KindCache<Ticker>,
    pub funding: KindCache<FundingRate>,
}

impl CollectorCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            tickers: KindCache::new(Duration::from_secs(config.ticker_ttl_s), config.max_size),
            funding: KindCache::new(Duration::from_secs(config.funding_ttl_s), config.max_size),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::fingerprint::fingerprint_symbols;
    use crate::infrastructure::mock::ticker;
    use rust_decimal_macros::dec;

    fn symbols() -> Vec<Symbol> {
        vec![Symbol::parse("BTC/USDT:USDT").unwrap()]
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let cache = CollectorCache::new(&CacheConfig::default());
        let exchange = ExchangeId::new("binance");
        let fp = fingerprint_symbols(&symbols());

        assert!(cache.tickers.get(&exchange, fp).await.is_none());

        let mut value = BTreeMap::new();
        let t = ticker("binance", "BTC/USDT:USDT", dec!(1), dec!(2), dec!(1));
        value.insert(t.symbol.clone(), t);
        cache.tickers.put(&exchange, fp, value).await;

        let entry = cache.tickers.get(&exchange, fp).await.unwrap();
        assert_eq!(entry.len(), 1);

        let stats = cache.tickers.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_ratio(), 0.5);
    }

    #[tokio::test]
    async fn test_symbol_set_change_misses() {
        let cache = CollectorCache::new(&CacheConfig::default());
        let exchange = ExchangeId::new("binance");
        let fp_a = fingerprint_symbols(&symbols());
        let fp_b = fingerprint_symbols(&[Symbol::parse("ETH/USDT:USDT").unwrap()]);

        cache.tickers.put(&exchange, fp_a, BTreeMap::new()).await;
        assert!(cache.tickers.get(&exchange, fp_b).await.is_none());
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let config = CacheConfig {
            ticker_ttl_s: 1,
            ..CacheConfig::default()
        };
        let cache = CollectorCache::new(&config);
        let exchange = ExchangeId::new("binance");
        let fp = fingerprint_symbols(&[]);

        cache.tickers.put(&exchange, fp, BTreeMap::new()).await;
        assert!(cache.tickers.get(&exchange, fp).await.is_some());

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(cache.tickers.get(&exchange, fp).await.is_none());
    }
}
