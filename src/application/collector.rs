//! The round engine: fan a collection round out across all available
//! exchange wrappers and fold the results into one snapshot.
//!
//! Round protocol: read the working symbol set once, gate out exchanges that
//! are Unhealthy or circuit-open, consult the kind cache, fetch the misses
//! concurrently under the round deadline, then assemble. Every configured
//! exchange keeps its top-level key in the result; failures are empty
//! sub-maps plus counters, never missing keys.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::future::join_all;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::application::shared_state::SharedSymbolSet;
use crate::application::statistics::Statistics;
use crate::domain::errors::CollectError;
use crate::domain::fingerprint::fingerprint_symbols;
use crate::domain::types::{
    CollectionStats, DataKind, FundingRate, Snapshot, Symbol, Ticker, now_ms,
};
use crate::infrastructure::cache::{CollectorCache, KindCache};
use crate::infrastructure::resilience::ResilientExchange;

pub struct Collector {
    wrappers: Vec<Arc<ResilientExchange>>,
    cache: Arc<CollectorCache>,
    shared_symbols: Arc<SharedSymbolSet>,
    statistics: Arc<Statistics>,
}

impl Collector {
    pub fn new(
        wrappers: Vec<Arc<ResilientExchange>>,
        cache: Arc<CollectorCache>,
        shared_symbols: Arc<SharedSymbolSet>,
        statistics: Arc<Statistics>,
    ) -> Self {
        Self {
            wrappers,
            cache,
            shared_symbols,
            statistics,
        }
    }

    pub async fn collect_tickers(&self, cadence: Duration) -> Snapshot<Ticker> {
        self.run_round(
            DataKind::Tickers,
            cadence,
            &self.cache.tickers,
            |wrapper, symbols| {
                Box::pin(async move { wrapper.fetch_tickers(symbols.as_deref()).await })
            },
        )
        .await
    }

    pub async fn collect_funding_rates(&self, cadence: Duration) -> Snapshot<FundingRate> {
        self.run_round(
            DataKind::FundingRates,
            cadence,
            &self.cache.funding,
            |wrapper, symbols| {
                Box::pin(async move { wrapper.fetch_funding_rates(symbols.as_deref()).await })
            },
        )
        .await
    }

    async fn run_round<T, F>(
        &self,
        kind: DataKind,
        cadence: Duration,
        cache: &KindCache<T>,
        fetch: F,
    ) -> Snapshot<T>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(
            Arc<ResilientExchange>,
            Option<Vec<Symbol>>,
        ) -> BoxFuture<'static, Result<std::collections::HashMap<Symbol, T>, CollectError>>,
    {
        let round_id = Uuid::new_v4();
        let started = Instant::now();
        let round_deadline = cadence * 2;

        // One read per round; a mid-round set_symbols affects the next round
        let symbols = self.shared_symbols.snapshot().await;
        let symbols_fp = fingerprint_symbols(&symbols);
        let filter: Option<Vec<Symbol>> = if symbols.is_empty() {
            None
        } else {
            Some(symbols)
        };

        debug!(
            "Collector: starting {kind} round {round_id} across {} exchanges",
            self.wrappers.len()
        );

        let mut stats = CollectionStats {
            queried: self.wrappers.len(),
            ..CollectionStats::default()
        };
        let mut data: BTreeMap<_, BTreeMap<Symbol, T>> = BTreeMap::new();
        let mut fetches = Vec::new();

        for wrapper in &self.wrappers {
            let id = wrapper.id().clone();
            data.insert(id.clone(), BTreeMap::new());

            if !wrapper.is_available().await {
                warn!("Collector: skipping '{id}' for {kind} round (unhealthy or circuit open)");
                stats.failed += 1;
                self.statistics.record_error(&id);
                continue;
            }

            if let Some(cached) = cache.get(&id, symbols_fp).await {
                debug!("Collector: cache hit for '{id}' {kind}");
                data.insert(id, (*cached).clone());
                stats.cached += 1;
                stats.succeeded += 1;
                continue;
            }

            let future = fetch(Arc::clone(wrapper), filter.clone());
            fetches.push(async move {
                (id, tokio::time::timeout(round_deadline, future).await)
            });
        }

        for (id, outcome) in join_all(fetches).await {
            match outcome {
                Ok(Ok(records)) => {
                    let records: BTreeMap<Symbol, T> = records.into_iter().collect();
                    cache.put(&id, symbols_fp, records.clone()).await;
                    data.insert(id.clone(), records);
                    stats.succeeded += 1;
                    self.statistics.record_success(&id);
                }
                Ok(Err(CollectError::CircuitOpen { retry_in_ms, .. })) => {
                    warn!(
                        "Collector: '{id}' rejected {kind} fetch, circuit open for {retry_in_ms}ms"
                    );
                    stats.failed += 1;
                    self.statistics.record_error(&id);
                }
                Ok(Err(CollectError::Adapter(e))) => {
                    warn!("Collector: '{id}' {kind} fetch failed: {e}");
                    stats.failed += 1;
                    self.statistics.record_error(&id);
                }
                Err(_) => {
                    warn!(
                        "Collector: '{id}' {kind} fetch exceeded round deadline ({round_deadline:?})"
                    );
                    stats.failed += 1;
                    self.statistics.record_error(&id);
                }
            }
        }

        stats.elapsed = started.elapsed();
        info!(
            "Collector: {kind} round {round_id} done, {}/{} exchanges in {:?} ({} cached)",
            stats.succeeded, stats.queried, stats.elapsed, stats.cached
        );

        Snapshot {
            kind,
            round_id,
            timestamp_ms: now_ms(),
            data,
            stats,
        }
    }
}
