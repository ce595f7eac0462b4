//! Gate.io USDT-settled perpetuals adapter (v4 futures API).
//!
//! Tickers come from the tickers endpoint; funding rates ride on the
//! contract listing, which carries the rate and its next apply time.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::domain::errors::AdapterError;
use crate::domain::ports::ExchangeAdapter;
use crate::domain::types::{ExchangeId, FundingRate, Symbol, Ticker, now_ms};
use crate::infrastructure::exchanges::client::{get_json, parse_decimal};

const MAINNET_URL: &str = "https://api.gateio.ws";
const TESTNET_URL: &str = "https://fx-api-testnet.gateio.ws";

pub struct GateioAdapter {
    id: ExchangeId,
    client: reqwest::Client,
    base_url: String,
    markets: RwLock<HashMap<String, Symbol>>,
}

#[derive(Debug, Deserialize)]
struct Contract {
    name: String,
    #[serde(default)]
    in_delisting: bool,
    #[serde(default)]
    funding_rate: Option<String>,
    /// Unix seconds of the next funding application.
    #[serde(default)]
    funding_next_apply: Option<i64>,
    #[serde(default)]
    mark_price: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TickerEntry {
    contract: String,
    #[serde(default)]
    last: String,
    #[serde(default)]
    lowest_ask: String,
    #[serde(default)]
    highest_bid: String,
    #[serde(default)]
    volume_24h_base: String,
}

impl GateioAdapter {
    pub fn new(client: reqwest::Client, sandbox: bool) -> Self {
        let base_url = if sandbox { TESTNET_URL } else { MAINNET_URL };
        Self::with_base_url(client, base_url)
    }

    pub fn with_base_url(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            id: ExchangeId::new("gateio"),
            client,
            base_url: base_url.into(),
            markets: RwLock::new(HashMap::new()),
        }
    }

    async fn ensure_markets(&self) -> Result<(), AdapterError> {
        if self.markets.read().await.is_empty() {
            self.initialize().await?;
        }
        Ok(())
    }

    fn canonical_from_name(name: &str) -> Option<Symbol> {
        let (base, quote) = name.split_once('_')?;
        Some(Symbol::perpetual(base, quote, quote))
    }

    async fn fetch_contracts(&self) -> Result<Vec<Contract>, AdapterError> {
        let url = format!("{}/api/v4/futures/usdt/contracts", self.base_url);
        get_json(&self.client, &url).await
    }
}

#[async_trait]
impl ExchangeAdapter for GateioAdapter {
    fn id(&self) -> &ExchangeId {
        &self.id
    }

    async fn initialize(&self) -> Result<(), AdapterError> {
        let contracts = self.fetch_contracts().await?;

        let mut markets = HashMap::new();
        for contract in contracts {
            if !contract.in_delisting {
                if let Some(canonical) = Self::canonical_from_name(&contract.name) {
                    markets.insert(contract.name.clone(), canonical);
                }
            }
        }

        info!("GateioAdapter: loaded {} perpetual markets", markets.len());
        *self.markets.write().await = markets;
        Ok(())
    }

    async fn list_futures_symbols(&self) -> Result<Vec<Symbol>, AdapterError> {
        self.ensure_markets().await?;
        Ok(self.markets.read().await.values().cloned().collect())
    }

    async fn fetch_tickers(
        &self,
        symbols: Option<&[Symbol]>,
    ) -> Result<HashMap<Symbol, Ticker>, AdapterError> {
        self.ensure_markets().await?;

        let url = format!("{}/api/v4/futures/usdt/tickers", self.base_url);
        let entries: Vec<TickerEntry> = get_json(&self.client, &url).await?;
        let requested: Option<HashSet<&Symbol>> = symbols.map(|s| s.iter().collect());
        let timestamp_ms = now_ms();

        let markets = self.markets.read().await;
        let mut result = HashMap::new();
        for entry in &entries {
            let Some(canonical) = markets.get(&entry.contract) else {
                continue;
            };
            if let Some(requested) = &requested {
                if !requested.contains(canonical) {
                    continue;
                }
            }
            result.insert(
                canonical.clone(),
                Ticker {
                    exchange: self.id.clone(),
                    symbol: canonical.clone(),
                    timestamp_ms,
                    bid: parse_decimal(&entry.highest_bid),
                    ask: parse_decimal(&entry.lowest_ask),
                    last: parse_decimal(&entry.last),
                    volume_24h: parse_decimal(&entry.volume_24h_base),
                },
            );
        }
        Ok(result)
    }

    async fn fetch_funding_rates(
        &self,
        symbols: Option<&[Symbol]>,
    ) -> Result<HashMap<Symbol, FundingRate>, AdapterError> {
        self.ensure_markets().await?;

        let contracts = self.fetch_contracts().await?;
        let requested: Option<HashSet<&Symbol>> = symbols.map(|s| s.iter().collect());
        let timestamp_ms = now_ms();

        let markets = self.markets.read().await;
        let mut result = HashMap::new();
        for contract in &contracts {
            let Some(canonical) = markets.get(&contract.name) else {
                continue;
            };
            if let Some(requested) = &requested {
                if !requested.contains(canonical) {
                    continue;
                }
            }
            let Some(rate) = contract
                .funding_rate
                .as_deref()
                .and_then(parse_decimal)
            else {
                continue;
            };
            result.insert(
                canonical.clone(),
                FundingRate {
                    exchange: self.id.clone(),
                    symbol: canonical.clone(),
                    timestamp_ms,
                    funding_rate: rate,
                    next_funding_time_ms: contract
                        .funding_next_apply
                        .filter(|s| *s > 0)
                        .map(|s| s * 1000),
                    mark_price: contract.mark_price.as_deref().and_then(parse_decimal),
                },
            );
        }
        Ok(result)
    }

    async fn probe(&self) -> bool {
        let url = format!("{}/api/v4/spot/time", self.base_url);
        get_json::<serde_json::Value>(&self.client, &url).await.is_ok()
    }

    async fn close(&self) {
        debug!("GateioAdapter: closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_from_contract_name() {
        assert_eq!(
            GateioAdapter::canonical_from_name("BTC_USDT").unwrap().as_str(),
            "BTC/USDT:USDT"
        );
        assert!(GateioAdapter::canonical_from_name("BTCUSDT").is_none());
    }
}
