//! HTX (Huobi) USDT-margined swap adapter.
//!
//! The swap API mixes quoted and bare numbers, so price fields go through a
//! tolerant wrapper before becoming decimals.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::domain::errors::AdapterError;
use crate::domain::ports::ExchangeAdapter;
use crate::domain::types::{ExchangeId, FundingRate, Symbol, Ticker, now_ms};
use crate::infrastructure::exchanges::client::{get_json, parse_decimal, parse_millis};

const BASE_URL: &str = "https://api.hbdm.com";

pub struct HtxAdapter {
    id: ExchangeId,
    client: reqwest::Client,
    base_url: String,
    markets: RwLock<HashMap<String, Symbol>>,
}

/// A number HTX may send either bare or quoted.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Num {
    Float(f64),
    Text(String),
}

impl Num {
    fn to_decimal(&self) -> Option<Decimal> {
        match self {
            Num::Float(f) => Decimal::try_from(*f).ok(),
            Num::Text(s) => parse_decimal(s),
        }
    }
}

#[derive(Debug, Deserialize)]
struct StatusEnvelope<T> {
    status: String,
    #[serde(default)]
    err_code: Option<serde_json::Value>,
    #[serde(default)]
    err_msg: Option<String>,
    #[serde(default)]
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ContractInfo {
    contract_code: String,
    contract_status: i32,
}

#[derive(Debug, Deserialize)]
struct BatchMerged {
    status: String,
    #[serde(default)]
    ticks: Vec<MergedTick>,
}

#[derive(Debug, Deserialize)]
struct MergedTick {
    contract_code: String,
    #[serde(default)]
    close: Option<Num>,
    #[serde(default)]
    amount: Option<Num>,
    /// `[price, amount]` pair.
    #[serde(default)]
    bid: Option<Vec<Num>>,
    #[serde(default)]
    ask: Option<Vec<Num>>,
    #[serde(default)]
    ts: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct FundingEntry {
    contract_code: String,
    #[serde(default)]
    funding_rate: String,
    #[serde(default)]
    next_funding_time: String,
}

impl HtxAdapter {
    pub fn new(client: reqwest::Client) -> Self {
        Self::with_base_url(client, BASE_URL)
    }

    pub fn with_base_url(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            id: ExchangeId::new("htx"),
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

    fn canonical_from_code(code: &str) -> Option<Symbol> {
        let (base, quote) = code.split_once('-')?;
        Some(Symbol::perpetual(base, quote, quote))
    }

    fn check_status<T>(envelope: StatusEnvelope<T>) -> Result<T, AdapterError> {
        if envelope.status != "ok" {
            let code = envelope
                .err_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "?".to_string());
            let msg = envelope.err_msg.unwrap_or_default();
            return Err(AdapterError::VendorTemporary(format!(
                "err_code {code}: {msg}"
            )));
        }
        envelope
            .data
            .ok_or_else(|| AdapterError::Other("htx envelope without data".into()))
    }

    fn top_of_book(side: &Option<Vec<Num>>) -> Option<Decimal> {
        side.as_ref().and_then(|pair| pair.first()).and_then(Num::to_decimal)
    }
}

#[async_trait]
impl ExchangeAdapter for HtxAdapter {
    fn id(&self) -> &ExchangeId {
        &self.id
    }

    async fn initialize(&self) -> Result<(), AdapterError> {
        let url = format!("{}/linear-swap-api/v1/swap_contract_info", self.base_url);
        let envelope: StatusEnvelope<Vec<ContractInfo>> = get_json(&self.client, &url).await?;
        let contracts = Self::check_status(envelope)?;

        let mut markets = HashMap::new();
        for contract in contracts {
            if contract.contract_status == 1 {
                if let Some(canonical) = Self::canonical_from_code(&contract.contract_code) {
                    markets.insert(contract.contract_code.clone(), canonical);
                }
            }
        }

        info!("HtxAdapter: loaded {} perpetual markets", markets.len());
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

        let url = format!(
            "{}/linear-swap-ex/market/detail/batch_merged",
            self.base_url
        );
        let batch: BatchMerged = get_json(&self.client, &url).await?;
        if batch.status != "ok" {
            return Err(AdapterError::VendorTemporary(
                "htx batch_merged returned error status".into(),
            ));
        }

        let requested: Option<HashSet<&Symbol>> = symbols.map(|s| s.iter().collect());
        let markets = self.markets.read().await;
        let mut result = HashMap::new();
        for tick in &batch.ticks {
            let Some(canonical) = markets.get(&tick.contract_code) else {
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
                    timestamp_ms: tick.ts.unwrap_or_else(now_ms),
                    bid: Self::top_of_book(&tick.bid),
                    ask: Self::top_of_book(&tick.ask),
                    last: tick.close.as_ref().and_then(Num::to_decimal),
                    volume_24h: tick.amount.as_ref().and_then(Num::to_decimal),
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

        let url = format!(
            "{}/linear-swap-api/v1/swap_batch_funding_rate",
            self.base_url
        );
        let envelope: StatusEnvelope<Vec<FundingEntry>> = get_json(&self.client, &url).await?;
        let entries = Self::check_status(envelope)?;

        let requested: Option<HashSet<&Symbol>> = symbols.map(|s| s.iter().collect());
        let timestamp_ms = now_ms();
        let markets = self.markets.read().await;
        let mut result = HashMap::new();
        for entry in &entries {
            let Some(canonical) = markets.get(&entry.contract_code) else {
                continue;
            };
            if let Some(requested) = &requested {
                if !requested.contains(canonical) {
                    continue;
                }
            }
            let Some(rate) = parse_decimal(&entry.funding_rate) else {
                continue;
            };
            result.insert(
                canonical.clone(),
                FundingRate {
                    exchange: self.id.clone(),
                    symbol: canonical.clone(),
                    timestamp_ms,
                    funding_rate: rate,
                    next_funding_time_ms: parse_millis(&entry.next_funding_time),
                    mark_price: None,
                },
            );
        }
        Ok(result)
    }

    async fn probe(&self) -> bool {
        let url = format!("{}/api/v1/timestamp", self.base_url);
        get_json::<serde_json::Value>(&self.client, &url).await.is_ok()
    }

    async fn close(&self) {
        debug!("HtxAdapter: closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_from_contract_code() {
        assert_eq!(
            HtxAdapter::canonical_from_code("BTC-USDT").unwrap().as_str(),
            "BTC/USDT:USDT"
        );
        assert!(HtxAdapter::canonical_from_code("BTCUSDT").is_none());
    }
}
