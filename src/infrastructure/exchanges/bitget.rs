//! Bitget USDT-margined futures adapter (v2 mix market API).

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::domain::errors::AdapterError;
use crate::domain::ports::ExchangeAdapter;
use crate::domain::types::{ExchangeId, FundingRate, Symbol, Ticker};
use crate::infrastructure::exchanges::client::{get_json, parse_decimal, parse_millis};

const BASE_URL: &str = "https://api.bitget.com";
const PRODUCT_TYPE: &str = "usdt-futures";

pub struct BitgetAdapter {
    id: ExchangeId,
    client: reqwest::Client,
    base_url: String,
    markets: RwLock<HashMap<String, Symbol>>,
}

#[derive(Debug, Deserialize)]
#[serde(bound = "T: DeserializeOwned")]
struct Envelope<T> {
    code: String,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct Contract {
    symbol: String,
    #[serde(rename = "baseCoin")]
    base_coin: String,
    #[serde(rename = "quoteCoin")]
    quote_coin: String,
    #[serde(rename = "symbolStatus", default)]
    symbol_status: String,
}

#[derive(Debug, Deserialize)]
struct TickerEntry {
    symbol: String,
    #[serde(rename = "lastPr", default)]
    last_price: String,
    #[serde(rename = "bidPr", default)]
    bid_price: String,
    #[serde(rename = "askPr", default)]
    ask_price: String,
    #[serde(rename = "baseVolume", default)]
    base_volume: String,
    #[serde(rename = "fundingRate", default)]
    funding_rate: String,
    #[serde(rename = "deliveryTime", default)]
    delivery_time: String,
    #[serde(default)]
    ts: String,
}

impl BitgetAdapter {
    pub fn new(client: reqwest::Client) -> Self {
        Self::with_base_url(client, BASE_URL)
    }

    pub fn with_base_url(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            id: ExchangeId::new("bitget"),
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

    async fn get_data<T: DeserializeOwned>(&self, url: &str) -> Result<T, AdapterError> {
        let envelope: Envelope<T> = get_json(&self.client, url).await?;
        if envelope.code != "00000" {
            return Err(match envelope.code.as_str() {
                "429" | "30007" => AdapterError::RateLimit { retry_after_s: None },
                "40037" | "40012" => AdapterError::Auth(envelope.msg),
                _ => AdapterError::VendorTemporary(format!(
                    "code {}: {}",
                    envelope.code, envelope.msg
                )),
            });
        }
        envelope
            .data
            .ok_or_else(|| AdapterError::Other("bitget envelope without data".into()))
    }

    async fn fetch_ticker_entries(&self) -> Result<Vec<TickerEntry>, AdapterError> {
        let url = format!(
            "{}/api/v2/mix/market/tickers?productType={}",
            self.base_url, PRODUCT_TYPE
        );
        self.get_data(&url).await
    }
}

#[async_trait]
impl ExchangeAdapter for BitgetAdapter {
    fn id(&self) -> &ExchangeId {
        &self.id
    }

    async fn initialize(&self) -> Result<(), AdapterError> {
        let url = format!(
            "{}/api/v2/mix/market/contracts?productType={}",
            self.base_url, PRODUCT_TYPE
        );
        let contracts: Vec<Contract> = self.get_data(&url).await?;

        let mut markets = HashMap::new();
        for contract in contracts {
            if contract.symbol_status == "normal" {
                markets.insert(
                    contract.symbol.clone(),
                    Symbol::perpetual(&contract.base_coin, &contract.quote_coin, "USDT"),
                );
            }
        }

        info!("BitgetAdapter: loaded {} perpetual markets", markets.len());
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
        let entries = self.fetch_ticker_entries().await?;
        let requested: Option<HashSet<&Symbol>> = symbols.map(|s| s.iter().collect());

        let markets = self.markets.read().await;
        let mut result = HashMap::new();
        for entry in &entries {
            let Some(canonical) = markets.get(&entry.symbol) else {
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
                    timestamp_ms: parse_millis(&entry.ts).unwrap_or_else(crate::domain::types::now_ms),
                    bid: parse_decimal(&entry.bid_price),
                    ask: parse_decimal(&entry.ask_price),
                    last: parse_decimal(&entry.last_price),
                    volume_24h: parse_decimal(&entry.base_volume),
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
        let entries = self.fetch_ticker_entries().await?;
        let requested: Option<HashSet<&Symbol>> = symbols.map(|s| s.iter().collect());

        let markets = self.markets.read().await;
        let mut result = HashMap::new();
        for entry in &entries {
            let Some(canonical) = markets.get(&entry.symbol) else {
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
                    timestamp_ms: parse_millis(&entry.ts).unwrap_or_else(crate::domain::types::now_ms),
                    funding_rate: rate,
                    next_funding_time_ms: parse_millis(&entry.delivery_time),
                    mark_price: None,
                },
            );
        }
        Ok(result)
    }

    async fn probe(&self) -> bool {
        let url = format!("{}/api/v2/public/time", self.base_url);
        self.get_data::<serde_json::Value>(&url).await.is_ok()
    }

    async fn close(&self) {
        debug!("BitgetAdapter: closed");
    }
}
