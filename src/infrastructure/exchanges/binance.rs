//! Binance USDⓈ-M futures adapter.
//!
//! Market metadata comes from `exchangeInfo`; tickers merge the 24h stats
//! with the book-ticker top of book; funding rates come from `premiumIndex`.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::domain::errors::AdapterError;
use crate::domain::ports::ExchangeAdapter;
use crate::domain::types::{ExchangeId, FundingRate, Symbol, Ticker};
use crate::infrastructure::exchanges::client::{get_json, parse_decimal};

const MAINNET_URL: &str = "https://fapi.binance.com";
const TESTNET_URL: &str = "https://testnet.binancefuture.com";

pub struct BinanceAdapter {
    id: ExchangeId,
    client: reqwest::Client,
    base_url: String,
    /// Native symbol (`BTCUSDT`) to canonical (`BTC/USDT:USDT`).
    markets: RwLock<HashMap<String, Symbol>>,
}

impl BinanceAdapter {
    pub fn new(client: reqwest::Client, sandbox: bool) -> Self {
        let base_url = if sandbox { TESTNET_URL } else { MAINNET_URL };
        Self::with_base_url(client, base_url)
    }

    pub fn with_base_url(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            id: ExchangeId::new("binance"),
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
}

#[derive(Debug, Deserialize)]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
struct SymbolInfo {
    symbol: String,
    status: String,
    #[serde(rename = "contractType", default)]
    contract_type: String,
    #[serde(rename = "baseAsset")]
    base_asset: String,
    #[serde(rename = "quoteAsset")]
    quote_asset: String,
    #[serde(rename = "marginAsset")]
    margin_asset: String,
}

#[derive(Debug, Deserialize)]
struct BookTicker {
    symbol: String,
    #[serde(rename = "bidPrice")]
    bid_price: String,
    #[serde(rename = "askPrice")]
    ask_price: String,
}

#[derive(Debug, Deserialize)]
struct Daily24h {
    symbol: String,
    #[serde(rename = "lastPrice")]
    last_price: String,
    #[serde(rename = "volume")]
    volume: String,
    #[serde(rename = "closeTime")]
    close_time: i64,
}

#[derive(Debug, Deserialize)]
struct PremiumIndex {
    symbol: String,
    #[serde(rename = "markPrice")]
    mark_price: String,
    #[serde(rename = "lastFundingRate")]
    last_funding_rate: String,
    #[serde(rename = "nextFundingTime")]
    next_funding_time: i64,
    time: i64,
}

#[async_trait]
impl ExchangeAdapter for BinanceAdapter {
    fn id(&self) -> &ExchangeId {
        &self.id
    }

    async fn initialize(&self) -> Result<(), AdapterError> {
        let url = format!("{}/fapi/v1/exchangeInfo", self.base_url);
        let info: ExchangeInfo = get_json(&self.client, &url).await?;

        let mut markets = HashMap::new();
        for symbol in info.symbols {
            if symbol.status == "TRADING" && symbol.contract_type == "PERPETUAL" {
                markets.insert(
                    symbol.symbol.clone(),
                    Symbol::perpetual(&symbol.base_asset, &symbol.quote_asset, &symbol.margin_asset),
                );
            }
        }

        info!("BinanceAdapter: loaded {} perpetual markets", markets.len());
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

        let book_url = format!("{}/fapi/v1/ticker/bookTicker", self.base_url);
        let daily_url = format!("{}/fapi/v1/ticker/24hr", self.base_url);
        let book: Vec<BookTicker> = get_json(&self.client, &book_url).await?;
        let daily: Vec<Daily24h> = get_json(&self.client, &daily_url).await?;

        let book_by_native: HashMap<&str, &BookTicker> =
            book.iter().map(|b| (b.symbol.as_str(), b)).collect();
        let requested: Option<HashSet<&Symbol>> = symbols.map(|s| s.iter().collect());

        let markets = self.markets.read().await;
        let mut result = HashMap::new();
        for entry in &daily {
            let Some(canonical) = markets.get(&entry.symbol) else {
                continue;
            };
            if let Some(requested) = &requested {
                if !requested.contains(canonical) {
                    continue;
                }
            }
            let top = book_by_native.get(entry.symbol.as_str());
            result.insert(
                canonical.clone(),
                Ticker {
                    exchange: self.id.clone(),
                    symbol: canonical.clone(),
                    timestamp_ms: entry.close_time,
                    bid: top.and_then(|t| parse_decimal(&t.bid_price)),
                    ask: top.and_then(|t| parse_decimal(&t.ask_price)),
                    last: parse_decimal(&entry.last_price),
                    volume_24h: parse_decimal(&entry.volume),
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

        let url = format!("{}/fapi/v1/premiumIndex", self.base_url);
        let premiums: Vec<PremiumIndex> = get_json(&self.client, &url).await?;
        let requested: Option<HashSet<&Symbol>> = symbols.map(|s| s.iter().collect());

        let markets = self.markets.read().await;
        let mut result = HashMap::new();
        for entry in &premiums {
            let Some(canonical) = markets.get(&entry.symbol) else {
                continue;
            };
            if let Some(requested) = &requested {
                if !requested.contains(canonical) {
                    continue;
                }
            }
            let Some(rate) = parse_decimal(&entry.last_funding_rate) else {
                continue;
            };
            result.insert(
                canonical.clone(),
                FundingRate {
                    exchange: self.id.clone(),
                    symbol: canonical.clone(),
                    timestamp_ms: entry.time,
                    funding_rate: rate,
                    next_funding_time_ms: (entry.next_funding_time > 0)
                        .then_some(entry.next_funding_time),
                    mark_price: parse_decimal(&entry.mark_price),
                },
            );
        }
        Ok(result)
    }

    async fn probe(&self) -> bool {
        let url = format!("{}/fapi/v1/ping", self.base_url);
        get_json::<serde_json::Value>(&self.client, &url).await.is_ok()
    }

    async fn close(&self) {
        debug!("BinanceAdapter: closed");
    }
}
