//! Bybit linear perpetuals adapter (v5 market API).
//!
//! The v5 tickers payload carries both top-of-book prices and funding
//! fields, so tickers and funding rates share one endpoint.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::domain::errors::AdapterError;
use crate::domain::ports::ExchangeAdapter;
use crate::domain::types::{ExchangeId, FundingRate, Symbol, Ticker, now_ms};
use crate::infrastructure::exchanges::client::{get_json, parse_decimal, parse_millis};

const MAINNET_URL: &str = "https://api.bybit.com";
const TESTNET_URL: &str = "https://api-testnet.bybit.com";

pub struct BybitAdapter {
    id: ExchangeId,
    client: reqwest::Client,
    base_url: String,
    markets: RwLock<HashMap<String, Symbol>>,
}

#[derive(Debug, Deserialize)]
#[serde(bound = "T: DeserializeOwned")]
struct Envelope<T> {
    #[serde(rename = "retCode")]
    ret_code: i64,
    #[serde(rename = "retMsg", default)]
    ret_msg: String,
    #[serde(default)]
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct InstrumentPage {
    #[serde(default)]
    list: Vec<Instrument>,
    #[serde(rename = "nextPageCursor", default)]
    next_page_cursor: String,
}

#[derive(Debug, Deserialize)]
struct Instrument {
    symbol: String,
    #[serde(rename = "contractType", default)]
    contract_type: String,
    #[serde(default)]
    status: String,
    #[serde(rename = "baseCoin")]
    base_coin: String,
    #[serde(rename = "quoteCoin")]
    quote_coin: String,
    #[serde(rename = "settleCoin")]
    settle_coin: String,
}

#[derive(Debug, Deserialize)]
struct TickerPage {
    #[serde(default)]
    list: Vec<TickerEntry>,
}

#[derive(Debug, Deserialize)]
struct TickerEntry {
    symbol: String,
    #[serde(rename = "bid1Price", default)]
    bid1_price: String,
    #[serde(rename = "ask1Price", default)]
    ask1_price: String,
    #[serde(rename = "lastPrice", default)]
    last_price: String,
    #[serde(rename = "volume24h", default)]
    volume_24h: String,
    #[serde(rename = "fundingRate", default)]
    funding_rate: String,
    #[serde(rename = "nextFundingTime", default)]
    next_funding_time: String,
    #[serde(rename = "markPrice", default)]
    mark_price: String,
}

impl BybitAdapter {
    pub fn new(client: reqwest::Client, sandbox: bool) -> Self {
        let base_url = if sandbox { TESTNET_URL } else { MAINNET_URL };
        Self::with_base_url(client, base_url)
    }

    pub fn with_base_url(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            id: ExchangeId::new("bybit"),
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

    /// Unwraps the `{retCode, retMsg, result}` envelope every v5 endpoint
    /// uses. A non-zero retCode on a public endpoint is a vendor-side
    /// rejection, not a transport failure.
    async fn get_result<T: DeserializeOwned>(&self, url: &str) -> Result<T, AdapterError> {
        let envelope: Envelope<T> = get_json(&self.client, url).await?;
        if envelope.ret_code != 0 {
            return Err(match envelope.ret_code {
                10006 | 10018 => AdapterError::RateLimit { retry_after_s: None },
                10003 | 10004 | 10005 => AdapterError::Auth(envelope.ret_msg),
                _ => AdapterError::VendorTemporary(format!(
                    "retCode {}: {}",
                    envelope.ret_code, envelope.ret_msg
                )),
            });
        }
        envelope
            .result
            .ok_or_else(|| AdapterError::Other("bybit envelope without result".into()))
    }

    async fn fetch_ticker_entries(&self) -> Result<Vec<TickerEntry>, AdapterError> {
        let url = format!("{}/v5/market/tickers?category=linear", self.base_url);
        let page: TickerPage = self.get_result(&url).await?;
        Ok(page.list)
    }
}

#[async_trait]
impl ExchangeAdapter for BybitAdapter {
    fn id(&self) -> &ExchangeId {
        &self.id
    }

    async fn initialize(&self) -> Result<(), AdapterError> {
        let mut markets = HashMap::new();
        let mut cursor = String::new();

        loop {
            let url = if cursor.is_empty() {
                format!(
                    "{}/v5/market/instruments-info?category=linear&limit=1000",
                    self.base_url
                )
            } else {
                format!(
                    "{}/v5/market/instruments-info?category=linear&limit=1000&cursor={}",
                    self.base_url, cursor
                )
            };
            let page: InstrumentPage = self.get_result(&url).await?;

            for instrument in page.list {
                if instrument.status == "Trading"
                    && instrument.contract_type == "LinearPerpetual"
                {
                    markets.insert(
                        instrument.symbol.clone(),
                        Symbol::perpetual(
                            &instrument.base_coin,
                            &instrument.quote_coin,
                            &instrument.settle_coin,
                        ),
                    );
                }
            }

            if page.next_page_cursor.is_empty() {
                break;
            }
            cursor = page.next_page_cursor;
        }

        info!("BybitAdapter: loaded {} perpetual markets", markets.len());
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
        let timestamp_ms = now_ms();

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
                    timestamp_ms,
                    bid: parse_decimal(&entry.bid1_price),
                    ask: parse_decimal(&entry.ask1_price),
                    last: parse_decimal(&entry.last_price),
                    volume_24h: parse_decimal(&entry.volume_24h),
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
        let timestamp_ms = now_ms();

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
                    timestamp_ms,
                    funding_rate: rate,
                    next_funding_time_ms: parse_millis(&entry.next_funding_time),
                    mark_price: parse_decimal(&entry.mark_price),
                },
            );
        }
        Ok(result)
    }

    async fn probe(&self) -> bool {
        let url = format!("{}/v5/market/time", self.base_url);
        self.get_result::<serde_json::Value>(&url).await.is_ok()
    }

    async fn close(&self) {
        debug!("BybitAdapter: closed");
    }
}
