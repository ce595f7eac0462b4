//! Core market-data types shared across the collector pipeline.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::errors::InvalidSymbol;

/// Short lowercase exchange identifier (`binance`, `bybit`, ...).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExchangeId(String);

impl ExchangeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ExchangeId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Canonical futures symbol `BASE/QUOTE[:SETTLE]`, e.g. `BTC/USDT:USDT`.
///
/// Adapters are responsible for producing the canonical form; nothing
/// downstream reconciles casing or separators.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(String);

impl Symbol {
    pub fn parse(s: &str) -> Result<Self, InvalidSymbol> {
        let upper = s.trim().to_uppercase();
        let (pair, settle) = match upper.split_once(':') {
            Some((pair, settle)) => (pair, Some(settle)),
            None => (upper.as_str(), None),
        };
        let Some((base, quote)) = pair.split_once('/') else {
            return Err(InvalidSymbol(s.to_string()));
        };
        if base.is_empty() || quote.is_empty() || settle.is_some_and(str::is_empty) {
            return Err(InvalidSymbol(s.to_string()));
        }
        Ok(Self(upper))
    }

    /// Canonical perpetual symbol from its parts.
    pub fn perpetual(base: &str, quote: &str, settle: &str) -> Self {
        Self(format!(
            "{}/{}:{}",
            base.to_uppercase(),
            quote.to_uppercase(),
            settle.to_uppercase()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Symbol {
    type Err = InvalidSymbol;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// The two data kinds the pipeline collects at independent cadences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataKind {
    Tickers,
    FundingRates,
}

impl DataKind {
    /// Wire name used in the `type` field and routing keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            DataKind::Tickers => "tickers",
            DataKind::FundingRates => "funding_rates",
        }
    }

    pub fn routing_key(&self) -> String {
        format!("snapshot.{}", self.as_str())
    }

    /// Batch priority: tickers move faster than funding rates.
    pub fn priority(&self) -> u8 {
        match self {
            DataKind::Tickers => 3,
            DataKind::FundingRates => 2,
        }
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-of-book snapshot for one (exchange, symbol).
///
/// A side missing upstream stays `None` and serializes as `null`; records
/// are never dropped for a missing side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub exchange: ExchangeId,
    pub symbol: Symbol,
    pub timestamp_ms: i64,
    pub bid: Option<Decimal>,
    pub ask: Option<Decimal>,
    pub last: Option<Decimal>,
    pub volume_24h: Option<Decimal>,
}

/// Funding snapshot for one (exchange, symbol). `funding_rate` is a signed
/// decimal fraction; values beyond ±0.01 are suspect but kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingRate {
    pub exchange: ExchangeId,
    pub symbol: Symbol,
    pub timestamp_ms: i64,
    pub funding_rate: Decimal,
    pub next_funding_time_ms: Option<i64>,
    pub mark_price: Option<Decimal>,
}

/// Per-round accounting attached to every snapshot.
#[derive(Debug, Clone, Default)]
pub struct CollectionStats {
    pub queried: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cached: usize,
    pub elapsed: Duration,
}

/// Immutable result of one collection round for one data kind.
///
/// Every configured exchange appears as a top-level key even when its fetch
/// failed or was skipped; failures surface as empty sub-maps plus a `failed`
/// count, never as a shape change.
#[derive(Debug, Clone)]
pub struct Snapshot<T> {
    pub kind: DataKind,
    pub round_id: Uuid,
    pub timestamp_ms: i64,
    pub data: BTreeMap<ExchangeId, BTreeMap<Symbol, T>>,
    pub stats: CollectionStats,
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_parse_canonicalizes_case() {
        let s = Symbol::parse("btc/usdt:usdt").unwrap();
        assert_eq!(s.as_str(), "BTC/USDT:USDT");
    }

    #[test]
    fn test_symbol_parse_without_settle() {
        let s = Symbol::parse("ETH/USD").unwrap();
        assert_eq!(s.as_str(), "ETH/USD");
    }

    #[test]
    fn test_symbol_parse_rejects_malformed() {
        assert!(Symbol::parse("BTCUSDT").is_err());
        assert!(Symbol::parse("/USDT").is_err());
        assert!(Symbol::parse("BTC/").is_err());
        assert!(Symbol::parse("BTC/USDT:").is_err());
    }

    #[test]
    fn test_exchange_id_lowercases() {
        assert_eq!(ExchangeId::new("Binance").as_str(), "binance");
    }

    #[test]
    fn test_kind_routing_key() {
        assert_eq!(DataKind::Tickers.routing_key(), "snapshot.tickers");
        assert_eq!(
            DataKind::FundingRates.routing_key(),
            "snapshot.funding_rates"
        );
    }
}
