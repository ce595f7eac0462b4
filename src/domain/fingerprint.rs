//! Content fingerprints for change detection.
//!
//! A fingerprint is the first 128 bits of a SHA-256 over snapshot data in a
//! canonical order: exchanges sorted, symbols sorted, and only the semantic
//! fields of each record. Timestamps are deliberately excluded so an
//! unchanged market produces an unchanged digest even when the venue bumps
//! its tick time.

use std::collections::BTreeMap;
use std::fmt;

use rust_decimal::Decimal;
use sha2::{Digest, Sha256};

use crate::domain::types::{ExchangeId, FundingRate, Symbol, Ticker};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(u128);

impl Fingerprint {
    pub fn as_u128(&self) -> u128 {
        self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0.to_be_bytes())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Contribution of one record's semantic fields to the digest.
pub trait ContentDigest {
    fn digest_content(&self, hasher: &mut Sha256);
}

fn put_opt_decimal(hasher: &mut Sha256, value: Option<Decimal>) {
    match value {
        // normalize() strips trailing zeros so 50000 and 50000.0 agree
        Some(d) => hasher.update(d.normalize().to_string().as_bytes()),
        None => hasher.update(b"~"),
    }
    hasher.update([0x1f]);
}

fn put_opt_i64(hasher: &mut Sha256, value: Option<i64>) {
    match value {
        Some(v) => hasher.update(v.to_be_bytes()),
        None => hasher.update(b"~"),
    }
    hasher.update([0x1f]);
}

impl ContentDigest for Ticker {
    fn digest_content(&self, hasher: &mut Sha256) {
        put_opt_decimal(hasher, self.bid);
        put_opt_decimal(hasher, self.ask);
        put_opt_decimal(hasher, self.last);
        put_opt_decimal(hasher, self.volume_24h);
    }
}

impl ContentDigest for FundingRate {
    fn digest_content(&self, hasher: &mut Sha256) {
        put_opt_decimal(hasher, Some(self.funding_rate));
        put_opt_i64(hasher, self.next_funding_time_ms);
        put_opt_decimal(hasher, self.mark_price);
    }
}

fn finish(hasher: Sha256) -> Fingerprint {
    let digest = hasher.finalize();
    let mut first = [0u8; 16];
    first.copy_from_slice(&digest[..16]);
    Fingerprint(u128::from_be_bytes(first))
}

/// Digest of a full snapshot payload. `BTreeMap` iteration makes the order
/// independent of how the maps were filled.
pub fn fingerprint_data<T: ContentDigest>(
    data: &BTreeMap<ExchangeId, BTreeMap<Symbol, T>>,
) -> Fingerprint {
    let mut hasher = Sha256::new();
    for (exchange, records) in data {
        hasher.update(exchange.as_str().as_bytes());
        hasher.update([0x1e]);
        for (symbol, record) in records {
            hasher.update(symbol.as_str().as_bytes());
            hasher.update([0x1d]);
            record.digest_content(&mut hasher);
        }
    }
    finish(hasher)
}

/// Digest of a symbol universe, used as part of cache keys. Insensitive to
/// the order the caller holds the symbols in.
pub fn fingerprint_symbols(symbols: &[Symbol]) -> Fingerprint {
    let mut sorted: Vec<&Symbol> = symbols.iter().collect();
    sorted.sort();
    let mut hasher = Sha256::new();
    for symbol in sorted {
        hasher.update(symbol.as_str().as_bytes());
        hasher.update([0x1e]);
    }
    finish(hasher)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn ticker(exchange: &str, symbol: &str, bid: Decimal) -> Ticker {
        Ticker {
            exchange: ExchangeId::new(exchange),
            symbol: Symbol::parse(symbol).unwrap(),
            timestamp_ms: 0,
            bid: Some(bid),
            ask: Some(bid + dec!(1)),
            last: Some(bid),
            volume_24h: None,
        }
    }

    fn build(entries: &[(&str, &str, Decimal)]) -> BTreeMap<ExchangeId, BTreeMap<Symbol, Ticker>> {
        let mut data: BTreeMap<ExchangeId, BTreeMap<Symbol, Ticker>> = BTreeMap::new();
        for (exchange, symbol, bid) in entries {
            data.entry(ExchangeId::new(*exchange)).or_default().insert(
                Symbol::parse(symbol).unwrap(),
                ticker(exchange, symbol, *bid),
            );
        }
        data
    }

    #[test]
    fn test_insertion_order_does_not_matter() {
        let a = build(&[
            ("binance", "BTC/USDT:USDT", dec!(50000)),
            ("bybit", "ETH/USDT:USDT", dec!(3000)),
        ]);
        let b = build(&[
            ("bybit", "ETH/USDT:USDT", dec!(3000)),
            ("binance", "BTC/USDT:USDT", dec!(50000)),
        ]);
        assert_eq!(fingerprint_data(&a), fingerprint_data(&b));
    }

    #[test]
    fn test_value_change_changes_fingerprint() {
        let a = build(&[("binance", "BTC/USDT:USDT", dec!(50000))]);
        let b = build(&[("binance", "BTC/USDT:USDT", dec!(50001))]);
        assert_ne!(fingerprint_data(&a), fingerprint_data(&b));
    }

    #[test]
    fn test_timestamp_does_not_affect_fingerprint() {
        let a = build(&[("binance", "BTC/USDT:USDT", dec!(50000))]);
        let mut b = a.clone();
        for records in b.values_mut() {
            for record in records.values_mut() {
                record.timestamp_ms = 999_999;
            }
        }
        assert_eq!(fingerprint_data(&a), fingerprint_data(&b));
    }

    #[test]
    fn test_trailing_zeros_are_normalized() {
        let a = build(&[("binance", "BTC/USDT:USDT", dec!(50000))]);
        let b = build(&[("binance", "BTC/USDT:USDT", dec!(50000.0))]);
        assert_eq!(fingerprint_data(&a), fingerprint_data(&b));
    }

    #[test]
    fn test_symbol_fingerprint_order_insensitive() {
        let x = [
            Symbol::parse("BTC/USDT:USDT").unwrap(),
            Symbol::parse("ETH/USDT:USDT").unwrap(),
        ];
        let y = [x[1].clone(), x[0].clone()];
        assert_eq!(fingerprint_symbols(&x), fingerprint_symbols(&y));
        assert_ne!(fingerprint_symbols(&x), fingerprint_symbols(&x[..1]));
    }

    proptest! {
        #[test]
        fn prop_fingerprint_is_permutation_invariant(
            entries in proptest::collection::vec(
                ("[a-z]{3,8}", "[A-Z]{2,5}", 0i64..1_000_000),
                1..20,
            )
        ) {
            let triples: Vec<(String, String, Decimal)> = entries
                .iter()
                .map(|(ex, base, cents)| {
                    (
                        ex.clone(),
                        format!("{base}/USDT:USDT"),
                        Decimal::new(*cents, 2),
                    )
                })
                .collect();
            let forward: Vec<(&str, &str, Decimal)> = triples
                .iter()
                .map(|(e, s, d)| (e.as_str(), s.as_str(), *d))
                .collect();
            let reference = build(&forward);

            // rebuild from the deduplicated entries in reverse order, so
            // both maps hold identical content inserted differently
            let mut flattened: Vec<(&str, &str, Decimal)> = reference
                .iter()
                .flat_map(|(exchange, records)| {
                    records.iter().map(move |(symbol, ticker)| {
                        (exchange.as_str(), symbol.as_str(), ticker.bid.unwrap())
                    })
                })
                .collect();
            flattened.reverse();
            let reordered = build(&flattened);

            prop_assert_eq!(
                fingerprint_data(&reference),
                fingerprint_data(&reordered)
            );
        }
    }
}
