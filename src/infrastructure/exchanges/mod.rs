//! Vendor adapters for the supported futures venues.
//!
//! Each adapter speaks the venue's public market-data API, owns the native
//! symbol mapping, and normalizes everything to `BASE/QUOTE:SETTLE`.

mod binance;
mod bitget;
mod bybit;
mod client;
mod gateio;
mod htx;

pub use binance::BinanceAdapter;
pub use bitget::BitgetAdapter;
pub use bybit::BybitAdapter;
pub use gateio::GateioAdapter;
pub use htx::HtxAdapter;

use std::sync::Arc;

use crate::config::ExchangeConfig;
use crate::domain::ports::ExchangeAdapter;

const KNOWN: &[&str] = &["binance", "bybit", "bitget", "htx", "gateio"];

pub fn is_known(name: &str) -> bool {
    KNOWN.contains(&name.to_lowercase().as_str())
}

pub fn known_exchanges() -> Vec<&'static str> {
    KNOWN.to_vec()
}

/// Config-time registry: exchange id to adapter.
pub fn build_adapter(
    name: &str,
    config: &ExchangeConfig,
    http: reqwest::Client,
) -> anyhow::Result<Arc<dyn ExchangeAdapter>> {
    match name.to_lowercase().as_str() {
        "binance" => Ok(Arc::new(BinanceAdapter::new(http, config.sandbox))),
        "bybit" => Ok(Arc::new(BybitAdapter::new(http, config.sandbox))),
        "bitget" => Ok(Arc::new(BitgetAdapter::new(http))),
        "htx" => Ok(Arc::new(HtxAdapter::new(http))),
        "gateio" => Ok(Arc::new(GateioAdapter::new(http, config.sandbox))),
        other => anyhow::bail!(
            "unknown exchange '{other}' (known: {})",
            KNOWN.join(", ")
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_knows_all_supported_venues() {
        for name in KNOWN {
            assert!(is_known(name));
            assert!(build_adapter(name, &ExchangeConfig::default(), reqwest::Client::new()).is_ok());
        }
        assert!(!is_known("mtgox"));
        assert!(build_adapter("mtgox", &ExchangeConfig::default(), reqwest::Client::new()).is_err());
    }

    #[test]
    fn test_is_known_ignores_case() {
        assert!(is_known("Binance"));
    }
}
