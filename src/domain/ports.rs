use std::collections::HashMap;

use async_trait::async_trait;

use crate::domain::errors::{AdapterError, TransportError};
use crate::domain::types::{ExchangeId, FundingRate, Symbol, Ticker};

/// Contract a per-exchange client exposes to the resilience wrapper.
///
/// Implementations normalize vendor symbols to the canonical
/// `BASE/QUOTE:SETTLE` form and silently omit symbols the venue does not
/// list. All operations are idempotent from the caller's point of view.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    fn id(&self) -> &ExchangeId;

    /// Load market metadata. Safe to call more than once.
    async fn initialize(&self) -> Result<(), AdapterError>;

    /// Active perpetual markets. An empty list is legal, not an error.
    async fn list_futures_symbols(&self) -> Result<Vec<Symbol>, AdapterError>;

    /// `None` means "all known perpetual symbols for this exchange".
    async fn fetch_tickers(
        &self,
        symbols: Option<&[Symbol]>,
    ) -> Result<HashMap<Symbol, Ticker>, AdapterError>;

    /// Same symbol semantics as `fetch_tickers`. Venues that do not report
    /// funding return an empty map and flag it via `supports_funding`.
    async fn fetch_funding_rates(
        &self,
        symbols: Option<&[Symbol]>,
    ) -> Result<HashMap<Symbol, FundingRate>, AdapterError>;

    fn supports_funding(&self) -> bool {
        true
    }

    /// Cheap liveness call for the health monitor.
    async fn probe(&self) -> bool;

    /// Release network resources. Idempotent.
    async fn close(&self);
}

/// Outbound message-bus seam. The production implementation publishes to an
/// AMQP topic exchange; tests record in memory.
#[async_trait]
pub trait BusSink: Send + Sync {
    async fn publish(
        &self,
        routing_key: &str,
        body: Vec<u8>,
        correlation_id: Option<&str>,
    ) -> Result<(), TransportError>;
}
