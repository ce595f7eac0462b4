use serde::Serialize;
use thiserror::Error;

use crate::domain::types::ExchangeId;

#[derive(Debug, Error)]
#[error("invalid symbol '{0}': expected BASE/QUOTE[:SETTLE]")]
pub struct InvalidSymbol(pub String);

/// Failure taxonomy adapters report to the resilience wrapper.
///
/// The wrapper keys retry decisions off this: `Auth`, `SymbolUnknown` and
/// `VendorPermanent` abort the retry loop, everything else is retryable.
#[derive(Debug, Clone, Error)]
pub enum AdapterError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("rate limited (retry after {retry_after_s:?}s)")]
    RateLimit { retry_after_s: Option<u64> },

    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("unknown symbol: {0}")]
    SymbolUnknown(String),

    #[error("exchange temporarily unavailable: {0}")]
    VendorTemporary(String),

    #[error("exchange rejected request: {0}")]
    VendorPermanent(String),

    #[error("{0}")]
    Other(String),
}

impl AdapterError {
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            AdapterError::Auth(_) | AdapterError::SymbolUnknown(_) | AdapterError::VendorPermanent(_)
        )
    }
}

/// What a fetch through the resilience wrapper can come back with.
#[derive(Debug, Clone, Error)]
pub enum CollectError {
    #[error("circuit breaker open for '{exchange}', retry in {retry_in_ms}ms")]
    CircuitOpen {
        exchange: ExchangeId,
        retry_in_ms: u64,
    },

    #[error(transparent)]
    Adapter(#[from] AdapterError),
}

/// Message-bus transport failures.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("broker unreachable: {0}")]
    Connection(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("broker did not confirm delivery")]
    Unconfirmed,
}

/// Closed set of error codes carried in control-plane responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlErrorCode {
    InvalidJson,
    InvalidCommand,
    DuplicateSymbol,
    SymbolNotFound,
    UnknownCommand,
    InternalError,
}

impl ControlErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlErrorCode::InvalidJson => "invalid_json",
            ControlErrorCode::InvalidCommand => "invalid_command",
            ControlErrorCode::DuplicateSymbol => "duplicate_symbol",
            ControlErrorCode::SymbolNotFound => "symbol_not_found",
            ControlErrorCode::UnknownCommand => "unknown_command",
            ControlErrorCode::InternalError => "internal_error",
        }
    }
}
