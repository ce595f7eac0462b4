//! Shared HTTP plumbing for the vendor adapters: one GET helper plus the
//! mapping from transport/status failures onto the adapter error taxonomy.

use std::str::FromStr;
use std::time::Instant;

use reqwest::StatusCode;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;

use crate::domain::errors::AdapterError;

pub(crate) async fn get_json<T: DeserializeOwned>(
    client: &reqwest::Client,
    url: &str,
) -> Result<T, AdapterError> {
    let started = Instant::now();

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            AdapterError::Timeout {
                elapsed_ms: started.elapsed().as_millis() as u64,
            }
        } else if e.is_connect() {
            AdapterError::Network(format!("connect to {url} failed: {e}"))
        } else {
            AdapterError::Network(e.to_string())
        }
    })?;

    let status = response.status();
    if !status.is_success() {
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let body = response.text().await.unwrap_or_default();
        return Err(classify_status(status, retry_after, &body));
    }

    response
        .json::<T>()
        .await
        .map_err(|e| AdapterError::Other(format!("malformed response from {url}: {e}")))
}

pub(crate) fn classify_status(
    status: StatusCode,
    retry_after_s: Option<u64>,
    body: &str,
) -> AdapterError {
    let detail = truncate(body);
    match status.as_u16() {
        // 418 is Binance's auto-ban escalation of 429
        429 | 418 => AdapterError::RateLimit { retry_after_s },
        401 | 403 => AdapterError::Auth(detail),
        500..=599 => AdapterError::VendorTemporary(format!("{status}: {detail}")),
        _ => AdapterError::VendorPermanent(format!("{status}: {detail}")),
    }
}

fn truncate(body: &str) -> String {
    const MAX: usize = 200;
    if body.len() <= MAX {
        body.to_string()
    } else {
        format!("{}...", &body[..MAX])
    }
}

/// Lenient decimal parse for vendor payloads that quote numbers as strings.
/// Empty and unparseable values become `None` rather than failing the batch.
pub(crate) fn parse_decimal(raw: &str) -> Option<Decimal> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    Decimal::from_str(trimmed).ok()
}

pub(crate) fn parse_millis(raw: &str) -> Option<i64> {
    raw.trim().parse::<i64>().ok().filter(|ms| *ms > 0)
}
