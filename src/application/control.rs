//! Control plane: executes JSON commands against the shared symbol set and
//! statistics, and answers on the response exchange.
//!
//! Commands: add_symbol, remove_symbol, set_symbols, get_symbols,
//! get_statistics. Responses carry the caller's correlation_id and go out
//! with routing key `control.response.<command>`.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::application::shared_state::SharedSymbolSet;
use crate::application::statistics::Statistics;
use crate::domain::errors::ControlErrorCode;
use crate::domain::ports::BusSink;
use crate::domain::types::Symbol;
use crate::infrastructure::resilience::ResilientExchange;

#[derive(Debug, Clone, Serialize)]
pub struct ControlResponse {
    pub correlation_id: Option<String>,
    pub success: bool,
    pub command: Option<String>,
    pub message: String,
    pub error: Option<ControlErrorCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub timestamp: i64,
}

impl ControlResponse {
    fn ok(
        correlation_id: Option<String>,
        command: &str,
        message: impl Into<String>,
        data: Value,
    ) -> Self {
        Self {
            correlation_id,
            success: true,
            command: Some(command.to_string()),
            message: message.into(),
            error: None,
            data: Some(data),
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    fn err(
        correlation_id: Option<String>,
        command: Option<&str>,
        message: impl Into<String>,
        error: ControlErrorCode,
        data: Option<Value>,
    ) -> Self {
        Self {
            correlation_id,
            success: false,
            command: command.map(str::to_string),
            message: message.into(),
            error: Some(error),
            data,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn routing_key(&self) -> String {
        format!(
            "control.response.{}",
            self.command.as_deref().unwrap_or("unknown")
        )
    }
}

pub struct ControlPlane {
    shared_symbols: Arc<SharedSymbolSet>,
    statistics: Arc<Statistics>,
    wrappers: Vec<Arc<ResilientExchange>>,
    sink: Arc<dyn BusSink>,
}

impl ControlPlane {
    pub fn new(
        shared_symbols: Arc<SharedSymbolSet>,
        statistics: Arc<Statistics>,
        wrappers: Vec<Arc<ResilientExchange>>,
        sink: Arc<dyn BusSink>,
    ) -> Self {
        Self {
            shared_symbols,
            statistics,
            wrappers,
            sink,
        }
    }

    /// Handle one raw message and publish the response.
    pub async fn process(&self, body: &[u8]) {
        let response = self.handle_message(body).await;
        self.send_response(&response).await;
    }

    /// Pure command execution; the transport never sees partial state.
    pub async fn handle_message(&self, body: &[u8]) -> ControlResponse {
        let value: Value = match serde_json::from_slice(body) {
            Ok(value) => value,
            Err(e) => {
                warn!("ControlPlane: invalid JSON: {e}");
                return ControlResponse::err(
                    None,
                    None,
                    format!("Invalid JSON: {e}"),
                    ControlErrorCode::InvalidJson,
                    None,
                );
            }
        };

        let correlation_id = value
            .get("correlation_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        let Some(command) = value.get("command").and_then(Value::as_str) else {
            return ControlResponse::err(
                correlation_id,
                None,
                "Missing required field: command",
                ControlErrorCode::InvalidCommand,
                None,
            );
        };

        info!(
            "ControlPlane: received command '{command}' (id: {})",
            correlation_id.as_deref().unwrap_or("-")
        );

        match command {
            "add_symbol" => self.add_symbol(correlation_id, &value).await,
            "remove_symbol" => self.remove_symbol(correlation_id, &value).await,
            "set_symbols" => self.set_symbols(correlation_id, &value).await,
            "get_symbols" => self.get_symbols(correlation_id).await,
            "get_statistics" => self.get_statistics(correlation_id).await,
            other => ControlResponse::err(
                correlation_id,
                Some(other),
                format!("Unknown command: {other}"),
                ControlErrorCode::UnknownCommand,
                None,
            ),
        }
    }

    async fn add_symbol(&self, correlation_id: Option<String>, value: &Value) -> ControlResponse {
        let symbol = match Self::required_symbol(&correlation_id, "add_symbol", value) {
            Ok(symbol) => symbol,
            Err(response) => return response,
        };

        let added = self.shared_symbols.add(symbol.clone()).await;
        let current = self.shared_symbols.snapshot().await;
        let data = serde_json::json!({
            "symbol": &symbol,
            "current_symbols": current,
        });

        if added {
            ControlResponse::ok(
                correlation_id,
                "add_symbol",
                format!("Symbol {symbol} added successfully"),
                data,
            )
        } else {
            ControlResponse::err(
                correlation_id,
                Some("add_symbol"),
                format!("Symbol {symbol} already exists"),
                ControlErrorCode::DuplicateSymbol,
                Some(data),
            )
        }
    }

    async fn remove_symbol(
        &self,
        correlation_id: Option<String>,
        value: &Value,
    ) -> ControlResponse {
        let symbol = match Self::required_symbol(&correlation_id, "remove_symbol", value) {
            Ok(symbol) => symbol,
            Err(response) => return response,
        };

        let removed = self.shared_symbols.remove(&symbol).await;
        let current = self.shared_symbols.snapshot().await;
        let data = serde_json::json!({
            "symbol": &symbol,
            "current_symbols": current,
        });

        if removed {
            ControlResponse::ok(
                correlation_id,
                "remove_symbol",
                format!("Symbol {symbol} removed successfully"),
                data,
            )
        } else {
            ControlResponse::err(
                correlation_id,
                Some("remove_symbol"),
                format!("Symbol {symbol} not found"),
                ControlErrorCode::SymbolNotFound,
                Some(data),
            )
        }
    }

    async fn set_symbols(&self, correlation_id: Option<String>, value: &Value) -> ControlResponse {
        let Some(raw) = value.get("symbols").and_then(Value::as_array) else {
            return ControlResponse::err(
                correlation_id,
                Some("set_symbols"),
                "Missing or invalid field: symbols (must be array)",
                ControlErrorCode::InvalidCommand,
                None,
            );
        };

        let mut symbols = Vec::with_capacity(raw.len());
        for entry in raw {
            let Some(text) = entry.as_str() else {
                return ControlResponse::err(
                    correlation_id,
                    Some("set_symbols"),
                    "Field symbols must be an array of strings",
                    ControlErrorCode::InvalidCommand,
                    None,
                );
            };
            match Symbol::parse(text) {
                Ok(symbol) => symbols.push(symbol),
                Err(e) => {
                    return ControlResponse::err(
                        correlation_id,
                        Some("set_symbols"),
                        e.to_string(),
                        ControlErrorCode::InvalidCommand,
                        None,
                    );
                }
            }
        }

        let count = self.shared_symbols.replace(symbols).await;
        let current = self.shared_symbols.snapshot().await;
        ControlResponse::ok(
            correlation_id,
            "set_symbols",
            "Symbols updated successfully",
            serde_json::json!({
                "symbols": current,
                "count": count,
            }),
        )
    }

    async fn get_symbols(&self, correlation_id: Option<String>) -> ControlResponse {
        let symbols = self.shared_symbols.snapshot().await;
        ControlResponse::ok(
            correlation_id,
            "get_symbols",
            "Symbols retrieved successfully",
            serde_json::json!({
                "count": symbols.len(),
                "symbols": symbols,
            }),
        )
    }

    async fn get_statistics(&self, correlation_id: Option<String>) -> ControlResponse {
        let snapshot = self.statistics.snapshot();

        let mut circuit_breakers = BTreeMap::new();
        let mut health = BTreeMap::new();
        for wrapper in &self.wrappers {
            let status = wrapper.status().await;
            circuit_breakers.insert(
                status.exchange.to_string(),
                serde_json::json!({
                    "state": status.circuit.state.as_str(),
                    "failures": status.circuit.failures,
                    "opens": status.circuit.opens,
                    "closes": status.circuit.closes,
                }),
            );
            health.insert(
                status.exchange.to_string(),
                serde_json::json!({
                    "status": status.health.status.as_str(),
                    "consecutive_failures": status.health.consecutive_failures,
                    "uptime_pct": status.health.uptime_pct,
                }),
            );
        }

        ControlResponse::ok(
            correlation_id,
            "get_statistics",
            "Statistics retrieved successfully",
            serde_json::json!({
                "exchange_success": snapshot.exchange_success,
                "exchange_errors": snapshot.exchange_errors,
                "rabbitmq_published": snapshot.rabbitmq_published,
                "rabbitmq_failed": snapshot.rabbitmq_failed,
                "circuit_breakers": circuit_breakers,
                "health": health,
            }),
        )
    }

    fn required_symbol(
        correlation_id: &Option<String>,
        command: &str,
        value: &Value,
    ) -> Result<Symbol, ControlResponse> {
        let Some(raw) = value.get("symbol").and_then(Value::as_str) else {
            return Err(ControlResponse::err(
                correlation_id.clone(),
                Some(command),
                "Missing required field: symbol",
                ControlErrorCode::InvalidCommand,
                None,
            ));
        };
        Symbol::parse(raw).map_err(|e| {
            ControlResponse::err(
                correlation_id.clone(),
                Some(command),
                e.to_string(),
                ControlErrorCode::InvalidCommand,
                None,
            )
        })
    }

    async fn send_response(&self, response: &ControlResponse) {
        let body = match serde_json::to_vec(response) {
            Ok(body) => body,
            Err(e) => {
                warn!("ControlPlane: failed to serialize response: {e}");
                return;
            }
        };

        match self
            .sink
            .publish(
                &response.routing_key(),
                body,
                response.correlation_id.as_deref(),
            )
            .await
        {
            Ok(()) => info!(
                "ControlPlane: {} response sent for '{}' (id: {})",
                if response.success { "ok" } else { "error" },
                response.command.as_deref().unwrap_or("-"),
                response.correlation_id.as_deref().unwrap_or("-")
            ),
            Err(e) => warn!("ControlPlane: failed to send response: {e}"),
        }
    }
}
