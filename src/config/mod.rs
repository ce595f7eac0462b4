//! Configuration loading for futurescan.
//!
//! Precedence: built-in defaults, then an optional TOML file, then
//! `FUTURESCAN_*` environment variables (`__` separates nested keys, lists
//! are comma-separated, booleans are case-insensitive). Validation failures
//! are fatal at startup.

mod exchange_config;
mod rabbitmq_config;

pub use exchange_config::{ApiCredentials, ExchangeConfig};
pub use rabbitmq_config::RabbitMqConfig;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

use crate::application::batch::BatchConfig;
use crate::domain::types::Symbol;
use crate::infrastructure::cache::CacheConfig;
use crate::infrastructure::exchanges;

const ENV_PREFIX: &str = "FUTURESCAN_";

/// Keys that are lists even when the override holds a single element.
const LIST_KEYS: &[&str] = &["exchanges", "symbols"];

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PerformanceConfig {
    /// Cadence of the statistics / health report loop.
    pub metrics_interval_s: u64,
    pub max_memory_mb: u64,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            metrics_interval_s: 60,
            max_memory_mb: 512,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: String,
    pub file_path: Option<PathBuf>,
    pub console: bool,
    pub max_file_size_mb: u64,
    pub backup_count: u32,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_path: None,
            console: true,
            max_file_size_mb: 100,
            backup_count: 5,
        }
    }
}

/// Main application configuration. Created once at startup and frozen.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub environment: String,
    pub exchanges: Vec<String>,
    /// Initial working symbol set. Empty means full-universe fetches.
    pub symbols: Vec<String>,
    pub ticker_interval_s: u64,
    pub funding_rate_interval_s: u64,
    pub api_keys: HashMap<String, ApiCredentials>,
    pub cache: CacheConfig,
    pub batch: BatchConfig,
    pub rabbitmq: RabbitMqConfig,
    pub exchange_configs: HashMap<String, ExchangeConfig>,
    pub performance: PerformanceConfig,
    pub logging: LoggingConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            environment: "development".to_string(),
            exchanges: vec!["binance".to_string(), "bybit".to_string()],
            symbols: Vec::new(),
            ticker_interval_s: 30,
            funding_rate_interval_s: 300,
            api_keys: HashMap::new(),
            cache: CacheConfig::default(),
            batch: BatchConfig::default(),
            rabbitmq: RabbitMqConfig::default(),
            exchange_configs: HashMap::new(),
            performance: PerformanceConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from an optional TOML file plus the environment.
    pub fn load(path: Option<&Path>, environment: Option<&str>) -> anyhow::Result<Self> {
        let mut root = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p)
                    .with_context(|| format!("failed to read config file {}", p.display()))?;
                raw.parse::<toml::Table>()
                    .with_context(|| format!("failed to parse config file {}", p.display()))?
            }
            None => toml::Table::new(),
        };

        apply_env_overrides(&mut root, std::env::vars());

        if let Some(env) = environment {
            root.insert(
                "environment".to_string(),
                toml::Value::String(env.to_string()),
            );
        }

        let config: AppConfig = toml::Value::Table(root)
            .try_into()
            .context("invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Settings for one exchange, falling back to defaults.
    pub fn exchange_config(&self, name: &str) -> ExchangeConfig {
        self.exchange_configs.get(name).cloned().unwrap_or_default()
    }

    pub fn credentials(&self, name: &str) -> Option<&ApiCredentials> {
        self.api_keys.get(name)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.exchanges.is_empty(),
            "at least one exchange must be configured"
        );
        for name in &self.exchanges {
            anyhow::ensure!(
                exchanges::is_known(name),
                "unknown exchange '{name}' (known: {})",
                exchanges::known_exchanges().join(", ")
            );
        }
        for symbol in &self.symbols {
            Symbol::parse(symbol)
                .with_context(|| format!("invalid symbol '{symbol}' in config"))?;
        }
        anyhow::ensure!(
            self.ticker_interval_s > 0,
            "ticker_interval_s must be positive"
        );
        anyhow::ensure!(
            self.funding_rate_interval_s > 0,
            "funding_rate_interval_s must be positive"
        );
        anyhow::ensure!(
            self.performance.metrics_interval_s > 0,
            "performance.metrics_interval_s must be positive"
        );
        anyhow::ensure!(
            self.performance.max_memory_mb > 0,
            "performance.max_memory_mb must be positive"
        );
        self.logging
            .level
            .parse::<tracing::Level>()
            .map_err(|_| anyhow::anyhow!("invalid logging.level '{}'", self.logging.level))?;
        self.cache.validate()?;
        self.batch.validate()?;
        self.rabbitmq.validate()?;
        for (name, exchange) in &self.exchange_configs {
            exchange.validate(name)?;
        }
        Ok(())
    }
}

fn apply_env_overrides(root: &mut toml::Table, vars: impl Iterator<Item = (String, String)>) {
    for (key, value) in vars {
        let Some(path) = key.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        let segments: Vec<String> = path.split("__").map(|s| s.to_lowercase()).collect();
        let Some(last) = segments.last() else {
            continue;
        };
        if segments.iter().any(String::is_empty) {
            continue;
        }
        let parsed = parse_env_value(last, &value);
        set_nested(root, &segments, parsed);
    }
}

fn parse_env_value(key: &str, raw: &str) -> toml::Value {
    if LIST_KEYS.contains(&key) || raw.contains(',') {
        return toml::Value::Array(
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| toml::Value::String(s.to_string()))
                .collect(),
        );
    }
    match raw.to_lowercase().as_str() {
        "true" => return toml::Value::Boolean(true),
        "false" => return toml::Value::Boolean(false),
        _ => {}
    }
    if let Ok(n) = raw.parse::<i64>() {
        return toml::Value::Integer(n);
    }
    if let Ok(f) = raw.parse::<f64>() {
        return toml::Value::Float(f);
    }
    toml::Value::String(raw.to_string())
}

fn set_nested(table: &mut toml::Table, segments: &[String], value: toml::Value) {
    let Some((head, rest)) = segments.split_first() else {
        return;
    };
    if rest.is_empty() {
        table.insert(head.clone(), value);
        return;
    }
    let entry = table
        .entry(head.clone())
        .or_insert_with(|| toml::Value::Table(toml::Table::new()));
    if !entry.is_table() {
        *entry = toml::Value::Table(toml::Table::new());
    }
    if let toml::Value::Table(child) = entry {
        set_nested(child, rest, value);
    }
}
