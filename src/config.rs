use std::str::FromStr;

use anyhow::{anyhow, Result};
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::margin::MarginPolicy;

#[derive(Debug, Deserialize, Clone)]
pub(crate) struct AppConfig {
    pub(crate) database: DatabaseConfig,
    pub(crate) api: ApiConfig,
    pub(crate) worker: WorkerConfig,
    pub(crate) margin: MarginPolicy,
}

#[derive(Debug, Deserialize, Clone)]
pub(crate) struct DatabaseConfig {
    pub(crate) url: String,
    pub(crate) min_pool_size: u32,
    pub(crate) max_pool_size: u32,
    pub(crate) max_lifetime_seconds: u64,
    pub(crate) acquire_timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub(crate) struct ApiConfig {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) cors_origins: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub(crate) struct WorkerConfig {
    pub(crate) poll_interval_ms: u64,
    pub(crate) batch_limit: i64,
    /// Only pick up orders at least this old; 0 disables the filter. Gives the
    /// placement path's fast-path trigger a head start over the batch scan.
    pub(crate) max_age_ms: i64,
    pub(crate) enabled_flag_ttl_ms: i64,
    pub(crate) quote_staleness_ms: i64,
}

impl WorkerConfig {
    pub(crate) fn max_age(&self) -> Option<i64> {
        if self.max_age_ms > 0 {
            Some(self.max_age_ms)
        } else {
            None
        }
    }
}

pub(crate) fn load_config() -> Result<AppConfig> {
    let cfg = AppConfig {
        database: DatabaseConfig {
            url: env_required("DATABASE_URL")?,
            min_pool_size: env_u32("DB_MIN_POOL_SIZE", 5),
            max_pool_size: env_u32("DB_MAX_POOL_SIZE", 20),
            max_lifetime_seconds: env_u64("DB_MAX_LIFETIME_SECONDS", 1800),
            acquire_timeout_seconds: env_u64("DB_ACQUIRE_TIMEOUT_SECONDS", 30),
        },
        api: ApiConfig {
            host: env_string("API_HOST", "0.0.0.0"),
            port: env_u16("API_PORT", 8100),
            cors_origins: env_list("CORS_ORIGINS", &["*"]),
        },
        worker: WorkerConfig {
            poll_interval_ms: env_u64("WORKER_POLL_INTERVAL_MS", 1000),
            batch_limit: env_i64("WORKER_BATCH_LIMIT", 50),
            max_age_ms: env_i64("WORKER_MAX_AGE_MS", 0),
            enabled_flag_ttl_ms: env_i64("WORKER_FLAG_TTL_MS", 5000),
            quote_staleness_ms: env_i64("QUOTE_STALENESS_MS", 300_000),
        },
        margin: MarginPolicy {
            equity_intraday_leverage: env_decimal("MARGIN_EQUITY_INTRADAY_LEVERAGE", "200")?,
            equity_delivery_leverage: env_decimal("MARGIN_EQUITY_DELIVERY_LEVERAGE", "50")?,
            derivative_leverage: env_decimal("MARGIN_DERIVATIVE_LEVERAGE", "100")?,
            brokerage_rate: env_decimal("BROKERAGE_RATE", "0.0003")?,
            brokerage_cap: env_decimal("BROKERAGE_CAP", "20")?,
            derivative_flat_fee: env_decimal("BROKERAGE_DERIVATIVE_FLAT", "20")?,
        },
    };
    if cfg.worker.batch_limit <= 0 {
        return Err(anyhow!("WORKER_BATCH_LIMIT must be positive"));
    }
    Ok(cfg)
}

fn env_required(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| anyhow!("missing required env var: {key}"))
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u16(key: &str, default: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(default)
}

fn env_decimal(key: &str, default: &str) -> Result<Decimal> {
    let raw = env_string(key, default);
    Decimal::from_str(&raw).map_err(|e| anyhow!("invalid decimal in {key}={raw}: {e}"))
}

fn env_list(key: &str, default: &[&str]) -> Vec<String> {
    match std::env::var(key) {
        Ok(v) => parse_list_value(&v)
            .unwrap_or_else(|| default.iter().map(|s| (*s).to_string()).collect()),
        Err(_) => default.iter().map(|s| (*s).to_string()).collect(),
    }
}

fn parse_list_value(raw: &str) -> Option<Vec<String>> {
    if let Ok(v) = serde_json::from_str::<Vec<String>>(raw) {
        return Some(v.into_iter().filter(|s| !s.trim().is_empty()).collect());
    }
    let parts: Vec<String> = raw
        .split(',')
        .map(|s| s.trim().trim_matches('"').to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts)
    }
}
