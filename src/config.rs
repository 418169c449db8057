//! # config
//!
//! Process configuration, read once at startup from the environment (after
//! `.env` is loaded). Every value has a default except `DATABASE_URL`, which
//! is only required for `STORE_KIND=postgres`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeMode {
    /// In-process simulated exchange.
    Paper,
    /// REST bridge for orders + public WebSocket for market data.
    Bridge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Memory,
    File,
    Postgres,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr:          SocketAddr,
    pub exchange_mode:      ExchangeMode,
    pub exchange_rest_url:  String,
    pub exchange_ws_url:    String,
    pub exchange_timeout:   Duration,
    pub reconnect_backoff:  Duration,
    pub store_kind:         StoreKind,
    pub data_dir:           PathBuf,
    pub database_url:       Option<String>,
    pub reconcile_interval: Duration,
    /// How long a terminal trade stays in memory before only the store has it.
    pub settled_retention:  Duration,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let string = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());
        let number = |key: &str, default: u64| -> anyhow::Result<u64> {
            match get(key) {
                Some(v) => v
                    .trim()
                    .parse()
                    .with_context(|| format!("{key} must be a whole number, got {v:?}")),
                None => Ok(default),
            }
        };

        let bind_addr: SocketAddr = string("BIND_ADDR", "0.0.0.0:3000")
            .parse()
            .context("BIND_ADDR must be host:port")?;

        let exchange_mode = match string("EXCHANGE_MODE", "paper").to_ascii_lowercase().as_str() {
            "paper" => ExchangeMode::Paper,
            "bridge" => ExchangeMode::Bridge,
            other => bail!("EXCHANGE_MODE must be paper or bridge, got {other:?}"),
        };

        let store_kind = match string("STORE_KIND", "file").to_ascii_lowercase().as_str() {
            "memory" => StoreKind::Memory,
            "file" => StoreKind::File,
            "postgres" => StoreKind::Postgres,
            other => bail!("STORE_KIND must be memory, file or postgres, got {other:?}"),
        };

        let database_url = get("DATABASE_URL").filter(|v| !v.trim().is_empty());
        if store_kind == StoreKind::Postgres && database_url.is_none() {
            bail!("DATABASE_URL is required when STORE_KIND=postgres");
        }

        Ok(Self {
            bind_addr,
            exchange_mode,
            exchange_rest_url: string("EXCHANGE_REST_URL", "http://localhost:8081"),
            exchange_ws_url: string("EXCHANGE_WS_URL", "wss://stream.binance.com:9443"),
            exchange_timeout: Duration::from_secs(number("EXCHANGE_TIMEOUT_SECS", 5)?),
            reconnect_backoff: Duration::from_millis(number("STREAM_RECONNECT_BACKOFF_MS", 100)?),
            store_kind,
            data_dir: PathBuf::from(string("DATA_DIR", "./data")),
            database_url,
            reconcile_interval: Duration::from_secs(number("RECONCILE_INTERVAL_SECS", 5)?.max(1)),
            settled_retention: Duration::from_secs(number("SETTLED_RETENTION_SECS", 300)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> anyhow::Result<AppConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg.bind_addr.port(), 3000);
        assert_eq!(cfg.exchange_mode, ExchangeMode::Paper);
        assert_eq!(cfg.store_kind, StoreKind::File);
        assert_eq!(cfg.reconnect_backoff, Duration::from_millis(100));
        assert_eq!(cfg.exchange_timeout, Duration::from_secs(5));
        assert_eq!(cfg.data_dir, PathBuf::from("./data"));
        assert_eq!(cfg.settled_retention, Duration::from_secs(300));
    }

    #[test]
    fn test_overrides() {
        let cfg = config(&[
            ("EXCHANGE_MODE", "BRIDGE"),
            ("STORE_KIND", "memory"),
            ("STREAM_RECONNECT_BACKOFF_MS", "250"),
            ("SETTLED_RETENTION_SECS", "0"),
        ])
        .unwrap();
        assert_eq!(cfg.exchange_mode, ExchangeMode::Bridge);
        assert_eq!(cfg.store_kind, StoreKind::Memory);
        assert_eq!(cfg.reconnect_backoff, Duration::from_millis(250));
        assert_eq!(cfg.settled_retention, Duration::ZERO);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(config(&[("EXCHANGE_MODE", "live")]).is_err());
        assert!(config(&[("EXCHANGE_TIMEOUT_SECS", "soon")]).is_err());
        assert!(config(&[("STORE_KIND", "postgres")]).is_err());
        assert!(config(&[("STORE_KIND", "postgres"), ("DATABASE_URL", "postgres://x/y")]).is_ok());
    }
}
