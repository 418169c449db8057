//! # store
//!
//! The persistence collaborator: durable write-through storage for trades.
//!
//! The engine saves after every mutation and reads back only to restore
//! active trades at startup or to answer history queries. In-flight decisions
//! never consult the store: the in-memory registry is authoritative.
//!
//! Backends:
//! * [`MemoryStore`] : `STORE_KIND=memory` (tests, throwaway sessions)
//! * [`FileStore`]   : `STORE_KIND=file`, one JSON document per trade
//! * `PgTradeStore`  : `STORE_KIND=postgres`, behind the `postgres` feature

pub mod file;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crate::models::{LocalId, Trade};

pub use file::FileStore;
pub use memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PgTradeStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[cfg(feature = "postgres")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Which trades a query returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeFilter {
    /// Not yet in a terminal status.
    #[default]
    Active,
    /// Closed, abandoned or failed.
    Closed,
    All,
}

impl TradeFilter {
    pub fn matches(self, trade: &Trade) -> bool {
        match self {
            TradeFilter::Active => !trade.status().is_terminal(),
            TradeFilter::Closed => trade.status().is_terminal(),
            TradeFilter::All => true,
        }
    }
}

#[async_trait]
pub trait TradeStore: Send + Sync {
    /// Inserts or replaces the stored copy of `trade`.
    async fn save(&self, trade: &Trade) -> Result<(), StoreError>;

    /// `Ok(None)` when no trade with that id was ever saved.
    async fn get(&self, id: &LocalId) -> Result<Option<Trade>, StoreError>;

    /// Matching trades, newest first.
    async fn query(&self, filter: TradeFilter) -> Result<Vec<Trade>, StoreError>;
}

/// Newest first, the order every backend returns.
pub(crate) fn sort_newest_first(trades: &mut [Trade]) {
    trades.sort_by(|a, b| b.created_at.cmp(&a.created_at));
}
