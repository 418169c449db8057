//! # store::postgres: PostgreSQL trade store
//!
//! Enabled with `--features postgres` and `STORE_KIND=postgres`.
//!
//! ## Setup
//! 1. Create a database and set `DATABASE_URL` in `.env`
//! 2. The schema in `migrations/001_trades.sql` is applied on connect

use anyhow::Context;
use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, types::Json, Executor, PgPool, Row};
use tracing::info;

use super::{StoreError, TradeFilter, TradeStore};
use crate::models::{LocalId, Trade, TradeStatus};

pub struct PgTradeStore {
    pool: PgPool,
}

impl PgTradeStore {
    /// Connects and applies the embedded migration.
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        info!("Connecting to PostgreSQL...");

        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(std::time::Duration::from_secs(5))
            .connect(database_url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        pool.execute(include_str!("../../migrations/001_trades.sql"))
            .await
            .context("Failed to run migration 001_trades.sql")?;

        info!("✅ PostgreSQL connected and migrations applied");
        Ok(Self { pool })
    }

    fn statuses_for(filter: TradeFilter) -> Vec<String> {
        TradeStatus::ALL
            .into_iter()
            .filter(|s| match filter {
                TradeFilter::Active => !s.is_terminal(),
                TradeFilter::Closed => s.is_terminal(),
                TradeFilter::All => true,
            })
            .map(|s| s.to_string())
            .collect()
    }
}

#[async_trait]
impl TradeStore for PgTradeStore {
    async fn save(&self, trade: &Trade) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO trades (local_id, symbol, status, data, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (local_id) DO UPDATE SET
              status     = EXCLUDED.status,
              data       = EXCLUDED.data,
              updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(trade.local_id)
        .bind(&trade.symbol)
        .bind(trade.status().to_string())
        .bind(Json(trade))
        .bind(trade.created_at)
        .bind(trade.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, id: &LocalId) -> Result<Option<Trade>, StoreError> {
        let row = sqlx::query("SELECT data FROM trades WHERE local_id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let Json(trade): Json<Trade> = row.try_get("data")?;
                Ok(Some(trade))
            }
            None => Ok(None),
        }
    }

    async fn query(&self, filter: TradeFilter) -> Result<Vec<Trade>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT data FROM trades
            WHERE status = ANY($1)
            ORDER BY created_at DESC
            "#,
        )
        .bind(Self::statuses_for(filter))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let Json(trade): Json<Trade> = row.try_get("data")?;
                Ok(trade)
            })
            .collect()
    }
}
