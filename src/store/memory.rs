//! In-memory trade store. Nothing survives a restart.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{sort_newest_first, StoreError, TradeFilter, TradeStore};
use crate::models::{LocalId, Trade};

#[derive(Default)]
pub struct MemoryStore {
    trades: RwLock<HashMap<LocalId, Trade>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TradeStore for MemoryStore {
    async fn save(&self, trade: &Trade) -> Result<(), StoreError> {
        self.trades.write().await.insert(trade.local_id, trade.clone());
        Ok(())
    }

    async fn get(&self, id: &LocalId) -> Result<Option<Trade>, StoreError> {
        Ok(self.trades.read().await.get(id).cloned())
    }

    async fn query(&self, filter: TradeFilter) -> Result<Vec<Trade>, StoreError> {
        let mut trades: Vec<Trade> = self
            .trades
            .read()
            .await
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        sort_newest_first(&mut trades);
        Ok(trades)
    }
}
