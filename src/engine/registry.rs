//! # engine::registry
//!
//! **Trade Registry**: the authoritative in-memory home of every live trade,
//! indexed by local id, by client order id and (for non-terminal trades) by
//! symbol.
//!
//! Each trade lives behind its own `Mutex`: holding a [`TradeSlot`]'s lock is
//! what "single writer per trade" means. The index maps are only locked for
//! the duration of a lookup or insert.
//!
//! Terminal trades leave the symbol index the moment they settle, so price
//! ticks only ever visit trades that can still exit. They stay in memory
//! until [`TradeRegistry::evict_settled`] drops them; the store keeps them
//! after that.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, MutexGuard, RwLock};

use crate::models::{LocalId, Trade};

pub type TradeHandle = Arc<TradeSlot>;

pub struct TradeSlot {
    pub local_id: LocalId,
    /// Immutable after creation, readable without the lock.
    pub symbol:   String,
    trade:        Mutex<Trade>,
    /// Prices that arrived while the trade was busy, oldest first.
    deferred:     std::sync::Mutex<Vec<f64>>,
}

impl TradeSlot {
    fn new(trade: Trade) -> Self {
        Self {
            local_id: trade.local_id,
            symbol:   trade.symbol.clone(),
            trade:    Mutex::new(trade),
            deferred: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, Trade> {
        self.trade.lock().await
    }

    /// `None` when another task currently holds the trade.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, Trade>> {
        self.trade.try_lock().ok()
    }

    pub async fn snapshot(&self) -> Trade {
        self.trade.lock().await.clone()
    }

    /// Queues a price for the next holder of the lock. Returns `true` when
    /// the queue was empty, i.e. the caller must schedule a catch-up.
    pub fn defer_price(&self, price: f64) -> bool {
        let mut deferred = self.deferred.lock().unwrap_or_else(PoisonError::into_inner);
        deferred.push(price);
        deferred.len() == 1
    }

    /// Drains queued prices in arrival order. Call with the trade lock held.
    pub fn take_deferred(&self) -> Vec<f64> {
        std::mem::take(&mut *self.deferred.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

#[derive(Default)]
pub struct TradeRegistry {
    by_id:     RwLock<HashMap<LocalId, TradeHandle>>,
    by_order:  RwLock<HashMap<String, LocalId>>,
    /// Non-terminal trades per symbol.
    by_symbol: RwLock<HashMap<String, HashSet<LocalId>>>,
    /// Terminal trades still held in memory, with the moment they settled.
    settled:   RwLock<HashMap<LocalId, Instant>>,
}

impl TradeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `trade` and indexes the client order ids it already carries.
    pub async fn insert(&self, trade: Trade) -> TradeHandle {
        let local_id = trade.local_id;
        let terminal = trade.status().is_terminal();
        let order_ids = trade.client_order_ids().to_vec();
        let slot = Arc::new(TradeSlot::new(trade));

        self.by_id.write().await.insert(local_id, Arc::clone(&slot));
        {
            let mut by_order = self.by_order.write().await;
            for id in order_ids {
                by_order.insert(id, local_id);
            }
        }
        if terminal {
            self.settled.write().await.insert(local_id, Instant::now());
        } else {
            self.by_symbol
                .write()
                .await
                .entry(symbol_key(&slot.symbol))
                .or_default()
                .insert(local_id);
        }
        slot
    }

    pub async fn get(&self, id: &LocalId) -> Option<TradeHandle> {
        self.by_id.read().await.get(id).cloned()
    }

    pub async fn index_order(&self, client_order_id: &str, local_id: LocalId) {
        self.by_order
            .write()
            .await
            .insert(client_order_id.to_string(), local_id);
    }

    pub async fn find_by_client_order_id(&self, client_order_id: &str) -> Option<TradeHandle> {
        let local_id = self.by_order.read().await.get(client_order_id).copied()?;
        self.get(&local_id).await
    }

    /// Non-terminal trades on `symbol`.
    pub async fn for_symbol(&self, symbol: &str) -> Vec<TradeHandle> {
        let ids: Vec<LocalId> = match self.by_symbol.read().await.get(&symbol_key(symbol)) {
            Some(ids) => ids.iter().copied().collect(),
            None => return Vec::new(),
        };
        let by_id = self.by_id.read().await;
        ids.iter().filter_map(|id| by_id.get(id).cloned()).collect()
    }

    pub async fn all(&self) -> Vec<TradeHandle> {
        self.by_id.read().await.values().cloned().collect()
    }

    /// Every non-terminal trade.
    pub async fn active(&self) -> Vec<TradeHandle> {
        let ids: Vec<LocalId> = self
            .by_symbol
            .read()
            .await
            .values()
            .flatten()
            .copied()
            .collect();
        let by_id = self.by_id.read().await;
        ids.iter().filter_map(|id| by_id.get(id).cloned()).collect()
    }

    /// Moves a trade that just reached a terminal status out of the symbol
    /// index.
    pub async fn retire(&self, local_id: LocalId, symbol: &str) {
        {
            let mut by_symbol = self.by_symbol.write().await;
            let key = symbol_key(symbol);
            if let Some(ids) = by_symbol.get_mut(&key) {
                ids.remove(&local_id);
                if ids.is_empty() {
                    by_symbol.remove(&key);
                }
            }
        }
        self.settled.write().await.insert(local_id, Instant::now());
    }

    /// Forgets terminal trades that settled at least `older_than` ago, except
    /// the ids in `keep`. Returns what was dropped.
    pub async fn evict_settled(&self, older_than: Duration, keep: &HashSet<LocalId>) -> Vec<LocalId> {
        let expired: HashSet<LocalId> = {
            let mut settled = self.settled.write().await;
            let expired: HashSet<LocalId> = settled
                .iter()
                .filter(|(id, at)| at.elapsed() >= older_than && !keep.contains(*id))
                .map(|(id, _)| *id)
                .collect();
            settled.retain(|id, _| !expired.contains(id));
            expired
        };
        if expired.is_empty() {
            return Vec::new();
        }

        self.by_id.write().await.retain(|id, _| !expired.contains(id));
        self.by_order
            .write()
            .await
            .retain(|_, local_id| !expired.contains(&*local_id));
        expired.into_iter().collect()
    }

    pub async fn len(&self) -> usize {
        self.by_id.read().await.len()
    }
}

fn symbol_key(symbol: &str) -> String {
    symbol.trim().to_lowercase()
}
