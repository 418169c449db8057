//! # engine::broadcaster
//!
//! **Update Broadcaster**: pushes an immutable snapshot of a trade to every
//! registered observer after each state change.
//!
//! Each observer owns an unbounded queue, so a slow observer only grows its
//! own backlog and never delays the publisher or other observers. Observers
//! whose receiving side is gone are pruned at the next registration.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use crate::models::Trade;

pub type TradeSnapshot = Arc<Trade>;

pub struct ObserverHandle {
    id: u64,
    rx: mpsc::UnboundedReceiver<TradeSnapshot>,
}

impl ObserverHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn recv(&mut self) -> Option<TradeSnapshot> {
        self.rx.recv().await
    }
}

#[derive(Default)]
pub struct UpdateBroadcaster {
    observers: RwLock<HashMap<u64, mpsc::UnboundedSender<TradeSnapshot>>>,
    next_id:   AtomicU64,
}

impl UpdateBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self) -> ObserverHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let mut observers = self.observers.write().await;
        let before = observers.len();
        observers.retain(|_, tx| !tx.is_closed());
        if observers.len() < before {
            debug!(pruned = before - observers.len(), "Pruned closed observers");
        }
        observers.insert(id, tx);

        ObserverHandle { id, rx }
    }

    pub async fn unregister(&self, id: u64) {
        self.observers.write().await.remove(&id);
    }

    /// Sends `trade` to every observer. Returns how many accepted it; closed
    /// observers are skipped, never reported as an error.
    pub async fn broadcast_trade_update(&self, trade: &Trade) -> usize {
        let snapshot: TradeSnapshot = Arc::new(trade.clone());
        let observers = self.observers.read().await;
        observers
            .values()
            .filter(|tx| tx.send(Arc::clone(&snapshot)).is_ok())
            .count()
    }

    pub async fn observer_count(&self) -> usize {
        self.observers.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_blocked_observer_does_not_delay_healthy_one() {
        let broadcaster = UpdateBroadcaster::new();
        let _blocked = broadcaster.register().await; // never drained
        let mut healthy = broadcaster.register().await;

        let trade = Trade::new("ethusdt");
        for _ in 0..10_000 {
            broadcaster.broadcast_trade_update(&trade).await;
        }

        let last = Trade::new("btcusdt");
        timeout(Duration::from_millis(500), broadcaster.broadcast_trade_update(&last))
            .await
            .expect("publisher must not block");

        let mut seen = 0;
        let got_last = timeout(Duration::from_secs(1), async {
            while let Some(snapshot) = healthy.recv().await {
                seen += 1;
                if snapshot.symbol == "btcusdt" {
                    return true;
                }
            }
            false
        })
        .await
        .expect("healthy observer starved");
        assert!(got_last);
        assert_eq!(seen, 10_001);
    }

    #[tokio::test]
    async fn test_closed_observers_are_pruned_on_register() {
        let broadcaster = UpdateBroadcaster::new();
        let dropped = broadcaster.register().await;
        let _kept = broadcaster.register().await;
        drop(dropped);

        // publishing to a closed observer is not an error
        assert_eq!(broadcaster.broadcast_trade_update(&Trade::new("ethusdt")).await, 1);
        assert_eq!(broadcaster.observer_count().await, 2);

        let _third = broadcaster.register().await;
        assert_eq!(broadcaster.observer_count().await, 2);
    }

    #[tokio::test]
    async fn test_unregister() {
        let broadcaster = UpdateBroadcaster::new();
        let observer = broadcaster.register().await;
        broadcaster.unregister(observer.id()).await;
        assert_eq!(broadcaster.observer_count().await, 0);
        assert_eq!(broadcaster.broadcast_trade_update(&Trade::new("ethusdt")).await, 0);
    }
}
