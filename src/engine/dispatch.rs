//! # engine::dispatch
//!
//! The long-running tasks that drive the engine:
//!
//! | Task                     | Input                         | Does                                   |
//! |--------------------------|-------------------------------|----------------------------------------|
//! | [`run_price_dispatch`]   | multiplexer listener          | exit evaluation, spawns automatic sells |
//! | [`run_order_update_pump`]| exchange order-update channel | `apply_order_update` in arrival order  |
//! | [`run_reconcile_loop`]   | interval timer                | re-saves failed saves, prunes settled  |
//!
//! The price loop never awaits an exchange call, a store write or a busy
//! trade: all three are spawned so market-data ingestion keeps flowing for
//! every symbol.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::multiplexer::ListenerHandle;
use super::TradeEngine;
use crate::exchange::OrderUpdate;

pub async fn run_price_dispatch(
    engine: Arc<TradeEngine>,
    mut listener: ListenerHandle,
    cancel: CancellationToken,
) {
    info!(listener = listener.id(), "⚡ Price dispatch loop started");

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = listener.recv() => event,
        };
        let Some(event) = event else {
            warn!("Multiplexer closed the dispatch listener");
            break;
        };

        let outcome = engine.on_market_trade(&event).await;

        for id in outcome.persist {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                if let Err(e) = engine.persist(id).await {
                    error!(trade_id = %id, error = %e, "Persist after tick failed");
                }
            });
        }

        for id in outcome.deferred {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                if let Err(e) = engine.apply_deferred_prices(id).await {
                    error!(trade_id = %id, error = %e, "Deferred price catch-up failed");
                }
            });
        }

        for (id, trigger) in outcome.sells {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                if let Err(e) = engine.auto_sell(id, trigger).await {
                    error!(trade_id = %id, ?trigger, error = %e, "Automatic sell failed");
                }
            });
        }
    }

    engine.multiplexer().unsubscribe(&listener).await;
    info!("Price dispatch loop stopped");
}

pub async fn run_order_update_pump(
    engine: Arc<TradeEngine>,
    mut updates: mpsc::UnboundedReceiver<OrderUpdate>,
    cancel: CancellationToken,
) {
    info!("Order update pump started");
    loop {
        let update = tokio::select! {
            _ = cancel.cancelled() => break,
            update = updates.recv() => update,
        };
        let Some(update) = update else { break };

        let client_order_id = update.client_order_id.clone();
        if let Err(e) = engine.apply_order_update(update).await {
            error!(client_order_id = %client_order_id, error = %e, "Order update could not be applied");
        }
    }
    info!("Order update pump stopped");
}

pub async fn run_reconcile_loop(
    engine: Arc<TradeEngine>,
    every: Duration,
    retention: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let saved = engine.reconcile_unsaved().await;
                if saved > 0 {
                    info!(saved, "Reconciliation pass persisted trades");
                }
                engine.prune_settled(retention).await;
            }
        }
    }
}
