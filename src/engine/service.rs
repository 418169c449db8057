//! # engine::service
//!
//! **Trade Engine**: the only writer of trade state.
//!
//! Every operation follows the same shape:
//!
//! ```text
//!  lock trade ─▶ check status ─▶ exchange call (optional) ─▶ mutate via transition()
//!             ─▶ commit: save to store (failure → reconcile queue) + broadcast snapshot
//! ```
//!
//! Client order ids are generated and indexed *before* the exchange is
//! called, so a fill that races the acknowledgement still finds its trade.
//! The trade lock is held across the exchange call; the order-update pump
//! simply waits its turn.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::broadcaster::UpdateBroadcaster;
use super::exits;
use super::multiplexer::StreamMultiplexer;
use super::order_id::OrderIdGenerator;
use super::registry::{TradeHandle, TradeRegistry};
use crate::error::AppError;
use crate::exchange::{BookTicker, ExchangeClient, OrderParams, OrderUpdate, OrderUpdateKind};
use crate::models::{
    BuyOrder, HistoryKind, LocalId, MarketTrade, SellOrder, SellTrigger, Trade, TradeStatus,
    TrailingState,
};
use crate::store::{TradeFilter, TradeStore};

/// What one price tick asks the dispatch loop to do.
#[derive(Debug, Default, PartialEq)]
pub struct TickOutcome {
    /// Trades whose exit condition fired; each needs an automatic market sell.
    pub sells:    Vec<(LocalId, SellTrigger)>,
    /// Trades whose trailing profit armed on this tick and need saving.
    pub persist:  Vec<LocalId>,
    /// Busy trades that queued this price and need a catch-up pass.
    pub deferred: Vec<LocalId>,
}

/// What a run of prices did to one trade.
#[derive(Debug, Default)]
struct PriceOutcome {
    armed:   bool,
    trigger: Option<SellTrigger>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub trades:             usize,
    pub active_trades:      usize,
    pub unsaved_trades:     usize,
    pub price_events:       u64,
    pub automatic_sells:    u64,
    pub subscribed_symbols: Vec<String>,
    pub observers:          usize,
}

/// Which order of a trade an exchange update refers to.
enum OrderRole {
    Buy,
    Sell,
    Stale,
}

pub struct TradeEngine {
    exchange:        Arc<dyn ExchangeClient>,
    store:           Arc<dyn TradeStore>,
    registry:        TradeRegistry,
    multiplexer:     Arc<StreamMultiplexer>,
    broadcaster:     Arc<UpdateBroadcaster>,
    order_ids:       OrderIdGenerator,
    unsaved:         Mutex<HashSet<LocalId>>,
    price_events:    AtomicU64,
    automatic_sells: AtomicU64,
}

impl TradeEngine {
    pub fn new(
        exchange: Arc<dyn ExchangeClient>,
        store: Arc<dyn TradeStore>,
        multiplexer: Arc<StreamMultiplexer>,
        broadcaster: Arc<UpdateBroadcaster>,
    ) -> Self {
        Self {
            exchange,
            store,
            registry: TradeRegistry::new(),
            multiplexer,
            broadcaster,
            order_ids: OrderIdGenerator::new(),
            unsaved: Mutex::new(HashSet::new()),
            price_events: AtomicU64::new(0),
            automatic_sells: AtomicU64::new(0),
        }
    }

    pub fn multiplexer(&self) -> &Arc<StreamMultiplexer> {
        &self.multiplexer
    }

    pub fn broadcaster(&self) -> &Arc<UpdateBroadcaster> {
        &self.broadcaster
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Registers a trade in `New`, subscribes its symbol and persists it.
    pub async fn add_new_trade(&self, mut trade: Trade) -> Result<LocalId, AppError> {
        if trade.symbol.is_empty() {
            return Err(AppError::Validation("symbol must not be empty".into()));
        }
        if trade.status() != TradeStatus::New {
            return Err(AppError::Validation(format!(
                "new trades must start in NEW, got {}",
                trade.status()
            )));
        }
        if trade.limit_sell.enabled {
            validate_limit_sell(&trade)?;
        }
        if trade.stop_loss.enabled {
            validate_percent("stop loss percent", trade.stop_loss.percent)?;
        }
        if trade.trailing_profit.enabled {
            validate_trailing(
                trade.trailing_profit.activation_percent,
                trade.trailing_profit.deviation_percent,
            )?;
        }
        if self.registry.get(&trade.local_id).await.is_some() {
            return Err(AppError::Validation(format!("trade {} already exists", trade.local_id)));
        }

        let id = trade.local_id;
        trade.add_history(HistoryKind::Created {
            symbol: trade.symbol.clone(),
        });
        let slot = self.registry.insert(trade).await;
        self.multiplexer.subscribe_symbol(&slot.symbol).await;

        let trade = slot.lock().await;
        self.commit(&trade).await;
        info!(trade_id = %id, symbol = %trade.symbol, "🆕 Trade registered");
        Ok(id)
    }

    /// The argument checks of [`post_buy`](Self::post_buy), for callers that
    /// want to fail before a trade is registered.
    pub fn validate_buy(price: f64, quantity: f64) -> Result<(), AppError> {
        validate_positive("buy price", price)?;
        validate_positive("quantity", quantity)
    }

    /// Process-unique client order id.
    pub fn make_order_id(&self) -> String {
        self.order_ids.next_id()
    }

    /// Submits the limit buy. Accepted → `PendingBuy`; any exchange error →
    /// `Failed`, with the error returned as-is.
    pub async fn post_buy(&self, id: LocalId, price: f64, quantity: f64) -> Result<Trade, AppError> {
        let slot = self.slot(&id, "post buy").await?;
        let mut trade = slot.lock().await;
        require(&trade, "post buy", &[TradeStatus::New])?;
        Self::validate_buy(price, quantity)?;

        let cid = self.register_order_id(&mut trade).await;
        let params = OrderParams::limit_buy(&trade.symbol, quantity, price, cid.clone());

        match self.exchange.place_order(&params).await {
            Ok(ack) => {
                trade.buy_order = Some(BuyOrder {
                    client_order_id: cid.clone(),
                    price,
                    quantity,
                    filled_quantity: 0.0,
                    fill_price: None,
                    filled: false,
                });
                trade.add_history(HistoryKind::BuyPosted {
                    client_order_id: cid.clone(),
                    price,
                    quantity,
                });
                self.transition(&mut trade, TradeStatus::PendingBuy, "post buy").await?;
                info!(
                    trade_id          = %id,
                    symbol            = %trade.symbol,
                    client_order_id   = %cid,
                    exchange_order_id = ?ack.exchange_order_id,
                    price,
                    quantity,
                    "🛒 Buy order posted"
                );
                self.commit(&trade).await;
                Ok(trade.clone())
            }
            Err(e) => {
                error!(trade_id = %id, client_order_id = %cid, error = %e, "Buy order failed");
                trade.add_history(HistoryKind::BuyRejected { error: e.to_string() });
                self.transition(&mut trade, TradeStatus::Failed, "post buy").await?;
                self.commit(&trade).await;
                Err(e.into())
            }
        }
    }

    /// Asks the exchange to cancel the resting buy. The trade becomes
    /// `Abandoned` when the exchange confirms the cancel.
    pub async fn cancel_buy(&self, id: LocalId) -> Result<Trade, AppError> {
        let slot = self.slot(&id, "cancel buy").await?;
        let mut trade = slot.lock().await;
        require(&trade, "cancel buy", &[TradeStatus::PendingBuy])?;

        let cid = buy_order_id(&trade)?;
        self.exchange.cancel_order(&trade.symbol, &cid).await?;

        trade.add_history(HistoryKind::BuyCancelRequested { client_order_id: cid.clone() });
        info!(trade_id = %id, client_order_id = %cid, "Buy cancel requested");
        self.commit(&trade).await;
        Ok(trade.clone())
    }

    pub async fn set_limit_sell_by_percent(&self, id: LocalId, percent: f64) -> Result<Trade, AppError> {
        validate_positive("limit sell percent", percent)?;
        self.update_limit_sell(id, |trade| trade.set_limit_sell_by_percent(percent))
            .await
    }

    pub async fn set_limit_sell_by_price(&self, id: LocalId, price: f64) -> Result<Trade, AppError> {
        validate_positive("limit sell price", price)?;
        self.update_limit_sell(id, |trade| trade.set_limit_sell_by_price(price))
            .await
    }

    /// Before a fill the config is stored as a pending instruction. After a
    /// fill the outstanding sell (if any) is cancelled and a new limit sell is
    /// posted at the target.
    async fn update_limit_sell(
        &self,
        id: LocalId,
        apply: impl FnOnce(&mut Trade),
    ) -> Result<Trade, AppError> {
        let slot = self.slot(&id, "set limit sell").await?;
        let mut trade = slot.lock().await;
        require(
            &trade,
            "set limit sell",
            &[
                TradeStatus::New,
                TradeStatus::PendingBuy,
                TradeStatus::Open,
                TradeStatus::PendingSell,
            ],
        )?;

        let result = match trade.status() {
            TradeStatus::New | TradeStatus::PendingBuy => {
                apply(&mut *trade);
                Ok(())
            }
            TradeStatus::Open => {
                apply(&mut *trade);
                self.post_limit_sell(&mut trade).await
            }
            _ => {
                self.cancel_outstanding_sell(&mut trade, "set limit sell").await?;
                apply(&mut *trade);
                self.post_limit_sell(&mut trade).await
            }
        };

        self.commit(&trade).await;
        result.map(|_| trade.clone())
    }

    /// Drops a pending limit-sell instruction. Nothing is sent to the exchange.
    pub async fn disable_limit_sell(&self, id: LocalId) -> Result<Trade, AppError> {
        let slot = self.slot(&id, "disable limit sell").await?;
        let mut trade = slot.lock().await;
        require(
            &trade,
            "disable limit sell",
            &[TradeStatus::New, TradeStatus::PendingBuy, TradeStatus::Open],
        )?;

        trade.disable_limit_sell();
        self.commit(&trade).await;
        Ok(trade.clone())
    }

    /// Immediate market sell of the whole position. Requires `Open`.
    pub async fn market_sell(&self, id: LocalId, trigger: SellTrigger) -> Result<Trade, AppError> {
        let slot = self.slot(&id, "market sell").await?;
        let mut trade = slot.lock().await;
        require(&trade, "market sell", &[TradeStatus::Open])?;

        let result = self.submit_sell(&mut trade, trigger, None).await;
        self.commit(&trade).await;
        result.map(|_| trade.clone())
    }

    /// Market sell fired by the dispatch loop. A trade that left `Open` in
    /// the meantime is left alone.
    pub async fn auto_sell(&self, id: LocalId, trigger: SellTrigger) -> Result<Option<Trade>, AppError> {
        let slot = self.slot(&id, "sell").await?;
        let mut trade = slot.lock().await;
        trade.exit_in_flight = false;

        if trade.status() != TradeStatus::Open {
            debug!(trade_id = %id, status = %trade.status(), ?trigger, "Automatic sell skipped");
            return Ok(None);
        }

        let result = self.submit_sell(&mut trade, trigger, None).await;
        if result.is_ok() {
            self.automatic_sells.fetch_add(1, Ordering::Relaxed);
        }
        self.commit(&trade).await;
        result.map(|_| Some(trade.clone()))
    }

    /// Cancels the outstanding sell; the trade goes back to `Open`.
    pub async fn cancel_sell(&self, id: LocalId) -> Result<Trade, AppError> {
        let slot = self.slot(&id, "cancel sell").await?;
        let mut trade = slot.lock().await;
        require(&trade, "cancel sell", &[TradeStatus::PendingSell])?;

        self.cancel_outstanding_sell(&mut trade, "cancel sell").await?;
        self.commit(&trade).await;
        Ok(trade.clone())
    }

    pub async fn update_stop_loss(&self, id: LocalId, enabled: bool, percent: f64) -> Result<Trade, AppError> {
        if enabled {
            validate_percent("stop loss percent", percent)?;
        }
        let slot = self.slot(&id, "update stop loss").await?;
        let mut trade = slot.lock().await;
        require_not_terminal(&trade, "update stop loss")?;

        trade.set_stop_loss(enabled, percent);
        self.commit(&trade).await;
        Ok(trade.clone())
    }

    pub async fn update_trailing_profit(
        &self,
        id: LocalId,
        enabled: bool,
        activation_percent: f64,
        deviation_percent: f64,
    ) -> Result<Trade, AppError> {
        if enabled {
            validate_trailing(activation_percent, deviation_percent)?;
        }
        let slot = self.slot(&id, "update trailing profit").await?;
        let mut trade = slot.lock().await;
        require_not_terminal(&trade, "update trailing profit")?;

        trade.set_trailing_profit(enabled, activation_percent, deviation_percent);
        self.commit(&trade).await;
        Ok(trade.clone())
    }

    /// Gives up on a trade that never bought anything. A resting buy is
    /// cancelled first; an exchange that no longer knows the order is fine.
    pub async fn abandon_trade(&self, id: LocalId) -> Result<Trade, AppError> {
        let Some(slot) = self.registry.get(&id).await else {
            let trade = self.find_trade_by_local_id(id).await?;
            return match trade.status() {
                TradeStatus::Abandoned => Ok(trade),
                status => Err(AppError::InvalidState { op: "abandon", status }),
            };
        };
        let mut trade = slot.lock().await;
        if trade.status() == TradeStatus::Abandoned {
            return Ok(trade.clone());
        }
        require(
            &trade,
            "abandon",
            &[TradeStatus::New, TradeStatus::PendingBuy, TradeStatus::Failed],
        )?;

        if trade.status() == TradeStatus::PendingBuy {
            let cid = buy_order_id(&trade)?;
            match self.exchange.cancel_order(&trade.symbol, &cid).await {
                Ok(()) => trade.add_history(HistoryKind::BuyCancelRequested { client_order_id: cid }),
                Err(e) if e.is_client_error() => {
                    warn!(trade_id = %id, error = %e, "Buy order already gone at the exchange");
                }
                Err(e) => return Err(e.into()),
            }
        }

        trade.add_history(HistoryKind::Abandoned);
        self.transition(&mut trade, TradeStatus::Abandoned, "abandon").await?;
        info!(trade_id = %id, "Trade abandoned");
        self.commit(&trade).await;
        Ok(trade.clone())
    }

    /// Administrative close. Repeating it on a finished trade changes nothing.
    pub async fn archive_trade(&self, id: LocalId) -> Result<Trade, AppError> {
        // only settled trades leave memory, and archiving those is a no-op
        let Some(slot) = self.registry.get(&id).await else {
            return self.find_trade_by_local_id(id).await;
        };
        let mut trade = slot.lock().await;
        if trade.status().is_terminal() {
            return Ok(trade.clone());
        }
        require(&trade, "archive", &[TradeStatus::PendingBuy, TradeStatus::Open])?;

        trade.archived_at = Some(Utc::now());
        trade.add_history(HistoryKind::Archived);
        self.transition(&mut trade, TradeStatus::Closed, "archive").await?;
        info!(trade_id = %id, "🗄️ Trade archived");
        self.commit(&trade).await;
        Ok(trade.clone())
    }

    // ── Queries ───────────────────────────────────────────────────────────────

    /// Registry first, then the store. `NotFound` when neither has it.
    pub async fn find_trade_by_local_id(&self, id: LocalId) -> Result<Trade, AppError> {
        if let Some(slot) = self.registry.get(&id).await {
            return Ok(slot.snapshot().await);
        }
        self.store
            .get(&id)
            .await?
            .ok_or_else(|| AppError::trade_not_found(id))
    }

    pub async fn active_trades(&self) -> Vec<Trade> {
        let mut trades = Vec::new();
        for slot in self.registry.active().await {
            let trade = slot.snapshot().await;
            if !trade.status().is_terminal() {
                trades.push(trade);
            }
        }
        trades.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        trades
    }

    /// Store results overlaid with the registry, which wins for any trade it
    /// holds.
    pub async fn query_trades(&self, filter: TradeFilter) -> Result<Vec<Trade>, AppError> {
        if filter == TradeFilter::Active {
            return Ok(self.active_trades().await);
        }

        let mut merged: HashMap<LocalId, Trade> = self
            .store
            .query(filter)
            .await?
            .into_iter()
            .map(|t| (t.local_id, t))
            .collect();
        for slot in self.registry.all().await {
            let trade = slot.snapshot().await;
            if filter.matches(&trade) {
                merged.insert(trade.local_id, trade);
            } else {
                merged.remove(&trade.local_id);
            }
        }

        let mut trades: Vec<Trade> = merged.into_values().collect();
        trades.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(trades)
    }

    pub async fn last_price(&self, symbol: &str) -> Result<f64, AppError> {
        Ok(self.exchange.last_price(symbol).await?)
    }

    pub async fn book_ticker(&self, symbol: &str) -> Result<BookTicker, AppError> {
        Ok(self.exchange.book_ticker(symbol).await?)
    }

    pub async fn stats(&self) -> EngineStats {
        EngineStats {
            trades:             self.registry.len().await,
            active_trades:      self.active_trades().await.len(),
            unsaved_trades:     self.unsaved.lock().await.len(),
            price_events:       self.price_events.load(Ordering::Relaxed),
            automatic_sells:    self.automatic_sells.load(Ordering::Relaxed),
            subscribed_symbols: self.multiplexer.subscribed_symbols().await,
            observers:          self.broadcaster.observer_count().await,
        }
    }

    // ── Exchange Feedback ─────────────────────────────────────────────────────

    /// Applies an asynchronous fill/cancel/reject report. Updates for ids this
    /// process never issued return `Ok(None)`.
    pub async fn apply_order_update(&self, update: OrderUpdate) -> Result<Option<Trade>, AppError> {
        let Some(slot) = self.registry.find_by_client_order_id(&update.client_order_id).await else {
            warn!(
                client_order_id = %update.client_order_id,
                symbol          = %update.symbol,
                "Order update for unknown client order id, ignored"
            );
            return Ok(None);
        };
        let mut trade = slot.lock().await;

        let cid = update.client_order_id.as_str();
        let role = if trade.buy_order.as_ref().is_some_and(|o| o.client_order_id == cid) {
            OrderRole::Buy
        } else if trade.sell_order.as_ref().is_some_and(|o| o.client_order_id == cid) {
            OrderRole::Sell
        } else {
            OrderRole::Stale
        };
        let status = trade.status();

        match (role, update.kind.clone()) {
            (OrderRole::Buy, OrderUpdateKind::Filled { price, quantity })
                if status == TradeStatus::PendingBuy =>
            {
                if let Some(order) = trade.buy_order.as_mut() {
                    order.fill_price = Some(price);
                    order.filled_quantity = quantity;
                    order.filled = true;
                }
                trade.add_history(HistoryKind::BuyFilled { price, quantity });
                self.transition(&mut trade, TradeStatus::Open, "fill buy").await?;
                info!(trade_id = %trade.local_id, price, quantity, "✅ Buy filled, position open");

                if trade.limit_sell.enabled {
                    if let Err(e) = self.post_limit_sell(&mut trade).await {
                        warn!(trade_id = %trade.local_id, error = %e, "Pending limit sell could not be posted");
                    }
                }
            }
            (OrderRole::Buy, OrderUpdateKind::PartiallyFilled { price, quantity })
                if status == TradeStatus::PendingBuy =>
            {
                if let Some(order) = trade.buy_order.as_mut() {
                    order.fill_price = Some(price);
                    order.filled_quantity = quantity;
                }
                trade.add_history(HistoryKind::BuyPartiallyFilled { price, quantity });
            }
            (OrderRole::Buy, OrderUpdateKind::Cancelled) if status == TradeStatus::PendingBuy => {
                trade.add_history(HistoryKind::BuyCancelled {
                    client_order_id: update.client_order_id.clone(),
                });
                self.transition(&mut trade, TradeStatus::Abandoned, "cancel buy").await?;
                info!(trade_id = %trade.local_id, "Buy cancelled, trade abandoned");
            }
            (OrderRole::Buy, OrderUpdateKind::Rejected { reason })
                if status == TradeStatus::PendingBuy =>
            {
                trade.add_history(HistoryKind::BuyRejected { error: reason });
                self.transition(&mut trade, TradeStatus::Failed, "reject buy").await?;
            }
            (OrderRole::Buy, OrderUpdateKind::Cancelled) if status == TradeStatus::Abandoned => {
                debug!(trade_id = %trade.local_id, "Cancel confirmation for abandoned trade");
                return Ok(Some(trade.clone()));
            }

            (OrderRole::Sell, OrderUpdateKind::Filled { price, quantity })
                if status == TradeStatus::PendingSell =>
            {
                if let Some(order) = trade.sell_order.as_mut() {
                    order.unconfirmed = false;
                }
                trade.sell_price = Some(price);
                trade.profit_percent = trade
                    .buy_price()
                    .filter(|buy| *buy > 0.0)
                    .map(|buy| (price - buy) / buy * 100.0);
                trade.add_history(HistoryKind::SellFilled { price, quantity });
                self.transition(&mut trade, TradeStatus::Closed, "fill sell").await?;
                info!(
                    trade_id       = %trade.local_id,
                    price,
                    profit_percent = ?trade.profit_percent,
                    "💰 Sell filled, trade closed"
                );
            }
            (OrderRole::Sell, OrderUpdateKind::PartiallyFilled { price, quantity })
                if status == TradeStatus::PendingSell =>
            {
                if let Some(order) = trade.sell_order.as_mut() {
                    order.unconfirmed = false;
                }
                trade.add_history(HistoryKind::SellPartiallyFilled { price, quantity });
            }
            (OrderRole::Sell, OrderUpdateKind::Cancelled) if status == TradeStatus::PendingSell => {
                trade.sell_order = None;
                trade.add_history(HistoryKind::SellCancelled {
                    client_order_id: update.client_order_id.clone(),
                });
                self.transition(&mut trade, TradeStatus::Open, "cancel sell").await?;
            }
            (OrderRole::Sell, OrderUpdateKind::Rejected { reason })
                if status == TradeStatus::PendingSell =>
            {
                let trigger = trade
                    .sell_order
                    .take()
                    .map(|o| o.trigger)
                    .unwrap_or(SellTrigger::Manual);
                trade.add_history(HistoryKind::SellRejected { trigger, error: reason });
                self.transition(&mut trade, TradeStatus::Open, "reject sell").await?;
            }

            (OrderRole::Stale, OrderUpdateKind::Cancelled) => {
                debug!(trade_id = %trade.local_id, client_order_id = %cid, "Cancel confirmation for replaced order");
                return Ok(Some(trade.clone()));
            }
            (_, kind) => {
                warn!(
                    trade_id        = %trade.local_id,
                    client_order_id = %cid,
                    status          = %status,
                    ?kind,
                    "Order update does not fit the trade's state"
                );
                trade.add_history(HistoryKind::UnmatchedOrderUpdate {
                    client_order_id: update.client_order_id.clone(),
                    detail:          format!("{kind:?} while {status}"),
                });
            }
        }

        self.commit(&trade).await;
        Ok(Some(trade.clone()))
    }

    // ── Price Ticks ───────────────────────────────────────────────────────────

    /// Evaluates exits for every open trade on the event's symbol. Never
    /// waits: a trade busy with another operation queues the price for a
    /// catch-up pass, and order actions are returned for the caller to run
    /// elsewhere.
    pub async fn on_market_trade(&self, event: &MarketTrade) -> TickOutcome {
        self.price_events.fetch_add(1, Ordering::Relaxed);
        let mut outcome = TickOutcome::default();

        for slot in self.registry.for_symbol(&event.symbol).await {
            let Some(mut trade) = slot.try_lock() else {
                if slot.defer_price(event.price) {
                    outcome.deferred.push(slot.local_id);
                }
                debug!(trade_id = %slot.local_id, price = event.price, "Trade busy, price deferred");
                continue;
            };

            // anything queued while the trade was busy came first
            let mut prices = slot.take_deferred();
            prices.push(event.price);
            let eval = evaluate_prices(&mut trade, &prices);

            if eval.armed {
                outcome.persist.push(slot.local_id);
            }
            if let Some(trigger) = eval.trigger {
                trade.exit_in_flight = true;
                outcome.sells.push((slot.local_id, trigger));
            }
        }
        outcome
    }

    /// Catch-up for prices a busy trade queued. Runs them in arrival order
    /// and, when one of them hits an exit, sells right away under the same
    /// lock.
    pub async fn apply_deferred_prices(&self, id: LocalId) -> Result<Option<Trade>, AppError> {
        let Some(slot) = self.registry.get(&id).await else {
            return Ok(None);
        };
        let mut trade = slot.lock().await;
        let prices = slot.take_deferred();
        if prices.is_empty() {
            return Ok(None);
        }

        let eval = evaluate_prices(&mut trade, &prices);
        let result = match eval.trigger {
            Some(trigger) => {
                let result = self.submit_sell(&mut trade, trigger, None).await;
                if result.is_ok() {
                    self.automatic_sells.fetch_add(1, Ordering::Relaxed);
                }
                result
            }
            None => Ok(()),
        };
        if eval.armed || eval.trigger.is_some() {
            self.commit(&trade).await;
        }
        debug!(trade_id = %id, prices = prices.len(), "Deferred prices applied");
        result.map(|_| Some(trade.clone()))
    }

    /// Saves and broadcasts the current state of one trade.
    pub async fn persist(&self, id: LocalId) -> Result<(), AppError> {
        let slot = self.slot(&id, "persist").await?;
        let trade = slot.lock().await;
        self.commit(&trade).await;
        Ok(())
    }

    // ── Persistence ───────────────────────────────────────────────────────────

    /// Loads non-terminal trades from the store and resubscribes their symbols.
    pub async fn restore(&self) -> Result<usize, AppError> {
        let mut restored = 0;
        for trade in self.store.query(TradeFilter::Active).await? {
            if self.registry.get(&trade.local_id).await.is_some() {
                continue;
            }
            let slot = self.registry.insert(trade).await;
            self.multiplexer.subscribe_symbol(&slot.symbol).await;
            restored += 1;
        }
        if restored > 0 {
            info!(restored, "♻️ Active trades restored from store");
        }
        Ok(restored)
    }

    /// Re-saves trades whose last save failed. Never touches the exchange.
    pub async fn reconcile_unsaved(&self) -> usize {
        let pending: Vec<LocalId> = self.unsaved.lock().await.iter().copied().collect();
        let mut saved = 0;

        for id in pending {
            let Some(slot) = self.registry.get(&id).await else {
                self.unsaved.lock().await.remove(&id);
                continue;
            };
            let trade = slot.lock().await;
            match self.store.save(&trade).await {
                Ok(()) => {
                    self.unsaved.lock().await.remove(&id);
                    saved += 1;
                    info!(trade_id = %id, "Trade persisted by reconciliation");
                }
                Err(e) => warn!(trade_id = %id, error = %e, "Reconciliation save failed again"),
            }
        }
        saved
    }

    /// Drops settled trades from memory once they are saved and have been
    /// terminal for at least `retention`. The store still answers for them.
    pub async fn prune_settled(&self, retention: Duration) -> usize {
        let unsaved = self.unsaved.lock().await.clone();
        let evicted = self.registry.evict_settled(retention, &unsaved).await;
        if !evicted.is_empty() {
            debug!(evicted = evicted.len(), "Settled trades released from memory");
        }
        evicted.len()
    }

    pub async fn unsaved_count(&self) -> usize {
        self.unsaved.lock().await.len()
    }

    pub async fn shutdown(&self) {
        self.multiplexer.shutdown().await;
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    /// The live slot for `id`. A trade that already left memory is settled,
    /// so `op` is refused with its stored status.
    async fn slot(&self, id: &LocalId, op: &'static str) -> Result<TradeHandle, AppError> {
        if let Some(slot) = self.registry.get(id).await {
            return Ok(slot);
        }
        match self.store.get(id).await? {
            Some(trade) => Err(AppError::InvalidState {
                op,
                status: trade.status(),
            }),
            None => Err(AppError::trade_not_found(id)),
        }
    }

    async fn register_order_id(&self, trade: &mut Trade) -> String {
        let cid = self.make_order_id();
        trade.add_client_order_id(cid.clone());
        self.registry.index_order(&cid, trade.local_id).await;
        cid
    }

    /// The one place status changes, so the side effects tied to particular
    /// edges cannot be skipped.
    async fn transition(&self, trade: &mut Trade, to: TradeStatus, op: &'static str) -> Result<(), AppError> {
        let from = trade.status();
        trade.transition(to, op)?;

        if from == TradeStatus::PendingBuy && to == TradeStatus::Open {
            trade.trailing = TrailingState::default();
        }
        if to == TradeStatus::Open {
            // prices queued before the position (re)opened do not apply to it
            if let Some(slot) = self.registry.get(&trade.local_id).await {
                let dropped = slot.take_deferred();
                if !dropped.is_empty() {
                    debug!(trade_id = %trade.local_id, dropped = dropped.len(), "Deferred prices discarded");
                }
            }
        }
        if !from.is_terminal() && to.is_terminal() {
            self.registry.retire(trade.local_id, &trade.symbol).await;
            self.multiplexer.unsubscribe_symbol(&trade.symbol).await;
        }
        debug!(trade_id = %trade.local_id, %from, %to, op, "Trade status changed");
        Ok(())
    }

    async fn post_limit_sell(&self, trade: &mut Trade) -> Result<(), AppError> {
        let target = trade.limit_sell_target().ok_or_else(|| {
            AppError::Validation("limit sell target needs a buy price".into())
        })?;
        self.submit_sell(trade, SellTrigger::LimitSell, Some(target)).await
    }

    /// Places a sell for the whole position: a limit order at `limit`, or a
    /// market order when `None`. Success moves the trade to `PendingSell`; a
    /// 4xx rejection leaves it `Open` with the rejection in history.
    ///
    /// An ambiguous failure (5xx, timeout, unreadable answer) may still have
    /// placed the order, so the trade moves to `PendingSell` with the order
    /// marked unconfirmed and the error is returned. A later fill closes the
    /// trade as usual; no second sell can fire in the meantime.
    async fn submit_sell(
        &self,
        trade: &mut Trade,
        trigger: SellTrigger,
        limit: Option<f64>,
    ) -> Result<(), AppError> {
        require(trade, "sell", &[TradeStatus::Open])?;

        let quantity = trade.sell_quantity();
        let cid = self.register_order_id(trade).await;
        let params = match limit {
            Some(price) => OrderParams::limit_sell(&trade.symbol, quantity, price, cid.clone()),
            None => OrderParams::market_sell(&trade.symbol, quantity, cid.clone()),
        };

        match self.exchange.place_order(&params).await {
            Ok(ack) => {
                trade.sell_order = Some(SellOrder {
                    client_order_id: cid.clone(),
                    price: limit,
                    quantity,
                    trigger,
                    posted_at: Utc::now(),
                    unconfirmed: false,
                });
                trade.add_history(HistoryKind::SellPosted {
                    client_order_id: cid.clone(),
                    trigger,
                    automatic: trigger.is_automatic(),
                    price: limit,
                    market_price: trade.last_price,
                });
                self.transition(trade, TradeStatus::PendingSell, "sell").await?;
                info!(
                    trade_id          = %trade.local_id,
                    client_order_id   = %cid,
                    exchange_order_id = ?ack.exchange_order_id,
                    ?trigger,
                    price             = ?limit,
                    quantity,
                    "📤 Sell order posted"
                );
                Ok(())
            }
            Err(e) if e.is_ambiguous() => {
                warn!(
                    trade_id        = %trade.local_id,
                    client_order_id = %cid,
                    ?trigger,
                    error           = %e,
                    "Sell order outcome unknown, waiting for the exchange"
                );
                trade.sell_order = Some(SellOrder {
                    client_order_id: cid.clone(),
                    price: limit,
                    quantity,
                    trigger,
                    posted_at: Utc::now(),
                    unconfirmed: true,
                });
                trade.add_history(HistoryKind::SellUnconfirmed {
                    client_order_id: cid,
                    trigger,
                    error: e.to_string(),
                });
                self.transition(trade, TradeStatus::PendingSell, "sell").await?;
                Err(e.into())
            }
            Err(e) => {
                error!(trade_id = %trade.local_id, ?trigger, error = %e, "Sell order failed");
                trade.add_history(HistoryKind::SellRejected {
                    trigger,
                    error: e.to_string(),
                });
                Err(e.into())
            }
        }
    }

    async fn cancel_outstanding_sell(&self, trade: &mut Trade, op: &'static str) -> Result<(), AppError> {
        let (cid, unconfirmed) = trade
            .sell_order
            .as_ref()
            .map(|o| (o.client_order_id.clone(), o.unconfirmed))
            .ok_or_else(|| AppError::Internal(anyhow!("trade {} has no sell order", trade.local_id)))?;

        match self.exchange.cancel_order(&trade.symbol, &cid).await {
            Ok(()) => {}
            Err(e) if unconfirmed && e.is_client_error() => {
                warn!(
                    trade_id        = %trade.local_id,
                    client_order_id = %cid,
                    error           = %e,
                    "Unconfirmed sell unknown to the exchange, dropping it"
                );
            }
            Err(e) => return Err(e.into()),
        }

        trade.sell_order = None;
        trade.add_history(HistoryKind::SellCancelled { client_order_id: cid.clone() });
        self.transition(trade, TradeStatus::Open, op).await?;
        info!(trade_id = %trade.local_id, client_order_id = %cid, "Sell order cancelled");
        Ok(())
    }

    /// Write-through save plus broadcast. A failed save never fails the
    /// operation: the trade is queued for reconciliation instead.
    async fn commit(&self, trade: &Trade) {
        match self.store.save(trade).await {
            Ok(()) => {
                self.unsaved.lock().await.remove(&trade.local_id);
            }
            Err(e) => {
                error!(trade_id = %trade.local_id, error = %e, "Trade save failed, queued for reconciliation");
                self.unsaved.lock().await.insert(trade.local_id);
            }
        }
        self.broadcaster.broadcast_trade_update(trade).await;
    }
}

// ─── Exit Evaluation ──────────────────────────────────────────────────────────

/// Runs `prices` through the trade's exit rules, oldest first. Stops at the
/// first trigger. Trades that are not `Open`, or already selling, ignore
/// every price.
fn evaluate_prices(trade: &mut Trade, prices: &[f64]) -> PriceOutcome {
    let mut outcome = PriceOutcome::default();
    if trade.status() != TradeStatus::Open || trade.exit_in_flight {
        return outcome;
    }
    let Some(buy_price) = trade.buy_price() else {
        return outcome;
    };
    let stop_loss = trade.stop_loss;
    let trailing_profit = trade.trailing_profit;

    for &price in prices {
        trade.last_price = Some(price);
        let eval = exits::evaluate(buy_price, price, &stop_loss, &trailing_profit, &mut trade.trailing);

        if eval.activated {
            trade.add_history(HistoryKind::TrailingProfitActivated { price });
            info!(trade_id = %trade.local_id, price, "📈 Trailing profit armed");
            outcome.armed = true;
        }
        if let Some(trigger) = eval.signal.trigger() {
            info!(
                trade_id  = %trade.local_id,
                symbol    = %trade.symbol,
                price,
                buy_price,
                signal    = ?eval.signal,
                "🚨 Exit condition hit, automatic sell"
            );
            outcome.trigger = Some(trigger);
            break;
        }
    }
    outcome
}

// ─── Validation ───────────────────────────────────────────────────────────────

fn require(trade: &Trade, op: &'static str, allowed: &[TradeStatus]) -> Result<(), AppError> {
    if allowed.contains(&trade.status()) {
        Ok(())
    } else {
        Err(AppError::InvalidState {
            op,
            status: trade.status(),
        })
    }
}

fn require_not_terminal(trade: &Trade, op: &'static str) -> Result<(), AppError> {
    if trade.status().is_terminal() {
        Err(AppError::InvalidState {
            op,
            status: trade.status(),
        })
    } else {
        Ok(())
    }
}

fn buy_order_id(trade: &Trade) -> Result<String, AppError> {
    trade
        .buy_order
        .as_ref()
        .map(|o| o.client_order_id.clone())
        .ok_or_else(|| AppError::Internal(anyhow!("trade {} has no buy order", trade.local_id)))
}

fn validate_positive(name: &str, value: f64) -> Result<(), AppError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(AppError::Validation(format!("{name} must be a positive number, got {value}")))
    }
}

fn validate_percent(name: &str, value: f64) -> Result<(), AppError> {
    if value.is_finite() && value > 0.0 && value < 100.0 {
        Ok(())
    } else {
        Err(AppError::Validation(format!("{name} must be between 0 and 100, got {value}")))
    }
}

fn validate_trailing(activation_percent: f64, deviation_percent: f64) -> Result<(), AppError> {
    validate_positive("trailing profit activation percent", activation_percent)?;
    validate_percent("trailing profit deviation percent", deviation_percent)
}

fn validate_limit_sell(trade: &Trade) -> Result<(), AppError> {
    match trade.limit_sell.kind {
        crate::models::LimitSellType::Percent => {
            validate_positive("limit sell percent", trade.limit_sell.percent)
        }
        crate::models::LimitSellType::Price => {
            validate_positive("limit sell price", trade.limit_sell.price)
        }
    }
}
