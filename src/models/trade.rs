//! # models::trade
//!
//! Defines [`Trade`]: the aggregate that follows one buy-then-sell position
//! from creation to a terminal state.
//!
//! ## State diagram
//! ```text
//! New ──buy accepted──▶ PendingBuy ──buy filled──▶ Open ──sell posted──▶ PendingSell ──sell filled──▶ Closed
//!  │                      │   │                      ▲  │                   │
//!  │                      │   └─cancelled/failed─▶ Abandoned / Failed       │
//!  │                      │                          │  └────archive──▶ Closed
//!  └─rejected─▶ Failed    └────archive──▶ Closed     └──────sell cancelled──┘
//! ```
//!
//! `status` is private: every change goes through [`Trade::transition`], which
//! rejects edges that are not on the diagram.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

/// Process-assigned identifier of a trade.
pub type LocalId = Uuid;

// ─── TradeStatus ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeStatus {
    New,
    PendingBuy,
    Open,
    PendingSell,
    Closed,
    Abandoned,
    Failed,
}

impl TradeStatus {
    pub const ALL: [TradeStatus; 7] = [
        TradeStatus::New,
        TradeStatus::PendingBuy,
        TradeStatus::Open,
        TradeStatus::PendingSell,
        TradeStatus::Closed,
        TradeStatus::Abandoned,
        TradeStatus::Failed,
    ];

    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TradeStatus::Closed | TradeStatus::Abandoned | TradeStatus::Failed
        )
    }

    /// The complete edge list of the trade state machine.
    pub fn can_transition_to(self, next: TradeStatus) -> bool {
        use TradeStatus::*;
        matches!(
            (self, next),
            (New, PendingBuy)
                | (New, Failed)
                | (New, Abandoned)
                | (PendingBuy, Open)
                | (PendingBuy, Abandoned)
                | (PendingBuy, Failed)
                | (PendingBuy, Closed)
                | (Open, PendingSell)
                | (Open, Closed)
                | (PendingSell, Closed)
                | (PendingSell, Open)
                | (Failed, Abandoned)
        )
    }
}

impl std::fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TradeStatus::New => "NEW",
            TradeStatus::PendingBuy => "PENDING_BUY",
            TradeStatus::Open => "OPEN",
            TradeStatus::PendingSell => "PENDING_SELL",
            TradeStatus::Closed => "CLOSED",
            TradeStatus::Abandoned => "ABANDONED",
            TradeStatus::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

// ─── Orders ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuyOrder {
    pub client_order_id: String,
    /// Limit price the order was posted at.
    pub price:           f64,
    pub quantity:        f64,
    pub filled_quantity: f64,
    /// Average fill price reported by the exchange.
    pub fill_price:      Option<f64>,
    pub filled:          bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SellTrigger {
    Manual,
    LimitSell,
    StopLoss,
    TrailingProfit,
}

impl SellTrigger {
    pub fn is_automatic(self) -> bool {
        matches!(self, SellTrigger::StopLoss | SellTrigger::TrailingProfit)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SellOrder {
    pub client_order_id: String,
    /// `None` for market orders.
    pub price:           Option<f64>,
    pub quantity:        f64,
    pub trigger:         SellTrigger,
    pub posted_at:       DateTime<Utc>,
    /// The exchange never acknowledged the order: it may or may not exist
    /// until an order update for it arrives.
    #[serde(default)]
    pub unconfirmed:     bool,
}

// ─── Exit Configuration ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LimitSellType {
    Percent,
    Price,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LimitSellConfig {
    pub enabled: bool,
    #[serde(rename = "type")]
    pub kind:    LimitSellType,
    pub percent: f64,
    pub price:   f64,
}

impl Default for LimitSellConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            kind:    LimitSellType::Percent,
            percent: 0.0,
            price:   0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct StopLossConfig {
    pub enabled: bool,
    /// Percent below the buy price that triggers a market sell.
    pub percent: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TrailingProfitConfig {
    pub enabled:            bool,
    pub activation_percent: f64,
    pub deviation_percent:  f64,
}

/// Peak tracker for trailing profit. Reset only when the trade reaches `Open`
/// from `PendingBuy`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TrailingState {
    pub activated: bool,
    pub peak:      Option<f64>,
}

// ─── History ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HistoryKind {
    Created { symbol: String },
    StatusChanged { from: TradeStatus, to: TradeStatus },
    BuyPosted { client_order_id: String, price: f64, quantity: f64 },
    BuyRejected { error: String },
    BuyFilled { price: f64, quantity: f64 },
    BuyPartiallyFilled { price: f64, quantity: f64 },
    BuyCancelRequested { client_order_id: String },
    BuyCancelled { client_order_id: String },
    LimitSellUpdated { config: LimitSellConfig },
    SellPosted {
        client_order_id: String,
        trigger:         SellTrigger,
        automatic:       bool,
        price:           Option<f64>,
        market_price:    Option<f64>,
    },
    SellRejected { trigger: SellTrigger, error: String },
    SellUnconfirmed { client_order_id: String, trigger: SellTrigger, error: String },
    SellCancelled { client_order_id: String },
    SellPartiallyFilled { price: f64, quantity: f64 },
    SellFilled { price: f64, quantity: f64 },
    StopLossUpdated { config: StopLossConfig },
    TrailingProfitUpdated { config: TrailingProfitConfig },
    TrailingProfitActivated { price: f64 },
    UnmatchedOrderUpdate { client_order_id: String, detail: String },
    Archived,
    Abandoned,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind:      HistoryKind,
}

// ─── Trade ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub local_id: LocalId,
    pub symbol:   String,
    status:       TradeStatus,

    /// Every client order id ever used by this trade, in order of creation.
    client_order_ids: Vec<String>,

    pub buy_order:  Option<BuyOrder>,
    /// The single outstanding sell order, if any.
    pub sell_order: Option<SellOrder>,

    pub limit_sell:      LimitSellConfig,
    pub stop_loss:       StopLossConfig,
    pub trailing_profit: TrailingProfitConfig,
    pub trailing:        TrailingState,

    pub last_price:     Option<f64>,
    pub sell_price:     Option<f64>,
    pub profit_percent: Option<f64>,

    pub created_at:  DateTime<Utc>,
    pub updated_at:  DateTime<Utc>,
    pub closed_at:   Option<DateTime<Utc>>,
    pub archived_at: Option<DateTime<Utc>>,

    history: Vec<HistoryEntry>,

    /// Set by the price dispatch loop while an automatic sell it spawned has
    /// not yet run. Never persisted.
    #[serde(skip)]
    pub(crate) exit_in_flight: bool,
}

impl Trade {
    pub fn new(symbol: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            local_id:         Uuid::new_v4(),
            symbol:           symbol.into().trim().to_lowercase(),
            status:           TradeStatus::New,
            client_order_ids: Vec::new(),
            buy_order:        None,
            sell_order:       None,
            limit_sell:       LimitSellConfig::default(),
            stop_loss:        StopLossConfig::default(),
            trailing_profit:  TrailingProfitConfig::default(),
            trailing:         TrailingState::default(),
            last_price:       None,
            sell_price:       None,
            profit_percent:   None,
            created_at:       now,
            updated_at:       now,
            closed_at:        None,
            archived_at:      None,
            history:          Vec::new(),
            exit_in_flight:   false,
        }
    }

    #[inline]
    pub fn status(&self) -> TradeStatus {
        self.status
    }

    pub fn client_order_ids(&self) -> &[String] {
        &self.client_order_ids
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    pub fn has_client_order_id(&self, id: &str) -> bool {
        self.client_order_ids.iter().any(|existing| existing == id)
    }

    pub fn add_client_order_id(&mut self, id: impl Into<String>) {
        let id = id.into();
        if !self.has_client_order_id(&id) {
            self.client_order_ids.push(id);
        }
    }

    pub fn add_history(&mut self, kind: HistoryKind) {
        let now = Utc::now();
        self.updated_at = now;
        self.history.push(HistoryEntry { timestamp: now, kind });
    }

    /// Moves the trade along one edge of the state diagram.
    pub fn transition(&mut self, to: TradeStatus, op: &'static str) -> Result<(), AppError> {
        let from = self.status;
        if !from.can_transition_to(to) {
            return Err(AppError::InvalidState { op, status: from });
        }
        self.status = to;
        if to == TradeStatus::Closed {
            self.closed_at = Some(Utc::now());
        }
        self.add_history(HistoryKind::StatusChanged { from, to });
        Ok(())
    }

    /// Effective buy price: the fill price when known, otherwise the limit.
    pub fn buy_price(&self) -> Option<f64> {
        self.buy_order
            .as_ref()
            .map(|order| order.fill_price.unwrap_or(order.price))
    }

    /// Quantity a sell must cover.
    pub fn sell_quantity(&self) -> f64 {
        self.buy_order
            .as_ref()
            .map(|order| {
                if order.filled_quantity > 0.0 {
                    order.filled_quantity
                } else {
                    order.quantity
                }
            })
            .unwrap_or(0.0)
    }

    pub fn set_limit_sell_by_percent(&mut self, percent: f64) {
        self.limit_sell = LimitSellConfig {
            enabled: true,
            kind:    LimitSellType::Percent,
            percent,
            price:   0.0,
        };
        self.add_history(HistoryKind::LimitSellUpdated { config: self.limit_sell });
    }

    pub fn set_limit_sell_by_price(&mut self, price: f64) {
        self.limit_sell = LimitSellConfig {
            enabled: true,
            kind:    LimitSellType::Price,
            percent: 0.0,
            price,
        };
        self.add_history(HistoryKind::LimitSellUpdated { config: self.limit_sell });
    }

    pub fn disable_limit_sell(&mut self) {
        self.limit_sell.enabled = false;
        self.add_history(HistoryKind::LimitSellUpdated { config: self.limit_sell });
    }

    pub fn set_stop_loss(&mut self, enabled: bool, percent: f64) {
        self.stop_loss = StopLossConfig { enabled, percent };
        self.add_history(HistoryKind::StopLossUpdated { config: self.stop_loss });
    }

    pub fn set_trailing_profit(&mut self, enabled: bool, activation_percent: f64, deviation_percent: f64) {
        self.trailing_profit = TrailingProfitConfig {
            enabled,
            activation_percent,
            deviation_percent,
        };
        self.add_history(HistoryKind::TrailingProfitUpdated { config: self.trailing_profit });
    }

    /// Target price of the configured limit sell, relative to the buy price
    /// for percent targets.
    pub fn limit_sell_target(&self) -> Option<f64> {
        if !self.limit_sell.enabled {
            return None;
        }
        match self.limit_sell.kind {
            LimitSellType::Price => Some(self.limit_sell.price),
            LimitSellType::Percent => self
                .buy_price()
                .map(|buy| buy * (1.0 + self.limit_sell.percent / 100.0)),
        }
    }
}
