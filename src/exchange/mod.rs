//! # exchange
//!
//! The **Exchange Client** contract: everything the engine needs from an
//! exchange, nothing about its wire format.
//!
//! ```text
//!  open_trade_stream(symbol) ──▶ MarketStream ── next() ──▶ Ok(MarketTrade) | Err(read failure)
//!  place_order(params)       ──▶ OrderAck       (accepted, not yet filled)
//!  cancel_order(symbol, id)  ──▶ ()
//!  last_price(symbol)        ──▶ f64
//!  book_ticker(symbol)       ──▶ BookTicker { bid, ask }
//!
//!  fills / cancels arrive later, asynchronously, as OrderUpdate values
//! ```
//!
//! Implementations:
//! * [`paper::PaperExchange`]  : deterministic in-process exchange (dev mode + tests)
//! * [`bridge::BridgeExchange`]: REST bridge for orders, public WS for market data

pub mod bridge;
pub mod paper;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::MarketTrade;

pub use bridge::BridgeExchange;
pub use paper::PaperExchange;

// ─── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExchangeError {
    /// The exchange answered and said no. `body` is the raw response so the
    /// HTTP layer can forward it unmodified.
    #[error("exchange rejected request (HTTP {status}): {body}")]
    Rejected { status: u16, body: String },

    /// The exchange could not be reached or timed out.
    #[error("exchange unreachable: {0}")]
    Transport(String),

    /// The market-data stream failed mid-read. Triggers a reconnect.
    #[error("market stream read failed: {0}")]
    Stream(String),

    /// The exchange answered with something we could not decode.
    #[error("unexpected exchange response: {0}")]
    Decode(String),
}

impl ExchangeError {
    /// `true` for rejections caused by the request itself (4xx).
    pub fn is_client_error(&self) -> bool {
        matches!(self, ExchangeError::Rejected { status, .. } if (400..500).contains(status))
    }

    /// `true` when the request may have taken effect anyway: the exchange
    /// failed internally (5xx), the connection dropped mid-request, or the
    /// answer could not be read. Only a 4xx is a definite "not done".
    pub fn is_ambiguous(&self) -> bool {
        match self {
            ExchangeError::Rejected { status, .. } => *status >= 500,
            ExchangeError::Transport(_) | ExchangeError::Stream(_) | ExchangeError::Decode(_) => true,
        }
    }
}

// ─── Orders ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Limit,
    Market,
}

/// Everything needed to submit one order. `client_order_id` is chosen by the
/// caller and must be unique for the life of the process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderParams {
    pub symbol:          String,
    pub side:            OrderSide,
    #[serde(rename = "type")]
    pub order_type:      OrderType,
    pub quantity:        f64,
    /// Required for limit orders, ignored for market orders.
    pub price:           Option<f64>,
    pub client_order_id: String,
}

impl OrderParams {
    pub fn limit_buy(symbol: &str, quantity: f64, price: f64, client_order_id: String) -> Self {
        Self {
            symbol: symbol.to_string(),
            side: OrderSide::Buy,
            order_type: OrderType::Limit,
            quantity,
            price: Some(price),
            client_order_id,
        }
    }

    pub fn limit_sell(symbol: &str, quantity: f64, price: f64, client_order_id: String) -> Self {
        Self {
            symbol: symbol.to_string(),
            side: OrderSide::Sell,
            order_type: OrderType::Limit,
            quantity,
            price: Some(price),
            client_order_id,
        }
    }

    pub fn market_sell(symbol: &str, quantity: f64, client_order_id: String) -> Self {
        Self {
            symbol: symbol.to_string(),
            side: OrderSide::Sell,
            order_type: OrderType::Market,
            quantity,
            price: None,
            client_order_id,
        }
    }
}

/// Acknowledgement of an accepted order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub client_order_id:   String,
    #[serde(default)]
    pub exchange_order_id: Option<String>,
}

/// Asynchronous report about an order, correlated by `client_order_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderUpdate {
    pub client_order_id: String,
    pub symbol:          String,
    #[serde(flatten)]
    pub kind:            OrderUpdateKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderUpdateKind {
    /// Fully filled; `quantity` is the cumulative filled quantity.
    Filled { price: f64, quantity: f64 },
    PartiallyFilled { price: f64, quantity: f64 },
    Cancelled,
    Rejected { reason: String },
}

/// Top of the order book.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BookTicker {
    pub bid: f64,
    pub ask: f64,
}

// ─── Client Contract ──────────────────────────────────────────────────────────

/// One event off a market stream: a trade, or a terminal read failure.
pub type StreamEvent = Result<MarketTrade, ExchangeError>;

/// A live upstream market-data connection for one symbol.
#[async_trait]
pub trait MarketStream: Send {
    /// Next event. `None` means the upstream closed the connection.
    async fn next(&mut self) -> Option<StreamEvent>;

    /// Closes the underlying connection.
    async fn close(&mut self);
}

pub type BoxedMarketStream = Box<dyn MarketStream>;

#[async_trait]
pub trait ExchangeClient: Send + Sync {
    async fn open_trade_stream(&self, symbol: &str) -> Result<BoxedMarketStream, ExchangeError>;

    async fn place_order(&self, params: &OrderParams) -> Result<OrderAck, ExchangeError>;

    async fn cancel_order(&self, symbol: &str, client_order_id: &str) -> Result<(), ExchangeError>;

    async fn last_price(&self, symbol: &str) -> Result<f64, ExchangeError>;

    async fn book_ticker(&self, symbol: &str) -> Result<BookTicker, ExchangeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let rejected = ExchangeError::Rejected { status: 400, body: "{}".into() };
        assert!(rejected.is_client_error());
        assert!(!rejected.is_ambiguous());

        let overloaded = ExchangeError::Rejected { status: 503, body: String::new() };
        assert!(!overloaded.is_client_error());
        assert!(overloaded.is_ambiguous());

        assert!(ExchangeError::Transport("timed out".into()).is_ambiguous());
        let garbled = ExchangeError::Decode("bad json".into());
        assert!(!garbled.is_client_error());
        assert!(garbled.is_ambiguous());
    }

    #[test]
    fn test_order_update_wire_shape() {
        let update: OrderUpdate = serde_json::from_str(
            r#"{"client_order_id":"xp-1","symbol":"ethusdt","status":"FILLED","price":101.5,"quantity":2.0}"#,
        )
        .unwrap();
        assert_eq!(
            update.kind,
            OrderUpdateKind::Filled { price: 101.5, quantity: 2.0 }
        );

        let cancelled: OrderUpdate = serde_json::from_str(
            r#"{"client_order_id":"xp-2","symbol":"ethusdt","status":"CANCELLED"}"#,
        )
        .unwrap();
        assert_eq!(cancelled.kind, OrderUpdateKind::Cancelled);
    }
}
