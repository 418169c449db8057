//! # models::market
//!
//! Defines [`MarketTrade`], one executed trade printed on the exchange tape
//! for a symbol. This is the unit the stream multiplexer fans out and the
//! exit evaluator reacts to.
//!
//! Kept small and `Clone`-cheap: every listener receives its own copy of
//! every event from every subscribed symbol.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single trade from the exchange's market-data stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketTrade {
    /// Lower-case symbol the trade was printed on, e.g. `"ethusdt"`.
    pub symbol: String,

    /// Execution price.
    pub price: f64,

    /// Executed quantity (base asset).
    pub quantity: f64,

    /// Exchange timestamp of the execution.
    pub timestamp: DateTime<Utc>,
}

impl MarketTrade {
    pub fn new(symbol: impl Into<String>, price: f64, quantity: f64) -> Self {
        Self {
            symbol: symbol.into().to_lowercase(),
            price,
            quantity,
            timestamp: Utc::now(),
        }
    }
}
