//! # state
//!
//! Shared application state injected into every Axum handler.
//!
//! Handlers hold no trade state of their own: everything goes through the
//! [`TradeEngine`], which serializes mutation per trade.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::engine::TradeEngine;

#[derive(Clone)]
pub struct AppState {
    pub engine:     Arc<TradeEngine>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(engine: Arc<TradeEngine>) -> Self {
        Self {
            engine,
            started_at: Utc::now(),
        }
    }
}

/// Convenience type alias
pub type SharedState = Arc<AppState>;

pub fn build_state(engine: Arc<TradeEngine>) -> SharedState {
    Arc::new(AppState::new(engine))
}
