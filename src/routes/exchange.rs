//! # routes::exchange
//!
//! Exchange callbacks and service health.
//!
//! | Method | Path                          | Description                               |
//! |--------|-------------------------------|-------------------------------------------|
//! | POST   | `/api/exchange/order-update`  | Push an execution report (bridge mode)    |
//! | GET    | `/api/health`                 | Uptime and engine counters                |

use axum::{extract::State, Json};
use chrono::Utc;
use serde_json::{json, Value};

use crate::{error::AppError, exchange::OrderUpdate, state::SharedState};

// ─── POST /api/exchange/order-update ──────────────────────────────────────────

/// Execution reports from a bridge that cannot hold a stream open to us.
/// Reports for unknown client order ids are acknowledged with `matched: false`.
pub async fn order_update(
    State(state): State<SharedState>,
    Json(update): Json<OrderUpdate>,
) -> Result<Json<Value>, AppError> {
    let trade = state.engine.apply_order_update(update).await?;
    Ok(Json(json!({
        "ok":      true,
        "matched": trade.is_some(),
        "trade":   trade,
    })))
}

// ─── GET /api/health ──────────────────────────────────────────────────────────

pub async fn health(State(state): State<SharedState>) -> Json<Value> {
    let uptime = (Utc::now() - state.started_at).num_seconds().max(0);
    Json(json!({
        "ok":          true,
        "status":      "running",
        "uptime_secs": uptime,
        "engine":      state.engine.stats().await,
    }))
}
