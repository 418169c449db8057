//! # routes::trades
//!
//! Thin HTTP adapter over the [`TradeEngine`](crate::engine::TradeEngine)
//! operations. Handlers decode input, call exactly one engine operation
//! (two for market-sell on a pending sell), and return the trade snapshot.
//!
//! ## Endpoints
//!
//! | Method | Path                                  | Engine operation                          |
//! |--------|---------------------------------------|-------------------------------------------|
//! | POST   | `/api/trades/buy`                     | `add_new_trade` + `post_buy`              |
//! | GET    | `/api/trades?filter=active\|closed\|all` | `query_trades`                         |
//! | GET    | `/api/trades/:id`                     | `find_trade_by_local_id`                  |
//! | POST   | `/api/trades/:id/cancel-buy`          | `cancel_buy`                              |
//! | POST   | `/api/trades/:id/cancel-sell`         | `cancel_sell` / `disable_limit_sell`      |
//! | POST   | `/api/trades/:id/limit-sell/percent`  | `set_limit_sell_by_percent`               |
//! | POST   | `/api/trades/:id/limit-sell/price`    | `set_limit_sell_by_price`                 |
//! | POST   | `/api/trades/:id/market-sell`         | `cancel_sell` (if pending) + `market_sell`|
//! | POST   | `/api/trades/:id/stop-loss`           | `update_stop_loss`                        |
//! | POST   | `/api/trades/:id/trailing-profit`     | `update_trailing_profit`                  |
//! | POST   | `/api/trades/:id/archive`             | `archive_trade`                           |
//! | POST   | `/api/trades/:id/abandon`             | `abandon_trade`                           |

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use crate::{
    engine::TradeEngine,
    error::AppError,
    models::{SellTrigger, Trade, TradeStatus},
    state::SharedState,
    store::TradeFilter,
};

fn trade_response(trade: Trade) -> Json<Value> {
    Json(json!({
        "ok":    true,
        "trade": trade,
    }))
}

// ─── POST /api/trades/buy ─────────────────────────────────────────────────────

/// ### Request body (JSON)
/// ```json
/// {
///   "symbol": "ETHUSDT",
///   "quantity": 0.5,
///   "price_source": "MANUAL",
///   "price": 1830.0,
///   "limit_sell": { "enabled": true, "type": "PERCENT", "percent": 5 },
///   "stop_loss": { "enabled": true, "percent": 3 },
///   "trailing_profit": { "enabled": true, "activation_percent": 4, "deviation_percent": 1 }
/// }
/// ```
/// `price_source` picks the limit price:
///
/// | Source       | Price                                   |
/// |--------------|-----------------------------------------|
/// | `MANUAL`     | `price` from the body                   |
/// | `LAST_PRICE` | last traded price on the exchange       |
/// | `BEST_BID`   | best bid from the exchange's book ticker|
/// | `BEST_ASK`   | best ask from the exchange's book ticker|
///
/// Every check runs before the trade is registered, so a rejected request
/// leaves nothing behind.
#[derive(Debug, Deserialize)]
pub struct BuyRequest {
    pub symbol:          String,
    pub quantity:        f64,
    pub price_source:    Option<String>,
    pub price:           Option<f64>,
    pub limit_sell:      Option<LimitSellRequest>,
    pub stop_loss:       Option<StopLossRequest>,
    pub trailing_profit: Option<TrailingProfitRequest>,
}

#[derive(Debug, Deserialize)]
pub struct LimitSellRequest {
    pub enabled: bool,
    #[serde(rename = "type")]
    pub kind:    Option<String>,
    pub percent: Option<f64>,
    pub price:   Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct StopLossRequest {
    pub enabled: bool,
    #[serde(default)]
    pub percent: f64,
}

#[derive(Debug, Deserialize)]
pub struct TrailingProfitRequest {
    pub enabled:            bool,
    #[serde(default)]
    pub activation_percent: f64,
    #[serde(default)]
    pub deviation_percent:  f64,
}

pub async fn buy(
    State(state): State<SharedState>,
    Json(req): Json<BuyRequest>,
) -> Result<Json<Value>, AppError> {
    let symbol = req.symbol.trim().to_lowercase();
    if symbol.is_empty() {
        return Err(AppError::Validation("symbol must not be empty".into()));
    }

    let source = req
        .price_source
        .as_deref()
        .unwrap_or_default()
        .trim()
        .to_ascii_uppercase();
    let price = match source.as_str() {
        "MANUAL" => req
            .price
            .ok_or_else(|| AppError::Validation("price is required for MANUAL price source".into()))?,
        "LAST_PRICE" => state.engine.last_price(&symbol).await?,
        "BEST_BID" => state.engine.book_ticker(&symbol).await?.bid,
        "BEST_ASK" => state.engine.book_ticker(&symbol).await?.ask,
        "" => return Err(AppError::Validation("price_source is required".into())),
        other => {
            return Err(AppError::Validation(format!(
                "price_source must be MANUAL, LAST_PRICE, BEST_BID or BEST_ASK, got {other:?}"
            )))
        }
    };
    TradeEngine::validate_buy(price, req.quantity)?;

    let mut trade = Trade::new(symbol);
    if let Some(limit) = req.limit_sell.filter(|l| l.enabled) {
        let kind = limit.kind.as_deref().unwrap_or_default().trim().to_ascii_uppercase();
        match kind.as_str() {
            "PERCENT" => trade.set_limit_sell_by_percent(limit.percent.ok_or_else(|| {
                AppError::Validation("limit_sell.percent is required for PERCENT".into())
            })?),
            "PRICE" => trade.set_limit_sell_by_price(limit.price.ok_or_else(|| {
                AppError::Validation("limit_sell.price is required for PRICE".into())
            })?),
            other => {
                return Err(AppError::Validation(format!(
                    "limit_sell.type must be PERCENT or PRICE, got {other:?}"
                )))
            }
        }
    }
    if let Some(stop) = req.stop_loss {
        trade.set_stop_loss(stop.enabled, stop.percent);
    }
    if let Some(trailing) = req.trailing_profit {
        trade.set_trailing_profit(
            trailing.enabled,
            trailing.activation_percent,
            trailing.deviation_percent,
        );
    }

    let id = state.engine.add_new_trade(trade).await?;
    let trade = state.engine.post_buy(id, price, req.quantity).await?;
    info!(trade_id = %id, symbol = %trade.symbol, price, "Buy request accepted");
    Ok(trade_response(trade))
}

// ─── Queries ──────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub filter: TradeFilter,
}

pub async fn list_trades(
    State(state): State<SharedState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, AppError> {
    let trades = state.engine.query_trades(query.filter).await?;
    Ok(Json(json!({
        "ok":     true,
        "count":  trades.len(),
        "trades": trades,
    })))
}

pub async fn get_trade(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    Ok(trade_response(state.engine.find_trade_by_local_id(id).await?))
}

// ─── Actions ──────────────────────────────────────────────────────────────────

pub async fn cancel_buy(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    Ok(trade_response(state.engine.cancel_buy(id).await?))
}

/// Cancels the outstanding sell, or drops the pending limit-sell instruction
/// when no sell has been posted yet.
pub async fn cancel_sell(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let current = state.engine.find_trade_by_local_id(id).await?;
    let trade = if current.status() == TradeStatus::PendingSell {
        state.engine.cancel_sell(id).await?
    } else {
        state.engine.disable_limit_sell(id).await?
    };
    Ok(trade_response(trade))
}

#[derive(Debug, Deserialize)]
pub struct PercentBody {
    pub percent: f64,
}

#[derive(Debug, Deserialize)]
pub struct PriceBody {
    pub price: f64,
}

pub async fn limit_sell_percent(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Json(body): Json<PercentBody>,
) -> Result<Json<Value>, AppError> {
    Ok(trade_response(
        state.engine.set_limit_sell_by_percent(id, body.percent).await?,
    ))
}

pub async fn limit_sell_price(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Json(body): Json<PriceBody>,
) -> Result<Json<Value>, AppError> {
    Ok(trade_response(
        state.engine.set_limit_sell_by_price(id, body.price).await?,
    ))
}

/// Sells the position at market. An outstanding limit sell is cancelled
/// first so the trade is never holding two sells.
pub async fn market_sell(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let current = state.engine.find_trade_by_local_id(id).await?;
    if current.status() == TradeStatus::PendingSell {
        state.engine.cancel_sell(id).await?;
    }
    Ok(trade_response(
        state.engine.market_sell(id, SellTrigger::Manual).await?,
    ))
}

pub async fn stop_loss(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Json(body): Json<StopLossRequest>,
) -> Result<Json<Value>, AppError> {
    Ok(trade_response(
        state
            .engine
            .update_stop_loss(id, body.enabled, body.percent)
            .await?,
    ))
}

pub async fn trailing_profit(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Json(body): Json<TrailingProfitRequest>,
) -> Result<Json<Value>, AppError> {
    Ok(trade_response(
        state
            .engine
            .update_trailing_profit(id, body.enabled, body.activation_percent, body.deviation_percent)
            .await?,
    ))
}

pub async fn archive(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    Ok(trade_response(state.engine.archive_trade(id).await?))
}

pub async fn abandon(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    Ok(trade_response(state.engine.abandon_trade(id).await?))
}
