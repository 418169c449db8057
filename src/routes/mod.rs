//! HTTP and WebSocket surface.

pub mod exchange;
pub mod monitor;
pub mod trades;

use axum::{
    routing::{get, post},
    Router,
};

use crate::state::SharedState;

/// Every route the service exposes. Middleware is layered on by `main`.
pub fn build_router(state: SharedState) -> Router {
    Router::new()
        // ── Trades ───────────────────────────────────────────────────────────
        .route("/api/trades",                          get(trades::list_trades))
        .route("/api/trades/buy",                      post(trades::buy))
        .route("/api/trades/:id",                      get(trades::get_trade))
        .route("/api/trades/:id/cancel-buy",           post(trades::cancel_buy))
        .route("/api/trades/:id/cancel-sell",          post(trades::cancel_sell))
        .route("/api/trades/:id/limit-sell/percent",   post(trades::limit_sell_percent))
        .route("/api/trades/:id/limit-sell/price",     post(trades::limit_sell_price))
        .route("/api/trades/:id/market-sell",          post(trades::market_sell))
        .route("/api/trades/:id/stop-loss",            post(trades::stop_loss))
        .route("/api/trades/:id/trailing-profit",      post(trades::trailing_profit))
        .route("/api/trades/:id/archive",              post(trades::archive))
        .route("/api/trades/:id/abandon",              post(trades::abandon))
        // ── Exchange & health ────────────────────────────────────────────────
        .route("/api/exchange/order-update",           post(exchange::order_update))
        .route("/api/health",                          get(exchange::health))
        // ── Observers ────────────────────────────────────────────────────────
        .route("/ws/trades",                           get(monitor::ws_trades))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::paper_engine;
    use crate::exchange::{ExchangeError, OrderSide, PaperExchange};
    use crate::state::build_state;
    use axum::{
        body::{to_bytes, Body},
        http::{Method, Request, StatusCode},
    };
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn app() -> (Router, PaperExchange) {
        let (engine, paper) = paper_engine();
        (build_router(build_state(engine)), paper)
    }

    async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => request.body(Body::empty()),
        }
        .unwrap();

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn post(app: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
        call(app, Method::POST, uri, Some(body)).await
    }

    fn manual_buy(symbol: &str, price: f64) -> Value {
        json!({
            "symbol": symbol,
            "quantity": 1.0,
            "price_source": "MANUAL",
            "price": price,
        })
    }

    /// The buy stays resting on the paper book: fills in these tests arrive
    /// through the order-update route instead.
    fn resting_sells(paper: &PaperExchange) -> usize {
        paper
            .resting_orders()
            .iter()
            .filter(|o| o.side == OrderSide::Sell)
            .count()
    }

    fn trade_id(body: &Value) -> String {
        body["trade"]["local_id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_manual_buy_and_get() {
        let (app, _paper) = app();
        let mut body = manual_buy(" ETHUSDT ", 100.0);
        body["stop_loss"] = json!({ "enabled": true, "percent": 5.0 });

        let (status, created) = post(&app, "/api/trades/buy", body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(created["ok"], true);
        assert_eq!(created["trade"]["status"], "PENDING_BUY");
        assert_eq!(created["trade"]["symbol"], "ethusdt");
        assert_eq!(created["trade"]["stop_loss"]["percent"], 5.0);

        let id = trade_id(&created);
        let (status, fetched) = call(&app, Method::GET, &format!("/api/trades/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["trade"]["local_id"], id.as_str());
    }

    #[tokio::test]
    async fn test_buy_validation() {
        let (app, _paper) = app();

        let mut missing_price = manual_buy("ethusdt", 100.0);
        missing_price.as_object_mut().unwrap().remove("price");
        let (status, body) = post(&app, "/api/trades/buy", missing_price).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["ok"], false);

        let mut bad_source = manual_buy("ethusdt", 100.0);
        bad_source["price_source"] = json!("BEST_GUESS");
        let (status, _) = post(&app, "/api/trades/buy", bad_source).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let mut bad_limit = manual_buy("ethusdt", 100.0);
        bad_limit["limit_sell"] = json!({ "enabled": true, "type": "TICKS", "percent": 5.0 });
        let (status, _) = post(&app, "/api/trades/buy", bad_limit).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = post(&app, "/api/trades/buy", manual_buy("   ", 100.0)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, list) = call(&app, Method::GET, "/api/trades?filter=all", None).await;
        assert_eq!(list["count"], 0);
    }

    #[tokio::test]
    async fn test_invalid_buy_amounts_register_nothing() {
        let (app, _paper) = app();

        let mut zero_quantity = manual_buy("ethusdt", 100.0);
        zero_quantity["quantity"] = json!(0.0);
        let (status, body) = post(&app, "/api/trades/buy", zero_quantity).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["ok"], false);

        let (status, _) = post(&app, "/api/trades/buy", manual_buy("ethusdt", -5.0)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, list) = call(&app, Method::GET, "/api/trades?filter=all", None).await;
        assert_eq!(list["count"], 0);
        let (_, health) = call(&app, Method::GET, "/api/health", None).await;
        assert_eq!(health["engine"]["trades"], 0);
        assert_eq!(health["engine"]["subscribed_symbols"], json!([]));
    }

    #[tokio::test]
    async fn test_book_ticker_sources() {
        let (app, paper) = app();
        let body = |source: &str| json!({ "symbol": "ETHUSDT", "quantity": 1.0, "price_source": source });

        let (status, rejected) = post(&app, "/api/trades/buy", body("BEST_BID")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(rejected["code"], -1121);

        paper.set_book_ticker("ethusdt", 99.5, 100.5);
        let (status, bid) = post(&app, "/api/trades/buy", body("best_bid")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(bid["trade"]["buy_order"]["price"], 99.5);

        let (status, ask) = post(&app, "/api/trades/buy", body("BEST_ASK")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ask["trade"]["buy_order"]["price"], 100.5);
    }

    #[tokio::test]
    async fn test_last_price_source() {
        let (app, paper) = app();
        let body = json!({ "symbol": "btcusdt", "quantity": 0.1, "price_source": "LAST_PRICE" });

        // No price seen yet: the exchange's rejection is forwarded as-is.
        let (status, rejected) = post(&app, "/api/trades/buy", body.clone()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(rejected["code"], -1121);

        paper.push_trade("btcusdt", 50_000.0, 1.0);
        let (status, created) = post(&app, "/api/trades/buy", body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(created["trade"]["buy_order"]["price"], 50_000.0);
    }

    #[tokio::test]
    async fn test_unknown_trade_is_404() {
        let (app, _paper) = app();
        let uri = format!("/api/trades/{}", uuid::Uuid::new_v4());
        let (status, body) = call(&app, Method::GET, &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["ok"], false);

        let (status, _) = post(&app, &format!("{uri}/archive"), json!({})).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_fill_then_sell_flow() {
        let (app, paper) = app();
        let mut body = manual_buy("ethusdt", 100.0);
        body["limit_sell"] = json!({ "enabled": true, "type": "PERCENT", "percent": 10.0 });
        let (_, created) = post(&app, "/api/trades/buy", body).await;
        let id = trade_id(&created);
        let cid = created["trade"]["buy_order"]["client_order_id"].as_str().unwrap().to_string();

        let fill = json!({
            "client_order_id": cid,
            "symbol": "ethusdt",
            "status": "FILLED",
            "price": 100.0,
            "quantity": 1.0,
        });
        let (status, filled) = post(&app, "/api/exchange/order-update", fill).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(filled["matched"], true);
        assert_eq!(filled["trade"]["status"], "PENDING_SELL");
        assert_eq!(filled["trade"]["sell_order"]["trigger"], "LIMIT_SELL");

        // Move the limit: the old sell is replaced, never doubled.
        let (status, moved) =
            post(&app, &format!("/api/trades/{id}/limit-sell/price"), json!({ "price": 130.0 })).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(moved["trade"]["status"], "PENDING_SELL");
        assert_eq!(moved["trade"]["sell_order"]["price"], 130.0);
        assert_eq!(resting_sells(&paper), 1);

        // Market sell on a pending sell cancels the limit first.
        paper.push_trade("ethusdt", 105.0, 1.0);
        let (status, sold) = post(&app, &format!("/api/trades/{id}/market-sell"), json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(sold["trade"]["status"], "PENDING_SELL");
        assert_eq!(sold["trade"]["sell_order"]["trigger"], "MANUAL");
        assert_eq!(resting_sells(&paper), 0);
    }

    #[tokio::test]
    async fn test_cancel_sell_then_disable_limit() {
        let (app, _paper) = app();
        let mut body = manual_buy("ethusdt", 100.0);
        body["limit_sell"] = json!({ "enabled": true, "type": "PRICE", "price": 120.0 });
        let (_, created) = post(&app, "/api/trades/buy", body).await;
        let id = trade_id(&created);
        let cid = created["trade"]["buy_order"]["client_order_id"].as_str().unwrap().to_string();
        post(
            &app,
            "/api/exchange/order-update",
            json!({ "client_order_id": cid, "symbol": "ethusdt", "status": "FILLED", "price": 100.0, "quantity": 1.0 }),
        )
        .await;

        let uri = format!("/api/trades/{id}/cancel-sell");
        let (status, cancelled) = post(&app, &uri, json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(cancelled["trade"]["status"], "OPEN");

        let (status, disabled) = post(&app, &uri, json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(disabled["trade"]["status"], "OPEN");
        assert_eq!(disabled["trade"]["limit_sell"]["enabled"], false);
    }

    #[tokio::test]
    async fn test_unmatched_order_update() {
        let (app, _paper) = app();
        let (status, body) = post(
            &app,
            "/api/exchange/order-update",
            json!({ "client_order_id": "someone-else-1", "symbol": "ethusdt", "status": "CANCELLED" }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["matched"], false);
        assert_eq!(body["trade"], Value::Null);
    }

    #[tokio::test]
    async fn test_exit_config_routes() {
        let (app, _paper) = app();
        let (_, created) = post(&app, "/api/trades/buy", manual_buy("ethusdt", 100.0)).await;
        let id = trade_id(&created);

        let (status, _) =
            post(&app, &format!("/api/trades/{id}/stop-loss"), json!({ "enabled": true, "percent": 150.0 })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, updated) = post(
            &app,
            &format!("/api/trades/{id}/trailing-profit"),
            json!({ "enabled": true, "activation_percent": 20.0, "deviation_percent": 5.0 }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["trade"]["trailing_profit"]["enabled"], true);
        assert_eq!(updated["trade"]["trailing_profit"]["deviation_percent"], 5.0);
    }

    #[tokio::test]
    async fn test_failed_buy_can_be_abandoned() {
        let (app, paper) = app();
        paper.reject_next_order(ExchangeError::Rejected {
            status: 400,
            body:   json!({ "code": -2010, "msg": "Account has insufficient balance." }).to_string(),
        });
        let (status, rejected) = post(&app, "/api/trades/buy", manual_buy("ethusdt", 100.0)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(rejected["code"], -2010);

        let (_, list) = call(&app, Method::GET, "/api/trades?filter=all", None).await;
        assert_eq!(list["count"], 1);
        assert_eq!(list["trades"][0]["status"], "FAILED");
        let id = list["trades"][0]["local_id"].as_str().unwrap().to_string();

        let (status, abandoned) = post(&app, &format!("/api/trades/{id}/abandon"), json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(abandoned["trade"]["status"], "ABANDONED");

        let (_, active) = call(&app, Method::GET, "/api/trades", None).await;
        assert_eq!(active["count"], 0);
        let (_, closed) = call(&app, Method::GET, "/api/trades?filter=closed", None).await;
        assert_eq!(closed["count"], 1);
    }

    #[tokio::test]
    async fn test_bad_filter_and_health() {
        let (app, _paper) = app();
        let (status, _) = call(&app, Method::GET, "/api/trades?filter=sideways", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        post(&app, "/api/trades/buy", manual_buy("ethusdt", 100.0)).await;
        let (status, health) = call(&app, Method::GET, "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(health["status"], "running");
        assert_eq!(health["engine"]["trades"], 1);
        assert_eq!(health["engine"]["subscribed_symbols"], json!(["ethusdt"]));
    }
}
