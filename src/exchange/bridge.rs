//! # exchange::bridge
//!
//! **Bridge Exchange**: talks to a real exchange through two doors:
//!
//! * **Orders** go through an exchange bridge over HTTP (the bridge holds the
//!   API keys and does the request signing):
//!   ```text
//!   POST {rest}/order/send    OrderParams              → { "client_order_id": "...", "exchange_order_id": "..." }
//!   POST {rest}/order/cancel  { symbol, client_order_id } → 2xx
//!   GET  {rest}/ticker/price?symbol=ETHUSDT             → { "symbol": "ETHUSDT", "price": "1834.21" }
//!   GET  {rest}/ticker/bookTicker?symbol=ETHUSDT        → { "bidPrice": "1834.20", "askPrice": "1834.21", ... }
//!   ```
//!   Fills come back on `POST /api/exchange/order-update`.
//!
//! * **Market data** comes straight from the public aggregated-trade stream:
//!   `{ws}/ws/{symbol}@aggTrade`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{error, info, warn};

use super::{
    BookTicker, BoxedMarketStream, ExchangeClient, ExchangeError, MarketStream, OrderAck,
    OrderParams, StreamEvent,
};
use crate::models::MarketTrade;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ─── BridgeExchange ───────────────────────────────────────────────────────────

pub struct BridgeExchange {
    client:   reqwest::Client,
    rest_url: String,
    ws_url:   String,
    timeout:  Duration,
}

impl BridgeExchange {
    pub fn new(
        client: reqwest::Client,
        rest_url: impl Into<String>,
        ws_url: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            rest_url: rest_url.into().trim_end_matches('/').to_string(),
            ws_url:   ws_url.into().trim_end_matches('/').to_string(),
            timeout,
        }
    }

    /// Checks the HTTP status and hands back the body, or the raw rejection.
    async fn read_body(response: reqwest::Response) -> Result<String, ExchangeError> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ExchangeError::Transport(format!("failed to read body: {e}")))?;

        if !status.is_success() {
            error!(http_status = %status, body = %body, "Exchange bridge returned HTTP error");
            return Err(ExchangeError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }

    fn unreachable(e: reqwest::Error) -> ExchangeError {
        error!(error = %e, "Exchange bridge unreachable");
        ExchangeError::Transport(format!("exchange bridge unreachable: {e}"))
    }
}

#[async_trait]
impl ExchangeClient for BridgeExchange {
    async fn open_trade_stream(&self, symbol: &str) -> Result<BoxedMarketStream, ExchangeError> {
        let url = format!("{}/ws/{}@aggTrade", self.ws_url, symbol.to_lowercase());
        info!(symbol, url = %url, "Connecting to aggregated trade stream");

        let (ws, _) = connect_async(url.as_str())
            .await
            .map_err(|e| ExchangeError::Transport(format!("stream connect failed: {e}")))?;

        Ok(Box::new(BridgeStream {
            symbol: symbol.to_lowercase(),
            ws,
        }))
    }

    async fn place_order(&self, params: &OrderParams) -> Result<OrderAck, ExchangeError> {
        let url = format!("{}/order/send", self.rest_url);

        info!(
            symbol          = %params.symbol,
            side            = ?params.side,
            order_type      = ?params.order_type,
            quantity        = params.quantity,
            price           = ?params.price,
            client_order_id = %params.client_order_id,
            "🚀 [BRIDGE] Sending order"
        );

        let response = self
            .client
            .post(&url)
            .json(params)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(Self::unreachable)?;

        let body = Self::read_body(response).await?;
        let ack: OrderAck = serde_json::from_str(&body).map_err(|e| {
            error!(error = %e, body = %body, "Order response parse failed");
            ExchangeError::Decode(format!("order response parse error: {e}"))
        })?;

        info!(
            client_order_id   = %ack.client_order_id,
            exchange_order_id = ?ack.exchange_order_id,
            "✅ [BRIDGE] Order accepted"
        );
        Ok(ack)
    }

    async fn cancel_order(&self, symbol: &str, client_order_id: &str) -> Result<(), ExchangeError> {
        let url = format!("{}/order/cancel", self.rest_url);
        let response = self
            .client
            .post(&url)
            .json(&json!({
                "symbol":          symbol,
                "client_order_id": client_order_id,
            }))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(Self::unreachable)?;

        Self::read_body(response).await?;
        info!(symbol, client_order_id, "[BRIDGE] Order cancelled");
        Ok(())
    }

    async fn last_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        let url = format!("{}/ticker/price", self.rest_url);
        let response = self
            .client
            .get(&url)
            .query(&[("symbol", symbol.to_uppercase())])
            .timeout(self.timeout)
            .send()
            .await
            .map_err(Self::unreachable)?;

        let body = Self::read_body(response).await?;
        parse_ticker_price(&body)
    }

    async fn book_ticker(&self, symbol: &str) -> Result<BookTicker, ExchangeError> {
        let url = format!("{}/ticker/bookTicker", self.rest_url);
        let response = self
            .client
            .get(&url)
            .query(&[("symbol", symbol.to_uppercase())])
            .timeout(self.timeout)
            .send()
            .await
            .map_err(Self::unreachable)?;

        let body = Self::read_body(response).await?;
        parse_book_ticker(&body)
    }
}

// ─── Wire Parsing ─────────────────────────────────────────────────────────────

/// Aggregated trade event as printed on the public stream.
#[derive(Debug, Deserialize)]
struct AggTradeEvent {
    #[serde(rename = "s")]
    symbol:     String,
    #[serde(rename = "p")]
    price:      String,
    #[serde(rename = "q")]
    quantity:   String,
    #[serde(rename = "T")]
    trade_time: i64,
}

fn parse_agg_trade(text: &str) -> Result<MarketTrade, ExchangeError> {
    let event: AggTradeEvent = serde_json::from_str(text)
        .map_err(|e| ExchangeError::Decode(format!("aggTrade decode: {e}")))?;
    let price = event
        .price
        .parse::<f64>()
        .map_err(|e| ExchangeError::Decode(format!("aggTrade price: {e}")))?;
    let quantity = event
        .quantity
        .parse::<f64>()
        .map_err(|e| ExchangeError::Decode(format!("aggTrade quantity: {e}")))?;

    Ok(MarketTrade {
        symbol: event.symbol.to_lowercase(),
        price,
        quantity,
        timestamp: DateTime::<Utc>::from_timestamp_millis(event.trade_time).unwrap_or_else(Utc::now),
    })
}

fn parse_ticker_price(body: &str) -> Result<f64, ExchangeError> {
    let value: serde_json::Value = serde_json::from_str(body)
        .map_err(|e| ExchangeError::Decode(format!("ticker decode: {e}")))?;
    match &value["price"] {
        serde_json::Value::String(s) => s
            .parse()
            .map_err(|e| ExchangeError::Decode(format!("ticker price: {e}"))),
        serde_json::Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| ExchangeError::Decode("ticker price out of range".into())),
        _ => Err(ExchangeError::Decode(format!("ticker without price: {body}"))),
    }
}

/// Book ticker as printed by the REST API: `bidPrice` / `askPrice` strings.
#[derive(Debug, Deserialize)]
struct BookTickerEvent {
    #[serde(rename = "bidPrice")]
    bid: String,
    #[serde(rename = "askPrice")]
    ask: String,
}

fn parse_book_ticker(body: &str) -> Result<BookTicker, ExchangeError> {
    let event: BookTickerEvent = serde_json::from_str(body)
        .map_err(|e| ExchangeError::Decode(format!("bookTicker decode: {e}")))?;
    let bid = event
        .bid
        .parse::<f64>()
        .map_err(|e| ExchangeError::Decode(format!("bookTicker bid: {e}")))?;
    let ask = event
        .ask
        .parse::<f64>()
        .map_err(|e| ExchangeError::Decode(format!("bookTicker ask: {e}")))?;
    Ok(BookTicker { bid, ask })
}

// ─── Stream ───────────────────────────────────────────────────────────────────

struct BridgeStream {
    symbol: String,
    ws:     WsStream,
}

#[async_trait]
impl MarketStream for BridgeStream {
    async fn next(&mut self) -> Option<StreamEvent> {
        loop {
            match self.ws.next().await? {
                Ok(Message::Text(text)) => match parse_agg_trade(&text) {
                    Ok(trade) => return Some(Ok(trade)),
                    Err(e) => {
                        warn!(symbol = %self.symbol, error = %e, "Skipping undecodable stream frame");
                    }
                },
                Ok(Message::Ping(data)) => {
                    if let Err(e) = self.ws.send(Message::Pong(data)).await {
                        return Some(Err(ExchangeError::Stream(e.to_string())));
                    }
                }
                Ok(Message::Close(_)) => return None,
                Ok(_) => {}
                Err(e) => return Some(Err(ExchangeError::Stream(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.ws.close(None).await {
            warn!(symbol = %self.symbol, error = %e, "Stream close handshake failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_agg_trade() {
        let text = r#"{"e":"aggTrade","E":1672515782136,"s":"ETHUSDT","a":164,"p":"1834.21","q":"0.250","f":100,"l":105,"T":1672515782136,"m":true,"M":true}"#;
        let trade = parse_agg_trade(text).unwrap();
        assert_eq!(trade.symbol, "ethusdt");
        assert_eq!(trade.price, 1834.21);
        assert_eq!(trade.quantity, 0.25);
        assert_eq!(trade.timestamp.timestamp_millis(), 1672515782136);
    }

    #[test]
    fn test_parse_agg_trade_rejects_garbage() {
        assert!(matches!(
            parse_agg_trade(r#"{"result":null,"id":1}"#),
            Err(ExchangeError::Decode(_))
        ));
    }

    #[test]
    fn test_parse_ticker_price_string_and_number() {
        assert_eq!(parse_ticker_price(r#"{"symbol":"ETHUSDT","price":"12.5"}"#).unwrap(), 12.5);
        assert_eq!(parse_ticker_price(r#"{"price":7}"#).unwrap(), 7.0);
        assert!(parse_ticker_price(r#"{"symbol":"X"}"#).is_err());
    }

    #[test]
    fn test_parse_book_ticker() {
        let body = r#"{"symbol":"ETHUSDT","bidPrice":"1834.20","bidQty":"3.1","askPrice":"1834.21","askQty":"0.7"}"#;
        assert_eq!(
            parse_book_ticker(body).unwrap(),
            BookTicker { bid: 1834.20, ask: 1834.21 }
        );
        assert!(matches!(
            parse_book_ticker(r#"{"symbol":"ETHUSDT","price":"1"}"#),
            Err(ExchangeError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_bridge_is_transport_error() {
        let exchange = BridgeExchange::new(
            reqwest::Client::new(),
            "http://127.0.0.1:9",
            "ws://127.0.0.1:9",
            Duration::from_millis(500),
        );
        let err = exchange
            .place_order(&OrderParams::market_sell("ethusdt", 1.0, "x".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Transport(_)));
    }
}
