//! # exchange::paper
//!
//! **Paper Exchange**: a deterministic, in-process exchange.
//!
//! Used when `EXCHANGE_MODE=paper` and as the exchange double in tests.
//!
//! ## Matching rules
//! * Limit BUY rests until a market trade prints at or below its price.
//! * Limit SELL rests until a market trade prints at or above its price.
//! * A limit order that is already marketable against the last print fills
//!   immediately at its limit price.
//! * MARKET orders fill immediately at the last printed price.
//!
//! Every fill / cancel is reported on the order-update channel handed out by
//! [`PaperExchange::take_order_updates`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{
    BookTicker, BoxedMarketStream, ExchangeClient, ExchangeError, MarketStream, OrderAck,
    OrderParams, OrderSide, OrderType, OrderUpdate, OrderUpdateKind, StreamEvent,
};
use crate::models::MarketTrade;

// ─── Internal Book ────────────────────────────────────────────────────────────

#[derive(Default)]
struct PaperBook {
    last_prices:        HashMap<String, f64>,
    book_tickers:       HashMap<String, BookTicker>,
    resting:            Vec<OrderParams>,
    placed:             Vec<OrderParams>,
    cancelled:          Vec<String>,
    streams:            HashMap<String, Vec<mpsc::UnboundedSender<StreamEvent>>>,
    stream_opens:       HashMap<String, usize>,
    stream_closes:      HashMap<String, usize>,
    reject_next_order:  Option<ExchangeError>,
    reject_next_cancel: Option<ExchangeError>,
    failed_opens_left:  usize,
    next_exchange_id:   u64,
}

struct Shared {
    book:       Mutex<PaperBook>,
    updates_tx: mpsc::UnboundedSender<OrderUpdate>,
    updates_rx: Mutex<Option<mpsc::UnboundedReceiver<OrderUpdate>>>,
}

impl Shared {
    fn book(&self) -> MutexGuard<'_, PaperBook> {
        self.book.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn report(&self, update: OrderUpdate) {
        debug!(client_order_id = %update.client_order_id, kind = ?update.kind, "📄 [PAPER] order update");
        // Err only when nobody took the receiver: nothing to report to.
        let _ = self.updates_tx.send(update);
    }
}

fn rejection(code: i32, msg: &str) -> ExchangeError {
    ExchangeError::Rejected {
        status: 400,
        body:   json!({ "code": code, "msg": msg }).to_string(),
    }
}

fn fill(order: &OrderParams, price: f64) -> OrderUpdate {
    OrderUpdate {
        client_order_id: order.client_order_id.clone(),
        symbol:          order.symbol.clone(),
        kind:            OrderUpdateKind::Filled { price, quantity: order.quantity },
    }
}

fn crosses(order: &OrderParams, price: f64) -> bool {
    match (order.side, order.price) {
        (OrderSide::Buy, Some(limit))  => price <= limit,
        (OrderSide::Sell, Some(limit)) => price >= limit,
        (_, None) => true,
    }
}

// ─── PaperExchange ────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct PaperExchange {
    shared: Arc<Shared>,
}

impl PaperExchange {
    pub fn new() -> Self {
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                book: Mutex::new(PaperBook::default()),
                updates_tx,
                updates_rx: Mutex::new(Some(updates_rx)),
            }),
        }
    }

    /// Hands out the order-update receiver. Only the first call gets it.
    pub fn take_order_updates(&self) -> Option<mpsc::UnboundedReceiver<OrderUpdate>> {
        self.shared
            .updates_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Prints a market trade: fills crossing resting orders, then delivers
    /// the trade to every open stream for the symbol.
    pub fn push_trade(&self, symbol: &str, price: f64, quantity: f64) {
        let symbol = symbol.to_lowercase();
        let mut fills = Vec::new();
        {
            let mut book = self.shared.book();
            book.last_prices.insert(symbol.clone(), price);

            let (matched, resting): (Vec<_>, Vec<_>) = std::mem::take(&mut book.resting)
                .into_iter()
                .partition(|order| order.symbol == symbol && crosses(order, price));
            book.resting = resting;
            for order in matched {
                let limit = order.price.unwrap_or(price);
                fills.push(fill(&order, limit));
            }

            let trade = MarketTrade::new(symbol.clone(), price, quantity);
            if let Some(senders) = book.streams.get_mut(&symbol) {
                senders.retain(|tx| tx.send(Ok(trade.clone())).is_ok());
            }
        }
        for update in fills {
            self.shared.report(update);
        }
    }

    /// Sets the best bid / ask reported for `symbol`.
    pub fn set_book_ticker(&self, symbol: &str, bid: f64, ask: f64) {
        self.shared
            .book()
            .book_tickers
            .insert(symbol.to_lowercase(), BookTicker { bid, ask });
    }

    /// Breaks every open stream for `symbol` with a read error.
    pub fn fail_streams(&self, symbol: &str, reason: &str) {
        let mut book = self.shared.book();
        if let Some(senders) = book.streams.remove(&symbol.to_lowercase()) {
            for tx in senders {
                let _ = tx.send(Err(ExchangeError::Stream(reason.to_string())));
            }
        }
    }

    /// The next `count` calls to `open_trade_stream` fail.
    pub fn fail_next_opens(&self, count: usize) {
        self.shared.book().failed_opens_left = count;
    }

    pub fn reject_next_order(&self, err: ExchangeError) {
        self.shared.book().reject_next_order = Some(err);
    }

    pub fn reject_next_cancel(&self, err: ExchangeError) {
        self.shared.book().reject_next_cancel = Some(err);
    }

    pub fn stream_opens(&self, symbol: &str) -> usize {
        self.shared.book().stream_opens.get(&symbol.to_lowercase()).copied().unwrap_or(0)
    }

    pub fn stream_closes(&self, symbol: &str) -> usize {
        self.shared.book().stream_closes.get(&symbol.to_lowercase()).copied().unwrap_or(0)
    }

    pub fn placed_orders(&self) -> Vec<OrderParams> {
        self.shared.book().placed.clone()
    }

    pub fn resting_orders(&self) -> Vec<OrderParams> {
        self.shared.book().resting.clone()
    }

    pub fn cancelled_orders(&self) -> Vec<String> {
        self.shared.book().cancelled.clone()
    }
}

impl Default for PaperExchange {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExchangeClient for PaperExchange {
    async fn open_trade_stream(&self, symbol: &str) -> Result<BoxedMarketStream, ExchangeError> {
        let symbol = symbol.to_lowercase();
        let mut book = self.shared.book();
        if book.failed_opens_left > 0 {
            book.failed_opens_left -= 1;
            return Err(ExchangeError::Transport("paper: connection refused".into()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        book.streams.entry(symbol.clone()).or_default().push(tx);
        *book.stream_opens.entry(symbol.clone()).or_default() += 1;
        info!(symbol = %symbol, "📄 [PAPER] trade stream opened");

        Ok(Box::new(PaperStream {
            symbol,
            rx,
            shared: Arc::clone(&self.shared),
            closed: false,
        }))
    }

    async fn place_order(&self, params: &OrderParams) -> Result<OrderAck, ExchangeError> {
        let immediate_fill;
        let ack;
        {
            let mut book = self.shared.book();
            if let Some(err) = book.reject_next_order.take() {
                return Err(err);
            }
            if !(params.quantity > 0.0) {
                return Err(rejection(-1013, "Invalid quantity."));
            }
            if book.placed.iter().any(|o| o.client_order_id == params.client_order_id) {
                return Err(rejection(-2010, "Duplicate order sent."));
            }

            let symbol = params.symbol.to_lowercase();
            let last = book.last_prices.get(&symbol).copied();
            immediate_fill = match params.order_type {
                OrderType::Market => match last {
                    Some(price) => Some(fill(params, price)),
                    None => return Err(rejection(-1100, "No market price for symbol.")),
                },
                OrderType::Limit => {
                    let limit = match params.price {
                        Some(price) if price > 0.0 => price,
                        _ => return Err(rejection(-1013, "Invalid price.")),
                    };
                    match last {
                        Some(price) if crosses(params, price) => Some(fill(params, limit)),
                        _ => None,
                    }
                }
            };

            book.placed.push(params.clone());
            if immediate_fill.is_none() {
                book.resting.push(params.clone());
            }
            book.next_exchange_id += 1;
            ack = OrderAck {
                client_order_id:   params.client_order_id.clone(),
                exchange_order_id: Some(format!("paper-{}", book.next_exchange_id)),
            };
        }

        if let Some(update) = immediate_fill {
            self.shared.report(update);
        }
        Ok(ack)
    }

    async fn cancel_order(&self, symbol: &str, client_order_id: &str) -> Result<(), ExchangeError> {
        {
            let mut book = self.shared.book();
            if let Some(err) = book.reject_next_cancel.take() {
                return Err(err);
            }
            let position = book
                .resting
                .iter()
                .position(|o| o.client_order_id == client_order_id)
                .ok_or_else(|| rejection(-2011, "Unknown order sent."))?;
            book.resting.remove(position);
            book.cancelled.push(client_order_id.to_string());
        }

        self.shared.report(OrderUpdate {
            client_order_id: client_order_id.to_string(),
            symbol:          symbol.to_lowercase(),
            kind:            OrderUpdateKind::Cancelled,
        });
        Ok(())
    }

    async fn last_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        self.shared
            .book()
            .last_prices
            .get(&symbol.to_lowercase())
            .copied()
            .ok_or_else(|| rejection(-1121, "Invalid symbol."))
    }

    async fn book_ticker(&self, symbol: &str) -> Result<BookTicker, ExchangeError> {
        self.shared
            .book()
            .book_tickers
            .get(&symbol.to_lowercase())
            .copied()
            .ok_or_else(|| rejection(-1121, "Invalid symbol."))
    }
}

// ─── Stream ───────────────────────────────────────────────────────────────────

struct PaperStream {
    symbol: String,
    rx:     mpsc::UnboundedReceiver<StreamEvent>,
    shared: Arc<Shared>,
    closed: bool,
}

#[async_trait]
impl MarketStream for PaperStream {
    async fn next(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.rx.close();
        *self
            .shared
            .book()
            .stream_closes
            .entry(self.symbol.clone())
            .or_default() += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_limit_buy_rests_until_price_crosses() {
        let exchange = PaperExchange::new();
        let mut updates = exchange.take_order_updates().unwrap();

        exchange
            .place_order(&OrderParams::limit_buy("ETHUSD", 1.0, 100.0, "b-1".into()))
            .await
            .unwrap();
        assert_eq!(exchange.resting_orders().len(), 1);

        exchange.push_trade("ethusd", 101.0, 0.5);
        assert!(updates.try_recv().is_err());

        exchange.push_trade("ethusd", 100.0, 0.5);
        let update = updates.try_recv().unwrap();
        assert_eq!(update.client_order_id, "b-1");
        assert_eq!(update.kind, OrderUpdateKind::Filled { price: 100.0, quantity: 1.0 });
        assert!(exchange.resting_orders().is_empty());
    }

    #[tokio::test]
    async fn test_market_order_needs_a_price() {
        let exchange = PaperExchange::new();
        let err = exchange
            .place_order(&OrderParams::market_sell("ethusd", 1.0, "s-1".into()))
            .await
            .unwrap_err();
        assert!(err.is_client_error());

        exchange.push_trade("ethusd", 90.0, 1.0);
        let mut updates = exchange.take_order_updates().unwrap();
        exchange
            .place_order(&OrderParams::market_sell("ethusd", 1.0, "s-2".into()))
            .await
            .unwrap();
        assert_eq!(
            updates.try_recv().unwrap().kind,
            OrderUpdateKind::Filled { price: 90.0, quantity: 1.0 }
        );
    }

    #[tokio::test]
    async fn test_duplicate_client_order_id_rejected() {
        let exchange = PaperExchange::new();
        let order = OrderParams::limit_buy("ethusd", 1.0, 10.0, "dup".into());
        exchange.place_order(&order).await.unwrap();
        let err = exchange.place_order(&order).await.unwrap_err();
        assert!(matches!(err, ExchangeError::Rejected { status: 400, ref body } if body.contains("-2010")));
    }

    #[tokio::test]
    async fn test_cancel_unknown_order_is_rejected() {
        let exchange = PaperExchange::new();
        let err = exchange.cancel_order("ethusd", "nope").await.unwrap_err();
        assert!(err.is_client_error());
    }

    #[tokio::test]
    async fn test_book_ticker_is_configurable() {
        let exchange = PaperExchange::new();
        let err = exchange.book_ticker("ethusd").await.unwrap_err();
        assert!(matches!(err, ExchangeError::Rejected { status: 400, ref body } if body.contains("-1121")));

        exchange.set_book_ticker("ETHUSD", 99.5, 100.5);
        assert_eq!(
            exchange.book_ticker("ethusd").await.unwrap(),
            BookTicker { bid: 99.5, ask: 100.5 }
        );
    }

    #[tokio::test]
    async fn test_stream_receives_trades_and_failures() {
        let exchange = PaperExchange::new();
        let mut stream = exchange.open_trade_stream("ETHUSD").await.unwrap();
        assert_eq!(exchange.stream_opens("ethusd"), 1);

        exchange.push_trade("ethusd", 10.0, 1.0);
        let trade = stream.next().await.unwrap().unwrap();
        assert_eq!(trade.price, 10.0);

        exchange.fail_streams("ethusd", "reset by peer");
        assert!(matches!(stream.next().await, Some(Err(ExchangeError::Stream(_)))));

        stream.close().await;
        stream.close().await;
        assert_eq!(exchange.stream_closes("ethusd"), 1);
    }
}
