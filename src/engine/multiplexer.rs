//! # engine::multiplexer
//!
//! **Stream Multiplexer**: at most one upstream market-data connection per
//! symbol, shared by every part of the process that needs that symbol.
//!
//! ```text
//!  subscribe_symbol("ethusdt") ×N ──▶ refcount N, ONE upstream task
//!
//!  upstream task (per symbol)            listeners (symbol-agnostic)
//!  ┌──────────────────────────┐          ┌─────────────┐
//!  │ open ─▶ read ─▶ fan out  │ ───────▶ │ dispatch    │
//!  │   ▲        │ error      │ ───────▶ │ loop, tests │
//!  │   └─ 100ms ┘            │          └─────────────┘
//!  └──────────────────────────┘
//! ```
//!
//! ## Contract
//! * Every listener receives every event from every open symbol stream. The
//!   consumer filters by symbol.
//! * Delivery is sequential over bounded channels of capacity 1: a listener
//!   that stops reading stalls delivery for that symbol. Consumers must drain
//!   promptly.
//! * The table lock is held only while the table changes, never across
//!   network I/O or channel sends.
//! * Dropping the refcount to zero cancels the symbol's token; the task
//!   closes its connection and exits before attempting another reconnect.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::exchange::{BoxedMarketStream, ExchangeClient};
use crate::models::MarketTrade;

type ListenerId = u64;

// ─── Listener Handle ──────────────────────────────────────────────────────────

/// Registration returned by [`StreamMultiplexer::subscribe`]. Receive events
/// with [`ListenerHandle::recv`]; pass it back to `unsubscribe` to stop.
pub struct ListenerHandle {
    id: ListenerId,
    rx: mpsc::Receiver<MarketTrade>,
}

impl ListenerHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next event, or `None` once the listener was removed or the
    /// multiplexer shut down.
    pub async fn recv(&mut self) -> Option<MarketTrade> {
        self.rx.recv().await
    }
}

// ─── Subscription Table ───────────────────────────────────────────────────────

struct SymbolSubscription {
    refcount: usize,
    cancel:   CancellationToken,
    task:     JoinHandle<()>,
}

#[derive(Default)]
struct Table {
    symbols:       HashMap<String, SymbolSubscription>,
    listeners:     BTreeMap<ListenerId, mpsc::Sender<MarketTrade>>,
    next_listener: ListenerId,
}

struct Shared {
    exchange: Arc<dyn ExchangeClient>,
    backoff:  Duration,
    table:    Mutex<Table>,
}

// ─── StreamMultiplexer ────────────────────────────────────────────────────────

pub struct StreamMultiplexer {
    shared: Arc<Shared>,
}

impl StreamMultiplexer {
    pub fn new(exchange: Arc<dyn ExchangeClient>, backoff: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                exchange,
                backoff,
                table: Mutex::new(Table::default()),
            }),
        }
    }

    /// Registers a listener for every event of every open symbol stream.
    pub async fn subscribe(&self) -> ListenerHandle {
        let (tx, rx) = mpsc::channel(1);
        let mut table = self.shared.table.lock().await;
        let id = table.next_listener;
        table.next_listener += 1;
        table.listeners.insert(id, tx);
        debug!(listener = id, listeners = table.listeners.len(), "Stream listener registered");
        ListenerHandle { id, rx }
    }

    /// Removes a listener. Calling it again for the same handle does nothing.
    pub async fn unsubscribe(&self, handle: &ListenerHandle) {
        let mut table = self.shared.table.lock().await;
        if table.listeners.remove(&handle.id).is_some() {
            debug!(listener = handle.id, "Stream listener removed");
        }
    }

    /// Takes a reference on `symbol`'s upstream stream, starting it on 0→1.
    pub async fn subscribe_symbol(&self, symbol: &str) {
        let symbol = symbol.trim().to_lowercase();
        let mut table = self.shared.table.lock().await;

        if let Some(sub) = table.symbols.get_mut(&symbol) {
            sub.refcount += 1;
            debug!(symbol = %symbol, refcount = sub.refcount, "Symbol stream shared");
            return;
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_symbol_stream(
            Arc::clone(&self.shared),
            symbol.clone(),
            cancel.clone(),
        ));
        table.symbols.insert(
            symbol.clone(),
            SymbolSubscription {
                refcount: 1,
                cancel,
                task,
            },
        );
        info!(symbol = %symbol, "📡 Symbol stream started");
    }

    /// Drops a reference on `symbol`; on 1→0 the upstream task is told to
    /// close its connection and exit.
    pub async fn unsubscribe_symbol(&self, symbol: &str) {
        let symbol = symbol.trim().to_lowercase();
        let mut table = self.shared.table.lock().await;

        let Some(sub) = table.symbols.get_mut(&symbol) else {
            warn!(symbol = %symbol, "unsubscribe_symbol without subscription, ignored");
            return;
        };
        sub.refcount -= 1;
        if sub.refcount > 0 {
            debug!(symbol = %symbol, refcount = sub.refcount, "Symbol stream reference dropped");
            return;
        }

        if let Some(sub) = table.symbols.remove(&symbol) {
            sub.cancel.cancel();
            info!(symbol = %symbol, "📴 Symbol stream stopping");
        }
    }

    pub async fn refcount(&self, symbol: &str) -> usize {
        let table = self.shared.table.lock().await;
        table
            .symbols
            .get(&symbol.trim().to_lowercase())
            .map(|sub| sub.refcount)
            .unwrap_or(0)
    }

    pub async fn subscribed_symbols(&self) -> Vec<String> {
        let table = self.shared.table.lock().await;
        let mut symbols: Vec<String> = table.symbols.keys().cloned().collect();
        symbols.sort();
        symbols
    }

    pub async fn listener_count(&self) -> usize {
        self.shared.table.lock().await.listeners.len()
    }

    /// Stops every symbol task, waits for them to close their connections,
    /// and drops all listeners.
    pub async fn shutdown(&self) {
        let subs: Vec<(String, SymbolSubscription)> = {
            let mut table = self.shared.table.lock().await;
            table.listeners.clear();
            table.symbols.drain().collect()
        };

        for (symbol, sub) in subs {
            sub.cancel.cancel();
            if let Err(e) = sub.task.await {
                error!(symbol = %symbol, error = %e, "Symbol stream task panicked");
            }
        }
        info!("Stream multiplexer shut down");
    }
}

// ─── Per-Symbol Task ──────────────────────────────────────────────────────────

/// Open → read → fan out, reconnecting after a fixed backoff until cancelled.
async fn run_symbol_stream(shared: Arc<Shared>, symbol: String, cancel: CancellationToken) {
    loop {
        let opened = tokio::select! {
            _ = cancel.cancelled() => break,
            opened = shared.exchange.open_trade_stream(&symbol) => opened,
        };

        match opened {
            Ok(mut stream) => {
                info!(symbol = %symbol, "Upstream stream connected");
                let cancelled = pump_stream(&shared, &symbol, &mut stream, &cancel).await;
                stream.close().await;
                if cancelled {
                    break;
                }
            }
            Err(e) => {
                error!(symbol = %symbol, error = %e, "Upstream stream open failed");
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(shared.backoff) => {
                info!(symbol = %symbol, backoff_ms = shared.backoff.as_millis() as u64, "Reconnecting upstream stream");
            }
        }
    }
    info!(symbol = %symbol, "Upstream stream closed");
}

/// Reads until the stream fails or ends (`false`) or the token fires (`true`).
async fn pump_stream(
    shared: &Shared,
    symbol: &str,
    stream: &mut BoxedMarketStream,
    cancel: &CancellationToken,
) -> bool {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return true,
            event = stream.next() => event,
        };

        match event {
            Some(Ok(trade)) => {
                tokio::select! {
                    _ = cancel.cancelled() => return true,
                    _ = fan_out(shared, trade) => {}
                }
            }
            Some(Err(e)) => {
                error!(symbol, error = %e, "Upstream stream read failed");
                return false;
            }
            None => {
                warn!(symbol, "Upstream stream ended");
                return false;
            }
        }
    }
}

/// Delivers `trade` to every listener in registration order. The listener
/// list is copied out of the table so no lock is held while sending.
async fn fan_out(shared: &Shared, trade: MarketTrade) {
    let listeners: Vec<(ListenerId, mpsc::Sender<MarketTrade>)> = {
        let table = shared.table.lock().await;
        table
            .listeners
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect()
    };

    let mut gone = Vec::new();
    for (id, tx) in listeners {
        if tx.send(trade.clone()).await.is_err() {
            gone.push(id);
        }
    }

    if !gone.is_empty() {
        let mut table = shared.table.lock().await;
        for id in gone {
            table.listeners.remove(&id);
            debug!(listener = id, "Dropped listener with closed channel");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::PaperExchange;
    use tokio::time::{sleep, timeout};

    const WAIT: Duration = Duration::from_secs(2);

    fn setup() -> (PaperExchange, StreamMultiplexer) {
        let paper = PaperExchange::new();
        let mux = StreamMultiplexer::new(Arc::new(paper.clone()), Duration::from_millis(10));
        (paper, mux)
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        timeout(WAIT, async {
            while !cond() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    async fn next(handle: &mut ListenerHandle) -> MarketTrade {
        timeout(WAIT, handle.recv())
            .await
            .expect("no event in time")
            .expect("listener closed")
    }

    #[tokio::test]
    async fn test_concurrent_subscribers_share_one_connection() {
        let (paper, mux) = setup();
        let mux = Arc::new(mux);

        let subs: Vec<_> = (0..16)
            .map(|_| {
                let mux = Arc::clone(&mux);
                tokio::spawn(async move { mux.subscribe_symbol("ETHUSDT").await })
            })
            .collect();
        for task in subs {
            task.await.unwrap();
        }
        assert_eq!(mux.refcount("ethusdt").await, 16);
        wait_until(|| paper.stream_opens("ethusdt") == 1).await;

        let unsubs: Vec<_> = (0..16)
            .map(|_| {
                let mux = Arc::clone(&mux);
                tokio::spawn(async move { mux.unsubscribe_symbol("ethusdt").await })
            })
            .collect();
        for task in unsubs {
            task.await.unwrap();
        }

        wait_until(|| paper.stream_closes("ethusdt") == 1).await;
        sleep(Duration::from_millis(50)).await;
        assert_eq!(paper.stream_opens("ethusdt"), 1);
        assert_eq!(paper.stream_closes("ethusdt"), 1);
        assert!(mux.subscribed_symbols().await.is_empty());
    }

    #[tokio::test]
    async fn test_fan_out_is_symbol_agnostic() {
        let (paper, mux) = setup();
        let mut a = mux.subscribe().await;
        let mut b = mux.subscribe().await;

        mux.subscribe_symbol("ethusdt").await;
        mux.subscribe_symbol("btcusdt").await;
        wait_until(|| paper.stream_opens("ethusdt") == 1 && paper.stream_opens("btcusdt") == 1).await;

        paper.push_trade("ethusdt", 100.0, 1.0);
        assert_eq!(next(&mut a).await.symbol, "ethusdt");
        assert_eq!(next(&mut b).await.symbol, "ethusdt");

        paper.push_trade("btcusdt", 20_000.0, 1.0);
        assert_eq!(next(&mut a).await.symbol, "btcusdt");
        assert_eq!(next(&mut b).await.symbol, "btcusdt");
    }

    #[tokio::test]
    async fn test_reconnect_loses_and_duplicates_nothing() {
        let (paper, mux) = setup();
        let mut listener = mux.subscribe().await;
        mux.subscribe_symbol("ethusdt").await;
        wait_until(|| paper.stream_opens("ethusdt") == 1).await;

        paper.push_trade("ethusdt", 1.0, 1.0);
        paper.push_trade("ethusdt", 2.0, 1.0);
        assert_eq!(next(&mut listener).await.price, 1.0);
        assert_eq!(next(&mut listener).await.price, 2.0);

        paper.fail_next_opens(1);
        paper.fail_streams("ethusdt", "connection reset");
        // one failed open, then a successful one
        wait_until(|| paper.stream_opens("ethusdt") == 2).await;
        assert_eq!(paper.stream_closes("ethusdt"), 1);

        paper.push_trade("ethusdt", 3.0, 1.0);
        paper.push_trade("ethusdt", 4.0, 1.0);
        assert_eq!(next(&mut listener).await.price, 3.0);
        assert_eq!(next(&mut listener).await.price, 4.0);

        assert!(
            timeout(Duration::from_millis(50), listener.recv()).await.is_err(),
            "no extra events after the reconnect"
        );
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let (paper, mux) = setup();
        let mut gone = mux.subscribe().await;
        let mut kept = mux.subscribe().await;
        assert_eq!(mux.listener_count().await, 2);

        mux.unsubscribe(&gone).await;
        mux.unsubscribe(&gone).await;
        assert_eq!(mux.listener_count().await, 1);

        mux.subscribe_symbol("ethusdt").await;
        wait_until(|| paper.stream_opens("ethusdt") == 1).await;
        paper.push_trade("ethusdt", 5.0, 1.0);
        assert_eq!(next(&mut kept).await.price, 5.0);
        assert!(gone.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_reconnect_during_backoff() {
        let paper = PaperExchange::new();
        let mux = StreamMultiplexer::new(Arc::new(paper.clone()), Duration::from_secs(60));

        paper.fail_next_opens(1);
        mux.subscribe_symbol("ethusdt").await;
        sleep(Duration::from_millis(20)).await;
        mux.unsubscribe_symbol("ethusdt").await;

        sleep(Duration::from_millis(50)).await;
        assert_eq!(paper.stream_opens("ethusdt"), 0);
        mux.shutdown().await;
    }

    #[tokio::test]
    async fn test_refcount_uses_the_same_symbol_key() {
        let (_paper, mux) = setup();
        mux.subscribe_symbol(" ETHUSDT ").await;
        mux.subscribe_symbol("ethusdt").await;

        assert_eq!(mux.refcount("ethusdt").await, 2);
        assert_eq!(mux.refcount("  EthUsdt\n").await, 2);
        assert_eq!(mux.refcount("btcusdt").await, 0);

        mux.unsubscribe_symbol("ETHUSDT ").await;
        assert_eq!(mux.refcount(" ethusdt").await, 1);
        mux.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_closes_every_stream() {
        let (paper, mux) = setup();
        let mut listener = mux.subscribe().await;
        mux.subscribe_symbol("ethusdt").await;
        mux.subscribe_symbol("solusdt").await;
        wait_until(|| paper.stream_opens("ethusdt") == 1 && paper.stream_opens("solusdt") == 1).await;

        mux.shutdown().await;
        assert_eq!(paper.stream_closes("ethusdt"), 1);
        assert_eq!(paper.stream_closes("solusdt"), 1);
        assert!(listener.recv().await.is_none());
    }
}
