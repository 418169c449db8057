//! # routes::monitor
//!
//! **Trade stream** for dashboards.
//!
//! | Method    | Path          | Description                                 |
//! |-----------|---------------|---------------------------------------------|
//! | GET (WS)  | `/ws/trades`  | `SNAPSHOT` on connect, then `TRADE_UPDATE`  |
//!
//! Each socket is one observer on the [`UpdateBroadcaster`](crate::engine::UpdateBroadcaster).
//! Its queue is unbounded, so a slow client only grows its own backlog.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info};

use crate::{events::WsEvent, state::SharedState};

// ─── WebSocket Handler ────────────────────────────────────────────────────────

pub async fn ws_trades(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: SharedState) {
    // Register before taking the snapshot so no update falls in between.
    let mut observer = state.engine.broadcaster().register().await;
    let (mut sender, mut receiver) = socket.split();

    info!(observer = observer.id(), "🔌 Trade observer connected");

    let active = state.engine.active_trades().await;
    let snapshot = WsEvent::Snapshot { trades: &active }.to_json();
    if sender.send(Message::Text(snapshot)).await.is_ok() {
        loop {
            tokio::select! {
                update = observer.recv() => {
                    let Some(trade) = update else { break };
                    let frame = WsEvent::TradeUpdate { trade: trade.as_ref() }.to_json();
                    if sender.send(Message::Text(frame)).await.is_err() {
                        break;
                    }
                }

                incoming = receiver.next() => {
                    match incoming {
                        Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                        Some(Ok(Message::Ping(data))) => {
                            let _ = sender.send(Message::Pong(data)).await;
                        }
                        Some(Ok(other)) => debug!(?other, "Ignoring client frame"),
                    }
                }
            }
        }
    }

    state.engine.broadcaster().unregister(observer.id()).await;
    info!(observer = observer.id(), "🔌 Trade observer disconnected");
}
