//! # ExitPilot: Trade Lifecycle Engine
//!
//! ## Architecture Overview
//!
//! ```text
//!  ┌──────────────┐  trade streams (one per symbol)  ┌───────────────────────┐
//!  │   Exchange   │ ────────────────────────────────▶│  StreamMultiplexer    │
//!  │ (paper/bridge)│                                 └──────────┬────────────┘
//!  │              │  order updates                              │ fan-out
//!  │              │ ──────────────┐                  ┌──────────▼────────────┐
//!  └──────▲───────┘               └─────────────────▶│  TradeEngine          │──▶ TradeStore
//!         │  place / cancel                          │  (exit evaluation,    │
//!         └──────────────────────────────────────────│   state machine)      │──▶ UpdateBroadcaster ──▶ /ws/trades
//!                                                    └──────────▲────────────┘
//!  ┌──────────────┐   POST /api/trades/...                      │
//!  │  Dashboard   │ ────────────────────────────────────────────┘
//!  └──────────────┘
//! ```
//!
//! ## Environment Variables
//!
//! | Variable                     | Default                         | Description                          |
//! |------------------------------|---------------------------------|--------------------------------------|
//! | `BIND_ADDR`                  | `0.0.0.0:3000`                  | Address Axum listens on              |
//! | `EXCHANGE_MODE`              | `paper`                         | `paper` or `bridge`                  |
//! | `EXCHANGE_REST_URL`          | `http://localhost:8081`         | Order bridge base URL                |
//! | `EXCHANGE_WS_URL`            | `wss://stream.binance.com:9443` | Public market-data WebSocket         |
//! | `EXCHANGE_TIMEOUT_SECS`      | `5`                             | Per-request timeout for the bridge   |
//! | `STREAM_RECONNECT_BACKOFF_MS`| `100`                           | Delay before reopening a stream      |
//! | `STORE_KIND`                 | `file`                          | `memory`, `file` or `postgres`       |
//! | `DATA_DIR`                   | `./data`                        | Root for the file store              |
//! | `DATABASE_URL`               | (none)                          | Required for `postgres`              |
//! | `RECONCILE_INTERVAL_SECS`    | `5`                             | Retry period for failed saves        |
//! | `SETTLED_RETENTION_SECS`     | `300`                           | Time closed trades stay in memory    |
//! | `RUST_LOG`                   | `exitpilot=debug`               | Tracing filter                       |

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;
mod engine;
mod error;
mod events;
mod exchange;
mod models;
mod routes;
mod state;
mod store;

use config::{AppConfig, ExchangeMode, StoreKind};
use engine::{dispatch, StreamMultiplexer, TradeEngine, UpdateBroadcaster};
use exchange::{BridgeExchange, ExchangeClient, OrderUpdate, PaperExchange};
use state::build_state;
use store::{FileStore, MemoryStore, TradeStore};

// ─── Entry Point ──────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Load .env (optional: CI/prod can use real env vars) ──────────────
    dotenvy::dotenv().ok();

    // ── 2. Initialise structured logging ─────────────────────────────────────
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env()
            .add_directive("exitpilot=debug".parse()?)
            .add_directive("tower_http=info".parse()?))
        .init();

    info!(
        r#"

  ╔═══════════════════════════════════════════════╗
  ║        EXITPILOT · Trade Lifecycle Engine     ║
  ║        Rust + Axum  ·  Streams & Exits        ║
  ╚═══════════════════════════════════════════════╝"#
    );

    let config = AppConfig::from_env()?;
    info!(
        mode  = ?config.exchange_mode,
        store = ?config.store_kind,
        "Configuration loaded"
    );

    // ── 3. Exchange ──────────────────────────────────────────────────────────
    let (exchange, order_updates) = build_exchange(&config)?;

    // ── 4. Trade store ───────────────────────────────────────────────────────
    let store = build_store(&config).await?;

    // ── 5. Engine ────────────────────────────────────────────────────────────
    let multiplexer = Arc::new(StreamMultiplexer::new(exchange.clone(), config.reconnect_backoff));
    let broadcaster = Arc::new(UpdateBroadcaster::new());
    let engine = Arc::new(TradeEngine::new(exchange, store, multiplexer.clone(), broadcaster));

    let restored = engine.restore().await?;
    info!(restored, "Active trades restored");

    // ── 6. Background tasks ──────────────────────────────────────────────────
    let cancel = CancellationToken::new();
    let mut tasks = vec![
        tokio::spawn(dispatch::run_price_dispatch(
            engine.clone(),
            multiplexer.subscribe().await,
            cancel.clone(),
        )),
        tokio::spawn(dispatch::run_reconcile_loop(
            engine.clone(),
            config.reconcile_interval,
            config.settled_retention,
            cancel.clone(),
        )),
    ];
    match order_updates {
        Some(updates) => tasks.push(tokio::spawn(dispatch::run_order_update_pump(
            engine.clone(),
            updates,
            cancel.clone(),
        ))),
        None => info!("Order updates arrive via POST /api/exchange/order-update"),
    }

    // ── 7. Build CORS layer (allow the dashboard dev server) ────────────────
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // ── 8. Build the Axum router ─────────────────────────────────────────────
    let app = routes::build_router(build_state(engine.clone()))
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    info!(addr = ?config.bind_addr, "🚀 ExitPilot server starting");

    // ── 9. Serve until Ctrl-C ────────────────────────────────────────────────
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // ── 10. Drain ────────────────────────────────────────────────────────────
    cancel.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "Background task ended abnormally");
        }
    }
    engine.shutdown().await;
    let saved = engine.reconcile_unsaved().await;
    if engine.unsaved_count().await > 0 {
        warn!(saved, "Some trades could not be saved before exit");
    }

    info!("ExitPilot stopped");
    Ok(())
}

type OrderUpdateRx = tokio::sync::mpsc::UnboundedReceiver<OrderUpdate>;

fn build_exchange(
    config: &AppConfig,
) -> anyhow::Result<(Arc<dyn ExchangeClient>, Option<OrderUpdateRx>)> {
    match config.exchange_mode {
        ExchangeMode::Paper => {
            let paper = PaperExchange::new();
            let updates = paper.take_order_updates();
            info!("📄 Paper exchange enabled");
            Ok((Arc::new(paper), updates))
        }
        ExchangeMode::Bridge => {
            let client = reqwest::Client::builder()
                .timeout(config.exchange_timeout)
                .build()?;
            info!(
                rest = %config.exchange_rest_url,
                ws   = %config.exchange_ws_url,
                "🌉 Exchange bridge enabled"
            );
            let bridge = BridgeExchange::new(
                client,
                config.exchange_rest_url.clone(),
                config.exchange_ws_url.clone(),
                config.exchange_timeout,
            );
            Ok((Arc::new(bridge), None))
        }
    }
}

async fn build_store(config: &AppConfig) -> anyhow::Result<Arc<dyn TradeStore>> {
    match config.store_kind {
        StoreKind::Memory => {
            warn!("In-memory trade store: trades are lost on restart");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreKind::File => {
            let store = FileStore::open(&config.data_dir).await?;
            info!(dir = %config.data_dir.display(), "🗄️  File trade store ready");
            Ok(Arc::new(store))
        }
        #[cfg(feature = "postgres")]
        StoreKind::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("DATABASE_URL is required when STORE_KIND=postgres"))?;
            Ok(Arc::new(store::PgTradeStore::connect(url).await?))
        }
        #[cfg(not(feature = "postgres"))]
        StoreKind::Postgres => {
            anyhow::bail!("STORE_KIND=postgres needs a build with --features postgres")
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Could not listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
