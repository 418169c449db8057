//! # engine
//!
//! The trade lifecycle core.
//!
//! ```text
//!  ExchangeClient ──▶ StreamMultiplexer ──▶ dispatch loop ──▶ TradeEngine ──▶ ExchangeClient
//!                                                               │   │
//!                                                   TradeStore ◀┘   └▶ UpdateBroadcaster
//! ```

pub mod broadcaster;
pub mod dispatch;
pub mod exits;
pub mod multiplexer;
pub mod order_id;
pub mod registry;
pub mod service;

pub use broadcaster::UpdateBroadcaster;
pub use multiplexer::StreamMultiplexer;
pub use service::TradeEngine;
