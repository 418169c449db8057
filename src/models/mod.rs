//! Domain models shared across the entire ExitPilot system.

pub mod market;
pub mod trade;

pub use market::MarketTrade;
pub use trade::{
    BuyOrder, HistoryEntry, HistoryKind, LimitSellType, LocalId, SellOrder, SellTrigger,
    StopLossConfig, Trade, TradeStatus, TrailingProfitConfig, TrailingState,
};
