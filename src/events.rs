//! # events
//!
//! Defines [`WsEvent`]: every frame pushed to `/ws/trades` observers.
//!
//! Events borrow the trades they carry and are serialized straight to a JSON
//! string, so a broadcast snapshot is never cloned again per frame.

use serde::Serialize;

use crate::models::Trade;

#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WsEvent<'a> {
    /// Sent once on connect: every active trade.
    Snapshot { trades: &'a [Trade] },

    /// A trade changed state or configuration.
    TradeUpdate { trade: &'a Trade },
}

impl WsEvent<'_> {
    #[inline]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|_| r#"{"event":"SERIALIZATION_ERROR"}"#.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_tags() {
        let trade = Trade::new("ethusdt");
        let update: serde_json::Value =
            serde_json::from_str(&WsEvent::TradeUpdate { trade: &trade }.to_json()).unwrap();
        assert_eq!(update["event"], "TRADE_UPDATE");
        assert_eq!(update["trade"]["symbol"], "ethusdt");

        let trades = vec![trade];
        let snapshot: serde_json::Value =
            serde_json::from_str(&WsEvent::Snapshot { trades: &trades }.to_json()).unwrap();
        assert_eq!(snapshot["event"], "SNAPSHOT");
        assert_eq!(snapshot["trades"].as_array().map(Vec::len), Some(1));
    }
}
