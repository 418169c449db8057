//! # store::file
//!
//! One pretty-printed JSON document per trade under `DATA_DIR/trades/`.
//! Writes go to a temp file first and are renamed into place, so a crash
//! mid-write never leaves a truncated document behind.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::{info, warn};

use super::{sort_newest_first, StoreError, TradeFilter, TradeStore};
use crate::models::{LocalId, Trade};

pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Creates `<data_dir>/trades` if needed.
    pub async fn open(data_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = data_dir.as_ref().join("trades");
        fs::create_dir_all(&dir).await?;
        info!(dir = %dir.display(), "📁 File trade store ready");
        Ok(Self { dir })
    }

    fn path_for(&self, id: &LocalId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

#[async_trait]
impl TradeStore for FileStore {
    async fn save(&self, trade: &Trade) -> Result<(), StoreError> {
        let path = self.path_for(&trade.local_id);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(trade)?;
        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn get(&self, id: &LocalId) -> Result<Option<Trade>, StoreError> {
        match fs::read(self.path_for(id)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn query(&self, filter: TradeFilter) -> Result<Vec<Trade>, StoreError> {
        let mut trades = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = fs::read(&path).await?;
            match serde_json::from_slice::<Trade>(&bytes) {
                Ok(trade) if filter.matches(&trade) => trades.push(trade),
                Ok(_) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable trade file"),
            }
        }
        sort_newest_first(&mut trades);
        Ok(trades)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TradeStatus;

    #[tokio::test]
    async fn test_save_get_and_query() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();

        let mut open = Trade::new("ethusdt");
        open.set_stop_loss(true, 5.0);
        let mut failed = Trade::new("btcusdt");
        failed.transition(TradeStatus::Failed, "post buy").unwrap();

        store.save(&open).await.unwrap();
        store.save(&failed).await.unwrap();

        let loaded = store.get(&open.local_id).await.unwrap().unwrap();
        assert_eq!(loaded.symbol, "ethusdt");
        assert!(loaded.stop_loss.enabled);
        assert_eq!(loaded.history(), open.history());

        let active = store.query(TradeFilter::Active).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].local_id, open.local_id);

        let closed = store.query(TradeFilter::Closed).await.unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].status(), TradeStatus::Failed);

        assert_eq!(store.query(TradeFilter::All).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_trade_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        assert!(store.get(&uuid::Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_overwrites_previous_copy() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();

        let mut trade = Trade::new("ethusdt");
        store.save(&trade).await.unwrap();
        trade.transition(TradeStatus::Abandoned, "abandon").unwrap();
        store.save(&trade).await.unwrap();

        let loaded = store.get(&trade.local_id).await.unwrap().unwrap();
        assert_eq!(loaded.status(), TradeStatus::Abandoned);
        assert!(store.query(TradeFilter::Active).await.unwrap().is_empty());
    }
}
