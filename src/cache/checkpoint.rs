use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::features::symbol::Symbol;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckpointStatus {
    Running,
    Completed,
    Failed,
}

impl fmt::Display for CheckpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointStatus::Running => write!(f, "running"),
            CheckpointStatus::Completed => write!(f, "completed"),
            CheckpointStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Progress of one symbol within one backfill run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub symbol: Symbol,
    /// Start of the last hour bucket whose batch committed.
    pub last_committed: Option<DateTime<Utc>>,
    pub status: CheckpointStatus,
    pub rows_committed: u64,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn running(symbol: Symbol, last_committed: Option<DateTime<Utc>>, rows_committed: u64) -> Self {
        Self {
            symbol,
            last_committed,
            status: CheckpointStatus::Running,
            rows_committed,
            updated_at: Utc::now(),
        }
    }

    pub fn with_status(mut self, status: CheckpointStatus) -> Self {
        self.status = status;
        self.updated_at = Utc::now();
        self
    }
}

/// Identifies a backfill run. Restarting with the same range resumes it.
pub fn run_key(start: DateTime<Utc>, end: DateTime<Utc>) -> String {
    format!("backfill:{}:{}", start.format("%Y%m%dT%H"), end.format("%Y%m%dT%H"))
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, run_key: &str, symbol: &Symbol) -> Result<Option<Checkpoint>>;

    async fn save(&self, run_key: &str, checkpoint: &Checkpoint) -> Result<()>;

    async fn list(&self, run_key: &str) -> Result<Vec<Checkpoint>>;

    /// Remove every checkpoint of a run. Returns how many were removed.
    async fn clear(&self, run_key: &str) -> Result<usize>;
}

/// Process-local store, used when no Redis is configured and in tests.
/// Checkpoints do not survive a restart.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    entries: RwLock<HashMap<String, HashMap<Symbol, Checkpoint>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, run_key: &str, symbol: &Symbol) -> Result<Option<Checkpoint>> {
        Ok(self.entries.read().get(run_key).and_then(|run| run.get(symbol)).cloned())
    }

    async fn save(&self, run_key: &str, checkpoint: &Checkpoint) -> Result<()> {
        self.entries
            .write()
            .entry(run_key.to_string())
            .or_default()
            .insert(checkpoint.symbol.clone(), checkpoint.clone());
        Ok(())
    }

    async fn list(&self, run_key: &str) -> Result<Vec<Checkpoint>> {
        let mut checkpoints: Vec<Checkpoint> = self
            .entries
            .read()
            .get(run_key)
            .map(|run| run.values().cloned().collect())
            .unwrap_or_default();
        checkpoints.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(checkpoints)
    }

    async fn clear(&self, run_key: &str) -> Result<usize> {
        Ok(self.entries.write().remove(run_key).map_or(0, |run| run.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn btc() -> Symbol {
        Symbol::normalize("BTC").unwrap()
    }

    #[test]
    fn test_run_key_is_stable() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        assert_eq!(run_key(start, end), "backfill:20240101T00:20240201T00");
    }

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryCheckpointStore::new();
        let cp = Checkpoint::running(btc(), None, 0);
        store.save("run", &cp).await.unwrap();

        assert_eq!(store.load("run", &btc()).await.unwrap(), Some(cp));
        assert_eq!(store.load("other", &btc()).await.unwrap(), None);
        assert_eq!(store.list("run").await.unwrap().len(), 1);
        assert_eq!(store.clear("run").await.unwrap(), 1);
        assert!(store.list("run").await.unwrap().is_empty());
    }
}
