use async_trait::async_trait;
use std::path::Path;

use crate::checkpoint::CheckpointEntry;
use crate::error::Result;
use crate::model::CheckpointId;

/// Persistence for checkpoint entries and their lineage tails.
///
/// The byte layout is private to the implementation; the contract is that
/// the persisted set restores the committed prefix exactly on restart.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persists a complete checkpoint entry.
    async fn persist(&self, entry: &CheckpointEntry) -> Result<()>;

    /// Loads one entry by id.
    async fn load(&self, id: CheckpointId) -> Result<Option<CheckpointEntry>>;

    /// Loads every persisted entry, ordered by id.
    async fn load_all(&self) -> Result<Vec<CheckpointEntry>>;

    /// Flushes pending writes to durable storage.
    async fn flush(&self) -> Result<()>;
}

/// sled-backed store: one tree, bincode values keyed by checkpoint id.
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// An in-memory store for runs without a configured checkpoint path.
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }
}

#[async_trait]
impl CheckpointStore for SledStore {
    async fn persist(&self, entry: &CheckpointEntry) -> Result<()> {
        let value = bincode::serialize(entry)?;
        self.db.insert(entry.id.to_be_bytes(), value)?;
        Ok(())
    }

    async fn load(&self, id: CheckpointId) -> Result<Option<CheckpointEntry>> {
        match self.db.get(id.to_be_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn load_all(&self) -> Result<Vec<CheckpointEntry>> {
        let mut entries = Vec::new();
        for item in self.db.iter() {
            let (_, bytes) = item?;
            entries.push(bincode::deserialize::<CheckpointEntry>(&bytes)?);
        }
        entries.sort_by_key(|e| e.id);
        Ok(entries)
    }

    async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lineage::LineageEntry;
    use crate::model::{Job, JobIdSet, JobKind};
    use tempfile::TempDir;

    fn entry_with_content(id: CheckpointId) -> CheckpointEntry {
        let mut entry = CheckpointEntry::new(id);
        entry.add_job(&Job::synthesized(10, JobKind::Compute, JobIdSet::new()));
        entry.add_save_data_job(100, 5, 1, 2);
        entry.notify_save_done(100, "handle-5".to_string()).unwrap();
        entry.set_lineage_tail(vec![(
            5,
            vec![LineageEntry {
                job_id: 10,
                version: 1,
                depth: 0,
                sterile: false,
            }],
        )]);
        entry
    }

    #[tokio::test]
    async fn test_persist_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = SledStore::open(dir.path().join("ckpt")).unwrap();

        store.persist(&entry_with_content(1)).await.unwrap();
        store.flush().await.unwrap();

        let loaded = store.load(1).await.unwrap().unwrap();
        assert_eq!(loaded.id, 1);
        assert!(loaded.includes(10));
        assert_eq!(loaded.handles_for(5, 1), vec![(2, "handle-5".to_string())]);
        assert_eq!(loaded.lineage_tail().len(), 1);
        assert!(store.load(2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_load_all_ordered() {
        let store = SledStore::temporary().unwrap();
        store.persist(&entry_with_content(3)).await.unwrap();
        store.persist(&entry_with_content(1)).await.unwrap();
        store.persist(&entry_with_content(2)).await.unwrap();

        let all = store.load_all().await.unwrap();
        let ids: Vec<CheckpointId> = all.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }
}
