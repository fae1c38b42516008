use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::command::WorkerCommand;
use crate::error::{ControllerError, Result};
use crate::model::WorkerId;

/// One joined worker: its outbound command channel and load accounting.
pub struct WorkerEntry {
    pub id: WorkerId,
    sender: mpsc::Sender<WorkerCommand>,
    outstanding: AtomicUsize,
}

impl WorkerEntry {
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }
}

/// Registry of live workers.
///
/// Commands to one worker flow through one mpsc sender, so per-connection
/// delivery order is the send order.
pub struct WorkerRegistry {
    workers: DashMap<WorkerId, Arc<WorkerEntry>>,
    next_id: AtomicU32,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self {
            workers: DashMap::new(),
            next_id: AtomicU32::new(1),
        }
    }

    /// Joins a worker, honoring a rejoin with a previously assigned id.
    pub fn register(
        &self,
        requested: Option<WorkerId>,
        sender: mpsc::Sender<WorkerCommand>,
    ) -> WorkerId {
        let id = match requested {
            Some(id) => {
                // Keep the allocator ahead of externally supplied ids.
                self.next_id.fetch_max(id + 1, Ordering::AcqRel);
                id
            }
            None => self.next_id.fetch_add(1, Ordering::AcqRel),
        };
        self.workers.insert(
            id,
            Arc::new(WorkerEntry {
                id,
                sender,
                outstanding: AtomicUsize::new(0),
            }),
        );
        info!(worker = id, "worker joined");
        id
    }

    pub fn contains(&self, id: WorkerId) -> bool {
        self.workers.contains_key(&id)
    }

    pub fn active_count(&self) -> usize {
        self.workers.len()
    }

    pub fn ids(&self) -> Vec<WorkerId> {
        self.workers.iter().map(|w| *w.key()).collect()
    }

    pub fn load(&self, id: WorkerId) -> usize {
        self.workers
            .get(&id)
            .map(|w| w.outstanding())
            .unwrap_or(usize::MAX)
    }

    pub fn least_loaded(&self) -> Option<WorkerId> {
        self.workers
            .iter()
            .min_by_key(|w| w.outstanding())
            .map(|w| w.id)
    }

    /// Sends a command, counting it against the worker's outstanding load.
    pub async fn send(&self, id: WorkerId, command: WorkerCommand) -> Result<()> {
        let entry = self
            .workers
            .get(&id)
            .map(|w| w.clone())
            .ok_or(ControllerError::UnknownWorker(id))?;
        entry.outstanding.fetch_add(1, Ordering::AcqRel);
        debug!(worker = id, command = ?command.job_id(), "command dispatched");
        entry
            .sender
            .send(command)
            .await
            .map_err(|_| ControllerError::ChannelClosed(id))
    }

    /// Credits a completion back against the worker's load.
    pub fn credit_completion(&self, id: WorkerId) {
        if let Some(entry) = self.workers.get(&id) {
            let prev = entry.outstanding.fetch_sub(1, Ordering::AcqRel);
            if prev == 0 {
                entry.outstanding.store(0, Ordering::Release);
            }
        }
    }

    pub fn remove(&self, id: WorkerId) -> bool {
        self.workers.remove(&id).is_some()
    }
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::JobIdSet;

    fn channel() -> (mpsc::Sender<WorkerCommand>, mpsc::Receiver<WorkerCommand>) {
        mpsc::channel(16)
    }

    #[test]
    fn test_register_assigns_fresh_ids() {
        let registry = WorkerRegistry::new();
        let (tx1, _rx1) = channel();
        let (tx2, _rx2) = channel();
        let a = registry.register(None, tx1);
        let b = registry.register(None, tx2);
        assert_ne!(a, b);
        assert_eq!(registry.active_count(), 2);
    }

    #[test]
    fn test_rejoin_keeps_requested_id() {
        let registry = WorkerRegistry::new();
        let (tx, _rx) = channel();
        let id = registry.register(Some(9), tx);
        assert_eq!(id, 9);

        let (tx2, _rx2) = channel();
        assert!(registry.register(None, tx2) > 9);
    }

    #[tokio::test]
    async fn test_send_orders_and_counts_load() {
        let registry = WorkerRegistry::new();
        let (tx, mut rx) = channel();
        let id = registry.register(None, tx);

        registry
            .send(id, WorkerCommand::Cancel { job_id: 1 })
            .await
            .unwrap();
        registry
            .send(id, WorkerCommand::Cancel { job_id: 2 })
            .await
            .unwrap();
        assert_eq!(registry.load(id), 2);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.job_id(), Some(1));
        let second = rx.recv().await.unwrap();
        assert_eq!(second.job_id(), Some(2));

        registry.credit_completion(id);
        assert_eq!(registry.load(id), 1);
    }

    #[tokio::test]
    async fn test_send_to_closed_channel_reports_lost() {
        let registry = WorkerRegistry::new();
        let (tx, rx) = channel();
        let id = registry.register(None, tx);
        drop(rx);

        let err = registry
            .send(
                id,
                WorkerCommand::Create {
                    job_id: 1,
                    ldo: 1,
                    phys_id: 1,
                    before: JobIdSet::new(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::ChannelClosed(_)));
    }

    #[test]
    fn test_least_loaded() {
        let registry = WorkerRegistry::new();
        let (tx1, _rx1) = channel();
        let (tx2, _rx2) = channel();
        let a = registry.register(None, tx1);
        let b = registry.register(None, tx2);

        registry.workers.get(&a).unwrap().outstanding.store(5, Ordering::Release);
        assert_eq!(registry.least_loaded(), Some(b));
    }
}
