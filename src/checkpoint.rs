use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

use crate::error::{ControllerError, Result};
use crate::lineage::LineageEntry;
use crate::model::{CheckpointId, Job, JobId, LdoId, Version, WorkerId};

/// A worker and the opaque reload handle it reported for a saved replica.
pub type WorkerHandle = (WorkerId, String);

/// Metadata for one checkpoint: the committed job prefix, the outstanding
/// SAVE_DATA jobs, and the handle index used to reload data on rewind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub id: CheckpointId,
    pub created_at: DateTime<Utc>,
    jobs: HashMap<JobId, Job>,
    save_jobs: HashMap<JobId, (LdoId, Version, WorkerId)>,
    index: HashMap<LdoId, HashMap<Version, Vec<WorkerHandle>>>,
    lineage_tail: Vec<(LdoId, Vec<LineageEntry>)>,
    pending_save_count: u64,
}

impl CheckpointEntry {
    pub fn new(id: CheckpointId) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            jobs: HashMap::new(),
            save_jobs: HashMap::new(),
            index: HashMap::new(),
            lineage_tail: Vec::new(),
            pending_save_count: 0,
        }
    }

    /// Includes a job in the committed prefix.
    pub fn add_job(&mut self, job: &Job) {
        self.jobs.insert(job.id, job.clone());
    }

    pub fn includes(&self, job_id: JobId) -> bool {
        self.jobs.contains_key(&job_id)
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    pub fn job_ids(&self) -> HashSet<JobId> {
        self.jobs.keys().copied().collect()
    }

    pub fn set_lineage_tail(&mut self, tail: Vec<(LdoId, Vec<LineageEntry>)>) {
        self.lineage_tail = tail;
    }

    pub fn lineage_tail(&self) -> &[(LdoId, Vec<LineageEntry>)] {
        &self.lineage_tail
    }

    /// Registers an emitted SAVE_DATA job; the entry is incomplete until
    /// every one reports back.
    pub fn add_save_data_job(
        &mut self,
        job_id: JobId,
        ldo: LdoId,
        version: Version,
        worker: WorkerId,
    ) {
        self.save_jobs.insert(job_id, (ldo, version, worker));
        self.pending_save_count += 1;
    }

    /// Records a save completion with the worker's reload handle.
    pub fn notify_save_done(&mut self, job_id: JobId, handle: String) -> Result<()> {
        let (ldo, version, worker) = self
            .save_jobs
            .get(&job_id)
            .copied()
            .ok_or(ControllerError::UnknownJob(job_id))?;
        self.index
            .entry(ldo)
            .or_default()
            .entry(version)
            .or_default()
            .push((worker, handle));
        self.pending_save_count = self.pending_save_count.saturating_sub(1);
        debug!(
            checkpoint = self.id,
            job = job_id,
            ldo,
            version,
            pending = self.pending_save_count,
            "save data done"
        );
        Ok(())
    }

    /// Handles usable to reload `ldo` at `version`.
    pub fn handles_for(&self, ldo: LdoId, version: Version) -> Vec<WorkerHandle> {
        self.index
            .get(&ldo)
            .and_then(|v| v.get(&version))
            .cloned()
            .unwrap_or_default()
    }

    /// Every saved (ldo, version) pair with its handles.
    pub fn saved_replicas(&self) -> Vec<(LdoId, Version, WorkerHandle)> {
        let mut out = Vec::new();
        for (&ldo, versions) in &self.index {
            for (&version, handles) in versions {
                for handle in handles {
                    out.push((ldo, version, handle.clone()));
                }
            }
        }
        out
    }

    pub fn is_complete(&self) -> bool {
        self.pending_save_count == 0
    }

    /// The committed prefix covers every job in `required`.
    pub fn covers(&self, required: &HashSet<JobId>) -> bool {
        required.iter().all(|id| self.jobs.contains_key(id))
    }
}

/// All open and committed checkpoints, newest last.
pub struct CheckpointRegistry {
    entries: DashMap<CheckpointId, CheckpointEntry>,
    order: Mutex<Vec<CheckpointId>>,
    save_job_index: DashMap<JobId, CheckpointId>,
}

impl CheckpointRegistry {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            order: Mutex::new(Vec::new()),
            save_job_index: DashMap::new(),
        }
    }

    pub fn open(&self, id: CheckpointId) -> Result<()> {
        if self.entries.contains_key(&id) {
            return Err(ControllerError::fatal(format!(
                "checkpoint {} already open",
                id
            )));
        }
        self.entries.insert(id, CheckpointEntry::new(id));
        self.order.lock().push(id);
        Ok(())
    }

    pub fn insert(&self, entry: CheckpointEntry) {
        let id = entry.id;
        self.entries.insert(id, entry);
        let mut order = self.order.lock();
        if !order.contains(&id) {
            order.push(id);
            order.sort_unstable();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn with_entry<R>(
        &self,
        id: CheckpointId,
        f: impl FnOnce(&mut CheckpointEntry) -> R,
    ) -> Result<R> {
        let mut entry = self
            .entries
            .get_mut(&id)
            .ok_or(ControllerError::UnknownCheckpoint(id))?;
        Ok(f(&mut entry))
    }

    pub fn get(&self, id: CheckpointId) -> Result<CheckpointEntry> {
        self.entries
            .get(&id)
            .map(|e| e.clone())
            .ok_or(ControllerError::UnknownCheckpoint(id))
    }

    /// Tags a SAVE_DATA job so its completion routes to the right entry.
    pub fn register_save_job(&self, job_id: JobId, checkpoint: CheckpointId) {
        self.save_job_index.insert(job_id, checkpoint);
    }

    /// Routes a save completion; unknown save jobs are dropped by the
    /// caller for idempotent safety.
    pub fn notify_save_done(&self, job_id: JobId, handle: String) -> Result<CheckpointId> {
        let checkpoint = self
            .save_job_index
            .get(&job_id)
            .map(|c| *c)
            .ok_or(ControllerError::UnknownJob(job_id))?;
        self.with_entry(checkpoint, |entry| entry.notify_save_done(job_id, handle))??;
        self.save_job_index.remove(&job_id);
        Ok(checkpoint)
    }

    /// Whether any checkpoint has committed (all saves reported).
    pub fn has_complete(&self) -> bool {
        self.newest_complete().is_some()
    }

    /// The newest committed checkpoint, if any.
    pub fn newest_complete(&self) -> Option<CheckpointId> {
        let order = self.order.lock();
        order.iter().rev().copied().find(|id| {
            self.entries
                .get(id)
                .map(|e| e.is_complete())
                .unwrap_or(false)
        })
    }

    /// Checkpoint ids, newest first.
    pub fn newest_first(&self) -> Vec<CheckpointId> {
        let order = self.order.lock();
        order.iter().rev().copied().collect()
    }

    /// The newest complete checkpoint whose committed prefix covers
    /// `required`.
    pub fn select_rewind_point(&self, required: &HashSet<JobId>) -> Option<CheckpointId> {
        let order = self.order.lock();
        for &id in order.iter().rev() {
            if let Some(entry) = self.entries.get(&id) {
                if entry.is_complete() && entry.covers(required) {
                    return Some(id);
                }
            }
        }
        warn!(required = required.len(), "no rewind point covers the lost set");
        None
    }
}

impl Default for CheckpointRegistry {
    fn default() -> Self {
        Self::new()
    }
}
