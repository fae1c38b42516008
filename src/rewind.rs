//! Checkpointing at frame boundaries and rewind on worker loss.
//!
//! A checkpoint snapshots the committed job prefix and the lineage tail,
//! then emits SAVE_DATA for one replica per (datum, committed version).
//! Losing a worker marks its jobs LOST, cancels the rest of the in-flight
//! frontier, restores lineage to the newest covering checkpoint, reloads
//! saved replicas, and re-drives the scheduling loop.

use std::collections::HashSet;
use tracing::{debug, info, warn};

use crate::command::WorkerCommand;
use crate::error::{ControllerError, Result};
use crate::model::{
    CheckpointId, Job, JobId, JobIdSet, JobKind, JobState, LdoId, Version, WorkerId,
};
use crate::{Controller, SynthJob};

/// Summary of one rewind pass. `worker` is set when a worker loss drove
/// the rewind; `checkpoint` is None only when the rewind predates any
/// committed checkpoint and the run replays from scratch.
#[derive(Debug, Clone)]
pub struct RewindStats {
    pub worker: Option<WorkerId>,
    pub lost_jobs: usize,
    pub cancelled_jobs: usize,
    pub dropped_replicas: usize,
    pub checkpoint: Option<CheckpointId>,
    pub reloads_issued: usize,
    pub requeued: usize,
}

impl Controller {
    /// Called when a main or complex job completes; opens a checkpoint on
    /// the configured cadence.
    pub(crate) async fn on_frame_boundary(&mut self) -> Result<()> {
        self.frames_completed += 1;
        let interval = self.config.checkpoint_interval_frames;
        if interval > 0 && self.frames_completed % interval == 0 {
            self.open_checkpoint().await?;
        }
        Ok(())
    }

    /// Opens a checkpoint at a quiescent boundary: snapshots the committed
    /// prefix and emits SAVE_DATA jobs for the last committed version of
    /// every live datum.
    pub async fn open_checkpoint(&mut self) -> Result<CheckpointId> {
        let id = self.ids.next_checkpoint_id();
        self.checkpoints.open(id)?;

        let done: Vec<Job> = self
            .graph
            .jobs_in_state(JobState::Done)
            .into_iter()
            .filter_map(|job_id| self.graph.get(job_id))
            .collect();
        let lineage_tail = self.versions.ledger().snapshot();
        self.checkpoints.with_entry(id, |entry| {
            for job in &done {
                entry.add_job(job);
            }
            entry.set_lineage_tail(lineage_tail);
        })?;

        // One replica per (datum, committed version). SAVE_DATA for a
        // version is only reachable here after its writers reported done,
        // because lineage advances on completion alone.
        let mut save_count = 0usize;
        for ldo in self.registry.ids() {
            let version = self.versions.ledger().last_version(ldo)?;
            let replica = self
                .directory
                .replicas(ldo)
                .into_iter()
                .find(|i| i.version == version && i.state == crate::model::PdiState::Valid);
            let Some(replica) = replica else {
                debug!(ldo, version, "no saveable replica; skipped");
                continue;
            };
            let save_id = self.ids.next_job_id();
            self.checkpoints.with_entry(id, |entry| {
                entry.add_save_data_job(save_id, ldo, version, replica.worker)
            })?;
            self.checkpoints.register_save_job(save_id, id);
            self.synthesized.insert(save_id, SynthJob::Save);
            self.workers
                .send(
                    replica.worker,
                    WorkerCommand::SaveData {
                        job_id: save_id,
                        phys_id: replica.phys_id,
                        checkpoint: id,
                    },
                )
                .await?;
            save_count += 1;
        }

        if save_count == 0 {
            let entry = self.checkpoints.get(id)?;
            self.store.persist(&entry).await?;
            self.store.flush().await?;
        }
        info!(checkpoint = id, saves = save_count, "checkpoint opened");
        Ok(id)
    }

    /// Issues a LOAD_DATA from the newest complete checkpoint holding a
    /// handle for (ldo, version), gating `gated_job` behind the load.
    pub(crate) async fn try_reload_from_checkpoint(
        &mut self,
        worker: WorkerId,
        ldo: LdoId,
        version: Version,
        gated_job: JobId,
    ) -> Result<bool> {
        for checkpoint_id in self.checkpoints.newest_first() {
            let entry = self.checkpoints.get(checkpoint_id)?;
            if !entry.is_complete() {
                continue;
            }
            let handles = entry.handles_for(ldo, version);
            let Some((_, handle)) = handles.first() else {
                continue;
            };
            let load_id = self
                .issue_load(worker, ldo, version, handle.clone())
                .await?;
            self.graph.add_edge(load_id, gated_job);
            debug!(load = load_id, ldo, version, checkpoint = checkpoint_id, "reload issued");
            return Ok(true);
        }
        Ok(false)
    }

    async fn issue_load(
        &mut self,
        worker: WorkerId,
        ldo: LdoId,
        version: Version,
        handle: String,
    ) -> Result<JobId> {
        let load_id = self.ids.next_job_id();
        let phys_id = self.ids.next_physical_id();
        self.directory
            .create_instance(worker, ldo, phys_id, version, Some(load_id));
        let load_job = Job::synthesized(load_id, JobKind::Create, JobIdSet::new());
        self.graph.add_job(load_job)?;
        self.graph.mark_assigned(load_id, worker)?;
        self.synthesized.insert(
            load_id,
            SynthJob::Load {
                worker,
                phys_id,
                version,
            },
        );
        self.workers
            .send(
                worker,
                WorkerCommand::LoadData {
                    job_id: load_id,
                    ldo,
                    version,
                    handle,
                    phys_id,
                },
            )
            .await?;
        Ok(load_id)
    }

    /// Worker-loss rewind: every job on the lost worker goes LOST and its
    /// replicas are dropped before the common rewind pass runs.
    pub async fn handle_worker_loss(&mut self, worker: WorkerId) -> Result<RewindStats> {
        warn!(worker, "worker lost; rewinding");
        self.workers.remove(worker);
        let lost = self.graph.mark_worker_lost(worker);
        let dropped_replicas = self.directory.drop_worker(worker);
        self.rewind(Some(worker), lost, dropped_replicas).await
    }

    /// Rewind entry point for a needed version with no live replica and no
    /// reconstruction path. No worker is lost; surviving placement stays,
    /// and the affected job's ancestry is restored and replayed. A repeat
    /// for the same (ldo, version) with no completion in between cannot
    /// converge and is refused.
    pub async fn handle_version_unavailable(
        &mut self,
        ldo: LdoId,
        version: Version,
        job: Option<JobId>,
    ) -> Result<RewindStats> {
        if self.last_version_rewind == Some((ldo, version)) {
            return Err(ControllerError::NoRewindPoint);
        }
        self.last_version_rewind = Some((ldo, version));
        warn!(ldo, version, job = ?job, "needed version unavailable; rewinding");
        self.rewind(None, job.into_iter().collect(), 0).await
    }

    /// Common rewind pass: cancel in-flight work, restore state to a
    /// committed checkpoint, reload saved replicas, and re-drive the
    /// scheduling loop.
    async fn rewind(
        &mut self,
        lost_worker: Option<WorkerId>,
        lost: Vec<JobId>,
        dropped_replicas: usize,
    ) -> Result<RewindStats> {
        // Cancel the remaining in-flight jobs; their late completions are
        // dropped, and the rewind re-runs them.
        let mut cancelled = Vec::new();
        for state in [JobState::Assigned, JobState::Running] {
            for job_id in self.graph.jobs_in_state(state) {
                let Some(job) = self.graph.get(job_id) else {
                    continue;
                };
                if let Some(assigned) = job.assigned_worker {
                    let _ = self
                        .workers
                        .send(assigned, WorkerCommand::Cancel { job_id })
                        .await;
                }
                self.graph.set_state(job_id, JobState::Lost)?;
                cancelled.push(job_id);
            }
        }

        // The rewind point must cover the non-sterile done ancestors of
        // everything we just lost.
        let mut required: HashSet<JobId> = HashSet::new();
        for &job_id in lost.iter().chain(cancelled.iter()) {
            for &ancestor in self.graph.ancestors(job_id).iter() {
                let Some(job) = self.graph.get(ancestor) else {
                    continue;
                };
                if !job.sterile && job.state == JobState::Done {
                    required.insert(ancestor);
                }
            }
        }

        // Prefer the newest checkpoint covering every required ancestor.
        // Ancestors outside every committed prefix are reset and replayed
        // below, so the newest committed checkpoint still serves when no
        // prefix covers them; with no committed checkpoint at all, the run
        // replays from the very beginning.
        let checkpoint = self
            .checkpoints
            .select_rewind_point(&required)
            .or_else(|| self.checkpoints.newest_complete());
        let entry = match checkpoint {
            Some(id) => Some(self.checkpoints.get(id)?),
            None => None,
        };

        // Restore lineage to the committed prefix, then prune to the live
        // parents the checkpoint vouches for. With no checkpoint, nothing
        // is committed and every chain clears.
        match &entry {
            Some(entry) => {
                for (ldo, tail) in entry.lineage_tail() {
                    self.versions.ledger().restore(*ldo, tail.clone())?;
                }
                self.versions.ledger().clean_all(&entry.job_ids());
            }
            None => self.versions.ledger().clean_all(&HashSet::new()),
        }

        // Reset replayable work; drop synthesized copies outright so fresh
        // ones are planned against the restored placement.
        for job_id in self.all_job_ids() {
            if entry.as_ref().map(|e| e.includes(job_id)).unwrap_or(false) {
                continue;
            }
            let Some(job) = self.graph.get(job_id) else {
                continue;
            };
            if job.state == JobState::Pending {
                continue;
            }
            if is_synthesized(&job) {
                if let Some((_, synth)) = self.synthesized.remove(&job_id) {
                    if let SynthJob::RemoteSend { worker, from_phys } = synth {
                        // Release a source stranded mid-transfer.
                        let _ = self.directory.complete_transfer_send(worker, from_phys);
                    }
                }
                self.assigned_io.remove(&job_id);
                self.graph.remove_job(job_id);
            } else {
                self.assigned_io.remove(&job_id);
                self.graph.reset_job(job_id)?;
            }
        }

        // Reload each saved replica that no surviving worker still holds.
        let mut reloads_issued = 0usize;
        let mut seen: HashSet<(LdoId, Version)> = HashSet::new();
        let saved = entry
            .as_ref()
            .map(|e| e.saved_replicas())
            .unwrap_or_default();
        for (ldo, version, (holder, handle)) in saved {
            if !seen.insert((ldo, version)) {
                continue;
            }
            let still_held = self
                .directory
                .replicas(ldo)
                .iter()
                .any(|i| i.version == version && i.state == crate::model::PdiState::Valid);
            if still_held {
                continue;
            }
            let target = if self.workers.contains(holder) {
                holder
            } else {
                self.workers
                    .least_loaded()
                    .ok_or_else(|| ControllerError::fatal("no workers available for reload"))?
            };
            self.issue_load(target, ldo, version, handle).await?;
            reloads_issued += 1;
        }

        let requeued = self.requeue_pending()?;
        let stats = RewindStats {
            worker: lost_worker,
            lost_jobs: lost.len(),
            cancelled_jobs: cancelled.len(),
            dropped_replicas,
            checkpoint,
            reloads_issued,
            requeued,
        };
        info!(
            worker = ?stats.worker,
            lost = stats.lost_jobs,
            cancelled = stats.cancelled_jobs,
            checkpoint = ?stats.checkpoint,
            reloads = reloads_issued,
            requeued,
            "rewind complete"
        );
        Ok(stats)
    }

    fn all_job_ids(&self) -> Vec<JobId> {
        let mut ids = Vec::new();
        for state in [
            JobState::Ready,
            JobState::Assigned,
            JobState::Running,
            JobState::Done,
            JobState::Lost,
        ] {
            ids.extend(self.graph.jobs_in_state(state));
        }
        ids
    }
}

/// Controller-synthesized jobs carry no application payload and are
/// re-planned rather than replayed.
fn is_synthesized(job: &Job) -> bool {
    match job.kind {
        JobKind::Create | JobKind::RemoteCopySend | JobKind::RemoteCopyReceive => true,
        JobKind::LocalCopy => job.parent.is_none(),
        _ => false,
    }
}
