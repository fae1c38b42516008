//! Assignment pass: worker choice, input materialization, and dispatch.
//!
//! Each ready job is bound to one worker; every logical input is resolved
//! to a physical replica at its needed version, synthesizing the minimum
//! set of create/copy jobs when the worker lacks one. Synthesized jobs are
//! threaded into the graph as predecessors, returning the job to PENDING
//! until they complete.

use std::collections::HashMap;
use tracing::{debug, warn};

use crate::command::WorkerCommand;
use crate::error::{ControllerError, Result};
use crate::frontier::Band;
use crate::model::{
    Job, JobId, JobIdSet, JobKind, JobState, LdoId, PhysicalId, Version, WorkerId,
};
use crate::{AssignedIo, Controller, SynthJob};

/// Outcome of materializing one logical input on the chosen worker.
struct Prepared {
    phys_id: PhysicalId,
    /// False when copies or creates were synthesized and must finish first.
    available: bool,
}

impl Controller {
    /// Drains the ready frontier, assigning up to the configured batch.
    /// Returns how many jobs were handed to workers.
    pub async fn assign_ready_jobs(&mut self) -> Result<usize> {
        let mut assigned = 0;
        for _ in 0..self.config.max_assign_batch {
            let Some(job_id) = self.frontier.pop() else {
                break;
            };
            match self.assign_job(job_id).await {
                Ok(true) => assigned += 1,
                Ok(false) => {}
                // Recoverable failures (a closed connection, a version with
                // no live replica) rewind and re-drive instead of killing
                // the loop.
                Err(err) if err.is_recoverable() => {
                    self.recover(err, Some(job_id)).await?;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(assigned)
    }

    /// Assigns one job: picks a worker, materializes inputs, and emits the
    /// execute command once every input is VALID locally.
    pub async fn assign_job(&mut self, job_id: JobId) -> Result<bool> {
        let job = match self.graph.get(job_id) {
            Some(job) => job,
            None => return Ok(false), // pruned while queued
        };
        if job.state != JobState::Ready {
            return Ok(false); // rewound or already handled while queued
        }

        if job.kind == JobKind::Complex {
            self.expand_complex_job(&job)?;
            return Ok(false);
        }

        let Some(worker) = self.pick_worker(&job)? else {
            warn!(job = job_id, "no worker available; deferring");
            self.graph.set_state(job_id, JobState::Pending)?;
            return Ok(false);
        };

        // Resolve the needed version of every input once.
        let mut needed: HashMap<LdoId, Version> = HashMap::new();
        for ldo in job.union_set() {
            if !needed.contains_key(&ldo) {
                let version = self.versions.needed_version(&self.graph, job_id, ldo)?;
                needed.insert(ldo, version);
            }
        }

        let mut resolved: HashMap<LdoId, PhysicalId> = HashMap::new();
        let mut blocked = false;
        for (&ldo, &version) in &needed {
            let prepared = self
                .prepare_data_at_worker(&job, worker, ldo, version)
                .await?;
            if prepared.available {
                resolved.insert(ldo, prepared.phys_id);
            } else {
                blocked = true;
            }
        }

        if blocked {
            // Synthesized predecessors were threaded in; completion of the
            // last one re-promotes the job.
            self.graph.set_state(job_id, JobState::Pending)?;
            return Ok(false);
        }

        let read_phys: Vec<PhysicalId> = job.read_set.iter().map(|l| resolved[l]).collect();
        let write_phys: Vec<PhysicalId> = job.write_set.iter().map(|l| resolved[l]).collect();
        let mut io = AssignedIo::default();
        for &ldo in &job.read_set {
            io.reads.push((worker, resolved[&ldo]));
        }
        for &ldo in &job.write_set {
            io.writes.push((worker, resolved[&ldo], ldo));
        }

        for &(w, phys_id) in &io.reads {
            self.directory.pin(w, phys_id);
        }
        self.assigned_io.insert(job_id, io);
        self.graph.mark_assigned(job_id, worker)?;
        if let Some(region) = job.region {
            self.templates.record_affinity(region, worker);
        }

        let command = self.execute_command_for(&job, read_phys, write_phys);
        self.workers.send(worker, command).await?;
        debug!(job = job_id, worker, "job assigned");
        Ok(true)
    }

    fn execute_command_for(
        &self,
        job: &Job,
        read_phys: Vec<PhysicalId>,
        write_phys: Vec<PhysicalId>,
    ) -> WorkerCommand {
        match job.kind {
            // An application-spawned copy moves bytes between two logical
            // objects resident on the same worker.
            JobKind::LocalCopy => WorkerCommand::LocalCopy {
                job_id: job.id,
                from_phys: read_phys.first().copied().unwrap_or_default(),
                to_phys: write_phys.first().copied().unwrap_or_default(),
                before: job.before.clone(),
            },
            _ => WorkerCommand::Execute {
                job_id: job.id,
                name: job.name.clone(),
                read_phys,
                write_phys,
                before: job.before.clone(),
                after: job.after.clone(),
                params: job.params.clone(),
            },
        }
    }

    /// Expands a complex vertex into its inner jobs on assignment demand.
    fn expand_complex_job(&mut self, job: &Job) -> Result<()> {
        let inner = self.templates.expand_complex(job.id, job.depth + 1)?;
        debug!(complex = job.id, inner = inner.len(), "complex job expanded");
        self.graph.set_state(job.id, JobState::Running)?;
        let ids: Vec<JobId> = inner.iter().map(|j| j.id).collect();
        for inner_job in inner {
            self.graph.add_job(inner_job)?;
        }
        for id in ids {
            self.promote_if_ready(id)?;
        }
        Ok(())
    }

    /// Prefers the worker already holding the most inputs at a compatible
    /// version; ties break toward the least outstanding load. A region
    /// affinity hint from the template engine wins outright.
    fn pick_worker(&self, job: &Job) -> Result<Option<WorkerId>> {
        if let Some(region) = &job.region {
            if let Some(hint) = self.templates.affinity_hint(region) {
                if self.workers.contains(hint) {
                    return Ok(Some(hint));
                }
            }
        }

        let candidates = self.workers.ids();
        if candidates.is_empty() {
            return Ok(None);
        }

        let mut best: Option<(usize, usize, WorkerId)> = None;
        for worker in candidates {
            let mut held = 0usize;
            for ldo in job.union_set() {
                let version = self.versions.needed_version(&self.graph, job.id, ldo)?;
                if self.directory.find_local(worker, ldo, version).is_some() {
                    held += 1;
                }
            }
            let load = self.workers.load(worker);
            let better = match &best {
                None => true,
                Some((best_held, best_load, _)) => {
                    held > *best_held || (held == *best_held && load < *best_load)
                }
            };
            if better {
                best = Some((held, load, worker));
            }
        }
        Ok(best.map(|(_, _, worker)| worker))
    }

    /// Finds or synthesizes a physical instance of `ldo` at `version` on
    /// `worker`. May emit a CREATE, a paired remote send/receive, or a
    /// checkpoint reload, each threaded in front of `job`.
    async fn prepare_data_at_worker(
        &mut self,
        job: &Job,
        worker: WorkerId,
        ldo: LdoId,
        version: Version,
    ) -> Result<Prepared> {
        if let Some(local) = self.directory.find_local(worker, ldo, version) {
            if let Some(creator) = local.creator_job {
                // Still materializing; gate on the creator.
                self.graph.add_edge(creator, job.id);
                return Ok(Prepared {
                    phys_id: local.phys_id,
                    available: false,
                });
            }
            if (local.pin_count > 0 || local.state == crate::model::PdiState::InTransfer)
                && job.write_set.contains(&ldo)
            {
                // Pending readers hold this snapshot; the writer gets a
                // duplicate instance instead of scribbling over it.
                let duplicate = self.directory.replicas(ldo).into_iter().find(|i| {
                    i.worker == worker && i.version == version && i.phys_id != local.phys_id
                });
                if let Some(duplicate) = duplicate {
                    // A duplicate already exists from an earlier pass.
                    if let Some(creator) = duplicate.creator_job {
                        self.graph.add_edge(creator, job.id);
                        return Ok(Prepared {
                            phys_id: duplicate.phys_id,
                            available: false,
                        });
                    }
                    return Ok(Prepared {
                        phys_id: duplicate.phys_id,
                        available: duplicate.pin_count == 0,
                    });
                }
                let to_phys = self.plan_create(job.id, worker, ldo).await?;
                let mut copy_before = JobIdSet::new();
                if let Some(creator) = self
                    .directory
                    .get(worker, to_phys)
                    .and_then(|i| i.creator_job)
                {
                    copy_before.push(creator);
                }
                self.plan_local_replica_copy(
                    job.id,
                    worker,
                    local.phys_id,
                    to_phys,
                    version,
                    copy_before,
                )
                .await?;
                return Ok(Prepared {
                    phys_id: to_phys,
                    available: false,
                });
            }
            return Ok(Prepared {
                phys_id: local.phys_id,
                available: true,
            });
        }

        if let Some(source) = self.directory.find_remote_source(ldo, version, worker) {
            let phys_id = self
                .plan_remote_copy(job, worker, ldo, version, &source)
                .await?;
            return Ok(Prepared {
                phys_id,
                available: false,
            });
        }

        if version == 0 {
            // Defined state: an empty instance suffices.
            let phys_id = self.plan_create(job.id, worker, ldo).await?;
            return Ok(Prepared {
                phys_id,
                available: false,
            });
        }

        // No replica of the needed version anywhere live; fall back to a
        // checkpoint reload before declaring the version unavailable.
        if self
            .try_reload_from_checkpoint(worker, ldo, version, job.id)
            .await?
        {
            return Ok(Prepared {
                phys_id: 0,
                available: false,
            });
        }
        Err(ControllerError::VersionUnavailable { ldo, version })
    }

    /// Synthesizes a CREATE job for an empty instance on `worker`, gating
    /// `gated_job` behind it.
    async fn plan_create(
        &mut self,
        gated_job: JobId,
        worker: WorkerId,
        ldo: LdoId,
    ) -> Result<PhysicalId> {
        let create_id = self.ids.next_job_id();
        let phys_id = self.ids.next_physical_id();
        self.directory
            .create_instance(worker, ldo, phys_id, 0, Some(create_id));

        let create_job = Job::synthesized(create_id, JobKind::Create, JobIdSet::new());
        self.graph.add_job(create_job)?;
        self.graph.mark_assigned(create_id, worker)?;
        self.graph.add_edge(create_id, gated_job);
        self.synthesized
            .insert(create_id, SynthJob::Create { worker, phys_id });

        self.workers
            .send(
                worker,
                WorkerCommand::Create {
                    job_id: create_id,
                    ldo,
                    phys_id,
                    before: JobIdSet::new(),
                },
            )
            .await?;
        debug!(create = create_id, worker, ldo, "create synthesized");
        Ok(phys_id)
    }

    /// Synthesizes a paired remote send/receive (plus a CREATE when the
    /// destination has no overwritable instance).
    async fn plan_remote_copy(
        &mut self,
        job: &Job,
        worker: WorkerId,
        ldo: LdoId,
        version: Version,
        source: &crate::model::PhysicalInstance,
    ) -> Result<PhysicalId> {
        let mut receive_before = JobIdSet::new();
        let to_phys = match self.directory.find_overwritable(worker, ldo, version) {
            Some(dst) => dst.phys_id,
            None => {
                let phys_id = self.plan_create(job.id, worker, ldo).await?;
                // The receive overwrites the created instance, so it is
                // ordered behind the create as well.
                let creator = self
                    .directory
                    .get(worker, phys_id)
                    .and_then(|i| i.creator_job);
                if let Some(creator) = creator {
                    receive_before.push(creator);
                }
                phys_id
            }
        };

        let send_id = self.ids.next_job_id();
        let receive_id = self.ids.next_job_id();
        receive_before.push(send_id);

        self.directory.begin_transfer(source.worker, source.phys_id)?;

        let send_job = Job::synthesized(send_id, JobKind::RemoteCopySend, JobIdSet::new());
        self.graph.add_job(send_job)?;
        self.graph.mark_assigned(send_id, source.worker)?;
        self.synthesized.insert(
            send_id,
            SynthJob::RemoteSend {
                worker: source.worker,
                from_phys: source.phys_id,
            },
        );

        let receive_job =
            Job::synthesized(receive_id, JobKind::RemoteCopyReceive, receive_before.clone());
        self.graph.add_job(receive_job)?;
        self.graph.mark_assigned(receive_id, worker)?;
        self.graph.add_edge(receive_id, job.id);
        self.synthesized.insert(
            receive_id,
            SynthJob::RemoteReceive {
                worker,
                to_phys,
                version,
            },
        );

        self.workers
            .send(
                source.worker,
                WorkerCommand::RemoteCopySend {
                    job_id: send_id,
                    receive_job_id: receive_id,
                    from_phys: source.phys_id,
                    dest_worker: worker,
                    before: JobIdSet::new(),
                },
            )
            .await?;
        self.workers
            .send(
                worker,
                WorkerCommand::RemoteCopyReceive {
                    job_id: receive_id,
                    to_phys,
                    before: receive_before,
                },
            )
            .await?;
        debug!(
            send = send_id,
            receive = receive_id,
            from = source.worker,
            to = worker,
            ldo,
            version,
            "remote copy pair synthesized"
        );
        Ok(to_phys)
    }

    /// Synthesizes a local replica copy on `worker` from `from_phys` into
    /// `to_phys`, gating `gated_job` behind it. Used when a same-worker
    /// instance at the needed version must be duplicated rather than moved.
    pub(crate) async fn plan_local_replica_copy(
        &mut self,
        gated_job: JobId,
        worker: WorkerId,
        from_phys: PhysicalId,
        to_phys: PhysicalId,
        version: Version,
        before: JobIdSet,
    ) -> Result<JobId> {
        let copy_id = self.ids.next_job_id();
        let copy_job = Job::synthesized(copy_id, JobKind::LocalCopy, before.clone());
        self.graph.add_job(copy_job)?;
        self.graph.mark_assigned(copy_id, worker)?;
        self.graph.add_edge(copy_id, gated_job);
        self.synthesized.insert(
            copy_id,
            SynthJob::LocalReplicaCopy {
                worker,
                to_phys,
                version,
            },
        );
        self.workers
            .send(
                worker,
                WorkerCommand::LocalCopy {
                    job_id: copy_id,
                    from_phys,
                    to_phys,
                    before,
                },
            )
            .await?;
        Ok(copy_id)
    }

    /// Re-enqueues every pending job whose predecessors are all done; used
    /// after rewind re-drives the scheduling loop.
    pub(crate) fn requeue_pending(&mut self) -> Result<usize> {
        let mut requeued = 0;
        for job_id in self.graph.jobs_in_state(JobState::Pending) {
            if self.graph.dependencies_met(job_id) {
                let band = match self.graph.get(job_id).map(|j| j.kind) {
                    Some(kind) if kind.is_spawn_only() => Band::Spawn,
                    _ => Band::Compute,
                };
                self.graph.set_state(job_id, JobState::Ready)?;
                if self.frontier.push(job_id, band) {
                    requeued += 1;
                } else {
                    self.graph.set_state(job_id, JobState::Pending)?;
                }
            }
        }
        Ok(requeued)
    }
}
