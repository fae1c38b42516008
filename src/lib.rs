//! # millrace: controller of a distributed data-flow runtime
//!
//! The controller ingests job-spawn and data-define events from workers,
//! maintains a dependency graph over jobs and versioned logical data,
//! resolves each job's inputs to physical replicas, plans the copies needed
//! to materialize them, and dispatches ready jobs back to workers. Recurring
//! subgraphs are detected as templates and re-instantiated without
//! re-walking the graph; progress is checkpointed so worker loss rewinds and
//! replays instead of failing the run.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use millrace::{ControllerBuilder, ControllerConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let (controller, handle) = ControllerBuilder::new()
//!         .with_config(ControllerConfig::development())
//!         .build()?;
//!
//!     // Worker connections register through the handle and feed events;
//!     // the controller loop owns all state.
//!     let _ = handle.clone();
//!     let status = controller.run().await?;
//!     std::process::exit(status)
//! }
//! ```

pub mod assigner;
pub mod checkpoint;
pub mod command;
pub mod config;
pub mod directory;
pub mod error;
pub mod exec_template;
pub mod frontier;
pub mod geometry;
pub mod graph;
pub mod ids;
pub mod lineage;
pub mod model;
pub mod registry;
pub mod rewind;
pub mod router;
pub mod store;
pub mod template;
pub mod version;
pub mod workers;

pub use checkpoint::{CheckpointEntry, CheckpointRegistry};
pub use command::{WorkerCommand, WorkerEvent};
pub use config::{ControllerConfig, ControllerConfigBuilder};
pub use directory::PhysicalDirectory;
pub use error::{ControllerError, Result};
pub use exec_template::ExecutionTemplate;
pub use frontier::{Band, ReadyFrontier};
pub use geometry::GeometricRegion;
pub use graph::JobGraph;
pub use ids::IdAllocator;
pub use lineage::{Lineage, LineageEntry, LineageLedger};
pub use model::{
    CheckpointId, ComputeJobSpec, Job, JobId, JobKind, JobState, LdoId, LogicalObject,
    PartitionId, PdiState, PhysicalId, PhysicalInstance, TemplateGenId, Version, WorkerId,
};
pub use registry::DataRegistry;
pub use rewind::RewindStats;
pub use router::{ControllerHandle, Envelope, InboundQueue};
pub use store::{CheckpointStore, SledStore};
pub use template::TemplateManager;
pub use version::VersionManager;
pub use workers::WorkerRegistry;

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::model::JobIdSet;

/// Bookkeeping for a controller-synthesized job: what to do with the
/// directory when the worker reports it done.
#[derive(Debug, Clone)]
pub(crate) enum SynthJob {
    Create {
        worker: WorkerId,
        phys_id: PhysicalId,
    },
    LocalReplicaCopy {
        worker: WorkerId,
        to_phys: PhysicalId,
        version: Version,
    },
    RemoteSend {
        worker: WorkerId,
        from_phys: PhysicalId,
    },
    RemoteReceive {
        worker: WorkerId,
        to_phys: PhysicalId,
        version: Version,
    },
    Load {
        worker: WorkerId,
        phys_id: PhysicalId,
        version: Version,
    },
    Save,
}

/// Physical instances a job was bound to at assignment time.
#[derive(Debug, Default, Clone)]
pub(crate) struct AssignedIo {
    pub reads: Vec<(WorkerId, PhysicalId)>,
    pub writes: Vec<(WorkerId, PhysicalId, LdoId)>,
}

/// The controller: one owned structure passed through the event loop.
///
/// All job-graph, lineage, and directory mutations happen on the loop
/// thread; the tables themselves are concurrent so read-side helpers can be
/// shared with the worker pool that expands templates.
pub struct Controller {
    pub(crate) config: ControllerConfig,
    pub(crate) ids: IdAllocator,
    pub(crate) registry: DataRegistry,
    pub(crate) versions: VersionManager,
    pub(crate) graph: JobGraph,
    pub(crate) directory: PhysicalDirectory,
    pub(crate) frontier: ReadyFrontier,
    pub(crate) workers: Arc<WorkerRegistry>,
    pub(crate) templates: TemplateManager,
    pub(crate) checkpoints: CheckpointRegistry,
    pub(crate) store: Arc<dyn CheckpointStore>,
    pub(crate) synthesized: DashMap<JobId, SynthJob>,
    pub(crate) assigned_io: DashMap<JobId, AssignedIo>,
    evt_rx: mpsc::Receiver<Envelope>,
    inbound: InboundQueue,
    main_seeded: bool,
    pub(crate) frames_completed: u64,
    /// Guard against a version rewind repeating with no intervening
    /// progress; cleared on every completion.
    pub(crate) last_version_rewind: Option<(LdoId, Version)>,
    termination: Option<i32>,
}

/// Point-in-time snapshot of controller state for operators.
#[derive(Debug, Clone)]
pub struct ControllerStats {
    pub jobs_total: usize,
    pub jobs_pending: usize,
    pub jobs_ready_queued: usize,
    pub jobs_running: usize,
    pub jobs_done: usize,
    pub jobs_lost: usize,
    pub replicas: usize,
    pub workers: usize,
    pub templates: usize,
    pub checkpoints: usize,
    pub frames_completed: u64,
}

impl Controller {
    /// Runs the event loop until a TERMINATE event arrives or every handle
    /// is dropped. Returns the exit status to propagate.
    pub async fn run(mut self) -> Result<i32> {
        info!(
            min_workers = self.config.min_workers_to_join,
            "controller running"
        );
        loop {
            match self.evt_rx.recv().await {
                Some(envelope) => self.inbound.push(envelope),
                None => {
                    info!("all handles dropped; controller stopping");
                    return Ok(0);
                }
            }
            // Drain whatever else arrived so control events jump the queue.
            while let Ok(envelope) = self.evt_rx.try_recv() {
                self.inbound.push(envelope);
            }

            self.process_queued_events().await?;
            self.assign_ready_jobs().await?;

            if let Some(status) = self.termination {
                self.broadcast_terminate(status).await;
                info!(status, "terminate forwarded to workers");
                return Ok(status);
            }
        }
    }

    /// Applies queued events, routing every failure through the generic
    /// recovery dispatch.
    pub async fn process_queued_events(&mut self) -> Result<()> {
        while let Some(envelope) = self.inbound.pop() {
            if let Err(err) = self.handle_event(envelope).await {
                self.recover(err, None).await?;
            }
        }
        Ok(())
    }

    /// Recovery dispatch over the error taxonomy, driven by the error's own
    /// predicates: droppable errors are logged and forgotten, template
    /// misuse is surfaced to the application, rewind-class errors restore
    /// from a checkpoint and replay, and everything else propagates. `job`
    /// names the job whose handling raised the error, when one exists.
    pub(crate) async fn recover(&mut self, err: ControllerError, job: Option<JobId>) -> Result<()> {
        if !err.is_recoverable() {
            return Err(err);
        }
        match err {
            err if err.is_droppable() => {
                warn!(%err, "dropped event");
            }
            ControllerError::ChannelClosed(lost) | ControllerError::WorkerLost(lost) => {
                self.handle_worker_loss(lost).await?;
            }
            ControllerError::Protocol { worker, .. } => {
                // Untrusted connection: close it and treat the worker as
                // lost.
                error!(worker, "protocol violation; dropping worker");
                self.handle_worker_loss(worker).await?;
            }
            ControllerError::VersionUnavailable { ldo, version } => {
                self.handle_version_unavailable(ldo, version, job).await?;
            }
            err @ ControllerError::TemplateState { .. } => {
                // Surfaced to the application; the run continues.
                error!(%err, "template call refused");
            }
            err => return Err(err),
        }
        Ok(())
    }

    /// Submits one event synchronously, with the same drop policy as the
    /// loop. Exposed so tests and embedded callers can drive the controller
    /// deterministically.
    pub async fn ingest(&mut self, envelope: Envelope) -> Result<()> {
        self.inbound.push(envelope);
        self.process_queued_events().await
    }

    /// One loop turn without blocking: drains events already submitted
    /// through handles, applies them, and runs a scheduling pass.
    pub async fn tick(&mut self) -> Result<()> {
        while let Ok(envelope) = self.evt_rx.try_recv() {
            self.inbound.push(envelope);
        }
        self.process_queued_events().await?;
        self.assign_ready_jobs().await?;
        Ok(())
    }

    /// The single dispatch switch over inbound message semantics.
    pub async fn handle_event(&mut self, envelope: Envelope) -> Result<()> {
        let from = envelope.worker;
        match envelope.event {
            WorkerEvent::Handshake { worker } => self.on_handshake(from, worker).await,
            WorkerEvent::SpawnCompute(spec) => self.on_spawn_compute(spec),
            WorkerEvent::SpawnCopy {
                job_id,
                from_ldo,
                to_ldo,
                before,
                after,
                parent,
                params,
            } => self.on_spawn_copy(job_id, from_ldo, to_ldo, before, after, parent, params),
            WorkerEvent::DefineData {
                name,
                ldo_id,
                partition,
                neighbor_partitions,
                parent,
                params,
            } => {
                self.registry
                    .define_data(name, ldo_id, partition, neighbor_partitions, parent, params)?;
                self.versions.define(ldo_id);
                Ok(())
            }
            WorkerEvent::DefinePartition { partition, region } => {
                self.registry.define_partition(partition, region);
                Ok(())
            }
            WorkerEvent::JobDone {
                job_id,
                after: _,
                params: _,
                run_time,
                wait_time,
            } => self.on_job_done(job_id, run_time, wait_time).await,
            WorkerEvent::SaveDataDone { job_id, handle } => {
                self.on_save_data_done(job_id, handle).await
            }
            WorkerEvent::DetectTemplate { name } => self.templates.detect(&name),
            WorkerEvent::AddTemplateJob { name, spec } => self.templates.add_compute(&name, spec),
            WorkerEvent::FinalizeTemplate { name } => self.templates.finalize(&name),
            WorkerEvent::InstantiateTemplate {
                name,
                inner_job_ids,
                outer_job_ids,
                parameters,
                parent,
            } => {
                self.on_instantiate_template(name, inner_job_ids, outer_job_ids, parameters, parent)
            }
            WorkerEvent::Terminate { exit_status } => {
                self.termination = Some(exit_status);
                Ok(())
            }
        }
    }

    async fn on_handshake(&mut self, from: WorkerId, claimed: Option<WorkerId>) -> Result<()> {
        if let Some(claimed) = claimed {
            if claimed != from {
                return Err(ControllerError::protocol(
                    from,
                    format!("handshake claims worker id {}", claimed),
                ));
            }
        }
        if !self.workers.contains(from) {
            return Err(ControllerError::UnknownWorker(from));
        }
        if !self.main_seeded && self.workers.active_count() >= self.config.min_workers_to_join {
            self.seed_main_job()?;
        }
        Ok(())
    }

    fn seed_main_job(&mut self) -> Result<()> {
        let id = self.ids.next_job_id();
        let mut main = Job::synthesized(id, JobKind::Main, JobIdSet::new());
        main.name = "main".to_string();
        main.sterile = false;
        self.graph.add_job(main)?;
        self.push_ready(id, Band::Spawn)?;
        self.main_seeded = true;
        info!(job = id, "main job seeded");
        Ok(())
    }

    fn on_spawn_compute(&mut self, spec: ComputeJobSpec) -> Result<()> {
        let depth = self
            .graph
            .get(spec.parent)
            .map(|parent| parent.depth + 1)
            .ok_or(ControllerError::UnknownJob(spec.parent))?;
        for ldo in spec.read_set.iter().chain(spec.write_set.iter()) {
            if !self.registry.contains(*ldo) {
                return Err(ControllerError::UnknownData(*ldo));
            }
        }
        let id = spec.job_id;
        self.graph.add_job(Job::from_compute_spec(spec, depth))?;
        debug!(job = id, "compute job spawned");
        self.promote_if_ready(id)?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn on_spawn_copy(
        &mut self,
        job_id: JobId,
        from_ldo: LdoId,
        to_ldo: LdoId,
        before: JobIdSet,
        after: JobIdSet,
        parent: JobId,
        params: bytes::Bytes,
    ) -> Result<()> {
        let depth = self
            .graph
            .get(parent)
            .map(|p| p.depth + 1)
            .ok_or(ControllerError::UnknownJob(parent))?;
        if !self.registry.contains(from_ldo) {
            return Err(ControllerError::UnknownData(from_ldo));
        }
        if !self.registry.contains(to_ldo) {
            return Err(ControllerError::UnknownData(to_ldo));
        }
        let mut job = Job::synthesized(job_id, JobKind::LocalCopy, before);
        job.read_set = smallvec::smallvec![from_ldo];
        job.write_set = smallvec::smallvec![to_ldo];
        job.after = after;
        job.parent = Some(parent);
        job.params = params;
        job.depth = depth;
        self.graph.add_job(job)?;
        self.promote_if_ready(job_id)?;
        Ok(())
    }

    async fn on_job_done(&mut self, job_id: JobId, run_time: f64, wait_time: f64) -> Result<()> {
        // Synthesized work first: directory effects, then graph promotion.
        if let Some(synth) = self.synthesized.get(&job_id).map(|s| s.clone()) {
            self.apply_synth_completion(job_id, &synth)?;
            self.synthesized.remove(&job_id);
            self.last_version_rewind = None;
            if !self.graph.contains(job_id) {
                return Ok(());
            }
            let promoted = self.graph.on_job_done(job_id, None, None)?;
            for succ in promoted {
                self.promote_if_ready(succ)?;
            }
            return Ok(());
        }

        let job = self
            .graph
            .get(job_id)
            .ok_or(ControllerError::UnknownJob(job_id))?;
        if job.state == JobState::Done {
            debug!(job = job_id, "duplicate completion dropped");
            return Ok(());
        }
        if job.state == JobState::Lost {
            // Late completion from cancelled work; rewound jobs are ignored.
            debug!(job = job_id, "late completion after rewind dropped");
            return Ok(());
        }
        if matches!(job.state, JobState::Pending | JobState::Ready) {
            // Stale report for a job rewound to replay; the rerun reports.
            debug!(job = job_id, "completion for unassigned job dropped");
            return Ok(());
        }
        if let Some(worker) = job.assigned_worker {
            self.workers.credit_completion(worker);
        }
        self.last_version_rewind = None;

        // Commit writes: every graph-level writer advances the destination
        // lineage; replica copies never reach this path.
        if let Some((_, io)) = self.assigned_io.remove(&job_id) {
            for (worker, phys_id) in io.reads {
                self.directory.unpin(worker, phys_id);
            }
            for (worker, phys_id, ldo) in io.writes {
                let version = self.versions.commit_write(&job, ldo)?;
                self.directory.commit_write(worker, phys_id, version)?;
            }
        }

        let promoted = self
            .graph
            .on_job_done(job_id, Some(run_time), Some(wait_time))?;
        for succ in promoted {
            self.promote_if_ready(succ)?;
        }

        // Template bookkeeping: inner completions may finish a complex job.
        if let Some((complex_id, complete)) = self.templates.mark_inner_done(job_id) {
            if complete {
                let promoted = self.graph.on_job_done(complex_id, None, None)?;
                for succ in promoted {
                    self.promote_if_ready(succ)?;
                }
                self.on_frame_boundary().await?;
            }
        }

        if matches!(job.kind, JobKind::Main) {
            self.on_frame_boundary().await?;
        }
        Ok(())
    }

    fn apply_synth_completion(&mut self, job_id: JobId, synth: &SynthJob) -> Result<()> {
        match synth {
            SynthJob::Create { worker, phys_id } => {
                self.directory.complete_create(*worker, *phys_id)?;
                self.workers.credit_completion(*worker);
            }
            SynthJob::LocalReplicaCopy {
                worker,
                to_phys,
                version,
            } => {
                self.directory.commit_write(*worker, *to_phys, *version)?;
                self.workers.credit_completion(*worker);
            }
            SynthJob::RemoteSend { worker, from_phys } => {
                self.directory.complete_transfer_send(*worker, *from_phys)?;
                self.workers.credit_completion(*worker);
            }
            SynthJob::RemoteReceive {
                worker,
                to_phys,
                version,
            } => {
                self.directory.commit_write(*worker, *to_phys, *version)?;
                self.workers.credit_completion(*worker);
            }
            SynthJob::Load {
                worker,
                phys_id,
                version,
            } => {
                self.directory.commit_write(*worker, *phys_id, *version)?;
                self.workers.credit_completion(*worker);
            }
            SynthJob::Save => {
                // SAVE_DATA completion is reported through SaveDataDone.
            }
        }
        debug!(job = job_id, "synthesized job completed");
        Ok(())
    }

    async fn on_save_data_done(&mut self, job_id: JobId, handle: String) -> Result<()> {
        let checkpoint = self.checkpoints.notify_save_done(job_id, handle)?;
        self.synthesized.remove(&job_id);
        let entry = self.checkpoints.get(checkpoint)?;
        if entry.is_complete() {
            self.store.persist(&entry).await?;
            self.store.flush().await?;
            info!(checkpoint, jobs = entry.job_count(), "checkpoint committed");
        }
        Ok(())
    }

    fn on_instantiate_template(
        &mut self,
        name: String,
        inner_job_ids: Vec<JobId>,
        outer_job_ids: Vec<JobId>,
        parameters: Vec<bytes::Bytes>,
        parent: JobId,
    ) -> Result<()> {
        let complex_id = self.ids.next_job_id();
        let mut vertex = self.templates.instantiate(
            &name,
            complex_id,
            inner_job_ids,
            outer_job_ids,
            parameters,
            parent,
        )?;
        vertex.depth = self.graph.get(parent).map(|p| p.depth + 1).unwrap_or(0);
        self.graph.add_job(vertex)?;
        debug!(template = %name, complex = complex_id, "template instantiated");
        self.promote_if_ready(complex_id)?;
        Ok(())
    }

    /// Pushes a job into the frontier when all predecessors are done.
    pub(crate) fn promote_if_ready(&mut self, job_id: JobId) -> Result<()> {
        if !matches!(self.graph.state(job_id), Some(JobState::Pending)) {
            return Ok(());
        }
        if self.graph.dependencies_met(job_id) {
            let band = self.band_for(job_id);
            self.push_ready(job_id, band)?;
        }
        Ok(())
    }

    fn band_for(&self, job_id: JobId) -> Band {
        match self.graph.get(job_id).map(|j| j.kind) {
            Some(kind) if kind.is_spawn_only() => Band::Spawn,
            _ => Band::Compute,
        }
    }

    fn push_ready(&mut self, job_id: JobId, band: Band) -> Result<()> {
        self.graph.set_state(job_id, JobState::Ready)?;
        if !self.frontier.push(job_id, band) {
            // Backpressure: stay pending; the next pass retries.
            self.graph.set_state(job_id, JobState::Pending)?;
            warn!(job = job_id, "frontier full; job deferred");
        }
        Ok(())
    }

    async fn broadcast_terminate(&mut self, status: i32) {
        for worker in self.workers.ids() {
            let _ = self
                .workers
                .send(worker, WorkerCommand::Terminate { status })
                .await;
        }
    }

    /// Loads persisted checkpoints on restart, restoring the job graph and
    /// lineage to the committed prefix of the newest complete entry.
    pub async fn recover_from_store(&mut self) -> Result<usize> {
        let entries = self.store.load_all().await?;
        let count = entries.len();
        let newest_complete = entries.iter().rposition(|e| e.is_complete());
        for entry in &entries {
            self.checkpoints.insert(entry.clone());
        }
        if let Some(idx) = newest_complete {
            let entry = &entries[idx];
            for (ldo, tail) in entry.lineage_tail() {
                self.versions.ledger().restore(*ldo, tail.clone())?;
            }
            for job in entry.jobs() {
                if !self.graph.contains(job.id) {
                    self.graph.add_job(job.clone())?;
                }
            }
            info!(
                checkpoint = entry.id,
                jobs = entry.job_count(),
                "restored committed prefix"
            );
        }
        Ok(count)
    }

    pub fn stats(&self) -> ControllerStats {
        ControllerStats {
            jobs_total: self.graph.len(),
            jobs_pending: self.graph.count_in_state(JobState::Pending),
            jobs_ready_queued: self.frontier.len(),
            jobs_running: self.graph.count_in_state(JobState::Running)
                + self.graph.count_in_state(JobState::Assigned),
            jobs_done: self.graph.count_in_state(JobState::Done),
            jobs_lost: self.graph.count_in_state(JobState::Lost),
            replicas: self.directory.len(),
            workers: self.workers.active_count(),
            templates: self.templates.template_count(),
            checkpoints: self.checkpoints.len(),
            frames_completed: self.frames_completed,
        }
    }

    // Accessors used by integration tests and embedding applications.

    pub fn graph(&self) -> &JobGraph {
        &self.graph
    }

    pub fn directory(&self) -> &PhysicalDirectory {
        &self.directory
    }

    pub fn registry(&self) -> &DataRegistry {
        &self.registry
    }

    pub fn versions(&self) -> &VersionManager {
        &self.versions
    }

    pub fn templates(&self) -> &TemplateManager {
        &self.templates
    }

    pub fn checkpoints(&self) -> &CheckpointRegistry {
        &self.checkpoints
    }
}

/// Builder for a controller and its event handle.
pub struct ControllerBuilder {
    config: ControllerConfig,
    store: Option<Arc<dyn CheckpointStore>>,
}

impl ControllerBuilder {
    pub fn new() -> Self {
        Self {
            config: ControllerConfig::default(),
            store: None,
        }
    }

    pub fn with_config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> Result<(Controller, ControllerHandle)> {
        self.config
            .validate()
            .map_err(ControllerError::InvalidConfiguration)?;

        let store: Arc<dyn CheckpointStore> = match self.store {
            Some(store) => store,
            None => match &self.config.checkpoint_path {
                Some(path) => Arc::new(SledStore::open(path)?),
                None => Arc::new(SledStore::temporary()?),
            },
        };

        let workers = Arc::new(WorkerRegistry::new());
        let (evt_tx, evt_rx) = mpsc::channel(self.config.event_queue_capacity);
        let handle = ControllerHandle::new(
            evt_tx,
            workers.clone(),
            self.config.command_queue_capacity,
        );

        let controller = Controller {
            frontier: ReadyFrontier::new(self.config.frontier_capacity),
            graph: JobGraph::new(self.config.ancestor_cache_capacity),
            config: self.config,
            ids: IdAllocator::new(),
            registry: DataRegistry::new(),
            versions: VersionManager::new(),
            directory: PhysicalDirectory::new(),
            workers,
            templates: TemplateManager::new(),
            checkpoints: CheckpointRegistry::new(),
            store,
            synthesized: DashMap::new(),
            assigned_io: DashMap::new(),
            evt_rx,
            inbound: InboundQueue::new(),
            main_seeded: false,
            frames_completed: 0,
            last_version_rewind: None,
            termination: None,
        };
        Ok((controller, handle))
    }
}

impl Default for ControllerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
