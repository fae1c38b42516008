use bytes::Bytes;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::geometry::GeometricRegion;

// Type aliases
pub type JobId = u64;
pub type LdoId = u64;
pub type PhysicalId = u64;
pub type WorkerId = u32;
pub type PartitionId = u32;
pub type TemplateGenId = u64;
pub type CheckpointId = u64;
pub type Version = u64;
pub type JobDepth = u64;

/// Small inline sets for the common case of a handful of dependencies.
pub type JobIdSet = SmallVec<[JobId; 4]>;
pub type LdoIdSet = SmallVec<[LdoId; 4]>;

/// Job kind over the closed set of controller-visible job flavors.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobKind {
    Compute = 0,
    LocalCopy = 1,
    RemoteCopySend = 2,
    RemoteCopyReceive = 3,
    Create = 4,
    Combine = 5,
    Complex = 6,
    Main = 7,
    Finish = 8,
}

impl JobKind {
    /// Copy-flavored jobs move bytes between replicas and never advance a
    /// logical version.
    pub fn is_copy(&self) -> bool {
        matches!(
            self,
            JobKind::LocalCopy | JobKind::RemoteCopySend | JobKind::RemoteCopyReceive
        )
    }

    /// Spawn-only jobs expand the graph but do no data work themselves.
    pub fn is_spawn_only(&self) -> bool {
        matches!(self, JobKind::Main | JobKind::Complex)
    }
}

/// Job lifecycle state.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    Pending = 0,
    Ready = 1,
    Assigned = 2,
    Running = 3,
    Done = 4,
    Lost = 5,
}

impl JobState {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(JobState::Pending),
            1 => Some(JobState::Ready),
            2 => Some(JobState::Assigned),
            3 => Some(JobState::Running),
            4 => Some(JobState::Done),
            5 => Some(JobState::Lost),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done | JobState::Lost)
    }
}

/// Physical-replica state. Only the physical-data directory mutates this.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PdiState {
    Valid = 0,
    Dirty = 1,
    InTransfer = 2,
    Creating = 3,
}

impl PdiState {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(PdiState::Valid),
            1 => Some(PdiState::Dirty),
            2 => Some(PdiState::InTransfer),
            3 => Some(PdiState::Creating),
            _ => None,
        }
    }
}

/// A job vertex in the controller graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    /// Application-level name for compute jobs; empty for synthesized jobs.
    pub name: String,
    pub parent: Option<JobId>,
    pub read_set: LdoIdSet,
    pub write_set: LdoIdSet,
    pub before: JobIdSet,
    pub after: JobIdSet,
    pub params: Bytes,
    /// Sterile jobs spawn no children and are omitted from parent indexing.
    pub sterile: bool,
    pub region: Option<GeometricRegion>,
    pub state: JobState,
    pub assigned_worker: Option<WorkerId>,
    pub depth: JobDepth,
    pub future_id: Option<JobId>,
    /// Seconds reported by the worker on completion.
    pub run_time: Option<f64>,
    pub wait_time: Option<f64>,
}

/// Specification for a compute job arriving from a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeJobSpec {
    pub job_id: JobId,
    pub name: String,
    pub read_set: LdoIdSet,
    pub write_set: LdoIdSet,
    pub before: JobIdSet,
    pub after: JobIdSet,
    pub parent: JobId,
    pub params: Bytes,
    pub sterile: bool,
    pub region: Option<GeometricRegion>,
    pub future_id: Option<JobId>,
}

impl Job {
    pub fn from_compute_spec(spec: ComputeJobSpec, depth: JobDepth) -> Self {
        Self {
            id: spec.job_id,
            kind: JobKind::Compute,
            name: spec.name,
            parent: Some(spec.parent),
            read_set: spec.read_set,
            write_set: spec.write_set,
            before: spec.before,
            after: spec.after,
            params: spec.params,
            sterile: spec.sterile,
            region: spec.region,
            state: JobState::Pending,
            assigned_worker: None,
            depth,
            future_id: spec.future_id,
            run_time: None,
            wait_time: None,
        }
    }

    /// A bare job record for controller-synthesized work (copies, creates,
    /// loads). These carry no application payload.
    pub fn synthesized(id: JobId, kind: JobKind, before: JobIdSet) -> Self {
        Self {
            id,
            kind,
            name: String::new(),
            parent: None,
            read_set: LdoIdSet::new(),
            write_set: LdoIdSet::new(),
            before,
            after: JobIdSet::new(),
            params: Bytes::new(),
            sterile: true,
            region: None,
            state: JobState::Pending,
            assigned_worker: None,
            depth: 0,
            future_id: None,
            run_time: None,
            wait_time: None,
        }
    }

    /// LDOs the job touches, reads first, writes after, without dedup.
    pub fn union_set(&self) -> impl Iterator<Item = LdoId> + '_ {
        self.read_set.iter().copied().chain(self.write_set.iter().copied())
    }
}

/// Definition of a logical data object. Immutable once defined.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogicalObject {
    pub id: LdoId,
    pub name: String,
    pub partition: PartitionId,
    pub neighbor_partitions: SmallVec<[PartitionId; 6]>,
    pub region: GeometricRegion,
    pub parent_job: JobId,
    /// Opaque definition payload carried for the workers; the registry
    /// stores it without interpreting it.
    pub params: Bytes,
}

/// A concrete replica of a logical object on one worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhysicalInstance {
    pub phys_id: PhysicalId,
    pub ldo: LdoId,
    pub worker: WorkerId,
    pub version: Version,
    pub state: PdiState,
    /// Job currently materializing this instance, when state is Creating.
    pub creator_job: Option<JobId>,
    /// Pending local reads that must observe this instance.
    pub pin_count: u32,
    /// Outbound copies currently sourced from this instance; the state
    /// reverts to VALID when the last one drains.
    pub pending_sends: u32,
}
