use std::io;
use thiserror::Error;

use crate::model::{CheckpointId, JobId, LdoId, PartitionId, Version, WorkerId};

/// Controller errors over the closed taxonomy of failure kinds.
#[derive(Error, Debug)]
pub enum ControllerError {
    // Protocol violations: the connection is untrusted afterwards.
    #[error("protocol violation from worker {worker}: {reason}")]
    Protocol { worker: WorkerId, reason: String },

    // Unknown-id references are droppable for idempotent safety.
    #[error("unknown job id: {0}")]
    UnknownJob(JobId),

    #[error("unknown logical data id: {0}")]
    UnknownData(LdoId),

    #[error("unknown worker id: {0}")]
    UnknownWorker(WorkerId),

    #[error("unknown partition id: {0}")]
    UnknownPartition(PartitionId),

    #[error("unknown checkpoint id: {0}")]
    UnknownCheckpoint(CheckpointId),

    #[error("logical data id {0} already defined")]
    DataAlreadyDefined(LdoId),

    #[error("job id {0} already spawned")]
    JobAlreadySpawned(JobId),

    // Template lifecycle misuse is surfaced to the application.
    #[error("template '{template}': {reason}")]
    TemplateState { template: String, reason: String },

    // No replica of the needed version and no reconstruction path.
    #[error("no replica of logical data {ldo} at version {version}")]
    VersionUnavailable { ldo: LdoId, version: Version },

    #[error("worker {0} lost")]
    WorkerLost(WorkerId),

    // Invariant violations abort with a diagnostic.
    #[error("fatal invariant violation: {0}")]
    Fatal(String),

    #[error("ready frontier full: capacity {capacity}")]
    FrontierFull { capacity: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("outbound channel to worker {0} closed")]
    ChannelClosed(WorkerId),

    #[error("no rewind point covers the lost jobs")]
    NoRewindPoint,

    // Store and encoding failures.
    #[error("store error: {0}")]
    Store(#[from] sled::Error),

    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ControllerError {
    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    pub fn template_state(template: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::TemplateState {
            template: template.into(),
            reason: reason.into(),
        }
    }

    pub fn protocol(worker: WorkerId, reason: impl Into<String>) -> Self {
        Self::Protocol {
            worker,
            reason: reason.into(),
        }
    }

    /// Errors that are dropped after a WARN rather than propagated, so that
    /// duplicate, late, or replayed messages stay idempotent.
    pub fn is_droppable(&self) -> bool {
        matches!(
            self,
            Self::UnknownJob(_)
                | Self::UnknownData(_)
                | Self::UnknownCheckpoint(_)
                | Self::JobAlreadySpawned(_)
                | Self::DataAlreadyDefined(_)
        )
    }

    /// Errors recovered by rewinding to a checkpoint: a worker is gone
    /// (or its connection is no longer trusted), or a needed version has
    /// no live replica.
    pub fn needs_rewind(&self) -> bool {
        matches!(
            self,
            Self::VersionUnavailable { .. }
                | Self::WorkerLost(_)
                | Self::ChannelClosed(_)
                | Self::Protocol { .. }
        )
    }

    /// Errors the controller absorbs without terminating: dropped locally,
    /// surfaced to the application, or recovered via rewind.
    pub fn is_recoverable(&self) -> bool {
        self.is_droppable()
            || self.needs_rewind()
            || matches!(self, Self::TemplateState { .. })
    }

    /// Errors that terminate the controller with a diagnostic.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

pub type Result<T> = std::result::Result<T, ControllerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_droppable_errors() {
        assert!(ControllerError::UnknownJob(3).is_droppable());
        assert!(ControllerError::UnknownData(9).is_droppable());
        assert!(!ControllerError::WorkerLost(1).is_droppable());
    }

    #[test]
    fn test_rewind_errors() {
        assert!(ControllerError::WorkerLost(2).needs_rewind());
        assert!(ControllerError::VersionUnavailable { ldo: 1, version: 4 }.needs_rewind());
        assert!(ControllerError::ChannelClosed(3).needs_rewind());
        assert!(ControllerError::protocol(1, "bad frame").needs_rewind());
        assert!(!ControllerError::UnknownJob(1).needs_rewind());
    }

    #[test]
    fn test_recoverable_errors() {
        // Dropped, surfaced, and rewind-class errors never terminate.
        assert!(ControllerError::UnknownJob(1).is_recoverable());
        assert!(ControllerError::template_state("iter", "not finalized").is_recoverable());
        assert!(ControllerError::VersionUnavailable { ldo: 1, version: 4 }.is_recoverable());
        assert!(ControllerError::WorkerLost(2).is_recoverable());

        assert!(!ControllerError::fatal("bad invariant").is_recoverable());
        assert!(!ControllerError::NoRewindPoint.is_recoverable());
    }

    #[test]
    fn test_fatal_display() {
        let err = ControllerError::fatal("lineage version non-monotone on append");
        assert!(err.is_fatal());
        assert!(err.to_string().contains("non-monotone"));
    }

    #[test]
    fn test_template_state_display() {
        let err = ControllerError::template_state("iter", "not finalized");
        assert!(err.to_string().contains("iter"));
        assert!(err.to_string().contains("not finalized"));
    }
}
