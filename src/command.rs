use bytes::Bytes;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::geometry::GeometricRegion;
use crate::model::{
    CheckpointId, ComputeJobSpec, JobId, JobIdSet, LdoId, PartitionId, PhysicalId, Version,
    WorkerId,
};

/// Inbound message semantics, worker to controller.
///
/// Wire framing is outside this crate; these are the decoded payloads the
/// event loop dispatches over in a single match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WorkerEvent {
    Handshake {
        worker: Option<WorkerId>,
    },
    SpawnCompute(ComputeJobSpec),
    SpawnCopy {
        job_id: JobId,
        from_ldo: LdoId,
        to_ldo: LdoId,
        before: JobIdSet,
        after: JobIdSet,
        parent: JobId,
        params: Bytes,
    },
    DefineData {
        name: String,
        ldo_id: LdoId,
        partition: PartitionId,
        neighbor_partitions: SmallVec<[PartitionId; 6]>,
        parent: JobId,
        params: Bytes,
    },
    DefinePartition {
        partition: PartitionId,
        region: GeometricRegion,
    },
    JobDone {
        job_id: JobId,
        after: JobIdSet,
        params: Bytes,
        run_time: f64,
        wait_time: f64,
    },
    SaveDataDone {
        job_id: JobId,
        handle: String,
    },
    DetectTemplate {
        name: String,
    },
    AddTemplateJob {
        name: String,
        spec: ComputeJobSpec,
    },
    FinalizeTemplate {
        name: String,
    },
    InstantiateTemplate {
        name: String,
        inner_job_ids: Vec<JobId>,
        outer_job_ids: Vec<JobId>,
        parameters: Vec<Bytes>,
        parent: JobId,
    },
    Terminate {
        exit_status: i32,
    },
}

impl WorkerEvent {
    /// Control-plane events jump the spawn traffic in the inbound queue.
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            WorkerEvent::Handshake { .. }
                | WorkerEvent::JobDone { .. }
                | WorkerEvent::SaveDataDone { .. }
                | WorkerEvent::Terminate { .. }
        )
    }
}

/// Outbound command semantics, controller to worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WorkerCommand {
    Execute {
        job_id: JobId,
        name: String,
        read_phys: Vec<PhysicalId>,
        write_phys: Vec<PhysicalId>,
        before: JobIdSet,
        after: JobIdSet,
        params: Bytes,
    },
    Create {
        job_id: JobId,
        ldo: LdoId,
        phys_id: PhysicalId,
        before: JobIdSet,
    },
    LocalCopy {
        job_id: JobId,
        from_phys: PhysicalId,
        to_phys: PhysicalId,
        before: JobIdSet,
    },
    RemoteCopySend {
        job_id: JobId,
        receive_job_id: JobId,
        from_phys: PhysicalId,
        dest_worker: WorkerId,
        before: JobIdSet,
    },
    RemoteCopyReceive {
        job_id: JobId,
        to_phys: PhysicalId,
        before: JobIdSet,
    },
    MegaRcr {
        job_id: JobId,
        receive_job_ids: Vec<JobId>,
        to_phys: Vec<PhysicalId>,
        before: JobIdSet,
    },
    SaveData {
        job_id: JobId,
        phys_id: PhysicalId,
        checkpoint: CheckpointId,
    },
    LoadData {
        job_id: JobId,
        ldo: LdoId,
        version: Version,
        handle: String,
        phys_id: PhysicalId,
    },
    Cancel {
        job_id: JobId,
    },
    Terminate {
        status: i32,
    },
}

impl WorkerCommand {
    /// The job the command creates or addresses, where one exists.
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            WorkerCommand::Execute { job_id, .. }
            | WorkerCommand::Create { job_id, .. }
            | WorkerCommand::LocalCopy { job_id, .. }
            | WorkerCommand::RemoteCopySend { job_id, .. }
            | WorkerCommand::RemoteCopyReceive { job_id, .. }
            | WorkerCommand::MegaRcr { job_id, .. }
            | WorkerCommand::SaveData { job_id, .. }
            | WorkerCommand::LoadData { job_id, .. }
            | WorkerCommand::Cancel { job_id } => Some(*job_id),
            WorkerCommand::Terminate { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_classification() {
        assert!(WorkerEvent::Handshake { worker: None }.is_control());
        assert!(WorkerEvent::JobDone {
            job_id: 1,
            after: JobIdSet::new(),
            params: Bytes::new(),
            run_time: 0.0,
            wait_time: 0.0,
        }
        .is_control());
        assert!(!WorkerEvent::DetectTemplate {
            name: "iter".to_string()
        }
        .is_control());
    }

    #[test]
    fn test_command_job_id() {
        let cmd = WorkerCommand::Create {
            job_id: 9,
            ldo: 1,
            phys_id: 2,
            before: JobIdSet::new(),
        };
        assert_eq!(cmd.job_id(), Some(9));
        assert_eq!(WorkerCommand::Terminate { status: 0 }.job_id(), None);
    }

    #[test]
    fn test_event_serde_round_trip() {
        let event = WorkerEvent::DefinePartition {
            partition: 3,
            region: GeometricRegion::new(0, 0, 0, 8, 8, 8),
        };
        let encoded = serde_json::to_string(&event).unwrap();
        let decoded: WorkerEvent = serde_json::from_str(&encoded).unwrap();
        match decoded {
            WorkerEvent::DefinePartition { partition, region } => {
                assert_eq!(partition, 3);
                assert_eq!(region.dx, 8);
            }
            other => panic!("unexpected decode: {:?}", other),
        }
    }
}
