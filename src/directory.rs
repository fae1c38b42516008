use dashmap::DashMap;
use tracing::debug;

use crate::error::{ControllerError, Result};
use crate::model::{JobId, LdoId, PdiState, PhysicalId, PhysicalInstance, Version, WorkerId};

/// Directory of physical replicas across workers.
///
/// This is the only entity that mutates a PDI's state or version; everyone
/// else reads snapshots. Versions move monotonically forward except through
/// worker loss, which removes the instance outright.
pub struct PhysicalDirectory {
    instances: DashMap<(WorkerId, PhysicalId), PhysicalInstance>,
    by_ldo: DashMap<LdoId, Vec<(WorkerId, PhysicalId)>>,
}

impl PhysicalDirectory {
    pub fn new() -> Self {
        Self {
            instances: DashMap::new(),
            by_ldo: DashMap::new(),
        }
    }

    /// Registers an instance being materialized by `creator_job`.
    pub fn create_instance(
        &self,
        worker: WorkerId,
        ldo: LdoId,
        phys_id: PhysicalId,
        version: Version,
        creator_job: Option<JobId>,
    ) {
        self.instances.insert(
            (worker, phys_id),
            PhysicalInstance {
                phys_id,
                ldo,
                worker,
                version,
                state: PdiState::Creating,
                creator_job,
                pin_count: 0,
                pending_sends: 0,
            },
        );
        self.by_ldo.entry(ldo).or_default().push((worker, phys_id));
        debug!(worker, phys_id, ldo, version, "instance creating");
    }

    /// Registers an instance that already holds valid bytes (initial data,
    /// checkpoint reload completion).
    pub fn insert_valid(&self, worker: WorkerId, ldo: LdoId, phys_id: PhysicalId, version: Version) {
        self.instances.insert(
            (worker, phys_id),
            PhysicalInstance {
                phys_id,
                ldo,
                worker,
                version,
                state: PdiState::Valid,
                creator_job: None,
                pin_count: 0,
                pending_sends: 0,
            },
        );
        self.by_ldo.entry(ldo).or_default().push((worker, phys_id));
    }

    pub fn get(&self, worker: WorkerId, phys_id: PhysicalId) -> Option<PhysicalInstance> {
        self.instances.get(&(worker, phys_id)).map(|i| i.clone())
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    fn transition(
        &self,
        worker: WorkerId,
        phys_id: PhysicalId,
        expect: &[PdiState],
        next: PdiState,
    ) -> Result<()> {
        let mut instance = self
            .instances
            .get_mut(&(worker, phys_id))
            .ok_or(ControllerError::UnknownData(phys_id))?;
        if !expect.contains(&instance.state) {
            return Err(ControllerError::fatal(format!(
                "instance {} on worker {} in state {:?}, expected one of {:?}",
                phys_id, worker, instance.state, expect
            )));
        }
        instance.state = next;
        if next != PdiState::Creating {
            instance.creator_job = None;
        }
        Ok(())
    }

    /// CREATING -> VALID on create-job (or load-job) completion.
    pub fn complete_create(&self, worker: WorkerId, phys_id: PhysicalId) -> Result<()> {
        self.transition(worker, phys_id, &[PdiState::Creating], PdiState::Valid)
    }

    /// VALID -> IN_TRANSFER when selected as the source of a copy. An
    /// instance already mid-transfer can source further copies; the sends
    /// are counted so the state reverts only when the last one drains.
    pub fn begin_transfer(&self, worker: WorkerId, phys_id: PhysicalId) -> Result<()> {
        let mut instance = self
            .instances
            .get_mut(&(worker, phys_id))
            .ok_or(ControllerError::UnknownData(phys_id))?;
        if !matches!(instance.state, PdiState::Valid | PdiState::InTransfer) {
            return Err(ControllerError::fatal(format!(
                "instance {} on worker {} in state {:?}, cannot source a copy",
                phys_id, worker, instance.state
            )));
        }
        instance.state = PdiState::InTransfer;
        instance.pending_sends += 1;
        Ok(())
    }

    /// IN_TRANSFER -> VALID once every outstanding send has completed.
    pub fn complete_transfer_send(&self, worker: WorkerId, phys_id: PhysicalId) -> Result<()> {
        let mut instance = self
            .instances
            .get_mut(&(worker, phys_id))
            .ok_or(ControllerError::UnknownData(phys_id))?;
        if instance.state != PdiState::InTransfer {
            return Err(ControllerError::fatal(format!(
                "send-done for instance {} on worker {} in state {:?}",
                phys_id, worker, instance.state
            )));
        }
        instance.pending_sends = instance.pending_sends.saturating_sub(1);
        if instance.pending_sends == 0 {
            instance.state = PdiState::Valid;
        }
        Ok(())
    }

    /// VALID -> DIRTY while a write is announced but not yet committed.
    pub fn announce_write(&self, worker: WorkerId, phys_id: PhysicalId) -> Result<()> {
        self.transition(worker, phys_id, &[PdiState::Valid], PdiState::Dirty)
    }

    /// Commits a write, bumping the instance to `new_version` in VALID state.
    /// Versions never decrease.
    pub fn commit_write(
        &self,
        worker: WorkerId,
        phys_id: PhysicalId,
        new_version: Version,
    ) -> Result<()> {
        let mut instance = self
            .instances
            .get_mut(&(worker, phys_id))
            .ok_or(ControllerError::UnknownData(phys_id))?;
        if new_version < instance.version {
            return Err(ControllerError::fatal(format!(
                "version regression on instance {}: {} -> {}",
                phys_id, instance.version, new_version
            )));
        }
        instance.version = new_version;
        instance.state = PdiState::Valid;
        instance.creator_job = None;
        Ok(())
    }

    pub fn pin(&self, worker: WorkerId, phys_id: PhysicalId) {
        if let Some(mut i) = self.instances.get_mut(&(worker, phys_id)) {
            i.pin_count += 1;
        }
    }

    pub fn unpin(&self, worker: WorkerId, phys_id: PhysicalId) {
        if let Some(mut i) = self.instances.get_mut(&(worker, phys_id)) {
            i.pin_count = i.pin_count.saturating_sub(1);
        }
    }

    /// All current replicas of a logical datum.
    pub fn replicas(&self, ldo: LdoId) -> Vec<PhysicalInstance> {
        self.keys_for(ldo)
            .into_iter()
            .filter_map(|k| self.instances.get(&k).map(|i| i.clone()))
            .collect()
    }

    /// A usable replica on `worker` at exactly `version`: VALID, CREATING
    /// (the caller gates on the creator job), or IN_TRANSFER (valid bytes,
    /// safe for concurrent reads).
    pub fn find_local(
        &self,
        worker: WorkerId,
        ldo: LdoId,
        version: Version,
    ) -> Option<PhysicalInstance> {
        self.replicas(ldo).into_iter().find(|i| {
            i.worker == worker
                && i.version == version
                && matches!(
                    i.state,
                    PdiState::Valid | PdiState::Creating | PdiState::InTransfer
                )
        })
    }

    /// A replica at exactly `version` on any other worker that can source a
    /// remote copy (VALID, or already mid-transfer).
    pub fn find_remote_source(
        &self,
        ldo: LdoId,
        version: Version,
        exclude_worker: WorkerId,
    ) -> Option<PhysicalInstance> {
        self.replicas(ldo).into_iter().find(|i| {
            i.worker != exclude_worker
                && i.version == version
                && matches!(i.state, PdiState::Valid | PdiState::InTransfer)
        })
    }

    /// An overwritable destination instance on `worker`: VALID, unpinned,
    /// and not holding the needed version.
    pub fn find_overwritable(
        &self,
        worker: WorkerId,
        ldo: LdoId,
        needed: Version,
    ) -> Option<PhysicalInstance> {
        self.replicas(ldo).into_iter().find(|i| {
            i.worker == worker
                && i.state == PdiState::Valid
                && i.pin_count == 0
                && i.version != needed
        })
    }

    /// Instances on `worker` strictly older than `needed` with no pending
    /// local read; these are eligible for eviction.
    pub fn obsolete_instances(
        &self,
        worker: WorkerId,
        ldo: LdoId,
        needed: Version,
    ) -> Vec<PhysicalInstance> {
        self.replicas(ldo)
            .into_iter()
            .filter(|i| {
                i.worker == worker
                    && i.version < needed
                    && i.pin_count == 0
                    && i.state == PdiState::Valid
            })
            .collect()
    }

    /// Removes one instance after its worker evicted it from cache.
    /// Eviction policy lives at the worker; this is only the notification
    /// interface.
    pub fn evict(&self, worker: WorkerId, phys_id: PhysicalId) -> bool {
        let removed = self.instances.remove(&(worker, phys_id));
        if let Some((_, instance)) = &removed {
            if let Some(mut keys) = self.by_ldo.get_mut(&instance.ldo) {
                keys.retain(|k| *k != (worker, phys_id));
            }
            debug!(worker, phys_id, ldo = instance.ldo, "instance evicted");
        }
        removed.is_some()
    }

    /// Drops every instance hosted on a lost worker; returns how many.
    pub fn drop_worker(&self, worker: WorkerId) -> usize {
        let doomed: Vec<(WorkerId, PhysicalId)> = self
            .instances
            .iter()
            .filter(|e| e.worker == worker)
            .map(|e| *e.key())
            .collect();
        for key in &doomed {
            self.instances.remove(key);
        }
        for mut entry in self.by_ldo.iter_mut() {
            entry.value_mut().retain(|(w, _)| *w != worker);
        }
        debug!(worker, dropped = doomed.len(), "worker instances dropped");
        doomed.len()
    }

    fn keys_for(&self, ldo: LdoId) -> Vec<(WorkerId, PhysicalId)> {
        self.by_ldo.get(&ldo).map(|v| v.clone()).unwrap_or_default()
    }
}

impl Default for PhysicalDirectory {
    fn default() -> Self {
        Self::new()
    }
}
