use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::error::{ControllerError, Result};
use crate::model::{JobId, PhysicalId, TemplateGenId};

/// Job flavor inside a worker-side execution template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecJobKind {
    Compute,
    Combine,
    LocalCopy,
    RemoteCopySend,
    RemoteCopyReceive,
    MegaRcr,
}

/// One pre-linked job slot. `dependency_num` is frozen at finalize; the
/// counter resets every instantiation and the slot becomes ready when the
/// counter reaches the target.
#[derive(Debug, Clone)]
struct ExecJobSlot {
    kind: ExecJobKind,
    before: Vec<JobId>,
    after: Vec<usize>,
    dependency_num: usize,
    to_phys_count: usize,
    // Per-instantiation state.
    job_id: JobId,
    counter: usize,
    done: bool,
}

struct PendingInstantiate {
    generation: TemplateGenId,
    inner_job_ids: Vec<JobId>,
    parameters: Vec<Bytes>,
    extra_dependency: HashSet<JobId>,
}

/// Worker-side mirror of a finalized template.
///
/// Once instantiated, inner dependencies resolve through counters without
/// per-job bookkeeping: compute and copy slots wait on their before edges,
/// remote receives additionally wait for bytes to arrive, mega-receives for
/// one arrival per target physical id.
pub struct ExecutionTemplate {
    name: String,
    finalized: bool,
    slots: Vec<ExecJobSlot>,
    detect_id_to_slot: HashMap<JobId, usize>,
    id_to_slot: HashMap<JobId, usize>,
    generation: TemplateGenId,
    live_jobs: usize,
    extra_gate: HashSet<JobId>,
    pending: Option<PendingInstantiate>,
}

impl ExecutionTemplate {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            finalized: false,
            slots: Vec::new(),
            detect_id_to_slot: HashMap::new(),
            id_to_slot: HashMap::new(),
            generation: 0,
            live_jobs: 0,
            extra_gate: HashSet::new(),
            pending: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn finalized(&self) -> bool {
        self.finalized
    }

    pub fn job_count(&self) -> usize {
        self.slots.len()
    }

    pub fn generation(&self) -> TemplateGenId {
        self.generation
    }

    pub fn live_jobs(&self) -> usize {
        self.live_jobs
    }

    pub fn pending_instantiate(&self) -> bool {
        self.pending.is_some()
    }

    fn add_slot(
        &mut self,
        kind: ExecJobKind,
        job_id: JobId,
        before: Vec<JobId>,
        to_phys_count: usize,
    ) -> Result<()> {
        if self.finalized {
            return Err(ControllerError::template_state(
                &self.name,
                "finalized; cannot add job",
            ));
        }
        self.detect_id_to_slot.insert(job_id, self.slots.len());
        self.slots.push(ExecJobSlot {
            kind,
            before,
            after: Vec::new(),
            dependency_num: 0,
            to_phys_count,
            job_id,
            counter: 0,
            done: false,
        });
        Ok(())
    }

    pub fn add_compute_job(&mut self, job_id: JobId, before: Vec<JobId>) -> Result<()> {
        self.add_slot(ExecJobKind::Compute, job_id, before, 0)
    }

    pub fn add_combine_job(&mut self, job_id: JobId, before: Vec<JobId>) -> Result<()> {
        self.add_slot(ExecJobKind::Combine, job_id, before, 0)
    }

    pub fn add_local_copy_job(&mut self, job_id: JobId, before: Vec<JobId>) -> Result<()> {
        self.add_slot(ExecJobKind::LocalCopy, job_id, before, 0)
    }

    pub fn add_remote_copy_send_job(&mut self, job_id: JobId, before: Vec<JobId>) -> Result<()> {
        self.add_slot(ExecJobKind::RemoteCopySend, job_id, before, 0)
    }

    pub fn add_remote_copy_receive_job(&mut self, job_id: JobId, before: Vec<JobId>) -> Result<()> {
        self.add_slot(ExecJobKind::RemoteCopyReceive, job_id, before, 0)
    }

    pub fn add_mega_rcr_job(
        &mut self,
        job_id: JobId,
        before: Vec<JobId>,
        to_phys: &[PhysicalId],
    ) -> Result<()> {
        self.add_slot(ExecJobKind::MegaRcr, job_id, before, to_phys.len())
    }

    /// Freezes the skeleton: links after edges and precomputes each slot's
    /// dependency target.
    pub fn finalize(&mut self) -> Result<()> {
        if self.finalized {
            return Err(ControllerError::template_state(
                &self.name,
                "already finalized",
            ));
        }
        for idx in 0..self.slots.len() {
            let before = self.slots[idx].before.clone();
            let mut num = before.len();
            match self.slots[idx].kind {
                ExecJobKind::RemoteCopyReceive => num += 1,
                ExecJobKind::MegaRcr => num += self.slots[idx].to_phys_count,
                _ => {}
            }
            self.slots[idx].dependency_num = num;
            for pred in before {
                if let Some(&pred_idx) = self.detect_id_to_slot.get(&pred) {
                    self.slots[pred_idx].after.push(idx);
                }
            }
        }
        self.finalized = true;
        Ok(())
    }

    /// Activates a new generation, or queues it while the previous one is
    /// still draining. Returns the jobs ready to run immediately.
    pub fn instantiate(
        &mut self,
        generation: TemplateGenId,
        inner_job_ids: Vec<JobId>,
        parameters: Vec<Bytes>,
        extra_dependency: HashSet<JobId>,
    ) -> Result<Vec<JobId>> {
        if !self.finalized {
            return Err(ControllerError::template_state(
                &self.name,
                "not finalized; cannot instantiate",
            ));
        }
        if inner_job_ids.len() != self.slots.len() {
            return Err(ControllerError::template_state(
                &self.name,
                format!(
                    "expected {} inner job ids, got {}",
                    self.slots.len(),
                    inner_job_ids.len()
                ),
            ));
        }
        if self.live_jobs > 0 {
            debug!(template = %self.name, generation, "instantiate queued behind running generation");
            self.pending = Some(PendingInstantiate {
                generation,
                inner_job_ids,
                parameters,
                extra_dependency,
            });
            return Ok(Vec::new());
        }
        Ok(self.activate(generation, inner_job_ids, parameters, extra_dependency))
    }

    fn activate(
        &mut self,
        generation: TemplateGenId,
        inner_job_ids: Vec<JobId>,
        _parameters: Vec<Bytes>,
        extra_dependency: HashSet<JobId>,
    ) -> Vec<JobId> {
        self.generation = generation;
        self.live_jobs = self.slots.len();
        self.extra_gate = extra_dependency;
        self.id_to_slot.clear();
        for (idx, slot) in self.slots.iter_mut().enumerate() {
            slot.job_id = inner_job_ids[idx];
            slot.counter = 0;
            slot.done = false;
            self.id_to_slot.insert(inner_job_ids[idx], idx);
        }
        if self.extra_gate.is_empty() {
            self.initially_ready()
        } else {
            Vec::new()
        }
    }

    fn initially_ready(&self) -> Vec<JobId> {
        self.slots
            .iter()
            .filter(|s| s.dependency_num == 0)
            .map(|s| s.job_id)
            .collect()
    }

    /// Marks an inner or gating job done; returns jobs that became ready.
    pub fn notify_done(&mut self, job_id: JobId) -> Vec<JobId> {
        if self.extra_gate.remove(&job_id) {
            if self.extra_gate.is_empty() {
                return self.initially_ready();
            }
            return Vec::new();
        }

        let slot_idx = match self.id_to_slot.get(&job_id) {
            Some(&idx) => idx,
            None => return Vec::new(),
        };
        if self.slots[slot_idx].done {
            return Vec::new();
        }
        self.slots[slot_idx].done = true;
        self.live_jobs = self.live_jobs.saturating_sub(1);

        let mut ready = Vec::new();
        let after = self.slots[slot_idx].after.clone();
        for succ in after {
            self.slots[succ].counter += 1;
            if self.slots[succ].counter == self.slots[succ].dependency_num {
                ready.push(self.slots[succ].job_id);
            }
        }

        if self.live_jobs == 0 {
            if let Some(pending) = self.pending.take() {
                debug!(template = %self.name, generation = pending.generation, "pending instantiate activated");
                ready.extend(self.activate(
                    pending.generation,
                    pending.inner_job_ids,
                    pending.parameters,
                    pending.extra_dependency,
                ));
            }
        }
        ready
    }

    /// Records a bytes-arrived event for a receive job (keyed by the receive
    /// job id); returns it when the arrival completed its counter.
    pub fn process_receive_event(&mut self, receive_job_id: JobId) -> Option<JobId> {
        let slot_idx = *self.id_to_slot.get(&receive_job_id)?;
        let slot = &mut self.slots[slot_idx];
        if !matches!(
            slot.kind,
            ExecJobKind::RemoteCopyReceive | ExecJobKind::MegaRcr
        ) {
            return None;
        }
        slot.counter += 1;
        if slot.counter == slot.dependency_num {
            Some(slot.job_id)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diamond() -> ExecutionTemplate {
        let mut t = ExecutionTemplate::new("iter");
        t.add_compute_job(1, vec![]).unwrap();
        t.add_compute_job(2, vec![1]).unwrap();
        t.add_compute_job(3, vec![1]).unwrap();
        t.add_compute_job(4, vec![2, 3]).unwrap();
        t.finalize().unwrap();
        t
    }

    #[test]
    fn test_counters_resolve_diamond() {
        let mut t = diamond();
        let ready = t
            .instantiate(1, vec![11, 12, 13, 14], vec![], HashSet::new())
            .unwrap();
        assert_eq!(ready, vec![11]);

        assert_eq!(t.notify_done(11), vec![12, 13]);
        assert!(t.notify_done(12).is_empty());
        assert_eq!(t.notify_done(13), vec![14]);
        assert!(t.notify_done(14).is_empty());
        assert_eq!(t.live_jobs(), 0);
    }

    #[test]
    fn test_receive_needs_bytes_and_before() {
        let mut t = ExecutionTemplate::new("copyin");
        t.add_compute_job(1, vec![]).unwrap();
        t.add_remote_copy_receive_job(2, vec![1]).unwrap();
        t.finalize().unwrap();

        let ready = t.instantiate(1, vec![11, 12], vec![], HashSet::new()).unwrap();
        assert_eq!(ready, vec![11]);

        // dependency_num = |before| + 1: neither alone suffices.
        assert!(t.notify_done(11).is_empty());
        assert_eq!(t.process_receive_event(12), Some(12));
    }

    #[test]
    fn test_bytes_can_arrive_before_dependencies() {
        let mut t = ExecutionTemplate::new("copyin");
        t.add_compute_job(1, vec![]).unwrap();
        t.add_remote_copy_receive_job(2, vec![1]).unwrap();
        t.finalize().unwrap();

        t.instantiate(1, vec![11, 12], vec![], HashSet::new()).unwrap();
        assert_eq!(t.process_receive_event(12), None);
        assert_eq!(t.notify_done(11), vec![12]);
    }

    #[test]
    fn test_mega_rcr_counts_each_target() {
        let mut t = ExecutionTemplate::new("gather");
        t.add_mega_rcr_job(1, vec![], &[100, 101, 102]).unwrap();
        t.finalize().unwrap();

        t.instantiate(1, vec![11], vec![], HashSet::new()).unwrap();
        assert_eq!(t.process_receive_event(11), None);
        assert_eq!(t.process_receive_event(11), None);
        assert_eq!(t.process_receive_event(11), Some(11));
    }

    #[test]
    fn test_extra_dependency_gates_roots() {
        let mut t = diamond();
        let extra: HashSet<JobId> = [900].into_iter().collect();
        let ready = t.instantiate(1, vec![11, 12, 13, 14], vec![], extra).unwrap();
        assert!(ready.is_empty());

        assert_eq!(t.notify_done(900), vec![11]);
    }

    #[test]
    fn test_pending_instantiate_activates_after_drain() {
        let mut t = diamond();
        t.instantiate(1, vec![11, 12, 13, 14], vec![], HashSet::new())
            .unwrap();

        // Second generation queues while the first is live.
        let ready = t
            .instantiate(2, vec![21, 22, 23, 24], vec![], HashSet::new())
            .unwrap();
        assert!(ready.is_empty());
        assert!(t.pending_instantiate());

        t.notify_done(11);
        t.notify_done(12);
        t.notify_done(13);
        let ready = t.notify_done(14);
        assert_eq!(ready, vec![21]);
        assert_eq!(t.generation(), 2);
        assert!(!t.pending_instantiate());
    }

    #[test]
    fn test_instantiate_requires_finalize() {
        let mut t = ExecutionTemplate::new("raw");
        t.add_compute_job(1, vec![]).unwrap();
        let err = t
            .instantiate(1, vec![11], vec![], HashSet::new())
            .unwrap_err();
        assert!(matches!(err, ControllerError::TemplateState { .. }));
    }
}
