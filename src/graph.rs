use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::error::{ControllerError, Result};
use crate::model::{Job, JobId, JobState, WorkerId};

/// Dependency graph over dynamically spawned jobs.
///
/// Vertices are job records; an edge `A -> B` exists when `A` appears in
/// `B`'s before set, when `B` appears in `A`'s after set, or when the
/// assigner threads a synthesized copy in front of `B`. Implicit version
/// edges are not materialized here; the assigner resolves them against the
/// lineage when a job otherwise becomes ready.
pub struct JobGraph {
    jobs: DashMap<JobId, Job>,
    /// pred -> set of succs waiting on it.
    dependents: DashMap<JobId, HashSet<JobId>>,
    /// succ -> full set of preds.
    dependencies: DashMap<JobId, HashSet<JobId>>,
    /// Bumped on any edge mutation; invalidates the ancestor cache.
    epoch: AtomicU64,
    ancestor_cache: DashMap<JobId, (u64, Arc<HashSet<JobId>>)>,
    ancestor_cache_capacity: usize,
}

impl JobGraph {
    pub fn new(ancestor_cache_capacity: usize) -> Self {
        Self {
            jobs: DashMap::new(),
            dependents: DashMap::new(),
            dependencies: DashMap::new(),
            epoch: AtomicU64::new(0),
            ancestor_cache: DashMap::new(),
            ancestor_cache_capacity,
        }
    }

    pub fn add_job(&self, job: Job) -> Result<()> {
        if self.jobs.contains_key(&job.id) {
            return Err(ControllerError::JobAlreadySpawned(job.id));
        }
        let id = job.id;
        for &pred in &job.before {
            self.wire_edge(pred, id);
        }
        for &succ in &job.after {
            self.wire_edge(id, succ);
        }
        self.jobs.insert(id, job);
        self.bump_epoch();
        Ok(())
    }

    /// Threads a synthesized predecessor in front of an existing job.
    pub fn add_edge(&self, pred: JobId, succ: JobId) {
        self.wire_edge(pred, succ);
        self.bump_epoch();
    }

    fn wire_edge(&self, pred: JobId, succ: JobId) {
        self.dependents.entry(pred).or_default().insert(succ);
        self.dependencies.entry(succ).or_default().insert(pred);
    }

    fn bump_epoch(&self) {
        self.epoch.fetch_add(1, Ordering::Release);
        if self.ancestor_cache.len() > self.ancestor_cache_capacity {
            self.ancestor_cache.clear();
        }
    }

    pub fn get(&self, id: JobId) -> Option<Job> {
        self.jobs.get(&id).map(|j| j.clone())
    }

    pub fn contains(&self, id: JobId) -> bool {
        self.jobs.contains_key(&id)
    }

    pub fn state(&self, id: JobId) -> Option<JobState> {
        self.jobs.get(&id).map(|j| j.state)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn set_state(&self, id: JobId, state: JobState) -> Result<()> {
        let mut job = self.jobs.get_mut(&id).ok_or(ControllerError::UnknownJob(id))?;
        job.state = state;
        Ok(())
    }

    pub fn mark_assigned(&self, id: JobId, worker: WorkerId) -> Result<()> {
        let mut job = self.jobs.get_mut(&id).ok_or(ControllerError::UnknownJob(id))?;
        job.state = JobState::Assigned;
        job.assigned_worker = Some(worker);
        Ok(())
    }

    /// All graph predecessors of `id` are DONE.
    pub fn dependencies_met(&self, id: JobId) -> bool {
        let preds = match self.dependencies.get(&id) {
            Some(p) => p.clone(),
            None => return true,
        };
        preds.iter().all(|pred| {
            matches!(
                self.jobs.get(pred).map(|j| j.state),
                // A pred the controller never saw cannot gate readiness
                // forever; unknown ids are dropped at ingest instead.
                Some(JobState::Done) | None
            )
        })
    }

    /// Marks a job DONE, records its reported timings, and returns the
    /// dependents that this completion made ready. Duplicate completions
    /// return an empty promotion set.
    pub fn on_job_done(
        &self,
        id: JobId,
        run_time: Option<f64>,
        wait_time: Option<f64>,
    ) -> Result<Vec<JobId>> {
        {
            let mut job = self.jobs.get_mut(&id).ok_or(ControllerError::UnknownJob(id))?;
            if job.state == JobState::Done {
                debug!(job = id, "duplicate completion dropped");
                return Ok(Vec::new());
            }
            job.state = JobState::Done;
            job.run_time = run_time;
            job.wait_time = wait_time;
        }

        let dependents: Vec<JobId> = self
            .dependents
            .get(&id)
            .map(|d| d.iter().copied().collect())
            .unwrap_or_default();

        let mut promoted = Vec::new();
        for dep in dependents {
            let pending = matches!(self.state(dep), Some(JobState::Pending));
            if pending && self.dependencies_met(dep) {
                promoted.push(dep);
            }
        }
        Ok(promoted)
    }

    /// Returns a job to PENDING for rewind replay, clearing its binding.
    pub fn reset_job(&self, id: JobId) -> Result<()> {
        let mut job = self.jobs.get_mut(&id).ok_or(ControllerError::UnknownJob(id))?;
        job.state = JobState::Pending;
        job.assigned_worker = None;
        job.run_time = None;
        job.wait_time = None;
        Ok(())
    }

    /// Jobs assigned to or running on a lost worker move to LOST.
    pub fn mark_worker_lost(&self, worker: WorkerId) -> Vec<JobId> {
        let mut lost = Vec::new();
        for mut entry in self.jobs.iter_mut() {
            if entry.assigned_worker == Some(worker)
                && matches!(entry.state, JobState::Assigned | JobState::Running)
            {
                entry.state = JobState::Lost;
                lost.push(entry.id);
            }
        }
        lost
    }

    /// Transitive predecessors via explicit edges and the parent relation.
    pub fn ancestors(&self, id: JobId) -> Arc<HashSet<JobId>> {
        let epoch = self.epoch.load(Ordering::Acquire);
        if let Some(cached) = self.ancestor_cache.get(&id) {
            if cached.0 == epoch {
                return cached.1.clone();
            }
        }

        let mut seen: HashSet<JobId> = HashSet::new();
        let mut frontier = vec![id];
        while let Some(current) = frontier.pop() {
            let mut push = |pred: JobId| {
                if pred != id && seen.insert(pred) {
                    frontier.push(pred);
                }
            };
            if let Some(preds) = self.dependencies.get(&current) {
                for &pred in preds.iter() {
                    push(pred);
                }
            }
            if let Some(parent) = self.jobs.get(&current).and_then(|j| j.parent) {
                push(parent);
            }
        }

        let set = Arc::new(seen);
        self.ancestor_cache.insert(id, (epoch, set.clone()));
        set
    }

    /// Drops a finished job and its index entries. Callers gate this on the
    /// lineage having been cleaned past the job.
    pub fn remove_job(&self, id: JobId) {
        self.jobs.remove(&id);
        self.dependents.remove(&id);
        if let Some((_, preds)) = self.dependencies.remove(&id) {
            for pred in preds {
                if let Some(mut succs) = self.dependents.get_mut(&pred) {
                    succs.remove(&id);
                }
            }
        }
        self.bump_epoch();
    }

    pub fn jobs_in_state(&self, state: JobState) -> Vec<JobId> {
        self.jobs
            .iter()
            .filter(|j| j.state == state)
            .map(|j| j.id)
            .collect()
    }

    pub fn count_in_state(&self, state: JobState) -> usize {
        self.jobs.iter().filter(|j| j.state == state).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Job, JobIdSet, JobKind};
    use smallvec::smallvec;

    fn job(id: JobId, before: JobIdSet) -> Job {
        Job::synthesized(id, JobKind::Compute, before)
    }

    fn graph() -> JobGraph {
        JobGraph::new(1024)
    }

    #[test]
    fn test_no_dependency_job_is_ready() {
        let g = graph();
        g.add_job(job(1, smallvec![])).unwrap();
        assert!(g.dependencies_met(1));
    }

    #[test]
    fn test_chain_promotion() {
        let g = graph();
        g.add_job(job(1, smallvec![])).unwrap();
        g.add_job(job(2, smallvec![1])).unwrap();
        g.add_job(job(3, smallvec![2])).unwrap();

        assert!(!g.dependencies_met(2));
        let promoted = g.on_job_done(1, None, None).unwrap();
        assert_eq!(promoted, vec![2]);

        let promoted = g.on_job_done(2, None, None).unwrap();
        assert_eq!(promoted, vec![3]);
    }

    #[test]
    fn test_multiple_dependencies_gate() {
        let g = graph();
        g.add_job(job(1, smallvec![])).unwrap();
        g.add_job(job(2, smallvec![])).unwrap();
        g.add_job(job(3, smallvec![1, 2])).unwrap();

        assert!(g.on_job_done(1, None, None).unwrap().is_empty());
        assert_eq!(g.on_job_done(2, None, None).unwrap(), vec![3]);
    }

    #[test]
    fn test_duplicate_done_is_dropped() {
        let g = graph();
        g.add_job(job(1, smallvec![])).unwrap();
        g.add_job(job(2, smallvec![1])).unwrap();

        assert_eq!(g.on_job_done(1, None, None).unwrap(), vec![2]);
        assert!(g.on_job_done(1, None, None).unwrap().is_empty());
    }

    #[test]
    fn test_unknown_done_is_error() {
        let g = graph();
        assert!(matches!(
            g.on_job_done(42, None, None),
            Err(ControllerError::UnknownJob(42))
        ));
    }

    #[test]
    fn test_synthesized_edge_returns_job_to_gating() {
        let g = graph();
        g.add_job(job(1, smallvec![])).unwrap();
        g.add_job(job(2, smallvec![])).unwrap();
        g.add_edge(1, 2);
        assert!(!g.dependencies_met(2));
        g.on_job_done(1, None, None).unwrap();
        assert!(g.dependencies_met(2));
    }

    #[test]
    fn test_ancestors_transitive_with_parent() {
        let g = graph();
        g.add_job(job(1, smallvec![])).unwrap();
        g.add_job(job(2, smallvec![1])).unwrap();
        let mut child = job(3, smallvec![2]);
        child.parent = Some(10);
        g.add_job(job(10, smallvec![])).unwrap();
        g.add_job(child).unwrap();

        let ancestors = g.ancestors(3);
        assert!(ancestors.contains(&1));
        assert!(ancestors.contains(&2));
        assert!(ancestors.contains(&10));
        assert!(!ancestors.contains(&3));
    }

    #[test]
    fn test_ancestor_cache_invalidated_by_new_edges() {
        let g = graph();
        g.add_job(job(1, smallvec![])).unwrap();
        g.add_job(job(2, smallvec![])).unwrap();
        assert!(!g.ancestors(2).contains(&1));

        g.add_edge(1, 2);
        assert!(g.ancestors(2).contains(&1));
    }

    #[test]
    fn test_mark_worker_lost() {
        let g = graph();
        g.add_job(job(1, smallvec![])).unwrap();
        g.add_job(job(2, smallvec![])).unwrap();
        g.mark_assigned(1, 7).unwrap();
        g.mark_assigned(2, 8).unwrap();

        let lost = g.mark_worker_lost(7);
        assert_eq!(lost, vec![1]);
        assert_eq!(g.state(1), Some(JobState::Lost));
        assert_eq!(g.state(2), Some(JobState::Assigned));
    }

    #[test]
    fn test_remove_job_clears_indices() {
        let g = graph();
        g.add_job(job(1, smallvec![])).unwrap();
        g.add_job(job(2, smallvec![1])).unwrap();
        g.on_job_done(1, None, None).unwrap();
        g.on_job_done(2, None, None).unwrap();

        g.remove_job(2);
        assert!(!g.contains(2));
        assert!(g.dependents.get(&1).map(|s| s.is_empty()).unwrap_or(true));
    }
}
