use bytes::Bytes;
use dashmap::DashMap;
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::error::{ControllerError, Result};
use crate::geometry::GeometricRegion;
use crate::model::{
    ComputeJobSpec, Job, JobDepth, JobId, JobIdSet, JobKind, JobState, LdoIdSet, WorkerId,
};

/// One job descriptor inside a template skeleton. Parameter bytes are
/// replaced by a slot index into the per-instantiation parameter vector.
#[derive(Debug, Clone)]
pub struct TemplateJob {
    pub name: String,
    pub job_id: JobId,
    pub read_set: LdoIdSet,
    pub write_set: LdoIdSet,
    pub before: JobIdSet,
    pub sterile: bool,
    pub region: Option<GeometricRegion>,
    pub param_slot: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TemplateState {
    Detecting,
    Finalized,
}

/// A recurring subgraph: accumulated while detecting, frozen at finalize.
///
/// Finalization precomputes the topological order, the inter-job adjacency
/// by index, the boundary slots for before-ids outside the template, and
/// the parent mask of non-sterile jobs.
pub struct TemplateEntry {
    name: String,
    state: TemplateState,
    jobs: Vec<TemplateJob>,
    id_to_index: HashMap<JobId, usize>,
    before_indices: Vec<Vec<usize>>,
    outer_slots: Vec<Vec<usize>>,
    outer_order: Vec<JobId>,
    topo_order: Vec<usize>,
    parent_indices: Vec<usize>,
    instantiations: u64,
}

impl TemplateEntry {
    fn new(name: String) -> Self {
        Self {
            name,
            state: TemplateState::Detecting,
            jobs: Vec::new(),
            id_to_index: HashMap::new(),
            before_indices: Vec::new(),
            outer_slots: Vec::new(),
            outer_order: Vec::new(),
            topo_order: Vec::new(),
            parent_indices: Vec::new(),
            instantiations: 0,
        }
    }

    pub fn finalized(&self) -> bool {
        self.state == TemplateState::Finalized
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    pub fn outer_count(&self) -> usize {
        self.outer_order.len()
    }

    pub fn instantiation_count(&self) -> u64 {
        self.instantiations
    }

    /// Discards a partial accumulation so detection can restart.
    fn clean_partially_filled(&mut self) {
        self.jobs.clear();
        self.id_to_index.clear();
    }

    fn add_compute(&mut self, spec: ComputeJobSpec) -> Result<()> {
        if self.finalized() {
            return Err(ControllerError::template_state(
                &self.name,
                "finalized; cannot add compute job",
            ));
        }
        if self.id_to_index.contains_key(&spec.job_id) {
            return Err(ControllerError::template_state(
                &self.name,
                format!("job {} already in template", spec.job_id),
            ));
        }
        let index = self.jobs.len();
        self.id_to_index.insert(spec.job_id, index);
        self.jobs.push(TemplateJob {
            name: spec.name,
            job_id: spec.job_id,
            read_set: spec.read_set,
            write_set: spec.write_set,
            before: spec.before,
            sterile: spec.sterile,
            region: spec.region,
            param_slot: index,
        });
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        if self.finalized() {
            return Err(ControllerError::template_state(
                &self.name,
                "already finalized",
            ));
        }

        let n = self.jobs.len();
        self.before_indices = vec![Vec::new(); n];
        self.outer_slots = vec![Vec::new(); n];
        self.outer_order.clear();
        let mut outer_index: HashMap<JobId, usize> = HashMap::new();

        let mut dag = DiGraph::<usize, ()>::new();
        let nodes: Vec<_> = (0..n).map(|i| dag.add_node(i)).collect();

        for (idx, job) in self.jobs.iter().enumerate() {
            for &pred in &job.before {
                match self.id_to_index.get(&pred) {
                    Some(&pred_idx) => {
                        self.before_indices[idx].push(pred_idx);
                        dag.add_edge(nodes[pred_idx], nodes[idx], ());
                    }
                    None => {
                        // Boundary dependency; assigned an outer slot in
                        // order of first appearance.
                        let next = self.outer_order.len();
                        let slot = *outer_index.entry(pred).or_insert_with(|| {
                            self.outer_order.push(pred);
                            next
                        });
                        self.outer_slots[idx].push(slot);
                    }
                }
            }
        }

        let order = toposort(&dag, None).map_err(|_| {
            ControllerError::template_state(&self.name, "cycle in template skeleton")
        })?;
        self.topo_order = order.into_iter().map(|node| dag[node]).collect();
        self.parent_indices = self
            .jobs
            .iter()
            .enumerate()
            .filter(|(_, j)| !j.sterile)
            .map(|(i, _)| i)
            .collect();

        self.state = TemplateState::Finalized;
        debug!(template = %self.name, jobs = n, outer = self.outer_order.len(), "template finalized");
        Ok(())
    }

    /// Expands one instantiation into concrete jobs, substituting the
    /// supplied ids and parameters, in precomputed topological order.
    fn expand(&self, entry: &ComplexJobEntry, depth: JobDepth) -> Vec<Job> {
        let mut jobs = Vec::with_capacity(self.jobs.len());
        for &idx in &self.topo_order {
            let tj = &self.jobs[idx];
            let mut before: JobIdSet = self.before_indices[idx]
                .iter()
                .map(|&i| entry.inner_job_ids[i])
                .collect();
            for &slot in &self.outer_slots[idx] {
                if let Some(&outer) = entry.outer_job_ids.get(slot) {
                    before.push(outer);
                }
            }
            jobs.push(Job {
                id: entry.inner_job_ids[idx],
                kind: JobKind::Compute,
                name: tj.name.clone(),
                parent: Some(entry.parent),
                read_set: tj.read_set.clone(),
                write_set: tj.write_set.clone(),
                before,
                after: JobIdSet::new(),
                params: entry
                    .parameters
                    .get(tj.param_slot)
                    .cloned()
                    .unwrap_or_default(),
                sterile: tj.sterile,
                region: tj.region,
                state: JobState::Pending,
                assigned_worker: None,
                depth,
                future_id: None,
                run_time: None,
                wait_time: None,
            });
        }
        jobs
    }

    fn parent_job_ids(&self, entry: &ComplexJobEntry) -> Vec<JobId> {
        self.parent_indices
            .iter()
            .map(|&i| entry.inner_job_ids[i])
            .collect()
    }
}

/// One instantiation of a template, standing as a single graph vertex until
/// assignment demand expands it.
#[derive(Debug, Clone)]
pub struct ComplexJobEntry {
    pub complex_id: JobId,
    pub template: String,
    pub inner_job_ids: Vec<JobId>,
    pub outer_job_ids: Vec<JobId>,
    pub parameters: Vec<Bytes>,
    pub parent: JobId,
    pub remaining: usize,
    pub expanded: bool,
}

/// Detects, finalizes, and instantiates recurring subgraphs.
pub struct TemplateManager {
    templates: DashMap<String, TemplateEntry>,
    complex: DashMap<JobId, ComplexJobEntry>,
    inner_to_complex: DashMap<JobId, JobId>,
    affinity: DashMap<GeometricRegion, WorkerId>,
}

impl TemplateManager {
    pub fn new() -> Self {
        Self {
            templates: DashMap::new(),
            complex: DashMap::new(),
            inner_to_complex: DashMap::new(),
            affinity: DashMap::new(),
        }
    }

    /// Starts (or restarts) detection. A finalized template makes this an
    /// idempotent lookup; a partially filled one is discarded and restarted.
    pub fn detect(&self, name: &str) -> Result<()> {
        match self.templates.get_mut(name) {
            None => {
                self.templates
                    .insert(name.to_string(), TemplateEntry::new(name.to_string()));
                Ok(())
            }
            Some(mut entry) => {
                if entry.finalized() {
                    debug!(template = name, "re-detect of finalized template; lookup only");
                    Ok(())
                } else {
                    warn!(template = name, "cleaned up partially filled template");
                    entry.clean_partially_filled();
                    Ok(())
                }
            }
        }
    }

    pub fn add_compute(&self, name: &str, spec: ComputeJobSpec) -> Result<()> {
        let mut entry = self
            .templates
            .get_mut(name)
            .ok_or_else(|| ControllerError::template_state(name, "not detected"))?;
        entry.add_compute(spec)
    }

    pub fn finalize(&self, name: &str) -> Result<()> {
        let mut entry = self
            .templates
            .get_mut(name)
            .ok_or_else(|| ControllerError::template_state(name, "not detected"))?;
        entry.finalize()
    }

    pub fn is_finalized(&self, name: &str) -> bool {
        self.templates
            .get(name)
            .map(|e| e.finalized())
            .unwrap_or(false)
    }

    /// Creates the COMPLEX vertex for one instantiation; inner jobs expand
    /// only when the assigner demands them.
    pub fn instantiate(
        &self,
        name: &str,
        complex_id: JobId,
        inner_job_ids: Vec<JobId>,
        outer_job_ids: Vec<JobId>,
        parameters: Vec<Bytes>,
        parent: JobId,
    ) -> Result<Job> {
        let mut entry = self
            .templates
            .get_mut(name)
            .ok_or_else(|| ControllerError::template_state(name, "not detected"))?;
        if !entry.finalized() {
            return Err(ControllerError::template_state(
                name,
                "not finalized; cannot instantiate",
            ));
        }
        if inner_job_ids.len() != entry.job_count() {
            return Err(ControllerError::template_state(
                name,
                format!(
                    "expected {} inner job ids, got {}",
                    entry.job_count(),
                    inner_job_ids.len()
                ),
            ));
        }
        if parameters.len() != entry.job_count() {
            return Err(ControllerError::template_state(
                name,
                format!(
                    "expected {} parameters, got {}",
                    entry.job_count(),
                    parameters.len()
                ),
            ));
        }
        entry.instantiations += 1;

        let complex_entry = ComplexJobEntry {
            complex_id,
            template: name.to_string(),
            inner_job_ids: inner_job_ids.clone(),
            outer_job_ids: outer_job_ids.clone(),
            parameters,
            parent,
            remaining: entry.job_count(),
            expanded: false,
        };
        for &inner in &inner_job_ids {
            self.inner_to_complex.insert(inner, complex_id);
        }
        self.complex.insert(complex_id, complex_entry);

        let mut vertex = Job::synthesized(
            complex_id,
            JobKind::Complex,
            outer_job_ids.into_iter().collect(),
        );
        vertex.name = name.to_string();
        vertex.parent = Some(parent);
        vertex.sterile = false;
        Ok(vertex)
    }

    /// Expands a complex job into its inner jobs exactly once.
    pub fn expand_complex(&self, complex_id: JobId, depth: JobDepth) -> Result<Vec<Job>> {
        let mut entry = self
            .complex
            .get_mut(&complex_id)
            .ok_or(ControllerError::UnknownJob(complex_id))?;
        if entry.expanded {
            return Ok(Vec::new());
        }
        entry.expanded = true;
        let template = self
            .templates
            .get(&entry.template)
            .ok_or_else(|| ControllerError::template_state(&entry.template, "missing"))?;
        Ok(template.expand(&entry, depth))
    }

    /// Inner ids that can author further jobs; these matter for rewind.
    pub fn complex_parent_ids(&self, complex_id: JobId) -> Result<Vec<JobId>> {
        let entry = self
            .complex
            .get(&complex_id)
            .ok_or(ControllerError::UnknownJob(complex_id))?;
        let template = self
            .templates
            .get(&entry.template)
            .ok_or_else(|| ControllerError::template_state(&entry.template, "missing"))?;
        Ok(template.parent_job_ids(&entry))
    }

    /// Records an inner completion; returns the owning complex id and
    /// whether that instantiation is now fully done.
    pub fn mark_inner_done(&self, inner_id: JobId) -> Option<(JobId, bool)> {
        let complex_id = *self.inner_to_complex.get(&inner_id)?;
        let mut entry = self.complex.get_mut(&complex_id)?;
        entry.remaining = entry.remaining.saturating_sub(1);
        let complete = entry.remaining == 0;
        if complete {
            self.inner_to_complex.remove(&inner_id);
        }
        Some((complex_id, complete))
    }

    pub fn record_affinity(&self, region: GeometricRegion, worker: WorkerId) {
        self.affinity.insert(region, worker);
    }

    /// Worker that last ran work for this region, if any.
    pub fn affinity_hint(&self, region: &GeometricRegion) -> Option<WorkerId> {
        self.affinity.get(region).map(|w| *w)
    }

    pub fn template_count(&self) -> usize {
        self.templates.len()
    }
}

impl Default for TemplateManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    fn spec(job_id: JobId, before: JobIdSet) -> ComputeJobSpec {
        ComputeJobSpec {
            job_id,
            name: format!("step_{}", job_id),
            read_set: smallvec![1],
            write_set: smallvec![1],
            before,
            after: JobIdSet::new(),
            parent: 100,
            params: Bytes::new(),
            sterile: false,
            region: None,
            future_id: None,
        }
    }

    fn detected_template(manager: &TemplateManager) {
        manager.detect("iter").unwrap();
        manager.add_compute("iter", spec(1, smallvec![])).unwrap();
        manager.add_compute("iter", spec(2, smallvec![1])).unwrap();
        manager.add_compute("iter", spec(3, smallvec![1])).unwrap();
        manager.add_compute("iter", spec(4, smallvec![2, 3])).unwrap();
    }

    #[test]
    fn test_add_requires_detection() {
        let manager = TemplateManager::new();
        assert!(manager.add_compute("iter", spec(1, smallvec![])).is_err());
    }

    #[test]
    fn test_finalize_freezes_skeleton() {
        let manager = TemplateManager::new();
        detected_template(&manager);
        manager.finalize("iter").unwrap();
        assert!(manager.is_finalized("iter"));

        // Frozen: no further accumulation, no double finalize.
        assert!(manager.add_compute("iter", spec(9, smallvec![])).is_err());
        assert!(manager.finalize("iter").is_err());
    }

    #[test]
    fn test_redetect_unfinalized_restarts() {
        let manager = TemplateManager::new();
        detected_template(&manager);
        manager.detect("iter").unwrap();
        // Accumulation was discarded; the same ids are accepted again.
        manager.add_compute("iter", spec(1, smallvec![])).unwrap();
    }

    #[test]
    fn test_redetect_finalized_is_idempotent_lookup() {
        let manager = TemplateManager::new();
        detected_template(&manager);
        manager.finalize("iter").unwrap();
        manager.detect("iter").unwrap();
        assert!(manager.is_finalized("iter"));
    }

    #[test]
    fn test_instantiate_requires_finalized() {
        let manager = TemplateManager::new();
        detected_template(&manager);
        let err = manager
            .instantiate("iter", 50, vec![11, 12, 13, 14], vec![], vec![Bytes::new(); 4], 100)
            .unwrap_err();
        assert!(matches!(err, ControllerError::TemplateState { .. }));
    }

    #[test]
    fn test_instantiate_twice_with_distinct_ids() {
        let manager = TemplateManager::new();
        detected_template(&manager);
        manager.finalize("iter").unwrap();

        let params_a: Vec<Bytes> = (0..4).map(|i| Bytes::from(vec![i as u8])).collect();
        let params_b: Vec<Bytes> = (0..4).map(|i| Bytes::from(vec![0x10 + i as u8])).collect();

        manager
            .instantiate("iter", 50, vec![11, 12, 13, 14], vec![], params_a.clone(), 100)
            .unwrap();
        manager
            .instantiate("iter", 60, vec![15, 16, 17, 18], vec![], params_b.clone(), 100)
            .unwrap();

        let first = manager.expand_complex(50, 1).unwrap();
        let second = manager.expand_complex(60, 1).unwrap();
        assert_eq!(first.len(), 4);
        assert_eq!(second.len(), 4);

        let mut ids: Vec<JobId> = first.iter().map(|j| j.id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![11, 12, 13, 14]);
        let mut ids: Vec<JobId> = second.iter().map(|j| j.id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![15, 16, 17, 18]);

        // Parameter slots follow the supplied vectors.
        let head = first.iter().find(|j| j.id == 11).unwrap();
        assert_eq!(head.params, params_a[0]);
        let head = second.iter().find(|j| j.id == 15).unwrap();
        assert_eq!(head.params, params_b[0]);

        // Inner before sets substitute the fresh ids.
        let tail = first.iter().find(|j| j.id == 14).unwrap();
        let mut before: Vec<JobId> = tail.before.to_vec();
        before.sort_unstable();
        assert_eq!(before, vec![12, 13]);
    }

    #[test]
    fn test_expansion_respects_topological_order() {
        let manager = TemplateManager::new();
        detected_template(&manager);
        manager.finalize("iter").unwrap();
        manager
            .instantiate("iter", 50, vec![11, 12, 13, 14], vec![], vec![Bytes::new(); 4], 100)
            .unwrap();

        let jobs = manager.expand_complex(50, 1).unwrap();
        let pos = |id: JobId| jobs.iter().position(|j| j.id == id).unwrap();
        assert!(pos(11) < pos(12));
        assert!(pos(11) < pos(13));
        assert!(pos(12) < pos(14));
        assert!(pos(13) < pos(14));

        // Expansion happens exactly once.
        assert!(manager.expand_complex(50, 1).unwrap().is_empty());
    }

    #[test]
    fn test_outer_dependencies_substituted() {
        let manager = TemplateManager::new();
        manager.detect("edge").unwrap();
        // Before-id 99 is outside the template: it becomes outer slot 0.
        manager.add_compute("edge", spec(1, smallvec![99])).unwrap();
        manager.finalize("edge").unwrap();

        manager
            .instantiate("edge", 50, vec![11], vec![777], vec![Bytes::new()], 100)
            .unwrap();
        let jobs = manager.expand_complex(50, 1).unwrap();
        assert_eq!(jobs[0].before.to_vec(), vec![777]);
    }

    #[test]
    fn test_complex_parent_ids_exclude_sterile() {
        let manager = TemplateManager::new();
        manager.detect("mix").unwrap();
        let mut sterile_spec = spec(1, smallvec![]);
        sterile_spec.sterile = true;
        manager.add_compute("mix", sterile_spec).unwrap();
        manager.add_compute("mix", spec(2, smallvec![1])).unwrap();
        manager.finalize("mix").unwrap();

        manager
            .instantiate("mix", 50, vec![11, 12], vec![], vec![Bytes::new(); 2], 100)
            .unwrap();
        assert_eq!(manager.complex_parent_ids(50).unwrap(), vec![12]);
    }

    #[test]
    fn test_inner_done_completes_complex() {
        let manager = TemplateManager::new();
        manager.detect("tiny").unwrap();
        manager.add_compute("tiny", spec(1, smallvec![])).unwrap();
        manager.add_compute("tiny", spec(2, smallvec![1])).unwrap();
        manager.finalize("tiny").unwrap();
        manager
            .instantiate("tiny", 50, vec![11, 12], vec![], vec![Bytes::new(); 2], 100)
            .unwrap();

        assert_eq!(manager.mark_inner_done(11), Some((50, false)));
        assert_eq!(manager.mark_inner_done(12), Some((50, true)));
    }

    #[test]
    fn test_affinity_hint() {
        let manager = TemplateManager::new();
        let region = GeometricRegion::new(0, 0, 0, 8, 8, 8);
        assert_eq!(manager.affinity_hint(&region), None);
        manager.record_affinity(region, 3);
        assert_eq!(manager.affinity_hint(&region), Some(3));
    }
}
