use tracing::debug;

use crate::error::Result;
use crate::graph::JobGraph;
use crate::lineage::{LineageEntry, LineageLedger};
use crate::model::{Job, JobId, LdoId, Version};

/// Resolves reader and writer versions against the lineage ledger.
///
/// The needed version of a job's input is the latest lineage version written
/// by any transitive predecessor of the job (explicit before edges plus the
/// parent relation); with no writer ancestor it is 0, the defined state.
pub struct VersionManager {
    ledger: LineageLedger,
}

impl VersionManager {
    pub fn new() -> Self {
        Self {
            ledger: LineageLedger::new(),
        }
    }

    pub fn ledger(&self) -> &LineageLedger {
        &self.ledger
    }

    pub fn define(&self, ldo: LdoId) {
        self.ledger.define(ldo);
    }

    /// Needed version of `ldo` for reader `job`.
    pub fn needed_version(&self, graph: &JobGraph, job: JobId, ldo: LdoId) -> Result<Version> {
        let ancestors = graph.ancestors(job);
        let version = self.ledger.latest_ancestor_version(ldo, &ancestors)?;
        debug!(job, ldo, version, "needed version resolved");
        Ok(version)
    }

    /// Records a completed non-copy write, allocating the next version.
    /// The returned version is what later readers that order after the
    /// writer must observe.
    pub fn commit_write(&self, writer: &Job, ldo: LdoId) -> Result<Version> {
        self.ledger.advance(ldo, writer.id, writer.depth, writer.sterile)
    }

    /// Re-registers an out-of-order parent writer during rewind replay.
    pub fn splice_parent_write(
        &self,
        ldo: LdoId,
        entry: &LineageEntry,
    ) -> Result<()> {
        self.ledger
            .splice_parent(ldo, entry.job_id, entry.version, entry.depth)
    }
}

impl Default for VersionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{JobIdSet, JobKind};
    use smallvec::smallvec;

    fn compute_job(id: JobId, before: JobIdSet) -> Job {
        let mut job = Job::synthesized(id, JobKind::Compute, before);
        job.sterile = false;
        job
    }

    #[test]
    fn test_reader_sees_ancestor_write() {
        let graph = JobGraph::new(64);
        let versions = VersionManager::new();
        versions.define(1);

        let writer = compute_job(10, smallvec![]);
        graph.add_job(writer.clone()).unwrap();
        let reader = compute_job(11, smallvec![10]);
        graph.add_job(reader).unwrap();

        graph.on_job_done(10, None, None).unwrap();
        let v = versions.commit_write(&writer, 1).unwrap();
        assert_eq!(v, 1);

        assert_eq!(versions.needed_version(&graph, 11, 1).unwrap(), 1);
    }

    #[test]
    fn test_reader_without_writer_ancestor_needs_defined_state() {
        let graph = JobGraph::new(64);
        let versions = VersionManager::new();
        versions.define(1);

        let writer = compute_job(10, smallvec![]);
        graph.add_job(writer.clone()).unwrap();
        versions.commit_write(&writer, 1).unwrap();

        // Unrelated reader: no before edge, no parent chain to the writer.
        let reader = compute_job(20, smallvec![]);
        graph.add_job(reader).unwrap();
        assert_eq!(versions.needed_version(&graph, 20, 1).unwrap(), 0);
    }

    #[test]
    fn test_reader_sees_latest_of_several_ancestor_writes() {
        let graph = JobGraph::new(64);
        let versions = VersionManager::new();
        versions.define(1);

        let w1 = compute_job(10, smallvec![]);
        let w2 = compute_job(11, smallvec![10]);
        graph.add_job(w1.clone()).unwrap();
        graph.add_job(w2.clone()).unwrap();
        graph.add_job(compute_job(12, smallvec![11])).unwrap();

        versions.commit_write(&w1, 1).unwrap();
        versions.commit_write(&w2, 1).unwrap();

        assert_eq!(versions.needed_version(&graph, 12, 1).unwrap(), 2);
    }

    #[test]
    fn test_version_resolution_through_parent_relation() {
        let graph = JobGraph::new(64);
        let versions = VersionManager::new();
        versions.define(1);

        let parent = compute_job(10, smallvec![]);
        graph.add_job(parent.clone()).unwrap();
        versions.commit_write(&parent, 1).unwrap();

        let mut child = compute_job(20, smallvec![]);
        child.parent = Some(10);
        graph.add_job(child).unwrap();

        assert_eq!(versions.needed_version(&graph, 20, 1).unwrap(), 1);
    }
}
