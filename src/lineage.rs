use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use tracing::debug;

use crate::error::{ControllerError, Result};
use crate::model::{JobDepth, JobId, LdoId, Version};

/// One committed write in a logical datum's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineageEntry {
    pub job_id: JobId,
    pub version: Version,
    pub depth: JobDepth,
    pub sterile: bool,
}

/// Per-LDO chain of writes with strictly increasing versions.
///
/// The parent index tracks the versions of non-sterile entries; these are
/// the writers that can author further jobs and thus matter for rewind.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Lineage {
    chain: VecDeque<LineageEntry>,
    parents: Vec<Version>,
}

impl Lineage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Version of the newest entry; 0 is the defined state of the LDO.
    pub fn last_version(&self) -> Version {
        self.chain.back().map(|e| e.version).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &LineageEntry> {
        self.chain.iter()
    }

    pub fn parent_versions(&self) -> &[Version] {
        &self.parents
    }

    pub fn entry_at_version(&self, version: Version) -> Option<&LineageEntry> {
        let idx = self.chain.partition_point(|e| e.version < version);
        self.chain.get(idx).filter(|e| e.version == version)
    }

    pub fn entry_for_job(&self, job_id: JobId) -> Option<&LineageEntry> {
        self.chain.iter().rev().find(|e| e.job_id == job_id)
    }

    /// Appends an entry; the version must strictly exceed every prior one.
    pub fn append(&mut self, entry: LineageEntry) -> Result<()> {
        if !self.chain.is_empty() && entry.version <= self.last_version() {
            return Err(ControllerError::fatal(format!(
                "lineage version non-monotone on append: {} after {}",
                entry.version,
                self.last_version()
            )));
        }
        if !entry.sterile {
            self.index_parent(entry.version);
        }
        self.chain.push_back(entry);
        Ok(())
    }

    /// Appends a write by `job_id` at the next version and returns it.
    pub fn advance(&mut self, job_id: JobId, depth: JobDepth, sterile: bool) -> Version {
        let version = self.last_version() + 1;
        // Infallible: last_version() + 1 is monotone by construction.
        let _ = self.append(LineageEntry {
            job_id,
            version,
            depth,
            sterile,
        });
        version
    }

    /// Inserts an out-of-order parent entry at the unique position that
    /// preserves version monotonicity. Splicing at the tail equals append.
    pub fn splice_parent(
        &mut self,
        job_id: JobId,
        version: Version,
        depth: JobDepth,
    ) -> Result<()> {
        let idx = self.chain.partition_point(|e| e.version < version);
        if self.chain.get(idx).map(|e| e.version) == Some(version) {
            return Err(ControllerError::fatal(format!(
                "parent-splice would duplicate lineage version {}",
                version
            )));
        }
        self.chain.insert(
            idx,
            LineageEntry {
                job_id,
                version,
                depth,
                sterile: false,
            },
        );
        self.index_parent(version);
        Ok(())
    }

    fn index_parent(&mut self, version: Version) {
        // Sterile entries never enter the parent index; both call sites
        // establish this before calling.
        debug_assert!(self
            .entry_at_version(version)
            .map(|e| !e.sterile)
            .unwrap_or(true));
        let idx = self.parents.partition_point(|&v| v < version);
        self.parents.insert(idx, version);
    }

    /// Trims every entry older than the oldest parent referenced by
    /// `live_parents`. An empty live set clears the chain entirely.
    ///
    /// The caller is responsible for ensuring no live job still needs a
    /// trimmed version.
    pub fn clean(&mut self, live_parents: &HashSet<JobId>) {
        if live_parents.is_empty() {
            self.chain.clear();
            self.parents.clear();
            return;
        }

        let mut remaining: HashSet<JobId> = live_parents.clone();
        let mut cutoff: Option<Version> = None;
        for &version in self.parents.iter().rev() {
            let entry = match self.entry_at_version(version) {
                Some(e) => e,
                None => continue,
            };
            if remaining.remove(&entry.job_id) {
                cutoff = Some(version);
                if remaining.is_empty() {
                    break;
                }
            }
        }

        // Live parents that never wrote this datum do not bound its chain.
        let cutoff = match cutoff {
            Some(v) => v,
            None => return,
        };

        let keep_from = self.chain.partition_point(|e| e.version < cutoff);
        self.chain.drain(..keep_from);
        self.parents.retain(|&v| v >= cutoff);
    }

    /// The latest version written by any job in `ancestors`, walking the
    /// chain newest to oldest; 0 when no ancestor wrote this datum.
    pub fn latest_ancestor_version(&self, ancestors: &HashSet<JobId>) -> Version {
        self.chain
            .iter()
            .rev()
            .find(|e| ancestors.contains(&e.job_id))
            .map(|e| e.version)
            .unwrap_or(0)
    }
}

/// The controller-wide map from logical datum to its lineage chain.
pub struct LineageLedger {
    chains: DashMap<LdoId, Lineage>,
}

impl LineageLedger {
    pub fn new() -> Self {
        Self {
            chains: DashMap::new(),
        }
    }

    /// Registers an empty chain for a freshly defined LDO.
    pub fn define(&self, ldo: LdoId) {
        self.chains.entry(ldo).or_default();
    }

    pub fn contains(&self, ldo: LdoId) -> bool {
        self.chains.contains_key(&ldo)
    }

    pub fn last_version(&self, ldo: LdoId) -> Result<Version> {
        self.chains
            .get(&ldo)
            .map(|c| c.last_version())
            .ok_or(ControllerError::UnknownData(ldo))
    }

    pub fn advance(
        &self,
        ldo: LdoId,
        job_id: JobId,
        depth: JobDepth,
        sterile: bool,
    ) -> Result<Version> {
        let mut chain = self
            .chains
            .get_mut(&ldo)
            .ok_or(ControllerError::UnknownData(ldo))?;
        let version = chain.advance(job_id, depth, sterile);
        debug!(ldo, job_id, version, "lineage advanced");
        Ok(version)
    }

    pub fn splice_parent(
        &self,
        ldo: LdoId,
        job_id: JobId,
        version: Version,
        depth: JobDepth,
    ) -> Result<()> {
        let mut chain = self
            .chains
            .get_mut(&ldo)
            .ok_or(ControllerError::UnknownData(ldo))?;
        chain.splice_parent(job_id, version, depth)
    }

    pub fn latest_ancestor_version(
        &self,
        ldo: LdoId,
        ancestors: &HashSet<JobId>,
    ) -> Result<Version> {
        self.chains
            .get(&ldo)
            .map(|c| c.latest_ancestor_version(ancestors))
            .ok_or(ControllerError::UnknownData(ldo))
    }

    /// Prunes every chain against one live-parent set.
    pub fn clean_all(&self, live_parents: &HashSet<JobId>) {
        for mut entry in self.chains.iter_mut() {
            entry.value_mut().clean(live_parents);
        }
    }

    pub fn with_chain<R>(&self, ldo: LdoId, f: impl FnOnce(&Lineage) -> R) -> Result<R> {
        self.chains
            .get(&ldo)
            .map(|c| f(c.value()))
            .ok_or(ControllerError::UnknownData(ldo))
    }

    /// Snapshot of each chain's tail for checkpoint persistence.
    pub fn snapshot(&self) -> Vec<(LdoId, Vec<LineageEntry>)> {
        self.chains
            .iter()
            .map(|e| (*e.key(), e.value().entries().copied().collect()))
            .collect()
    }

    /// Replaces a chain wholesale during restart from a persisted prefix.
    pub fn restore(&self, ldo: LdoId, entries: Vec<LineageEntry>) -> Result<()> {
        let mut chain = Lineage::new();
        for entry in entries {
            chain.append(entry)?;
        }
        self.chains.insert(ldo, chain);
        Ok(())
    }
}

impl Default for LineageLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(job_id: JobId, version: Version, sterile: bool) -> LineageEntry {
        LineageEntry {
            job_id,
            version,
            depth: 0,
            sterile,
        }
    }

    #[test]
    fn test_append_monotone() {
        let mut chain = Lineage::new();
        chain.append(entry(1, 1, false)).unwrap();
        chain.append(entry(2, 2, false)).unwrap();
        assert_eq!(chain.last_version(), 2);

        let err = chain.append(entry(3, 2, false)).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_sterile_entries_not_in_parent_index() {
        let mut chain = Lineage::new();
        chain.append(entry(1, 1, false)).unwrap();
        chain.append(entry(2, 2, true)).unwrap();
        chain.append(entry(3, 3, false)).unwrap();
        assert_eq!(chain.parent_versions(), &[1, 3]);
    }

    #[test]
    fn test_advance_allocates_next_version() {
        let mut chain = Lineage::new();
        assert_eq!(chain.advance(10, 1, false), 1);
        assert_eq!(chain.advance(11, 2, false), 2);
        assert_eq!(chain.entry_for_job(11).unwrap().version, 2);
    }

    #[test]
    fn test_splice_parent_middle() {
        let mut chain = Lineage::new();
        chain.append(entry(1, 1, false)).unwrap();
        chain.append(entry(3, 4, false)).unwrap();
        chain.splice_parent(2, 2, 0).unwrap();

        let versions: Vec<Version> = chain.entries().map(|e| e.version).collect();
        assert_eq!(versions, vec![1, 2, 4]);
        assert_eq!(chain.parent_versions(), &[1, 2, 4]);
    }

    #[test]
    fn test_splice_at_tail_equals_append() {
        let mut a = Lineage::new();
        a.append(entry(1, 1, false)).unwrap();
        a.splice_parent(2, 5, 0).unwrap();

        let mut b = Lineage::new();
        b.append(entry(1, 1, false)).unwrap();
        b.append(entry(2, 5, false)).unwrap();

        let va: Vec<_> = a.entries().copied().collect();
        let vb: Vec<_> = b.entries().copied().collect();
        assert_eq!(va, vb);
        assert_eq!(a.parent_versions(), b.parent_versions());
    }

    #[test]
    fn test_splice_duplicate_version_is_fatal() {
        let mut chain = Lineage::new();
        chain.append(entry(1, 2, false)).unwrap();
        assert!(chain.splice_parent(9, 2, 0).unwrap_err().is_fatal());
    }

    #[test]
    fn test_clean_empty_live_set_clears() {
        let mut chain = Lineage::new();
        chain.append(entry(1, 1, false)).unwrap();
        chain.append(entry(2, 2, false)).unwrap();
        chain.clean(&HashSet::new());
        assert!(chain.is_empty());
        assert!(chain.parent_versions().is_empty());
    }

    #[test]
    fn test_clean_trims_before_oldest_live_parent() {
        let mut chain = Lineage::new();
        chain.append(entry(1, 1, false)).unwrap();
        chain.append(entry(2, 2, false)).unwrap();
        chain.append(entry(3, 3, false)).unwrap();
        chain.append(entry(4, 4, false)).unwrap();

        let live: HashSet<JobId> = [3, 4].into_iter().collect();
        chain.clean(&live);

        let versions: Vec<Version> = chain.entries().map(|e| e.version).collect();
        assert_eq!(versions, vec![3, 4]);
        assert_eq!(chain.parent_versions(), &[3, 4]);
    }

    #[test]
    fn test_clean_can_prune_past_sterile_entries() {
        let mut chain = Lineage::new();
        chain.append(entry(1, 1, true)).unwrap();
        chain.append(entry(2, 2, false)).unwrap();

        // The sterile writer is never live, so the chain prunes past it.
        let live: HashSet<JobId> = [2].into_iter().collect();
        chain.clean(&live);
        let versions: Vec<Version> = chain.entries().map(|e| e.version).collect();
        assert_eq!(versions, vec![2]);
    }

    #[test]
    fn test_latest_ancestor_version() {
        let mut chain = Lineage::new();
        chain.append(entry(1, 1, false)).unwrap();
        chain.append(entry(2, 2, false)).unwrap();
        chain.append(entry(3, 3, false)).unwrap();

        let ancestors: HashSet<JobId> = [1, 2].into_iter().collect();
        assert_eq!(chain.latest_ancestor_version(&ancestors), 2);

        let strangers: HashSet<JobId> = [99].into_iter().collect();
        assert_eq!(chain.latest_ancestor_version(&strangers), 0);
    }

    #[test]
    fn test_ledger_advance_and_unknown() {
        let ledger = LineageLedger::new();
        ledger.define(7);
        assert_eq!(ledger.advance(7, 100, 0, false).unwrap(), 1);
        assert_eq!(ledger.last_version(7).unwrap(), 1);
        assert!(matches!(
            ledger.advance(8, 100, 0, false),
            Err(ControllerError::UnknownData(8))
        ));
    }

    #[test]
    fn test_ledger_snapshot_restore_round_trip() {
        let ledger = LineageLedger::new();
        ledger.define(1);
        ledger.advance(1, 10, 0, false).unwrap();
        ledger.advance(1, 11, 0, false).unwrap();

        let snap = ledger.snapshot();
        let restored = LineageLedger::new();
        for (ldo, entries) in snap {
            restored.restore(ldo, entries).unwrap();
        }
        assert_eq!(restored.last_version(1).unwrap(), 2);
    }
}
