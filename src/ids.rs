use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::model::{CheckpointId, JobId, LdoId, PhysicalId, TemplateGenId};

/// Hands out monotone, contiguous id ranges per id space.
///
/// Every allocation is a `fetch_add`, so ranges handed to concurrent callers
/// never overlap and ids within a range are contiguous by construction.
#[derive(Debug)]
pub struct IdAllocator {
    next_job: AtomicU64,
    next_ldo: AtomicU64,
    next_phys: AtomicU64,
    next_template_gen: AtomicU64,
    next_checkpoint: AtomicU64,
}

// Low ids are reserved for application-seeded jobs and data.
const FIRST_CONTROLLER_ID: u64 = 1 << 40;

impl IdAllocator {
    pub fn new() -> Self {
        Self {
            next_job: AtomicU64::new(FIRST_CONTROLLER_ID),
            next_ldo: AtomicU64::new(FIRST_CONTROLLER_ID),
            next_phys: AtomicU64::new(1),
            next_template_gen: AtomicU64::new(1),
            next_checkpoint: AtomicU64::new(1),
        }
    }

    pub fn next_job_id(&self) -> JobId {
        self.next_job.fetch_add(1, Ordering::Relaxed)
    }

    /// A contiguous range of `count` fresh job ids.
    pub fn job_id_range(&self, count: u64) -> Range<JobId> {
        let start = self.next_job.fetch_add(count, Ordering::Relaxed);
        start..start + count
    }

    pub fn next_ldo_id(&self) -> LdoId {
        self.next_ldo.fetch_add(1, Ordering::Relaxed)
    }

    pub fn next_physical_id(&self) -> PhysicalId {
        self.next_phys.fetch_add(1, Ordering::Relaxed)
    }

    pub fn next_template_generation(&self) -> TemplateGenId {
        self.next_template_gen.fetch_add(1, Ordering::Relaxed)
    }

    pub fn next_checkpoint_id(&self) -> CheckpointId {
        self.next_checkpoint.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}
