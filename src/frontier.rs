use crossbeam::queue::SegQueue;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::model::JobId;

/// Scheduling band of a ready job.
///
/// Spawn-only work (the main job, template expansion) runs in the low band so
/// the compute frontier of the current frame drains first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Band {
    Compute,
    Spawn,
}

/// Lock-free two-band ready frontier with capacity backpressure.
///
/// A push that would exceed capacity is refused and the job stays PENDING;
/// the next scheduling pass retries it.
pub struct ReadyFrontier {
    compute: SegQueue<JobId>,
    spawn: SegQueue<JobId>,
    capacity: usize,
    size: AtomicUsize,
}

impl ReadyFrontier {
    pub fn new(capacity: usize) -> Self {
        Self {
            compute: SegQueue::new(),
            spawn: SegQueue::new(),
            capacity,
            size: AtomicUsize::new(0),
        }
    }

    /// Attempts to push a job; returns false at capacity.
    pub fn push(&self, job_id: JobId, band: Band) -> bool {
        if self.size.fetch_add(1, Ordering::AcqRel) >= self.capacity {
            self.size.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        match band {
            Band::Compute => self.compute.push(job_id),
            Band::Spawn => self.spawn.push(job_id),
        }
        true
    }

    /// Pops the next ready job, compute band first.
    pub fn pop(&self) -> Option<JobId> {
        let item = self.compute.pop().or_else(|| self.spawn.pop());
        if item.is_some() {
            self.size.fetch_sub(1, Ordering::AcqRel);
        }
        item
    }

    pub fn len(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&self) {
        while self.pop().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_basic_operations() {
        let frontier = ReadyFrontier::new(4);
        assert!(frontier.is_empty());
        assert_eq!(frontier.pop(), None);

        assert!(frontier.push(1, Band::Compute));
        assert!(frontier.push(2, Band::Compute));
        assert_eq!(frontier.len(), 2);
        assert_eq!(frontier.pop(), Some(1));
        assert_eq!(frontier.pop(), Some(2));
        assert!(frontier.is_empty());
    }

    #[test]
    fn test_compute_band_drains_first() {
        let frontier = ReadyFrontier::new(16);
        assert!(frontier.push(100, Band::Spawn));
        assert!(frontier.push(1, Band::Compute));
        assert!(frontier.push(2, Band::Compute));

        assert_eq!(frontier.pop(), Some(1));
        assert_eq!(frontier.pop(), Some(2));
        assert_eq!(frontier.pop(), Some(100));
    }

    #[test]
    fn test_capacity_backpressure() {
        let frontier = ReadyFrontier::new(2);
        assert!(frontier.push(1, Band::Compute));
        assert!(frontier.push(2, Band::Spawn));
        assert!(!frontier.push(3, Band::Compute));
        assert_eq!(frontier.len(), 2);

        frontier.pop();
        assert!(frontier.push(3, Band::Compute));
    }

    #[test]
    fn test_concurrent_push_pop() {
        let frontier = Arc::new(ReadyFrontier::new(10_000));
        let mut handles = vec![];

        for t in 0..4u64 {
            let f = Arc::clone(&frontier);
            handles.push(thread::spawn(move || {
                for i in 0..500 {
                    while !f.push(t * 1000 + i, Band::Compute) {
                        thread::yield_now();
                    }
                }
            }));
        }
        for _ in 0..4 {
            let f = Arc::clone(&frontier);
            handles.push(thread::spawn(move || {
                let mut popped = 0;
                while popped < 500 {
                    if f.pop().is_some() {
                        popped += 1;
                    } else {
                        thread::yield_now();
                    }
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }
        assert!(frontier.is_empty());
    }
}
