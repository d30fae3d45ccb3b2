//! Deferred garbage collection of tombstoned physical blobs.
//!
//! Queue-based deferred deletion is modeled as an interface rather than a
//! concrete backend. A tombstoned [`sop_core::Handle`]
//! (`is_deleted = true`) still owns an active physical blob that nothing
//! references logically anymore; reclaiming it immediately during commit
//! would add blob-store round trips to the commit's critical path, so
//! deletion is deferred to whatever consumes this queue. This crate ships
//! the trait and one in-memory FIFO reference implementation; a real
//! deployment is expected to swap in an actual queue (SQS, a DB table
//! polled by a worker, etc).

use parking_lot::Mutex;
use sop_core::ids::{LogicalId, PhysicalId};
use std::collections::VecDeque;

/// One physical blob eligible for reclamation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcTask {
    /// Registry table the owning handle lived in.
    pub table: String,
    /// The logical ID whose handle was tombstoned.
    pub logical_id: LogicalId,
    /// The physical ID of the blob to reclaim.
    pub physical_id: PhysicalId,
}

/// Queue of blobs awaiting reclamation.
pub trait DeferredGc: Send + Sync {
    /// Enqueue a blob for later reclamation.
    fn enqueue(&self, task: GcTask);

    /// Dequeue up to `max` tasks for a worker to reclaim. Tasks are not
    /// automatically re-enqueued if the worker fails to process them —
    /// callers that need at-least-once delivery should re-enqueue on
    /// failure themselves.
    fn dequeue(&self, max: usize) -> Vec<GcTask>;

    /// Number of tasks currently queued.
    fn len(&self) -> usize;

    /// True if nothing is queued.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory FIFO reference implementation.
#[derive(Default)]
pub struct FifoDeferredGc {
    queue: Mutex<VecDeque<GcTask>>,
}

impl FifoDeferredGc {
    /// An empty queue.
    pub fn new() -> Self {
        Self::default()
    }
}

impl DeferredGc for FifoDeferredGc {
    fn enqueue(&self, task: GcTask) {
        self.queue.lock().push_back(task);
    }

    fn dequeue(&self, max: usize) -> Vec<GcTask> {
        let mut queue = self.queue.lock();
        let n = max.min(queue.len());
        queue.drain(..n).collect()
    }

    fn len(&self) -> usize {
        self.queue.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(table: &str) -> GcTask {
        GcTask {
            table: table.to_string(),
            logical_id: LogicalId::new(),
            physical_id: PhysicalId::new(),
        }
    }

    #[test]
    fn fifo_order_is_preserved() {
        let q = FifoDeferredGc::new();
        q.enqueue(task("a"));
        q.enqueue(task("b"));
        let drained = q.dequeue(10);
        assert_eq!(drained[0].table, "a");
        assert_eq!(drained[1].table, "b");
        assert!(q.is_empty());
    }

    #[test]
    fn dequeue_respects_max() {
        let q = FifoDeferredGc::new();
        for i in 0..5 {
            q.enqueue(task(&i.to_string()));
        }
        let drained = q.dequeue(2);
        assert_eq!(drained.len(), 2);
        assert_eq!(q.len(), 3);
    }

    #[test]
    fn dequeue_of_empty_queue_returns_empty() {
        let q = FifoDeferredGc::new();
        assert!(q.dequeue(5).is_empty());
    }
}
