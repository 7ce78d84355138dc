use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::event::Event;
use crate::queue::straight::{QueueOutcome, StraightQueue};

/// Thin router that fans events out to one `StraightQueue` per worker pid,
/// instead of holding events itself. Grounded on
/// `cpp/nucleus/collectionQueue.cpp`, whose every method just looks up the
/// target worker's queue and delegates.
///
/// A real `collectionPool` assigns a queue per idle worker as it starts;
/// here the per-worker queues are created lazily on first submission and
/// keyed directly by pid, since the pool (not this type) owns worker
/// lifecycle.
#[derive(Debug, Default)]
pub struct CollectionQueue {
    per_worker: HashMap<i32, StraightQueue>,
    max_length: u32,
}

impl CollectionQueue {
    pub fn new(max_length: u32) -> Self {
        CollectionQueue {
            per_worker: HashMap::new(),
            max_length,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.per_worker.values().all(|q| q.is_empty())
    }

    pub fn len(&self) -> usize {
        self.per_worker.values().map(|q| q.len()).sum()
    }

    /// A collection queue always requires a target worker pid — there is no
    /// "any worker will do" path, matching `canExecuteEventDirectly`'s check
    /// that throws when `workerPid <= 1`.
    pub fn queue_event(&mut self, event: Event, recovery_replay: bool) -> Result<QueueOutcome> {
        let pid = event
            .target_worker_pid
            .filter(|&p| p > 1)
            .ok_or(Error::InvalidTarget(event.target_worker_pid))?;
        let queue = self
            .per_worker
            .entry(pid)
            .or_insert_with(|| StraightQueue::new(self.max_length));
        Ok(queue.queue_event(event, recovery_replay))
    }

    pub fn pop_available_event_for(&mut self, pid: i32) -> Option<Event> {
        self.per_worker.get_mut(&pid)?.pop_available_event()
    }

    pub fn scan_for_expired_events(&mut self) {
        for queue in self.per_worker.values_mut() {
            queue.scan_for_expired_events();
        }
    }

    pub fn dump_queue(&mut self) -> Vec<Event> {
        let mut out = Vec::new();
        for queue in self.per_worker.values_mut() {
            out.extend(queue.dump_queue());
        }
        out
    }

    pub fn remove_worker(&mut self, pid: i32) {
        self.per_worker.remove(&pid);
    }

    pub fn status_key() -> &'static str {
        "qSize,qMax,numWorkerQueues"
    }

    pub fn status(&self) -> String {
        format!("{},{},{}", self.len(), self.max_length, self.per_worker.len())
    }
}
