use crate::config::{QueueDescriptor, QueueType};
use crate::error::Result;
use crate::event::{Event, FailureCause, WorkerConf};
use crate::pool::collection::CollectionPool;
use crate::pool::{NullWorkerLauncher, WorkerDescriptor, WorkerLauncher, WorkerPool};
use crate::queue::batch::BatchQueue;
use crate::queue::collection::CollectionQueue;
use crate::queue::straight::StraightQueue;
use crate::queue::{Queue, QueueOutcome};
use crate::worker_io::ProcessLauncher;

/// One pool bound to one queue: either the default `WorkerPool` feeding a
/// `Straight`/`Batch` queue, or a `CollectionPool` feeding a `Collection`
/// queue that's pre-addressed per worker. Grounded on
/// `queueContainer.cpp`'s constructor, which picks between these two pairs
/// based on `queueType`.
#[derive(Debug)]
enum Pool {
    Worker(WorkerPool),
    Collection(CollectionPool),
}

/// Binds one queue to one pool and runs the feed loop between them.
/// Grounded on `cpp/nucleus/queueContainer.cpp`.
#[derive(Debug)]
pub struct QueueContainer {
    pub descriptor: QueueDescriptor,
    queue: Queue,
    pool: Pool,
    frozen: bool,
    exit_when_done: bool,
    launcher: Box<dyn WorkerLauncher>,
}

/// What happened to a submitted event. The caller (the dispatcher, reading
/// off the submission socket) uses this to decide whether to reply
/// immediately or wait for the worker's result.
pub enum SubmitOutcome {
    /// Ran immediately against an idle worker; the pid it was sent to.
    Dispatched(i32),
    /// No idle worker (or pool frozen): sitting in the queue.
    Queued,
    /// Queue was full: these are the events that were dumped to make room
    /// for the new arrival, which is now the queue's sole resident. Caller
    /// writes them to the recovery log.
    Overflowed(Vec<Event>),
}

/// Picks what a queue's pool should exec when it needs a new worker:
/// `persistent_app` if configured, else `default_script` run through the
/// same path, else nothing — a queue with neither never spawns workers of
/// its own and `reconfigure`/`resize` just logs and stays put.
fn build_launcher(descriptor: &QueueDescriptor) -> Box<dyn WorkerLauncher> {
    let program = descriptor
        .persistent_app
        .clone()
        .or_else(|| descriptor.default_script.clone().map(std::path::PathBuf::from));
    match program {
        Some(program) => Box::new(ProcessLauncher { program, args: Vec::new() }),
        None => Box::new(NullWorkerLauncher),
    }
}

impl QueueContainer {
    pub fn new(descriptor: QueueDescriptor) -> Self {
        let (queue, pool) = match descriptor.queue_type {
            QueueType::Straight if descriptor.is_batch() => (
                Queue::Batch(BatchQueue::new(
                    descriptor.max_length,
                    descriptor.num_sub_queues.unwrap_or(1),
                    descriptor.max_events_from_main_queue,
                    descriptor.max_events_from_sub_queue,
                )),
                Pool::Worker(WorkerPool::new(descriptor.num_workers, descriptor.max_exec_time)),
            ),
            QueueType::Straight => (
                Queue::Straight(StraightQueue::new(descriptor.max_length)),
                Pool::Worker(WorkerPool::new(descriptor.num_workers, descriptor.max_exec_time)),
            ),
            QueueType::Collection => (
                Queue::Collection(CollectionQueue::new(descriptor.max_length)),
                Pool::Collection(CollectionPool::new(descriptor.num_workers, descriptor.max_exec_time)),
            ),
        };
        let launcher = build_launcher(&descriptor);
        QueueContainer {
            descriptor,
            queue,
            pool,
            frozen: false,
            exit_when_done: false,
            launcher,
        }
    }

    pub fn add_worker(&mut self, worker: WorkerDescriptor) {
        match &mut self.pool {
            Pool::Worker(p) => p.add_worker(worker),
            Pool::Collection(p) => p.add_worker(worker),
        }
    }

    /// Applies a `CMD_WORKER_CONF` reconfiguration and converges the pool to
    /// the new target size through the container's own launcher, mirroring
    /// the original's `resizeWorkerPool`/`reconfigure` pair: update the
    /// target fields first, then spawn or terminate workers to match.
    /// Returns the pids of any newly spawned workers.
    pub fn reconfigure(&mut self, conf: WorkerConf) -> Vec<i32> {
        match &mut self.pool {
            Pool::Worker(p) => {
                if let Some(n) = conf.num_workers {
                    p.set_target_size(n);
                }
                if let Some(max_exec_time) = conf.max_exec_time {
                    p.set_max_exec_time(Some(max_exec_time));
                }
                p.resize(self.launcher.as_ref())
            }
            Pool::Collection(p) => {
                if let Some(n) = conf.num_workers {
                    p.set_target_size(n);
                }
                if let Some(max_exec_time) = conf.max_exec_time {
                    p.set_max_exec_time(Some(max_exec_time));
                }
                p.resize(self.launcher.as_ref())
            }
        }
    }

    /// Whether an event can bypass the queue entirely and run immediately
    /// against an idle worker. Collection queues require a target pid to
    /// even ask the question; mirrors `canExecuteEventDirectly`.
    fn can_execute_directly(&self, event: &Event) -> bool {
        if self.frozen {
            return false;
        }
        match (&self.pool, event.target_worker_pid) {
            (Pool::Worker(p), _) => p.any_available_worker(),
            (Pool::Collection(p), Some(pid)) => p.is_idle(pid),
            (Pool::Collection(_), None) => false,
        }
    }

    /// Stamps the event's queue/expiry time and either runs it immediately
    /// or enqueues it. Mirrors `queueContainer::submitEvent`.
    pub fn submit_event(&mut self, mut event: Event, now: chrono::DateTime<chrono::Utc>) -> Result<SubmitOutcome> {
        event.stamp_queued(now);

        if self.can_execute_directly(&event) {
            let pid = self.dispatch_to_idle_worker(&event);
            if let Some(pid) = pid {
                return Ok(SubmitOutcome::Dispatched(pid));
            }
        }

        match self.queue.queue_event(event, false)? {
            QueueOutcome::Queued => Ok(SubmitOutcome::Queued),
            QueueOutcome::Overflowed(event) => Ok(SubmitOutcome::Overflowed(event)),
        }
    }

    fn dispatch_to_idle_worker(&mut self, event: &Event) -> Option<i32> {
        match &mut self.pool {
            Pool::Worker(p) => p.acquire_idle_worker().map(|w| w.pid),
            Pool::Collection(p) => {
                let pid = event.target_worker_pid?;
                p.acquire_worker(pid).map(|w| w.pid)
            }
        }
    }

    /// Feeds idle workers from the queue until either side runs dry.
    /// The original notes the loop differs between straight and
    /// collection pools: a straight pool just drains `popAvailableEvent`
    /// while any worker is idle; a collection pool must ask the queue for
    /// a specific pid's next event, since different workers have disjoint
    /// backlogs. Mirrors `queueContainer::feedWorker`.
    pub fn feed_workers(&mut self) -> Vec<(i32, Event)> {
        let mut dispatched = Vec::new();
        match &mut self.pool {
            Pool::Worker(p) => {
                while p.any_available_worker() {
                    let event = match self.queue.pop_available_event() {
                        Some(e) => e,
                        None => break,
                    };
                    if let Some(worker) = p.acquire_idle_worker() {
                        dispatched.push((worker.pid, event));
                    }
                }
            }
            Pool::Collection(p) => {
                while let Some(pid) = p.any_idle_pid() {
                    let event = match self.queue.pop_available_event_for(pid) {
                        Some(e) => e,
                        None => break,
                    };
                    if p.acquire_worker(pid).is_some() {
                        dispatched.push((pid, event));
                    }
                }
            }
        }
        dispatched
    }

    /// Marks a worker idle again, then immediately tries to hand it
    /// another event off the same queue, mirroring `releaseWorker`'s
    /// "release, then feed" sequence.
    pub fn release_worker(&mut self, pid: i32) -> Option<Event> {
        match &mut self.pool {
            Pool::Worker(p) => {
                p.release_worker(pid);
                let event = self.queue.pop_available_event()?;
                p.acquire_idle_worker();
                Some(event)
            }
            Pool::Collection(p) => {
                p.release_worker(pid);
                let event = self.queue.pop_available_event_for(pid)?;
                p.acquire_worker(pid);
                Some(event)
            }
        }
    }

    pub fn scan_for_expired_events(&mut self) {
        self.queue.scan_for_expired_events();
    }

    pub fn overrunning_workers(&self) -> Vec<i32> {
        match &self.pool {
            Pool::Worker(p) => p.overrunning_workers(),
            Pool::Collection(p) => p.overrunning_workers(),
        }
    }

    /// Removes a worker that exited unexpectedly while holding `in_flight`,
    /// and re-dispatches that event to another idle worker if one is free
    /// and the event hasn't expired meanwhile. Otherwise the event is
    /// requeued; if requeuing it overflows the queue, whatever got dumped
    /// to make room comes back for the caller to hand to the recovery log
    /// with `FailureCause::WorkerCrash`. Mirrors the original's handling of
    /// a `SIGCHLD` for a busy worker: re-queue and re-feed rather than
    /// drop.
    pub fn report_worker_crash(
        &mut self,
        pid: i32,
        in_flight: Event,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Vec<Event> {
        match &mut self.pool {
            Pool::Worker(p) => {
                p.remove_worker(pid);
            }
            Pool::Collection(p) => {
                p.remove_worker(pid);
            }
        }

        if in_flight.is_expired(now) {
            return vec![in_flight];
        }

        if let Some(new_pid) = self.dispatch_to_idle_worker(&in_flight) {
            tracing::info!(old_pid = pid, new_pid, event = in_flight.id, "re-dispatched event after worker crash");
            return Vec::new();
        }

        match self.queue.queue_event(in_flight, false) {
            Ok(QueueOutcome::Queued) => Vec::new(),
            Ok(QueueOutcome::Overflowed(dumped)) => dumped,
            Err(_) => Vec::new(),
        }
    }

    /// Broadcasts shutdown intent to the queue and pool, then makes one
    /// last attempt to drain whatever's left to idle workers. Mirrors
    /// `queueContainer::exitWhenDone`.
    pub fn exit_when_done(&mut self) -> Vec<(i32, Event)> {
        self.exit_when_done = true;
        self.queue.set_exit_when_done();
        if let Pool::Worker(p) = &mut self.pool {
            p.set_exit_when_done();
        }
        self.feed_workers()
    }

    /// Toggles whether submissions queue instead of dispatching directly.
    /// On unfreeze, re-feeds every worker slot once, mirroring
    /// `queueContainer::freeze(false)` calling `feedWorker` `totalWorkers`
    /// times.
    pub fn freeze(&mut self, frozen: bool) -> Vec<(i32, Event)> {
        self.frozen = frozen;
        if frozen {
            Vec::new()
        } else {
            self.feed_workers()
        }
    }

    pub fn dump_queue(&mut self) -> Vec<Event> {
        self.queue.dump_queue()
    }

    /// `"frozen,shutdown,<queue status>,<pool status>"`, matching
    /// `queueContainer::getStatus`'s csv assembly.
    pub fn status(&self) -> String {
        let pool_status = match &self.pool {
            Pool::Worker(p) => p.status(),
            Pool::Collection(p) => p.status(),
        };
        format!(
            "{},{},{},{}",
            self.frozen as u8,
            self.exit_when_done as u8,
            self.queue.status(),
            pool_status
        )
    }

    pub fn reset_stats(&mut self) {
        self.queue.reset_stats();
    }
}

pub fn failure_for_queue_type(queue_type: QueueType) -> FailureCause {
    match queue_type {
        QueueType::Collection => FailureCause::InvalidTarget,
        QueueType::Straight => FailureCause::Overrun,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;

    fn descriptor() -> QueueDescriptor {
        let mut d = QueueDescriptor::straight("test");
        d.max_length = 10;
        d.num_workers = 1;
        d
    }

    fn worker(pid: i32) -> WorkerDescriptor {
        WorkerDescriptor {
            pid,
            fd: pid + 5000,
            persistent: false,
            busy_since: None,
        }
    }

    fn worker_pool_counts(c: &QueueContainer) -> (usize, usize) {
        match &c.pool {
            Pool::Worker(p) => (p.total_workers(), p.idle_count()),
            Pool::Collection(p) => (p.total_workers(), p.idle_count()),
        }
    }

    #[test]
    fn reconfigure_shrinks_idle_workers_to_new_target() {
        let mut c = QueueContainer::new(descriptor());
        c.add_worker(worker(1));
        c.add_worker(worker(2));
        assert_eq!(worker_pool_counts(&c), (2, 2));

        let spawned = c.reconfigure(WorkerConf { num_workers: Some(1), max_exec_time: None });
        assert!(spawned.is_empty());
        assert_eq!(worker_pool_counts(&c), (1, 1));
    }

    #[test]
    fn reconfigure_with_no_worker_program_logs_and_stops_growing() {
        let mut c = QueueContainer::new(descriptor());
        let spawned = c.reconfigure(WorkerConf { num_workers: Some(3), max_exec_time: None });
        assert!(spawned.is_empty());
        assert_eq!(worker_pool_counts(&c), (0, 0));
    }

    #[test]
    fn dispatches_directly_to_idle_worker() {
        let mut c = QueueContainer::new(descriptor());
        c.add_worker(worker(1));
        let ev = Event::new(1, EventKind::Script, b"p".to_vec());
        match c.submit_event(ev, chrono::Utc::now()).unwrap() {
            SubmitOutcome::Dispatched(pid) => assert_eq!(pid, 1),
            _ => panic!("expected direct dispatch"),
        }
    }

    #[test]
    fn queues_when_no_idle_worker() {
        let mut c = QueueContainer::new(descriptor());
        let ev = Event::new(1, EventKind::Script, b"p".to_vec());
        match c.submit_event(ev, chrono::Utc::now()).unwrap() {
            SubmitOutcome::Queued => {}
            _ => panic!("expected queued"),
        }
    }

    #[test]
    fn frozen_container_never_dispatches_directly() {
        let mut c = QueueContainer::new(descriptor());
        c.add_worker(worker(1));
        c.freeze(true);
        let ev = Event::new(1, EventKind::Script, b"p".to_vec());
        match c.submit_event(ev, chrono::Utc::now()).unwrap() {
            SubmitOutcome::Queued => {}
            _ => panic!("expected queued while frozen"),
        }
    }

    #[test]
    fn release_worker_feeds_next_queued_event() {
        let mut c = QueueContainer::new(descriptor());
        c.add_worker(worker(1));
        let ev1 = Event::new(1, EventKind::Script, b"p".to_vec());
        let ev2 = Event::new(2, EventKind::Script, b"p".to_vec());
        c.submit_event(ev1, chrono::Utc::now()).unwrap();
        c.submit_event(ev2, chrono::Utc::now()).unwrap();
        let next = c.release_worker(1).unwrap();
        assert_eq!(next.id, 2);
    }

    #[test]
    fn crashed_worker_is_removed_and_event_redispatched_to_spare() {
        let mut c = QueueContainer::new(descriptor());
        c.add_worker(worker(1));
        c.add_worker(worker(2));
        let ev = Event::new(1, EventKind::Script, b"p".to_vec());
        c.submit_event(ev.clone(), chrono::Utc::now()).unwrap();

        let result = c.report_worker_crash(1, ev, chrono::Utc::now());
        assert!(result.is_empty(), "event should have been re-dispatched, not returned");
        assert!(c.overrunning_workers().is_empty());
    }

    #[test]
    fn crashed_worker_with_no_spare_requeues_event() {
        let mut c = QueueContainer::new(descriptor());
        c.add_worker(worker(1));
        let ev = Event::new(1, EventKind::Script, b"p".to_vec());
        c.submit_event(ev.clone(), chrono::Utc::now()).unwrap();

        let result = c.report_worker_crash(1, ev, chrono::Utc::now());
        assert!(result.is_empty(), "event should sit back in the queue");
        c.add_worker(worker(2));
        let fed = c.feed_workers();
        assert_eq!(fed.len(), 1);
        assert_eq!(fed[0].0, 2);
    }

    #[test]
    fn crashed_worker_with_expired_event_returns_it_for_recovery() {
        let mut c = QueueContainer::new(descriptor());
        c.add_worker(worker(1));
        let mut ev = Event::new(1, EventKind::Script, b"p".to_vec())
            .with_lifetime(Some(std::time::Duration::from_secs(0)));
        let now = chrono::Utc::now();
        ev.stamp_queued(now);
        c.submit_event(ev.clone(), now).unwrap();

        let later = now + chrono::Duration::seconds(1);
        let result = c.report_worker_crash(1, ev, later);
        assert_eq!(result.len(), 1, "expired event should come back for the recovery log");
    }
}
