pub mod collection;

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

/// One running worker process. Grounded on `cpp/nucleus/workerPool.h`'s
/// worker descriptor: pid and fd are the two keys other structures index
/// by, `busy_since` backs `checkOverrunningWorkers`.
#[derive(Debug, Clone)]
pub struct WorkerDescriptor {
    pub pid: i32,
    pub fd: i32,
    pub persistent: bool,
    pub busy_since: Option<Instant>,
}

/// Spawns and signals worker processes. A real implementation forks/execs
/// the configured script or binary and wires up `worker_io`'s framed
/// socket; tests supply a double that just hands back synthetic pids, the
/// same split `ergo_queues` makes between `QueueJobProcessor` and its test
/// double.
pub trait WorkerLauncher: Send + Sync + std::fmt::Debug {
    fn spawn(&self) -> std::io::Result<WorkerDescriptor>;
    fn terminate(&self, pid: i32);
}

/// Stand-in for a queue with no `persistent_app`/`default_script`
/// configured. `spawn` always fails so `resize` logs and stops instead of
/// looping; used by `QueueContainer` for queues that have nothing to exec.
#[derive(Debug, Default)]
pub struct NullWorkerLauncher;

impl WorkerLauncher for NullWorkerLauncher {
    fn spawn(&self) -> std::io::Result<WorkerDescriptor> {
        Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "queue has no persistent_app or default_script to launch as a worker",
        ))
    }

    fn terminate(&self, _pid: i32) {}
}

/// Round-robin pool of identical workers feeding off one queue. Grounded
/// on `cpp/nucleus/workerPool.h`/`.cpp`.
#[derive(Debug)]
pub struct WorkerPool {
    workers: HashMap<i32, WorkerDescriptor>,
    fd_to_pid: HashMap<i32, i32>,
    idle: VecDeque<i32>,
    target_size: u32,
    max_exec_time: Option<u64>,
    exit_when_done: bool,
}

impl WorkerPool {
    pub fn new(target_size: u32, max_exec_time: Option<u64>) -> Self {
        WorkerPool {
            workers: HashMap::new(),
            fd_to_pid: HashMap::new(),
            idle: VecDeque::new(),
            target_size,
            max_exec_time,
            exit_when_done: false,
        }
    }

    pub fn total_workers(&self) -> usize {
        self.workers.len()
    }

    pub fn idle_count(&self) -> usize {
        self.idle.len()
    }

    pub fn any_available_worker(&self) -> bool {
        !self.idle.is_empty()
    }

    /// Registers a freshly spawned worker as idle. Corresponds to
    /// `addIdleWorkersEntry` plus the bookkeeping `resizeWorkerPool` and
    /// `respawnChild` both do after a child comes up.
    pub fn add_worker(&mut self, descriptor: WorkerDescriptor) {
        self.fd_to_pid.insert(descriptor.fd, descriptor.pid);
        self.idle.push_back(descriptor.pid);
        self.workers.insert(descriptor.pid, descriptor);
    }

    /// Pulls the next idle worker in round-robin order and marks it busy.
    /// Returns `None` if the pool has nobody free, mirroring
    /// `anyAvailableWorkers` returning false.
    pub fn acquire_idle_worker(&mut self) -> Option<&WorkerDescriptor> {
        let pid = self.idle.pop_front()?;
        let worker = self.workers.get_mut(&pid)?;
        worker.busy_since = Some(Instant::now());
        Some(worker)
    }

    /// Marks a worker idle again after it finishes an event. Mirrors
    /// `releaseWorker` pushing the fd back onto `idleWorkers`.
    pub fn release_worker(&mut self, pid: i32) {
        if let Some(worker) = self.workers.get_mut(&pid) {
            worker.busy_since = None;
            self.idle.push_back(pid);
        }
    }

    pub fn get_by_pid(&self, pid: i32) -> Option<&WorkerDescriptor> {
        self.workers.get(&pid)
    }

    pub fn get_by_fd(&self, fd: i32) -> Option<&WorkerDescriptor> {
        let pid = self.fd_to_pid.get(&fd)?;
        self.workers.get(pid)
    }

    /// Removes a worker entirely, e.g. after a crash. Callers are
    /// responsible for re-queueing whatever event it was running, the way
    /// `queueContainer` does on a `WorkerCrash`.
    pub fn remove_worker(&mut self, pid: i32) -> Option<WorkerDescriptor> {
        let worker = self.workers.remove(&pid)?;
        self.fd_to_pid.remove(&worker.fd);
        self.idle.retain(|&p| p != pid);
        Some(worker)
    }

    /// Workers whose `busy_since` exceeds `max_exec_time`. The container
    /// kills and respawns these, matching `checkOverrunningWorkers`.
    pub fn overrunning_workers(&self) -> Vec<i32> {
        let limit = match self.max_exec_time {
            Some(seconds) => std::time::Duration::from_secs(seconds),
            None => return Vec::new(),
        };
        let now = Instant::now();
        self.workers
            .values()
            .filter(|w| w.busy_since.map(|since| now.duration_since(since) > limit).unwrap_or(false))
            .map(|w| w.pid)
            .collect()
    }

    pub fn set_target_size(&mut self, target_size: u32) {
        self.target_size = target_size;
    }

    pub fn target_size(&self) -> u32 {
        self.target_size
    }

    pub fn set_max_exec_time(&mut self, max_exec_time: Option<u64>) {
        self.max_exec_time = max_exec_time;
    }

    /// Converges the live worker count toward `target_size`, spawning
    /// through `launcher` when short and terminating idle workers when
    /// over. Mirrors `resizeWorkerPool`: growth spawns immediately, shrink
    /// only ever culls idle workers, never one mid-event — a busy worker
    /// over target just isn't replaced once it finishes and releases.
    /// Returns the pids of newly spawned workers.
    pub fn resize(&mut self, launcher: &dyn WorkerLauncher) -> Vec<i32> {
        let mut spawned = Vec::new();
        while (self.workers.len() as u32) < self.target_size {
            match launcher.spawn() {
                Ok(descriptor) => {
                    let pid = descriptor.pid;
                    self.add_worker(descriptor);
                    spawned.push(pid);
                }
                Err(err) => {
                    tracing::error!(%err, "failed to spawn worker while resizing pool");
                    break;
                }
            }
        }
        while (self.workers.len() as u32) > self.target_size {
            let pid = match self.idle.pop_front() {
                Some(pid) => pid,
                None => break,
            };
            launcher.terminate(pid);
            self.remove_worker(pid);
        }
        spawned
    }

    /// Latches shutdown intent. Once set, `resizeWorkerPool` style logic
    /// should stop spawning replacements for workers that exit.
    pub fn set_exit_when_done(&mut self) {
        self.exit_when_done = true;
    }

    pub fn exit_when_done(&self) -> bool {
        self.exit_when_done
    }

    pub fn status_key() -> &'static str {
        "numWorkers,numIdle"
    }

    pub fn status(&self) -> String {
        format!("{},{}", self.workers.len(), self.idle.len())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn mk_worker(pid: i32) -> WorkerDescriptor {
        WorkerDescriptor {
            pid,
            fd: pid + 1000,
            persistent: false,
            busy_since: None,
        }
    }

    #[test]
    fn idle_and_busy_sets_stay_disjoint() {
        let mut pool = WorkerPool::new(2, None);
        pool.add_worker(mk_worker(1));
        pool.add_worker(mk_worker(2));
        assert_eq!(pool.idle_count(), 2);

        let pid = pool.acquire_idle_worker().unwrap().pid;
        assert_eq!(pool.idle_count(), 1);
        pool.release_worker(pid);
        assert_eq!(pool.idle_count(), 2);
    }

    #[test]
    fn no_idle_worker_when_all_busy() {
        let mut pool = WorkerPool::new(1, None);
        pool.add_worker(mk_worker(1));
        assert!(pool.acquire_idle_worker().is_some());
        assert!(!pool.any_available_worker());
        assert!(pool.acquire_idle_worker().is_none());
    }

    #[test]
    fn remove_worker_clears_both_indices() {
        let mut pool = WorkerPool::new(1, None);
        pool.add_worker(mk_worker(1));
        assert!(pool.get_by_fd(1001).is_some());
        pool.remove_worker(1);
        assert!(pool.get_by_pid(1).is_none());
        assert!(pool.get_by_fd(1001).is_none());
    }
}
