use std::collections::HashSet;

use super::{WorkerDescriptor, WorkerLauncher, WorkerPool};

/// A `WorkerPool` whose idle set is addressable by pid rather than a plain
/// round-robin deque, so the container can ask "is worker N idle right
/// now" instead of only "give me whichever worker is next". Grounded on
/// `cpp/nucleus/collectionPool.h`, which keeps `idleWorkers` as a map for
/// exactly this reason — a collection queue's events are pre-targeted at a
/// specific pid, so the pool must check that one pid's availability rather
/// than pop the front of a queue.
#[derive(Debug)]
pub struct CollectionPool {
    inner: WorkerPool,
    idle_set: HashSet<i32>,
}

impl CollectionPool {
    pub fn new(target_size: u32, max_exec_time: Option<u64>) -> Self {
        CollectionPool {
            inner: WorkerPool::new(target_size, max_exec_time),
            idle_set: HashSet::new(),
        }
    }

    pub fn add_worker(&mut self, descriptor: WorkerDescriptor) {
        self.idle_set.insert(descriptor.pid);
        self.inner.add_worker(descriptor);
    }

    pub fn is_idle(&self, pid: i32) -> bool {
        self.idle_set.contains(&pid)
    }

    /// Acquires a specific worker by pid rather than round-robin, the way
    /// `collectionPool::anyAvailableWorkers(pid)` checks one target.
    pub fn acquire_worker(&mut self, pid: i32) -> Option<&WorkerDescriptor> {
        if !self.idle_set.remove(&pid) {
            return None;
        }
        self.inner.get_by_pid(pid)
    }

    pub fn release_worker(&mut self, pid: i32) {
        if self.inner.get_by_pid(pid).is_some() {
            self.idle_set.insert(pid);
        }
    }

    pub fn get_by_pid(&self, pid: i32) -> Option<&WorkerDescriptor> {
        self.inner.get_by_pid(pid)
    }

    pub fn get_by_fd(&self, fd: i32) -> Option<&WorkerDescriptor> {
        self.inner.get_by_fd(fd)
    }

    pub fn remove_worker(&mut self, pid: i32) -> Option<WorkerDescriptor> {
        self.idle_set.remove(&pid);
        self.inner.remove_worker(pid)
    }

    /// Any one idle worker's fd, used to feed a collection queue's
    /// backlog without caring which pid gets picked first. Corresponds to
    /// `getNextIdleFd` walking the idle map.
    pub fn any_idle_pid(&self) -> Option<i32> {
        self.idle_set.iter().next().copied()
    }

    pub fn total_workers(&self) -> usize {
        self.inner.total_workers()
    }

    pub fn idle_count(&self) -> usize {
        self.idle_set.len()
    }

    pub fn overrunning_workers(&self) -> Vec<i32> {
        self.inner.overrunning_workers()
    }

    pub fn set_target_size(&mut self, target_size: u32) {
        self.inner.set_target_size(target_size);
    }

    pub fn set_max_exec_time(&mut self, max_exec_time: Option<u64>) {
        self.inner.set_max_exec_time(max_exec_time);
    }

    /// Same convergence as `WorkerPool::resize`, but culls from `idle_set`
    /// rather than a round-robin deque, since a collection pool's idle
    /// workers aren't ordered.
    pub fn resize(&mut self, launcher: &dyn WorkerLauncher) -> Vec<i32> {
        let mut spawned = Vec::new();
        while self.inner.total_workers() < self.inner.target_size() as usize {
            match launcher.spawn() {
                Ok(descriptor) => {
                    let pid = descriptor.pid;
                    self.add_worker(descriptor);
                    spawned.push(pid);
                }
                Err(err) => {
                    tracing::error!(%err, "failed to spawn worker while resizing collection pool");
                    break;
                }
            }
        }
        while self.inner.total_workers() > self.inner.target_size() as usize {
            let pid = match self.idle_set.iter().next().copied() {
                Some(pid) => pid,
                None => break,
            };
            launcher.terminate(pid);
            self.remove_worker(pid);
        }
        spawned
    }

    pub fn status(&self) -> String {
        format!("{},{}", self.inner.total_workers(), self.idle_set.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mk_worker(pid: i32) -> WorkerDescriptor {
        WorkerDescriptor {
            pid,
            fd: pid + 2000,
            persistent: false,
            busy_since: None,
        }
    }

    #[test]
    fn acquire_targets_specific_pid() {
        let mut pool = CollectionPool::new(2, None);
        pool.add_worker(mk_worker(10));
        pool.add_worker(mk_worker(20));

        assert!(pool.acquire_worker(20).is_some());
        assert!(!pool.is_idle(20));
        assert!(pool.is_idle(10));
        assert!(pool.acquire_worker(20).is_none());
    }

    #[test]
    fn release_returns_worker_to_idle_set() {
        let mut pool = CollectionPool::new(1, None);
        pool.add_worker(mk_worker(10));
        pool.acquire_worker(10);
        assert!(!pool.is_idle(10));
        pool.release_worker(10);
        assert!(pool.is_idle(10));
    }
}
