use std::collections::HashMap;
use std::time::Duration;

use txproc_graceful_shutdown::GracefulShutdownConsumer;
use tokio::sync::mpsc;
use tokio::time::interval;

use crate::config::NucleusConfig;
use crate::container::{QueueContainer, SubmitOutcome};
use crate::error::Result;
use crate::event::{Command, Event};
use crate::recovery_log::RecoveryLog;

/// A submission arriving off the submission socket, paired with the name
/// of the queue it targets. Modeled as a channel message rather than a
/// direct call so the socket-accept loop and the dispatcher loop can live
/// in separate tasks, the way `ergo_queues`'s dequeuer loop is driven by a
/// channel rather than calling into the queue inline.
pub struct Submission {
    pub queue_name: String,
    pub event: Event,
}

/// Owns every `QueueContainer` in the process and runs the maintenance
/// loop (expiry scan, overrun checks, worker feeding) plus shutdown
/// sequencing. Grounded on the original's single-threaded event loop and
/// on `ergo_queues::dequeuer_loop`'s `tokio::select!` shape for combining
/// a work channel with shutdown and timer sources.
pub struct Dispatcher {
    containers: HashMap<String, QueueContainer>,
    recovery_log: RecoveryLog,
    maint_interval: Duration,
}

impl Dispatcher {
    pub fn new(recovery_log: RecoveryLog, nucleus: &NucleusConfig) -> Self {
        Dispatcher {
            containers: HashMap::new(),
            recovery_log,
            maint_interval: nucleus.maint_interval,
        }
    }

    pub fn register_queue(&mut self, container: QueueContainer) {
        self.containers.insert(container.descriptor.name.clone(), container);
    }

    /// Replays the recovery log into the matching queues at startup.
    /// Events whose `to_queue` no longer exists are logged and dropped,
    /// rather than panicking on a config that dropped a queue since the
    /// last run.
    pub async fn recover(&mut self) -> Result<u64> {
        let entries = self.recovery_log.recover().await?;
        let mut replayed = 0u64;
        for entry in entries {
            match self.containers.get_mut(&entry.to_queue) {
                Some(container) => {
                    let now = chrono::Utc::now();
                    let _ = container.submit_event(entry.event, now)?;
                    replayed += 1;
                }
                None => {
                    tracing::warn!(queue = %entry.to_queue, seq = entry.seq, "recovery entry targets unknown queue, dropping");
                }
            }
        }
        Ok(replayed)
    }

    /// Routes one submission to its target container. On overflow the
    /// queue's prior contents were dumped to make room for the new event
    /// (§4.2); those dumped events, not the new arrival, get written to the
    /// recovery log (§7 `OverflowSpilled`). A `WorkerConf` command never
    /// touches the queue itself — it resizes the container's pool and stops
    /// there, mirroring `reconfigure` being a sibling of `submitEvent`
    /// rather than a queued event type.
    pub async fn submit(&mut self, submission: Submission) -> Result<Option<i32>> {
        let now = chrono::Utc::now();
        let container = match self.containers.get_mut(&submission.queue_name) {
            Some(c) => c,
            None => {
                tracing::warn!(queue = %submission.queue_name, "submission for unknown queue");
                return Ok(None);
            }
        };

        if let Some(Command::WorkerConf(conf)) = submission.event.command.clone() {
            let spawned = container.reconfigure(conf);
            tracing::info!(
                queue = %submission.queue_name,
                spawned = spawned.len(),
                "applied worker pool reconfiguration"
            );
            return Ok(None);
        }

        match container.submit_event(submission.event, now)? {
            SubmitOutcome::Dispatched(pid) => Ok(Some(pid)),
            SubmitOutcome::Queued => Ok(None),
            SubmitOutcome::Overflowed(dumped) => {
                for event in &dumped {
                    self.recovery_log
                        .write_entry("overflow", &submission.queue_name, &submission.queue_name, event)
                        .await?;
                }
                Ok(None)
            }
        }
    }

    /// One maintenance tick: scan every queue for expired events and check
    /// for workers that have overrun `max_exec_time`. Returns the pids the
    /// caller should kill and respawn.
    pub fn run_maintenance(&mut self) -> Vec<(String, i32)> {
        let mut overrun = Vec::new();
        for (name, container) in self.containers.iter_mut() {
            container.scan_for_expired_events();
            for pid in container.overrunning_workers() {
                overrun.push((name.clone(), pid));
            }
        }
        overrun
    }

    /// Propagates shutdown to every container, dumping whatever couldn't
    /// be drained to idle workers into the recovery log so a restart picks
    /// it back up. Mirrors the original's shutdown path, which calls
    /// `exitWhenDone` on every queue and then `dumpQueue` on whatever
    /// remains once workers stop accepting new work.
    pub async fn shutdown(&mut self) -> Result<()> {
        for (name, container) in self.containers.iter_mut() {
            container.exit_when_done();
            for event in container.dump_queue() {
                self.recovery_log.write_entry("shutdown", name, name, &event).await?;
            }
        }
        Ok(())
    }

    /// Runs the maintenance/shutdown loop until the graceful-shutdown
    /// consumer reports shutdown. `submissions` is the channel fed by the
    /// submission-socket accept loop (owned by `txproc-server`, not this
    /// crate, per §1's scope note on the socket layer).
    pub async fn run(
        &mut self,
        mut submissions: mpsc::Receiver<Submission>,
        mut shutdown: GracefulShutdownConsumer,
    ) -> Result<()> {
        let mut maintenance = interval(self.maint_interval);
        loop {
            tokio::select! {
                biased;

                _ = shutdown.wait_for_shutdown() => {
                    tracing::info!("dispatcher shutting down");
                    self.shutdown().await?;
                    return Ok(());
                }

                Some(submission) = submissions.recv() => {
                    if let Err(err) = self.submit(submission).await {
                        tracing::error!(%err, "failed to submit event");
                    }
                }

                _ = maintenance.tick() => {
                    for (queue, pid) in self.run_maintenance() {
                        tracing::warn!(queue, pid, "worker exceeded max exec time");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueDescriptor;
    use crate::event::EventKind;
    use crate::pool::WorkerDescriptor;

    fn nucleus_config(stats_dir: std::path::PathBuf) -> NucleusConfig {
        NucleusConfig {
            active_queues: vec!["in".into()],
            maint_interval: Duration::from_secs(60),
            expired_event_interval: Duration::from_secs(60),
            max_num_queues: 8,
            max_network_descriptors: 64,
            stats_dir,
            unix_socket_path: std::path::PathBuf::from("/tmp/txproc-test.sock"),
            unix_socket_stream_path: std::path::PathBuf::from("/tmp/txproc-test-stream.sock"),
            socket_group: None,
        }
    }

    async fn dispatcher_with_one_queue() -> (Dispatcher, std::path::PathBuf) {
        let dir = std::env::temp_dir().join(format!(
            "txproc-dispatcher-test-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .subsec_nanos()
        ));
        let recovery_log = RecoveryLog::open(&dir, "test").await.unwrap();
        let nucleus = nucleus_config(dir.clone());
        let mut dispatcher = Dispatcher::new(recovery_log, &nucleus);

        let mut descriptor = QueueDescriptor::straight("in");
        descriptor.max_length = 1;
        dispatcher.register_queue(QueueContainer::new(descriptor));
        (dispatcher, dir)
    }

    #[tokio::test]
    async fn submit_overflow_dumps_the_displaced_event_to_recovery_log() {
        let (mut dispatcher, dir) = dispatcher_with_one_queue().await;

        // maxLength=1: the first event occupies the queue; the second
        // submission pushes the queue past capacity, so the *first* event
        // (already resident) is dumped to the recovery log and the second
        // becomes the sole resident, per spec §4.2/§8 scenario 4.
        let first = Event::new(1, EventKind::Script, b"a".to_vec());
        let second = Event::new(2, EventKind::Script, b"b".to_vec());
        dispatcher
            .submit(Submission { queue_name: "in".into(), event: first })
            .await
            .unwrap();
        dispatcher
            .submit(Submission { queue_name: "in".into(), event: second })
            .await
            .unwrap();

        assert_eq!(dispatcher.recovery_log.count(), 1);
        let entries = dispatcher.recovery_log.recover().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event.id, 1);

        let container = dispatcher.containers.get_mut("in").unwrap();
        container.add_worker(WorkerDescriptor { pid: 1, fd: 10, persistent: false, busy_since: None });
        let fed = container.feed_workers();
        assert_eq!(fed.len(), 1);
        assert_eq!(fed[0].1.id, 2);

        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn recover_replays_overflowed_event_into_matching_queue() {
        let (mut dispatcher, dir) = dispatcher_with_one_queue().await;

        let first = Event::new(1, EventKind::Script, b"a".to_vec());
        let second = Event::new(2, EventKind::Script, b"b".to_vec());
        dispatcher
            .submit(Submission { queue_name: "in".into(), event: first })
            .await
            .unwrap();
        dispatcher
            .submit(Submission { queue_name: "in".into(), event: second })
            .await
            .unwrap();

        // Drain the current resident (the second event, which displaced the
        // first into the recovery log) out of the queue so there's room for
        // the recovery replay to actually land rather than overflow again.
        {
            let container = dispatcher.containers.get_mut("in").unwrap();
            container.add_worker(WorkerDescriptor { pid: 99, fd: 990, persistent: false, busy_since: None });
            let drained = container.feed_workers();
            assert_eq!(drained.len(), 1);
            assert_eq!(drained[0].1.id, 2);
        }

        let replayed = dispatcher.recover().await.unwrap();
        assert_eq!(replayed, 1);

        let container = dispatcher.containers.get_mut("in").unwrap();
        container.add_worker(WorkerDescriptor { pid: 1, fd: 10, persistent: false, busy_since: None });
        let fed = container.feed_workers();
        assert_eq!(fed.len(), 1);
        assert_eq!(fed[0].1.id, 1);

        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn submit_worker_conf_command_resizes_pool_without_touching_the_queue() {
        use crate::event::{Command, WorkerConf};

        let (mut dispatcher, dir) = dispatcher_with_one_queue().await;
        let container = dispatcher.containers.get_mut("in").unwrap();
        container.add_worker(WorkerDescriptor { pid: 1, fd: 10, persistent: false, busy_since: None });
        container.add_worker(WorkerDescriptor { pid: 2, fd: 20, persistent: false, busy_since: None });

        let conf = Command::WorkerConf(WorkerConf { num_workers: Some(1), max_exec_time: None });
        let ev = Event::command(1, conf);
        let reply = dispatcher
            .submit(Submission { queue_name: "in".into(), event: ev })
            .await
            .unwrap();
        assert!(reply.is_none());

        // The idle pool shrank to the new target; nothing was queued or
        // written to the recovery log, since a `WorkerConf` command never
        // reaches the queue at all.
        assert_eq!(dispatcher.recovery_log.count(), 0);
        let container = dispatcher.containers.get("in").unwrap();
        assert!(container.status().ends_with(",1,1"));

        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn shutdown_dumps_remaining_queue_contents_to_recovery_log() {
        let (mut dispatcher, dir) = dispatcher_with_one_queue().await;

        let ev = Event::new(1, EventKind::Script, b"a".to_vec());
        dispatcher
            .submit(Submission { queue_name: "in".into(), event: ev })
            .await
            .unwrap();

        dispatcher.shutdown().await.unwrap();
        assert_eq!(dispatcher.recovery_log.count(), 1);

        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[test]
    fn run_maintenance_reports_overrunning_workers() {
        let dir = std::env::temp_dir().join(format!("txproc-dispatcher-maint-test-{}", std::process::id()));
        let nucleus = nucleus_config(dir.clone());

        let mut descriptor = QueueDescriptor::straight("in");
        descriptor.max_exec_time = Some(0);
        let mut container = QueueContainer::new(descriptor);
        container.add_worker(WorkerDescriptor { pid: 7, fd: 70, persistent: false, busy_since: None });
        let ev = Event::new(1, EventKind::Script, b"a".to_vec());
        container.submit_event(ev, chrono::Utc::now()).unwrap();
        std::thread::sleep(Duration::from_millis(5));

        let mut containers = HashMap::new();
        containers.insert("in".to_string(), container);
        let mut dispatcher = Dispatcher {
            containers,
            recovery_log: futures::executor::block_on(RecoveryLog::open(&dir, "maint")).unwrap(),
            maint_interval: nucleus.maint_interval,
        };

        let overrun = dispatcher.run_maintenance();
        assert_eq!(overrun, vec![("in".to_string(), 7)]);

        futures::executor::block_on(tokio::fs::remove_dir_all(&dir)).ok();
    }
}
