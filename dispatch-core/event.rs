use chrono::{DateTime, Utc};
use std::time::Duration;

/// File descriptor of whatever socket the event's reply should eventually
/// land on. Opaque to the queue/pool layer — they only ever push, peek, and
/// pop the top of the stack.
pub type ReturnFd = i32;

/// What kind of work an event carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum EventKind {
    Script,
    Perl,
    Url,
    Bin,
    Command,
}

/// Control commands carried by `EventKind::Command` events. These never
/// reach a worker's regular payload handling path — the pool and container
/// intercept them.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Command {
    /// Queue has drained; persistent-app workers should exit.
    EndOfQueue,
    /// Broadcast shutdown: workers should finish in-flight work and exit.
    ExitWhenDone,
    /// Reconfigure a queue's pool size or exec time limit.
    WorkerConf(WorkerConf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct WorkerConf {
    pub num_workers: Option<u32>,
    pub max_exec_time: Option<u64>,
}

/// Why an event failed, surfaced on the reply frame. Matches §7's error
/// taxonomy: every per-event failure resolves to exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCause {
    Expired,
    Dumped,
    Overrun,
    InvalidTarget,
    WorkerCrash,
}

impl FailureCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCause::Expired => "expired",
            FailureCause::Dumped => "dumped",
            FailureCause::Overrun => "overrun",
            FailureCause::InvalidTarget => "invalid_target",
            FailureCause::WorkerCrash => "worker_crash",
        }
    }
}

/// The reply frame sent back down an event's return fd.
#[derive(Debug, Clone)]
pub struct Reply {
    pub success: bool,
    pub failure_cause: Option<FailureCause>,
    pub result: Option<Vec<u8>>,
}

impl Reply {
    pub fn failure(cause: FailureCause) -> Self {
        Reply {
            success: false,
            failure_cause: Some(cause),
            result: None,
        }
    }

    pub fn success(result: Option<Vec<u8>>) -> Self {
        Reply {
            success: true,
            failure_cause: None,
            result,
        }
    }
}

/// Delivers a reply for an event to whatever is holding its return fd.
/// Implemented by the worker transport in production and by a channel in
/// tests, the same way `ergo_queues`'s dequeuer loop is generic over a
/// `QueueJobProcessor`.
pub trait ReplySink: Send + Sync + std::fmt::Debug {
    fn deliver(&self, fd: ReturnFd, reply: Reply);
}

/// Drops replies on the floor. Used for the recovery process, where the fds
/// in replayed events are not valid in this process (§4.1/§7).
#[derive(Debug, Default, Clone, Copy)]
pub struct NullReplySink;

impl ReplySink for NullReplySink {
    fn deliver(&self, _fd: ReturnFd, _reply: Reply) {}
}

/// Unit of work submitted for execution. See spec §3.
#[derive(Debug, Clone)]
pub struct Event {
    pub id: u64,
    pub kind: EventKind,
    pub command: Option<Command>,
    pub payload: Vec<u8>,
    return_fd_stack: Vec<ReturnFd>,
    pub queue_time: Option<DateTime<Utc>>,
    pub lifetime: Option<Duration>,
    pub expiry_time: Option<DateTime<Utc>>,
    expired: bool,
    pub target_worker_pid: Option<i32>,
    pub sub_queue_key: u32,
}

impl Event {
    pub fn new(id: u64, kind: EventKind, payload: Vec<u8>) -> Self {
        Event {
            id,
            kind,
            command: None,
            payload,
            return_fd_stack: Vec::new(),
            queue_time: None,
            lifetime: None,
            expiry_time: None,
            expired: false,
            target_worker_pid: None,
            sub_queue_key: 0,
        }
    }

    /// Synthesises a control-command event. Control commands never carry a
    /// return fd, expiry, or sub-queue key — they're generated internally,
    /// not submitted by a caller.
    pub fn command(id: u64, command: Command) -> Self {
        Event {
            id,
            kind: EventKind::Command,
            command: Some(command),
            payload: Vec::new(),
            return_fd_stack: Vec::new(),
            queue_time: None,
            lifetime: None,
            expiry_time: None,
            expired: false,
            target_worker_pid: None,
            sub_queue_key: 0,
        }
    }

    pub fn with_lifetime(mut self, lifetime: Option<Duration>) -> Self {
        self.lifetime = lifetime;
        self
    }

    pub fn with_sub_queue_key(mut self, key: u32) -> Self {
        self.sub_queue_key = key;
        self
    }

    pub fn with_target_worker_pid(mut self, pid: i32) -> Self {
        self.target_worker_pid = Some(pid);
        self
    }

    /// Restores the entire return-fd stack, as a recovery-log replay does:
    /// the fds themselves are dead in this process, but the stack depth is
    /// still part of the event's recorded state (§8's round-trip law).
    pub fn with_return_fd_stack(mut self, stack: Vec<ReturnFd>) -> Self {
        self.return_fd_stack = stack;
        self
    }

    pub fn return_fd_stack(&self) -> &[ReturnFd] {
        &self.return_fd_stack
    }

    /// Restores queue/expiry timestamps and the latched `expired` flag
    /// directly, bypassing `stamp_queued`'s derivation from `lifetime` —
    /// used when reconstructing an event whose timestamps were already
    /// fixed before it was written to the recovery log.
    pub fn with_recorded_times(
        mut self,
        queue_time: Option<DateTime<Utc>>,
        expiry_time: Option<DateTime<Utc>>,
        expired: bool,
    ) -> Self {
        self.queue_time = queue_time;
        self.expiry_time = expiry_time;
        self.expired = expired;
        self
    }

    pub fn push_return_fd(&mut self, fd: ReturnFd) {
        self.return_fd_stack.push(fd);
    }

    /// The fd a reply should currently go out on, if any. The top of the
    /// stack, as in the original's `getReturnFd`.
    pub fn return_fd(&self) -> Option<ReturnFd> {
        self.return_fd_stack.last().copied()
    }

    /// Drops the return fd that was just used, as the original's
    /// `shiftReturnFd` does after sending a reply.
    pub fn shift_return_fd(&mut self) {
        self.return_fd_stack.pop();
    }

    /// Stamps queue-acceptance metadata: queue time and, if a lifetime was
    /// set, the derived expiry time. Mirrors `queueContainer::submitEvent`
    /// and `batchQueue::queueEvent`, both of which do this at acceptance.
    pub fn stamp_queued(&mut self, now: DateTime<Utc>) {
        self.queue_time = Some(now);
        if let Some(lifetime) = self.lifetime {
            self.expiry_time = Some(now + chrono::Duration::from_std(lifetime).unwrap_or_default());
        }
    }

    pub fn has_been_expired(&self) -> bool {
        self.expired
    }

    /// True if the expiry deadline has passed, independent of whether the
    /// `expired` flag has been set yet. Once the flag is set the event must
    /// never be considered "freshly expiring" again (§3 invariant).
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expiry_time {
            Some(t) => t <= now,
            None => false,
        }
    }

    /// Latches the expired flag. Once set, the event may only ever be
    /// produced to callers as an expired notification.
    pub fn expire(&mut self) {
        self.expired = true;
    }

    pub fn is_command(&self, want: &Command) -> bool {
        self.command.as_ref() == Some(want)
    }
}
