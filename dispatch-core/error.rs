use thiserror::Error;

/// Errors surfaced by the dispatch core.
///
/// Per-event failures (expiry, overrun, invalid target) are never built
/// from this enum at the call site that handles them — they're folded into
/// a `FailureCause` reply instead (see `event::FailureCause`). This enum is
/// for the structural failures named in the error taxonomy: bad config,
/// I/O, and the internal invariant violations that should never happen but
/// are still reported as `Result`s rather than panics.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("unrecognised queue type '{0}'")]
    UnknownQueueType(String),

    #[error("operation requires a target worker pid, got {0:?}")]
    InvalidTarget(Option<i32>),

    #[error("no queue registered for worker pid {0}")]
    UnknownWorkerPid(i32),

    #[error("no queue registered for worker fd {0}")]
    UnknownWorkerFd(i32),

    #[error("sub-queue handle {0:?} not found in batch queue state")]
    SubQueueNotFound(crate::queue::batch::SubDequeId),

    #[error("recovery log I/O error: {0}")]
    RecoveryIo(std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
