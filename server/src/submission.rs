use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;

use txproc_dispatch_core::dispatcher::Submission;
use txproc_dispatch_core::event::{Event, EventKind};
use txproc_dispatch_core::Result;

/// Wire shape of a submitted event, as accepted on the stream submission
/// socket. Mirrors §6's "each frame is one event; the stream variant
/// prefixes a length" — the datagram variant at `<app>.sock` is not
/// modeled since Tokio has no ergonomic `AF_UNIX SOCK_DGRAM` support (see
/// `worker_io`'s framing note); every submission path in this build goes
/// through the length-prefixed stream socket.
#[derive(Debug, Serialize, Deserialize)]
struct SubmittedEvent {
    queue: String,
    kind: EventKind,
    payload: Vec<u8>,
    sub_queue_key: Option<u32>,
    target_worker_pid: Option<i32>,
}

/// Binds `path` and feeds every accepted connection's single frame into
/// `tx` as a `Submission`. Runs until the listener itself errors; callers
/// drive this as one branch of the graceful-shutdown `select!`, the way
/// the dispatcher's own loop treats the submission source as just another
/// event arm.
pub async fn listen(path: &Path, tx: mpsc::Sender<Submission>) -> Result<()> {
    let _ = tokio::fs::remove_file(path).await;
    let listener = UnixListener::bind(path)?;
    tracing::info!(path = %path.display(), "listening for submissions");

    loop {
        let (stream, _) = listener.accept().await?;
        let tx = tx.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, tx).await {
                tracing::warn!(%err, "submission connection failed");
            }
        });
    }
}

async fn handle_connection(mut stream: UnixStream, tx: mpsc::Sender<Submission>) -> Result<()> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;

    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    let submitted: SubmittedEvent = serde_json::from_slice(&body)?;

    let mut event = Event::new(0, submitted.kind, submitted.payload);
    if let Some(key) = submitted.sub_queue_key {
        event = event.with_sub_queue_key(key);
    }
    if let Some(pid) = submitted.target_worker_pid {
        event = event.with_target_worker_pid(pid);
    }

    let ack = tx
        .send(Submission {
            queue_name: submitted.queue,
            event,
        })
        .await
        .is_ok();

    let ack_byte: u8 = if ack { 1 } else { 0 };
    stream.write_all(&[ack_byte]).await?;
    Ok(())
}
