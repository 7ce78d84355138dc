mod config;
mod submission;
mod tracing_config;

use std::path::PathBuf;
use std::process::ExitCode;

use structopt::StructOpt;
use tokio::sync::mpsc;
use txproc_dispatch_core::container::QueueContainer;
use txproc_dispatch_core::dispatcher::Dispatcher;
use txproc_dispatch_core::recovery_log::RecoveryLog;
use txproc_dispatch_core::Error;
use txproc_graceful_shutdown::GracefulShutdown;

#[derive(Debug, StructOpt)]
#[structopt(name = "txproc", about = "Event dispatch core")]
struct Args {
    #[structopt(long, parse(from_os_str), help = "Path to the ini-style configuration file")]
    config: PathBuf,

    #[structopt(long, help = "Skip replaying the recovery log on startup")]
    no_recovery: bool,
}

const SUBMISSION_CHANNEL_CAPACITY: usize = 1024;

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    tracing_config::configure("txproc");

    let args = Args::from_args();
    match run(args).await {
        Ok(()) => ExitCode::from(0),
        Err(err @ Error::Config(_)) | Err(err @ Error::UnknownQueueType(_)) => {
            tracing::error!(%err, "configuration error");
            ExitCode::from(2)
        }
        Err(err) => {
            tracing::error!(%err, "fatal error");
            ExitCode::from(1)
        }
    }
}

async fn run(args: Args) -> txproc_dispatch_core::Result<()> {
    let loaded = config::load(&args.config)?;

    let recovery_log = RecoveryLog::open(&loaded.nucleus.stats_dir, "txproc").await?;

    let shutdown = GracefulShutdown::new();
    let mut dispatcher = Dispatcher::new(recovery_log, &loaded.nucleus);

    for descriptor in loaded.queues {
        dispatcher.register_queue(QueueContainer::new(descriptor));
    }

    if !args.no_recovery {
        let replayed = dispatcher.recover().await?;
        tracing::info!(replayed, "recovery log replayed");
    }

    let (submission_tx, submission_rx) = mpsc::channel(SUBMISSION_CHANNEL_CAPACITY);

    let socket_path = loaded.nucleus.unix_socket_stream_path.clone();
    let mut listener_shutdown = shutdown.consumer();
    tokio::spawn(async move {
        tokio::select! {
            result = submission::listen(&socket_path, submission_tx) => {
                if let Err(err) = result {
                    tracing::error!(%err, "submission listener stopped");
                }
            }
            _ = listener_shutdown.wait_for_shutdown() => {}
        }
    });

    dispatcher.run(submission_rx, shutdown.consumer()).await
}
