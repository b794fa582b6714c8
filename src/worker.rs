//! Retry loop shared by the event watcher and every container tailer.
//!
//! A worker supplies one polling step. The runner calls it forever, sorting
//! failures into "retry now" (runtime timeouts), "retry after a pause"
//! (socket faults and anything unexpected) and "stop" (explicit terminate).
//! Cancelling the token stops the worker wherever it is blocked.

use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::moby::RuntimeError;
use crate::moby::chunk::ChunkError;

const RETRY_PAUSE: Duration = Duration::from_secs(1);
/// A stream that ends cleanly is reopened after this long, so a daemon that
/// keeps closing it at once cannot make the loop spin.
const REOPEN_PAUSE: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// The worker has nothing left to do and should exit.
    #[error("worker terminated")]
    Terminate,
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Chunk(#[from] ChunkError),
}

impl WorkerError {
    /// Every value [`WorkerError::class`] can return.
    pub const CLASSES: [&'static str; 6] = [
        "terminate",
        "not_found",
        "timeout",
        "transport",
        "api",
        "invalid_chunk",
    ];

    pub fn class(&self) -> &'static str {
        match self {
            Self::Terminate => "terminate",
            Self::Runtime(e) => e.class(),
            Self::Chunk(_) => "invalid_chunk",
        }
    }
}

#[async_trait]
pub trait EventWorker: Send {
    /// Component name used in log lines, e.g. `Container(0123456789ab)`.
    fn progname(&self) -> String;

    /// One pass of the worker. Returning `Ok` or a retryable error means
    /// "call me again".
    async fn process_events(&mut self) -> Result<(), WorkerError>;

    /// Reports an unexpected fault, usually to a metrics counter.
    fn event_exception(&self, error: &WorkerError);
}

pub async fn run<W: EventWorker>(mut worker: W, cancel: CancellationToken) {
    let progname = worker.progname();
    log::debug!("{progname}: starting");

    loop {
        let result = tokio::select! {
            () = cancel.cancelled() => break,
            result = worker.process_events() => result,
        };

        let pause = match result {
            Ok(()) => REOPEN_PAUSE,
            Err(WorkerError::Terminate) => {
                log::info!("{progname}: terminating");
                break;
            }
            Err(WorkerError::Runtime(RuntimeError::Timeout)) => {
                log::debug!("{progname}: read timeout, reconnecting");
                continue;
            }
            Err(e @ WorkerError::Runtime(RuntimeError::Transport(_))) => {
                log::debug!("{progname}: socket error ({}): {e}", e.class());
                RETRY_PAUSE
            }
            Err(e) => {
                log::error!("{progname}: unexpected {} error: {e}", e.class());
                worker.event_exception(&e);
                RETRY_PAUSE
            }
        };

        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(pause) => {}
        }
    }

    log::debug!("{progname}: stopped");
}

pub fn spawn<W: EventWorker + 'static>(worker: W, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(run(worker, cancel))
}
