use std::io;

/// Boxed error type carried by failing work items and close handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors surfaced by the loop worker.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Loop setup or polling failed.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// `start()` was called on a worker that is already running.
    #[error("worker already started")]
    AlreadyStarted,
    /// The worker is shutting down or has exited; the item was not accepted
    /// or will never run.
    #[error("worker stopped")]
    WorkerStopped,
    /// A posted work item returned an error.
    #[error("work item failed: {0}")]
    Work(#[source] BoxError),
    /// A queued close handler returned an error.
    #[error("close handler failed: {0}")]
    CloseHandler(#[source] BoxError),
}

impl Error {
    /// Wrap an arbitrary application error as a work-item failure.
    ///
    /// The original error stays reachable through `source()` / downcasting,
    /// so callers of `stop()` can recover it from a fatal report.
    pub fn work<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Work(Box::new(err))
    }
}
