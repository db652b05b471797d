//! Double-buffered work and close queues.
//!
//! One mutex guards the "adding" halves of both queues plus the notifier
//! handle used to signal the loop. The "running" halves are owned by the
//! worker thread; a drain pass swaps the pairs under the mutex and executes
//! items with the mutex released, so producers never contend with running
//! callbacks.

use std::collections::VecDeque;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};

use crate::error::Error;
use crate::reactor::{HandleId, NotifyHandle, Reactor};
use crate::worker::LoopContext;

/// Boxed work callback executed on the loop thread.
pub(crate) type WorkFn =
    Box<dyn for<'a> FnOnce(&mut LoopContext<'a>) -> Result<(), Error> + Send>;

/// Type-specific close callback carried by close-queue items. The common
/// case is [`Reactor::close`]; transports supply their own for handles that
/// need extra release logic.
pub type CloseFn = fn(&mut Reactor, HandleId) -> Result<(), Error>;

/// A queued work item: callback plus optional completion signal.
pub(crate) struct Job {
    pub(crate) run: WorkFn,
    pub(crate) completion: Option<Sender<Result<(), Error>>>,
}

/// A queued handle close.
pub(crate) struct CloseRequest {
    pub(crate) handle: HandleId,
    pub(crate) close: CloseFn,
}

impl CloseRequest {
    pub(crate) fn new(close: CloseFn, handle: HandleId) -> Self {
        Self { handle, close }
    }
}

/// The "adding" side of both queue pairs, guarded by the queue mutex.
pub(crate) struct Pending {
    pub(crate) work: VecDeque<Job>,
    pub(crate) close: VecDeque<CloseRequest>,
    /// Signal half of the async notifier. Installed during init, taken back
    /// before the notifier is disposed so late posters observe a retired
    /// queue instead of racing a dead handle.
    pub(crate) waker: Option<NotifyHandle>,
    /// Set once the worker is exiting; posts are refused from then on.
    pub(crate) retired: bool,
}

impl Pending {
    pub(crate) fn new() -> Self {
        Self {
            work: VecDeque::new(),
            close: VecDeque::new(),
            waker: None,
            retired: false,
        }
    }
}

/// Completion signal for [`post_async`](crate::WorkerHandle::post_async).
///
/// Delivery is a channel send: the loop thread never runs the waiting
/// caller's continuation. A worker that exits without running the item
/// reports [`Error::WorkerStopped`].
pub struct Completion {
    rx: Receiver<Result<(), Error>>,
}

impl Completion {
    pub(crate) fn channel() -> (Sender<Result<(), Error>>, Completion) {
        let (tx, rx) = bounded(1);
        (tx, Completion { rx })
    }

    /// Block until the work item has run.
    pub fn wait(self) -> Result<(), Error> {
        match self.rx.recv() {
            Ok(result) => result,
            Err(_) => Err(Error::WorkerStopped),
        }
    }

    /// Block up to `timeout`; `None` means the item has not completed yet.
    pub fn wait_timeout(&self, timeout: std::time::Duration) -> Option<Result<(), Error>> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(Error::WorkerStopped)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_completion_delivers_result() {
        let (tx, completion) = Completion::channel();
        tx.send(Ok(())).unwrap();
        assert!(completion.wait().is_ok());
    }

    #[test]
    fn test_completion_abandoned_reports_stopped() {
        let (tx, completion) = Completion::channel();
        drop(tx);
        assert!(matches!(completion.wait(), Err(Error::WorkerStopped)));
    }

    #[test]
    fn test_completion_wait_timeout() {
        let (tx, completion) = Completion::channel();
        assert!(completion.wait_timeout(Duration::from_millis(5)).is_none());
        tx.send(Ok(())).unwrap();
        assert!(matches!(
            completion.wait_timeout(Duration::from_millis(5)),
            Some(Ok(()))
        ));
    }
}
