//! The loop worker thread.
//!
//! `LoopWorker` owns a [`Reactor`] and is the execution home for every
//! resource allocated against it. Other threads reach the loop through
//! [`WorkerHandle::post`]: items land on the double-buffered queues and the
//! async notifier wakes the loop to drain them. A heartbeat timer ticks every
//! enrolled connection once a second with the loop's cached clock, and
//! `stop()` walks a three-stage escalation from cooperative exit to an
//! immediate loop stop.

use std::collections::VecDeque;
use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, bounded};
use parking_lot::Mutex;

use crate::config::Config;
use crate::connection::ConnectionManager;
use crate::error::Error;
use crate::metrics::{
    CLOSE_HANDLES_EXECUTED, CONNECTIONS_TICKED, DRAIN_PASSES, HEARTBEATS, WORK_ITEMS_EXECUTED,
    WORK_ITEM_FAILURES, WORK_ITEMS_POSTED,
};
use crate::pool::{BufferPool, WriteReqPool};
use crate::queue::{CloseFn, CloseRequest, Completion, Job, Pending};
use crate::reactor::{HandleId, HandleKind, Reactor, Wakeup};

/// Budget for forcibly aborting connections after a graceful drain fails.
const ABORT_TIMEOUT: Duration = Duration::from_secs(1);

struct StartState {
    started: bool,
    init_completed: bool,
}

/// State reachable from any thread.
pub(crate) struct Shared {
    /// The queue-pair mutex: adding halves of both queues plus the notifier.
    /// Never held while a callback runs.
    sync: Mutex<Pending>,
    /// Start barrier: serializes init with the first shutdown attempt.
    start: Mutex<StartState>,
    /// One-shot fatal latch, assigned on the worker thread and re-raised to
    /// the `stop()` caller.
    fatal: Mutex<Option<Error>>,
    stop_immediate: AtomicBool,
    /// Heartbeat-cached loop clock, in milliseconds.
    now_ms: AtomicU64,
    connections: Arc<ConnectionManager>,
}

impl Shared {
    fn submit(&self, job: Job) -> Result<(), Error> {
        let waker = {
            let mut pending = self.sync.lock();
            if pending.retired {
                return Err(Error::WorkerStopped);
            }
            pending.work.push_back(job);
            pending.waker.clone()
        };
        if let Some(waker) = waker {
            waker.signal();
        }
        WORK_ITEMS_POSTED.increment();
        Ok(())
    }

    fn submit_close(&self, request: CloseRequest) -> Result<(), Error> {
        let waker = {
            let mut pending = self.sync.lock();
            if pending.retired {
                return Err(Error::WorkerStopped);
            }
            pending.close.push_back(request);
            pending.waker.clone()
        };
        if let Some(waker) = waker {
            waker.signal();
        }
        Ok(())
    }

    fn set_fatal(&self, error: Error) {
        let mut slot = self.fatal.lock();
        if slot.is_none() {
            *slot = Some(error);
        }
    }
}

/// Cloneable posting handle. This is what producers on other threads hold.
#[derive(Clone)]
pub struct WorkerHandle {
    shared: Arc<Shared>,
}

impl WorkerHandle {
    /// Enqueue a fire-and-forget work item. Callable from any thread; the
    /// item runs on the loop thread at the next drain. An item that returns
    /// an error becomes the worker's fatal error.
    pub fn post<F>(&self, f: F) -> Result<(), Error>
    where
        F: FnOnce(&mut LoopContext<'_>) -> Result<(), Error> + Send + 'static,
    {
        self.shared.submit(Job {
            run: Box::new(f),
            completion: None,
        })
    }

    /// Like [`post`](Self::post), but returns a [`Completion`] that resolves
    /// after the item has run (or failed). An item error fails only its own
    /// completion.
    pub fn post_async<F>(&self, f: F) -> Result<Completion, Error>
    where
        F: FnOnce(&mut LoopContext<'_>) -> Result<(), Error> + Send + 'static,
    {
        let (tx, completion) = Completion::channel();
        self.shared.submit(Job {
            run: Box::new(f),
            completion: Some(tx),
        })?;
        Ok(completion)
    }

    /// Run a plain closure on the loop thread.
    pub fn schedule<F>(&self, f: F) -> Result<(), Error>
    where
        F: FnOnce() + Send + 'static,
    {
        self.post(move |_| {
            f();
            Ok(())
        })
    }

    /// Queue a handle close and wake the loop. Safe from any thread.
    pub fn queue_close_handle(&self, close: CloseFn, handle: HandleId) -> Result<(), Error> {
        self.shared.submit_close(CloseRequest::new(close, handle))
    }

    /// The heartbeat-cached loop clock, in milliseconds.
    pub fn now_millis(&self) -> u64 {
        self.shared.now_ms.load(Ordering::Relaxed)
    }

    pub fn connection_manager(&self) -> Arc<ConnectionManager> {
        self.shared.connections.clone()
    }
}

/// A generic deferred-execution seam for collaborators that only need
/// "run this closure somewhere later".
pub trait Scheduler {
    fn schedule(&self, task: Box<dyn FnOnce() + Send + 'static>);
}

impl Scheduler for WorkerHandle {
    fn schedule(&self, task: Box<dyn FnOnce() + Send + 'static>) {
        let _ = WorkerHandle::schedule(self, move || task());
    }
}

/// Borrowed view of the loop-owned state, handed to work items.
///
/// Only the worker thread ever constructs one, so everything reachable from
/// here is single-threaded by construction.
pub struct LoopContext<'a> {
    reactor: &'a mut Reactor,
    connections: &'a ConnectionManager,
    buffer_pool: &'a mut BufferPool,
    write_req_pool: &'a mut WriteReqPool,
    shared: &'a Shared,
    notifier: HandleId,
    heartbeat: HandleId,
}

impl LoopContext<'_> {
    pub fn reactor(&mut self) -> &mut Reactor {
        &mut *self.reactor
    }

    pub fn connections(&self) -> &ConnectionManager {
        self.connections
    }

    pub fn buffer_pool(&mut self) -> &mut BufferPool {
        &mut *self.buffer_pool
    }

    pub fn write_req_pool(&mut self) -> &mut WriteReqPool {
        &mut *self.write_req_pool
    }

    /// The async notifier's handle ID.
    pub fn notifier(&self) -> HandleId {
        self.notifier
    }

    /// The heartbeat timer's handle ID.
    pub fn heartbeat(&self) -> HandleId {
        self.heartbeat
    }

    pub fn now_millis(&self) -> u64 {
        self.reactor.now()
    }

    /// Queue a handle close without waking the loop. Used from work items
    /// that are already running on the loop, where no wake is required.
    pub fn queue_close_handle(&self, close: CloseFn, handle: HandleId) {
        let mut pending = self.shared.sync.lock();
        if !pending.retired {
            pending.close.push_back(CloseRequest::new(close, handle));
        }
    }
}

/// Loop-owned state. Lives on the worker thread for the worker's lifetime.
struct LoopState {
    reactor: Reactor,
    buffer_pool: BufferPool,
    write_req_pool: WriteReqPool,
    /// Running halves of the queue pairs; swapped with the adding halves
    /// under the queue mutex at the start of each drain.
    work_running: VecDeque<Job>,
    close_running: VecDeque<CloseRequest>,
    notifier: HandleId,
    heartbeat: HandleId,
}

/// The event-loop worker.
pub struct LoopWorker {
    config: Config,
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
    done_rx: Receiver<()>,
    done_tx: Option<Sender<()>>,
}

impl LoopWorker {
    pub fn new(config: Config) -> Self {
        let (done_tx, done_rx) = bounded(0);
        Self {
            config,
            shared: Arc::new(Shared {
                sync: Mutex::new(Pending::new()),
                start: Mutex::new(StartState {
                    started: false,
                    init_completed: false,
                }),
                fatal: Mutex::new(None),
                stop_immediate: AtomicBool::new(false),
                now_ms: AtomicU64::new(0),
                connections: Arc::new(ConnectionManager::new()),
            }),
            thread: None,
            done_rx,
            done_tx: Some(done_tx),
        }
    }

    /// Spawn the worker thread and block until the loop, notifier, and
    /// heartbeat timer are initialized (or the init error is returned).
    pub fn start(&mut self) -> Result<(), Error> {
        {
            let mut start = self.shared.start.lock();
            if start.started {
                return Err(Error::AlreadyStarted);
            }
            start.started = true;
        }

        let (init_tx, init_rx) = bounded(1);
        let done_tx = self.done_tx.take().expect("start guarded by started flag");
        let shared = self.shared.clone();
        let config = self.config.clone();
        let thread = thread::Builder::new()
            .name(self.config.thread_name.clone())
            .spawn(move || worker_main(shared, config, init_tx, done_tx))
            .map_err(Error::Io)?;
        self.thread = Some(thread);

        match init_rx.recv() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::WorkerStopped),
        }
    }

    /// Cloneable posting handle for producers.
    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            shared: self.shared.clone(),
        }
    }

    /// See [`WorkerHandle::post`].
    pub fn post<F>(&self, f: F) -> Result<(), Error>
    where
        F: FnOnce(&mut LoopContext<'_>) -> Result<(), Error> + Send + 'static,
    {
        self.handle().post(f)
    }

    /// See [`WorkerHandle::post_async`].
    pub fn post_async<F>(&self, f: F) -> Result<Completion, Error>
    where
        F: FnOnce(&mut LoopContext<'_>) -> Result<(), Error> + Send + 'static,
    {
        self.handle().post_async(f)
    }

    /// See [`WorkerHandle::schedule`].
    pub fn schedule<F>(&self, f: F) -> Result<(), Error>
    where
        F: FnOnce() + Send + 'static,
    {
        self.handle().schedule(f)
    }

    /// See [`WorkerHandle::queue_close_handle`].
    pub fn queue_close_handle(&self, close: CloseFn, handle: HandleId) -> Result<(), Error> {
        self.shared.submit_close(CloseRequest::new(close, handle))
    }

    pub fn connection_manager(&self) -> Arc<ConnectionManager> {
        self.shared.connections.clone()
    }

    /// The heartbeat-cached loop clock, in milliseconds.
    pub fn now_millis(&self) -> u64 {
        self.shared.now_ms.load(Ordering::Relaxed)
    }

    /// Description of the captured fatal error, if any. The error itself is
    /// returned by `stop()`.
    pub fn fatal_error(&self) -> Option<String> {
        self.shared.fatal.lock().as_ref().map(|e| e.to_string())
    }

    /// Shut the worker down.
    ///
    /// Drains connections within the configured `shutdown_timeout`, then
    /// escalates through three stages, each given `timeout / 3`:
    ///
    /// 1. stop the heartbeat and unreference the notifier, letting the loop
    ///    exit once its remaining handles close;
    /// 2. close every handle other than the notifier;
    /// 3. stop the loop outright; the worker returns without teardown and
    ///    its handles are abandoned.
    ///
    /// Returns the worker's fatal error if one was captured. Calling `stop`
    /// before `start`, or again after the worker exited, is safe.
    pub fn stop(&mut self, timeout: Duration) -> Result<(), Error> {
        {
            let start = self.shared.start.lock();
            if !start.init_completed {
                return Ok(());
            }
        }

        if !self.is_exited() {
            let connections = self.shared.connections.clone();
            if !connections.walk_and_close(self.config.shutdown_timeout) {
                tracing::warn!(
                    timeout = ?self.config.shutdown_timeout,
                    remaining = connections.len(),
                    "not all connections closed gracefully; aborting the rest"
                );
                if !connections.walk_and_abort(ABORT_TIMEOUT) {
                    tracing::warn!(
                        remaining = connections.len(),
                        "not all connections could be aborted"
                    );
                }
            }

            // A post that finds the queue retired means the worker is
            // already exiting; keep waiting on the join token regardless.
            let step = timeout / 3;
            let handle = self.handle();
            let _ = handle.post(|ctx| {
                let heartbeat = ctx.heartbeat();
                let notifier = ctx.notifier();
                let reactor = ctx.reactor();
                reactor.timer_stop(heartbeat);
                reactor.unref_handle(notifier);
                Ok(())
            });
            if !self.wait_exit(step) {
                tracing::warn!("loop did not exit after heartbeat stop; closing remaining handles");
                let _ = handle.post(|ctx| {
                    let notifier = ctx.notifier();
                    let mut doomed = Vec::new();
                    ctx.reactor().walk(|id, _| {
                        if id != notifier {
                            doomed.push(id);
                        }
                    });
                    for id in doomed {
                        ctx.reactor().close(id)?;
                    }
                    ctx.reactor().unref_handle(notifier);
                    Ok(())
                });
                if !self.wait_exit(step) {
                    tracing::warn!("loop did not exit after handle close; stopping the loop");
                    self.shared.stop_immediate.store(true, Ordering::SeqCst);
                    let _ = handle.post(|ctx| {
                        ctx.reactor().stop();
                        Ok(())
                    });
                    if !self.wait_exit(step) {
                        tracing::error!(
                            ?timeout,
                            "event loop thread did not stop within the shutdown budget"
                        );
                    }
                }
            }
        }

        if self.is_exited()
            && let Some(thread) = self.thread.take()
        {
            let _ = thread.join();
        }

        if let Some(fatal) = self.shared.fatal.lock().take() {
            return Err(fatal);
        }
        Ok(())
    }

    fn is_exited(&self) -> bool {
        matches!(self.done_rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    fn wait_exit(&self, timeout: Duration) -> bool {
        match self.done_rx.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) => false,
        }
    }
}

fn worker_main(
    shared: Arc<Shared>,
    config: Config,
    init_tx: Sender<Result<(), Error>>,
    done_tx: Sender<()>,
) {
    // Dropped on every exit path, resolving the join token.
    let _done = done_tx;

    let mut state = {
        let mut start = shared.start.lock();
        match init_loop(&shared, &config) {
            Ok(state) => {
                start.init_completed = true;
                drop(start);
                let _ = init_tx.send(Ok(()));
                state
            }
            Err(e) => {
                drop(start);
                let _ = init_tx.send(Err(e));
                retire(&shared);
                return;
            }
        }
    };

    let result = run_loop(&shared, &config, &mut state).and_then(|()| {
        if shared.stop_immediate.load(Ordering::SeqCst) {
            Ok(())
        } else {
            teardown(&shared, &mut state)
        }
    });
    if let Err(e) = result {
        tracing::error!(error = %e, "event loop failed");
        shared.set_fatal(e);
        if let Some(flag) = &config.app_shutdown {
            flag.store(true, Ordering::SeqCst);
        }
    }

    let LoopState {
        reactor,
        work_running,
        close_running,
        ..
    } = state;
    if shared.stop_immediate.load(Ordering::SeqCst) {
        // Immediate stop returns without teardown: the loop and its handles
        // are abandoned rather than touched in an unknown state.
        mem::forget(reactor);
    }
    retire(&shared);
    fail_unran(&shared, work_running, close_running);
    // Pools drop here.
}

fn init_loop(shared: &Shared, config: &Config) -> Result<LoopState, Error> {
    let mut reactor = Reactor::new()?;
    let notifier = reactor.add_notifier();
    let heartbeat = reactor.add_timer(config.heartbeat_interval);

    let signal = reactor.signal_handle();
    let backlog = {
        let mut pending = shared.sync.lock();
        pending.waker = Some(signal.clone());
        !pending.work.is_empty() || !pending.close.is_empty()
    };
    if backlog {
        // Items were posted before start; make sure the first poll drains them.
        signal.signal();
    }

    Ok(LoopState {
        reactor,
        buffer_pool: BufferPool::new(&config.buffer_pool),
        write_req_pool: WriteReqPool::new(config.write_req_pool_size),
        work_running: VecDeque::new(),
        close_running: VecDeque::new(),
        notifier,
        heartbeat,
    })
}

fn run_loop(shared: &Shared, config: &Config, state: &mut LoopState) -> Result<(), Error> {
    loop {
        if state.reactor.stop_requested() || !state.reactor.has_live_handles() {
            return Ok(());
        }
        let wakeups = state.reactor.poll_once()?;
        for wakeup in wakeups {
            match wakeup {
                Wakeup::Notified => drain(shared, config, state)?,
                Wakeup::Timer(id) if id == state.heartbeat => on_heartbeat(shared, state),
                Wakeup::Timer(_) => {}
            }
        }
    }
}

/// Drain queued work and closes, alternating until both come up empty or the
/// pass cap is hit. Items posted during the drain run on the next alternation
/// or the next notifier wake.
fn drain(shared: &Shared, config: &Config, state: &mut LoopState) -> Result<(), Error> {
    let mut remaining = config.max_drain_loops.max(1);
    loop {
        let ran_work = drain_work(shared, state)?;
        let ran_close = drain_close(shared, state)?;
        DRAIN_PASSES.increment();
        remaining -= 1;
        if !(ran_work || ran_close) || remaining == 0 {
            return Ok(());
        }
    }
}

fn drain_work(shared: &Shared, state: &mut LoopState) -> Result<bool, Error> {
    debug_assert!(state.work_running.is_empty());
    {
        let mut pending = shared.sync.lock();
        mem::swap(&mut pending.work, &mut state.work_running);
    }

    let ran = !state.work_running.is_empty();
    while let Some(job) = state.work_running.pop_front() {
        let LoopState {
            reactor,
            buffer_pool,
            write_req_pool,
            notifier,
            heartbeat,
            ..
        } = state;
        let mut ctx = LoopContext {
            reactor,
            connections: &*shared.connections,
            buffer_pool,
            write_req_pool,
            shared,
            notifier: *notifier,
            heartbeat: *heartbeat,
        };
        let result = (job.run)(&mut ctx);
        WORK_ITEMS_EXECUTED.increment();
        match (result, job.completion) {
            (Ok(()), Some(tx)) => {
                let _ = tx.send(Ok(()));
            }
            (Ok(()), None) => {}
            (Err(e), Some(tx)) => {
                WORK_ITEM_FAILURES.increment();
                tracing::debug!(error = %e, "work item failed; reported to its completion");
                let _ = tx.send(Err(e));
            }
            (Err(e), None) => {
                WORK_ITEM_FAILURES.increment();
                tracing::error!(error = %e, "work item failed with no completion");
                return Err(e);
            }
        }
    }
    Ok(ran)
}

fn drain_close(shared: &Shared, state: &mut LoopState) -> Result<bool, Error> {
    debug_assert!(state.close_running.is_empty());
    {
        let mut pending = shared.sync.lock();
        mem::swap(&mut pending.close, &mut state.close_running);
    }
    let ran = !state.close_running.is_empty();
    run_close_queue(state)?;
    Ok(ran)
}

fn run_close_queue(state: &mut LoopState) -> Result<(), Error> {
    while let Some(request) = state.close_running.pop_front() {
        CLOSE_HANDLES_EXECUTED.increment();
        if let Err(e) = (request.close)(&mut state.reactor, request.handle) {
            tracing::error!(
                error = %e,
                handle = request.handle.as_usize(),
                "handle close failed"
            );
            return Err(e);
        }
    }
    Ok(())
}

fn on_heartbeat(shared: &Shared, state: &mut LoopState) {
    let now = state.reactor.now();
    shared.now_ms.store(now, Ordering::Relaxed);
    HEARTBEATS.increment();

    let connections = &shared.connections;
    state.reactor.walk(|_, handle| {
        if let HandleKind::Stream { conn } = *handle.kind()
            && let Some(connection) = connections.get(conn)
        {
            connection.tick(now);
            CONNECTIONS_TICKED.increment();
        }
    });
}

fn teardown(shared: &Shared, state: &mut LoopState) -> Result<(), Error> {
    // Refuse further posts and take the notifier out of the queue state
    // before its handle is disposed.
    retire(shared);
    state.reactor.ref_handle(state.notifier);

    // Flush closes queued by collaborators, then dispose our own handles
    // through the same close path.
    drain_close(shared, state)?;
    state
        .close_running
        .push_back(CloseRequest::new(Reactor::close, state.notifier));
    state
        .close_running
        .push_back(CloseRequest::new(Reactor::close, state.heartbeat));
    run_close_queue(state)?;

    // One more turn so deferred reclamation runs before the loop is dropped.
    state.reactor.run_closing();
    Ok(())
}

fn retire(shared: &Shared) {
    let mut pending = shared.sync.lock();
    pending.retired = true;
    pending.waker = None;
}

/// Fail completions of items that never ran and discard the rest.
fn fail_unran(
    shared: &Shared,
    mut work_running: VecDeque<Job>,
    close_running: VecDeque<CloseRequest>,
) {
    let (work, close) = {
        let mut pending = shared.sync.lock();
        (mem::take(&mut pending.work), mem::take(&mut pending.close))
    };

    let dropped_closes = close_running.len() + close.len();
    let mut abandoned = 0usize;
    for job in work_running.drain(..).chain(work) {
        match job.completion {
            Some(tx) => {
                let _ = tx.send(Err(Error::WorkerStopped));
            }
            None => abandoned += 1,
        }
    }
    if abandoned > 0 || dropped_closes > 0 {
        tracing::debug!(abandoned, dropped_closes, "discarded queued items at exit");
    }
}
