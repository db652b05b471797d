//! Mio-based loop primitive.
//!
//! `Reactor` is the single-threaded dispatch core the worker runs on: a
//! `mio::Poll` plus a table of loop-owned handles (the async notifier, timers,
//! and stream enrollments), a cross-thread wake primitive, and a cached
//! millisecond clock. Dispatch is completion-style: `poll_once` returns the
//! wakeups that fired and the caller matches on them, so no callbacks are
//! stored inside the reactor and no user-pointer smuggling is needed.
//!
//! Everything here except `NotifyHandle::signal` must only be touched from
//! the thread that owns the reactor.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use mio::{Events, Poll, Token, Waker};
use slab::Slab;

use crate::connection::ConnId;
use crate::error::Error;

const WAKER_TOKEN: Token = Token(0);
const EVENTS_CAPACITY: usize = 64;

/// Identifier for a loop-owned handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId(pub(crate) usize);

impl HandleId {
    /// Raw slot index, useful for per-handle arrays.
    #[inline]
    pub fn as_usize(&self) -> usize {
        self.0
    }
}

/// What a loop-owned handle is.
#[derive(Debug, Clone, Copy)]
pub enum HandleKind {
    /// The cross-thread wake primitive. Keeps the loop alive while
    /// referenced so producers can always reach it.
    Notifier,
    /// A repeating timer.
    Timer {
        /// Re-arm period.
        period: Duration,
    },
    /// An externally-owned stream endpoint enrolled with the loop so that
    /// walks (heartbeat, rude shutdown) can see it.
    Stream {
        /// The connection carried by this stream.
        conn: ConnId,
    },
}

/// A live entry in the reactor's handle table.
#[derive(Debug)]
pub struct Handle {
    kind: HandleKind,
    referenced: bool,
    closing: bool,
    /// Armed timer deadline. `None` for non-timers and stopped timers.
    deadline: Option<Instant>,
}

impl Handle {
    #[inline]
    pub fn kind(&self) -> &HandleKind {
        &self.kind
    }

    #[inline]
    pub fn is_referenced(&self) -> bool {
        self.referenced
    }

    /// Whether this handle counts toward keeping the loop alive.
    #[inline]
    fn is_active(&self) -> bool {
        match self.kind {
            HandleKind::Notifier | HandleKind::Stream { .. } => true,
            HandleKind::Timer { .. } => self.deadline.is_some(),
        }
    }
}

/// A wakeup returned by [`Reactor::poll_once`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wakeup {
    /// The async notifier was signalled from some thread.
    Notified,
    /// A timer fired.
    Timer(HandleId),
}

/// Thread-safe signal half of the async notifier.
///
/// `signal()` may be called from any thread. Repeated signals while a wake is
/// already pending coalesce into a single wakeup per loop turn.
#[derive(Clone)]
pub struct NotifyHandle {
    waker: Arc<Waker>,
    notified: Arc<AtomicBool>,
}

impl NotifyHandle {
    /// Wake the loop so it drains its queues.
    pub fn signal(&self) {
        if !self.notified.swap(true, Ordering::AcqRel)
            && let Err(e) = self.waker.wake()
        {
            // The loop is tearing down and the poll backend is gone. The
            // shutdown controller treats this as "worker already exiting".
            tracing::trace!(error = %e, "wake on closed loop ignored");
        }
    }
}

/// The single-threaded event-dispatch core.
pub struct Reactor {
    poll: Poll,
    events: Events,
    handles: Slab<Handle>,
    waker: Arc<Waker>,
    notified: Arc<AtomicBool>,
    pending_close: Vec<HandleId>,
    stop_flag: bool,
    origin: Instant,
    now_ms: u64,
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        Ok(Self {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            handles: Slab::new(),
            waker,
            notified: Arc::new(AtomicBool::new(false)),
            pending_close: Vec::new(),
            stop_flag: false,
            origin: Instant::now(),
            now_ms: 0,
        })
    }

    /// Cross-thread signal handle, cheap to clone.
    pub fn signal_handle(&self) -> NotifyHandle {
        NotifyHandle {
            waker: self.waker.clone(),
            notified: self.notified.clone(),
        }
    }

    /// Milliseconds since the reactor was created, refreshed once per poll
    /// turn. Reading it never touches the system clock.
    #[inline]
    pub fn now(&self) -> u64 {
        self.now_ms
    }

    pub fn add_notifier(&mut self) -> HandleId {
        self.insert(HandleKind::Notifier, None)
    }

    /// Add a repeating timer armed `period` from now.
    pub fn add_timer(&mut self, period: Duration) -> HandleId {
        self.insert(HandleKind::Timer { period }, Some(Instant::now() + period))
    }

    /// Enroll a stream endpoint carrying `conn`.
    pub fn add_stream(&mut self, conn: ConnId) -> HandleId {
        self.insert(HandleKind::Stream { conn }, None)
    }

    fn insert(&mut self, kind: HandleKind, deadline: Option<Instant>) -> HandleId {
        let key = self.handles.insert(Handle {
            kind,
            referenced: true,
            closing: false,
            deadline,
        });
        HandleId(key)
    }

    /// Disarm a timer without closing it.
    pub fn timer_stop(&mut self, id: HandleId) {
        if let Some(handle) = self.handles.get_mut(id.0) {
            handle.deadline = None;
        }
    }

    pub fn ref_handle(&mut self, id: HandleId) {
        if let Some(handle) = self.handles.get_mut(id.0) {
            handle.referenced = true;
        }
    }

    /// Stop `id` from keeping the loop alive. Idempotent.
    pub fn unref_handle(&mut self, id: HandleId) {
        if let Some(handle) = self.handles.get_mut(id.0) {
            handle.referenced = false;
        }
    }

    /// Begin closing a handle. The slot is reclaimed on the next loop turn
    /// (or an explicit [`run_closing`](Self::run_closing) pass), mirroring
    /// deferred close callbacks. Closing an unknown or already-closing
    /// handle is a silent no-op.
    pub fn close(&mut self, id: HandleId) -> Result<(), Error> {
        if let Some(handle) = self.handles.get_mut(id.0)
            && !handle.closing
        {
            handle.closing = true;
            self.pending_close.push(id);
        }
        Ok(())
    }

    /// Reclaim handles whose close was requested. The teardown path calls
    /// this once after disposing the notifier and heartbeat so their slots
    /// are gone before the loop itself is dropped.
    pub fn run_closing(&mut self) {
        for id in self.pending_close.drain(..) {
            let _ = self.handles.try_remove(id.0);
        }
    }

    /// Invoke `f` for every live (non-closing) handle.
    pub fn walk<F>(&self, mut f: F)
    where
        F: FnMut(HandleId, &Handle),
    {
        for (key, handle) in self.handles.iter() {
            if !handle.closing {
                f(HandleId(key), handle);
            }
        }
    }

    /// Whether any referenced, active handle remains. The loop exits
    /// naturally once this turns false.
    pub fn has_live_handles(&self) -> bool {
        self.handles
            .iter()
            .any(|(_, h)| !h.closing && h.referenced && h.is_active())
    }

    /// Request an immediate stop: the owner's run loop returns after the
    /// current turn without waiting for handles to close.
    pub fn stop(&mut self) {
        self.stop_flag = true;
    }

    #[inline]
    pub fn stop_requested(&self) -> bool {
        self.stop_flag
    }

    /// One loop turn: reclaim closed slots, refresh the cached clock, block
    /// until a signal or timer deadline, and return what fired.
    pub fn poll_once(&mut self) -> io::Result<Vec<Wakeup>> {
        self.run_closing();
        self.now_ms = self.origin.elapsed().as_millis() as u64;

        let timeout = self.next_timeout();
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
        self.now_ms = self.origin.elapsed().as_millis() as u64;

        let mut fired = Vec::new();
        if self.notified.swap(false, Ordering::AcqRel) {
            fired.push(Wakeup::Notified);
        }
        self.fire_due_timers(&mut fired);
        Ok(fired)
    }

    fn next_timeout(&self) -> Option<Duration> {
        let now = Instant::now();
        self.handles
            .iter()
            .filter(|(_, h)| !h.closing)
            .filter_map(|(_, h)| h.deadline)
            .map(|deadline| deadline.saturating_duration_since(now))
            .min()
    }

    fn fire_due_timers(&mut self, fired: &mut Vec<Wakeup>) {
        let now = Instant::now();
        for (key, handle) in self.handles.iter_mut() {
            if handle.closing {
                continue;
            }
            if let Some(deadline) = handle.deadline
                && deadline <= now
            {
                fired.push(Wakeup::Timer(HandleId(key)));
                handle.deadline = match handle.kind {
                    HandleKind::Timer { period } => Some(now + period),
                    _ => None,
                };
            }
        }
    }
}
