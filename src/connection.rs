//! Connection registry walked by the heartbeat and drained during shutdown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::metrics::CONNECTIONS_REGISTERED;

/// Opaque connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(u64);

impl ConnId {
    /// Create a connection ID from a raw value. Primarily useful for tests;
    /// real IDs come from [`ConnectionManager::register`].
    #[inline]
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// A connection as seen by the loop core.
///
/// `tick` runs on the loop thread once per heartbeat. `request_close` and
/// `abort` are invoked by the shutdown controller from its own thread; a
/// connection acknowledges either by deregistering itself from the manager
/// (typically by posting its teardown onto the loop).
pub trait Connection: Send + Sync {
    /// Heartbeat callback with the loop's cached clock, in milliseconds.
    fn tick(&self, now_ms: u64);

    /// Ask the connection to close gracefully.
    fn request_close(&self);

    /// Forcibly abort the connection.
    fn abort(&self);
}

/// Registry of live connections, keyed by [`ConnId`].
#[derive(Default)]
pub struct ConnectionManager {
    inner: Mutex<HashMap<ConnId, Arc<dyn Connection>>>,
    drained: Condvar,
    next_id: Mutex<u64>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection and return its ID.
    pub fn register(&self, conn: Arc<dyn Connection>) -> ConnId {
        let id = {
            let mut next = self.next_id.lock();
            *next += 1;
            ConnId(*next)
        };
        self.inner.lock().insert(id, conn);
        CONNECTIONS_REGISTERED.increment();
        id
    }

    /// Remove a connection. Signals any shutdown waiter when the registry
    /// empties out.
    pub fn deregister(&self, id: ConnId) {
        let removed = self.inner.lock().remove(&id).is_some();
        if removed {
            CONNECTIONS_REGISTERED.decrement();
            self.drained.notify_all();
        }
    }

    pub fn get(&self, id: ConnId) -> Option<Arc<dyn Connection>> {
        self.inner.lock().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Ask every connection to close and wait up to `timeout` for the
    /// registry to drain. Returns whether all connections deregistered.
    pub fn walk_and_close(&self, timeout: Duration) -> bool {
        self.drain(timeout, |conn| conn.request_close())
    }

    /// Abort every connection and wait up to `timeout` for the registry to
    /// drain. Returns whether all connections deregistered.
    pub fn walk_and_abort(&self, timeout: Duration) -> bool {
        self.drain(timeout, |conn| conn.abort())
    }

    fn drain<F>(&self, timeout: Duration, f: F) -> bool
    where
        F: Fn(&Arc<dyn Connection>),
    {
        // Snapshot outside the lock: connections may deregister synchronously
        // from inside the callback.
        let targets: Vec<Arc<dyn Connection>> = self.inner.lock().values().cloned().collect();
        if targets.is_empty() {
            return true;
        }
        for conn in &targets {
            f(conn);
        }

        let deadline = Instant::now() + timeout;
        let mut map = self.inner.lock();
        while !map.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.drained.wait_for(&mut map, deadline - now);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::thread;

    struct StubConn {
        closes: AtomicU32,
        aborts: AtomicU32,
    }

    impl StubConn {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                closes: AtomicU32::new(0),
                aborts: AtomicU32::new(0),
            })
        }
    }

    impl Connection for StubConn {
        fn tick(&self, _now_ms: u64) {}

        fn request_close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }

        fn abort(&self) {
            self.aborts.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_register_deregister() {
        let manager = ConnectionManager::new();
        let a = manager.register(StubConn::new());
        let b = manager.register(StubConn::new());
        assert_ne!(a, b);
        assert_eq!(manager.len(), 2);

        manager.deregister(a);
        assert!(manager.get(a).is_none());
        assert!(manager.get(b).is_some());

        // Repeat deregister is harmless.
        manager.deregister(a);
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_walk_and_close_empty_registry() {
        let manager = ConnectionManager::new();
        assert!(manager.walk_and_close(Duration::from_millis(1)));
    }

    #[test]
    fn test_walk_and_close_times_out_on_stuck_conn() {
        let manager = ConnectionManager::new();
        let conn = StubConn::new();
        manager.register(conn.clone());

        let start = Instant::now();
        assert!(!manager.walk_and_close(Duration::from_millis(50)));
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(conn.closes.load(Ordering::SeqCst), 1);
        assert_eq!(conn.aborts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_walk_and_abort_reaches_every_conn() {
        let manager = ConnectionManager::new();
        let a = StubConn::new();
        let b = StubConn::new();
        manager.register(a.clone());
        manager.register(b.clone());

        assert!(!manager.walk_and_abort(Duration::from_millis(20)));
        assert_eq!(a.aborts.load(Ordering::SeqCst), 1);
        assert_eq!(b.aborts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drain_wakes_when_last_conn_leaves() {
        let manager = Arc::new(ConnectionManager::new());
        let id = manager.register(StubConn::new());

        let deregister = {
            let manager = manager.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                manager.deregister(id);
            })
        };

        assert!(manager.walk_and_close(Duration::from_secs(2)));
        deregister.join().unwrap();
    }
}
