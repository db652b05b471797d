//! Integration tests for the heartbeat.

use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;

use monio::{Config, ConnId, Connection, ConnectionManager, LoopWorker};

fn start_worker(config: Config) -> LoopWorker {
    let mut worker = LoopWorker::new(config);
    worker.start().expect("worker should start");
    worker
}

/// Records every tick timestamp and deregisters itself on close.
#[derive(Default)]
struct TickRecorder {
    ticks: Mutex<Vec<u64>>,
    registration: Mutex<Option<(Weak<ConnectionManager>, ConnId)>>,
}

impl Connection for TickRecorder {
    fn tick(&self, now_ms: u64) {
        self.ticks.lock().unwrap().push(now_ms);
    }

    fn request_close(&self) {
        if let Some((manager, id)) = self.registration.lock().unwrap().take() {
            if let Some(manager) = manager.upgrade() {
                manager.deregister(id);
            }
        }
    }

    fn abort(&self) {
        self.request_close();
    }
}

fn enroll(worker: &LoopWorker, conn: &Arc<TickRecorder>) -> ConnId {
    let manager = worker.connection_manager();
    let id = manager.register(conn.clone());
    *conn.registration.lock().unwrap() = Some((Arc::downgrade(&manager), id));
    worker
        .post_async(move |ctx| {
            ctx.reactor().add_stream(id);
            Ok(())
        })
        .unwrap()
        .wait()
        .unwrap();
    id
}

/// One tick per second per registered connection, timestamps non-decreasing
/// and roughly a heartbeat apart.
#[test]
fn test_heartbeat_cadence() {
    let mut worker = start_worker(Config::default());
    let conn = Arc::new(TickRecorder::default());
    enroll(&worker, &conn);

    thread::sleep(Duration::from_millis(3500));

    let ticks = conn.ticks.lock().unwrap().clone();
    assert!(ticks.len() >= 3, "expected >= 3 ticks, got {}", ticks.len());
    assert!(ticks.windows(2).all(|pair| pair[0] <= pair[1]));
    for pair in ticks.windows(2) {
        let gap = pair[1] - pair[0];
        assert!((700..=1500).contains(&gap), "tick gap was {gap}ms");
    }

    worker.stop(Duration::from_secs(3)).unwrap();
}

/// The heartbeat publishes the loop clock for other threads.
#[test]
fn test_heartbeat_caches_loop_clock() {
    let mut worker = start_worker(Config::default());
    let conn = Arc::new(TickRecorder::default());
    enroll(&worker, &conn);

    thread::sleep(Duration::from_millis(1500));

    let cached = worker.now_millis();
    assert!(cached >= 500, "cached clock was {cached}ms");
    // The published value is drawn from a heartbeat tick, not a fresh clock
    // read.
    let ticks = conn.ticks.lock().unwrap().clone();
    assert!(ticks.contains(&cached));

    worker.stop(Duration::from_secs(3)).unwrap();
}

/// Deregistered connections are silently skipped even while their stream
/// handle is still enrolled.
#[test]
fn test_heartbeat_skips_deregistered_connections() {
    let mut worker = start_worker(Config::default());
    let conn = Arc::new(TickRecorder::default());
    let id = enroll(&worker, &conn);
    worker.connection_manager().deregister(id);

    thread::sleep(Duration::from_millis(1200));

    assert!(conn.ticks.lock().unwrap().is_empty());
    worker.stop(Duration::from_secs(3)).unwrap();
}
