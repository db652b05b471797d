//! Loop worker metrics.
//!
//! Counters are incremented from arbitrary producer threads on the post
//! path, so each one shards its storage across cache-line-aligned slots
//! keyed by thread. Readers sum the shards. Gauges are only touched behind
//! the registry lock and stay plain.

use std::any::Any;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use metriken::{Gauge, Value, metric};

const SHARDS: usize = 16;

static SHARD_SEQ: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    /// Shard index for this thread, handed out round-robin.
    static SHARD: usize = SHARD_SEQ.fetch_add(1, Ordering::Relaxed) % SHARDS;
}

/// One counter slot, padded to its own cache line.
#[repr(align(128))]
struct Shard(AtomicU64);

/// A monotonic counter sharded per thread, so concurrent producers never
/// contend on one cache line.
pub struct Counter {
    shards: [Shard; SHARDS],
}

impl Counter {
    pub const fn new() -> Self {
        Self {
            shards: [const { Shard(AtomicU64::new(0)) }; SHARDS],
        }
    }

    #[inline]
    pub fn increment(&self) {
        self.add(1);
    }

    #[inline]
    pub fn add(&self, n: u64) {
        SHARD.with(|idx| self.shards[*idx].0.fetch_add(n, Ordering::Relaxed));
    }

    /// Sum across shards. Approximate while writers are active.
    pub fn total(&self) -> u64 {
        self.shards
            .iter()
            .map(|shard| shard.0.load(Ordering::Relaxed))
            .sum()
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

impl metriken::Metric for Counter {
    fn as_any(&self) -> Option<&dyn Any> {
        Some(self)
    }

    fn value(&self) -> Option<Value<'_>> {
        Some(Value::Counter(self.total()))
    }
}

#[metric(
    name = "work_items_posted",
    description = "Total work items accepted by the post queue"
)]
pub static WORK_ITEMS_POSTED: Counter = Counter::new();

#[metric(
    name = "work_items_executed",
    description = "Total work items executed on the loop thread"
)]
pub static WORK_ITEMS_EXECUTED: Counter = Counter::new();

#[metric(
    name = "work_item_failures",
    description = "Total work items that returned an error"
)]
pub static WORK_ITEM_FAILURES: Counter = Counter::new();

#[metric(
    name = "drain_passes",
    description = "Total work/close drain passes run by the loop"
)]
pub static DRAIN_PASSES: Counter = Counter::new();

#[metric(
    name = "close_handles_executed",
    description = "Total queued handle closes executed on the loop thread"
)]
pub static CLOSE_HANDLES_EXECUTED: Counter = Counter::new();

#[metric(name = "heartbeats", description = "Total heartbeat timer fires")]
pub static HEARTBEATS: Counter = Counter::new();

#[metric(
    name = "connections_ticked",
    description = "Total per-connection tick callbacks delivered"
)]
pub static CONNECTIONS_TICKED: Counter = Counter::new();

#[metric(
    name = "connections_registered",
    description = "Number of currently registered connections"
)]
pub static CONNECTIONS_REGISTERED: Gauge = Gauge::new();

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_counter_sums_across_threads() {
        let counter = Counter::new();
        thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..1000 {
                        counter.increment();
                    }
                });
            }
        });
        assert_eq!(counter.total(), 8000);
    }

    #[test]
    fn test_counter_add() {
        let counter = Counter::new();
        counter.add(5);
        counter.add(7);
        assert_eq!(counter.total(), 12);
    }
}
