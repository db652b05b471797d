use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

/// Configuration for the loop worker.
#[derive(Clone)]
pub struct Config {
    /// Maximum work/close drain alternations per notifier wake. Bounds the
    /// time spent running queued items before the loop returns to polling.
    pub max_drain_loops: u32,
    /// Heartbeat timer period. Each tick caches the loop clock and ticks
    /// every registered connection.
    pub heartbeat_interval: Duration,
    /// Budget for draining connections at the start of `stop()`.
    pub shutdown_timeout: Duration,
    /// Name for the worker thread.
    pub thread_name: String,
    /// Buffer pool sizing for the per-loop buffer pool.
    pub buffer_pool: BufferPoolConfig,
    /// Maximum number of pooled write requests kept for reuse.
    pub write_req_pool_size: usize,
    /// Host shutdown flag. Set to `true` when the loop captures a fatal
    /// error, asking the hosting application to stop.
    pub app_shutdown: Option<Arc<AtomicBool>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_drain_loops: 8,
            heartbeat_interval: Duration::from_millis(1000),
            shutdown_timeout: Duration::from_secs(5),
            thread_name: "monio-loop".to_string(),
            buffer_pool: BufferPoolConfig::default(),
            write_req_pool_size: 128,
            app_shutdown: None,
        }
    }
}

/// Sizing for the loop's buffer pool.
#[derive(Clone)]
pub struct BufferPoolConfig {
    /// Size of each pooled buffer slot in bytes.
    pub slot_size: usize,
    /// Number of slots to allocate.
    pub slot_count: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            slot_size: 16 * 1024,
            slot_count: 256,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.max_drain_loops, 8);
        assert_eq!(config.heartbeat_interval, Duration::from_millis(1000));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
        assert!(config.app_shutdown.is_none());
    }

    #[test]
    fn test_buffer_pool_defaults() {
        let config = BufferPoolConfig::default();
        assert_eq!(config.slot_size, 16 * 1024);
        assert_eq!(config.slot_count, 256);
    }
}
