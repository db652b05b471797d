//! Pooled collaborators owned by the loop.
//!
//! Both pools are loop-thread-only: work items reach them through the loop
//! context, and they are disposed when the worker tears down.

use bytes::BytesMut;

use crate::config::BufferPoolConfig;
use crate::connection::ConnId;

/// Handle to an acquired buffer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufSlot(u32);

/// Fixed-size buffer slots recycled across connections.
///
/// Slots are handed out LIFO so the most recently released buffer, still
/// warm in cache, goes out first. An occupancy map catches double releases.
pub struct BufferPool {
    slots: Vec<Box<[u8]>>,
    free: Vec<u32>,
    occupied: Vec<bool>,
}

impl BufferPool {
    pub fn new(config: &BufferPoolConfig) -> Self {
        assert!(config.slot_size > 0, "buffer slots need a nonzero size");
        assert!(
            u32::try_from(config.slot_count).is_ok(),
            "slot_count does not fit a slot handle"
        );

        let slots = (0..config.slot_count)
            .map(|_| vec![0u8; config.slot_size].into_boxed_slice())
            .collect();
        Self {
            slots,
            free: (0..config.slot_count as u32).rev().collect(),
            occupied: vec![false; config.slot_count],
        }
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Slots currently available for acquisition.
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Take a slot out of the pool. `None` when everything is in use.
    pub fn acquire(&mut self) -> Option<BufSlot> {
        let slot = self.free.pop()?;
        self.occupied[slot as usize] = true;
        Some(BufSlot(slot))
    }

    /// Hand a slot back for reuse.
    ///
    /// # Panics
    /// Panics if the slot is not currently acquired.
    pub fn release(&mut self, slot: BufSlot) {
        let idx = slot.0 as usize;
        assert!(self.occupied[idx], "released a slot that was never acquired");
        self.occupied[idx] = false;
        self.free.push(slot.0);
    }

    pub fn data(&self, slot: BufSlot) -> &[u8] {
        &self.slots[slot.0 as usize]
    }

    pub fn data_mut(&mut self, slot: BufSlot) -> &mut [u8] {
        &mut self.slots[slot.0 as usize]
    }
}

/// A reusable write request: a payload buffer plus the connection it is
/// destined for.
#[derive(Debug, Default)]
pub struct WriteReq {
    pub buf: BytesMut,
    pub conn: Option<ConnId>,
}

impl WriteReq {
    fn reset(&mut self) {
        self.buf.clear();
        self.conn = None;
    }
}

/// Pool of [`WriteReq`] objects. Requests returned beyond `max_pooled` are
/// dropped instead of retained.
pub struct WriteReqPool {
    free: Vec<WriteReq>,
    max_pooled: usize,
}

impl WriteReqPool {
    pub fn new(max_pooled: usize) -> Self {
        Self {
            free: Vec::with_capacity(max_pooled),
            max_pooled,
        }
    }

    #[inline]
    pub fn pooled_count(&self) -> usize {
        self.free.len()
    }

    /// Take a request from the pool, allocating when empty.
    pub fn take(&mut self) -> WriteReq {
        self.free.pop().unwrap_or_default()
    }

    /// Return a request for reuse.
    pub fn put(&mut self, mut req: WriteReq) {
        if self.free.len() < self.max_pooled {
            req.reset();
            self.free.push(req);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_of(slot_size: usize, slot_count: usize) -> BufferPool {
        BufferPool::new(&BufferPoolConfig {
            slot_size,
            slot_count,
        })
    }

    #[test]
    fn test_acquire_release_cycle() {
        let mut pool = pool_of(512, 4);
        assert_eq!(pool.capacity(), 4);
        assert_eq!(pool.available(), 4);

        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.available(), 2);

        pool.release(a);
        pool.release(b);
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn test_acquire_returns_none_when_drained() {
        let mut pool = pool_of(64, 2);
        let _a = pool.acquire().unwrap();
        let _b = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());
    }

    #[test]
    fn test_released_slot_is_reused_first() {
        let mut pool = pool_of(64, 3);
        let first = pool.acquire().unwrap();
        let _second = pool.acquire().unwrap();

        pool.release(first);
        assert_eq!(pool.acquire().unwrap(), first);
    }

    #[test]
    fn test_slot_data_roundtrip() {
        let mut pool = pool_of(512, 2);
        let slot = pool.acquire().unwrap();
        pool.data_mut(slot)[..5].copy_from_slice(b"hello");
        assert_eq!(&pool.data(slot)[..5], b"hello");
    }

    #[test]
    #[should_panic(expected = "never acquired")]
    fn test_double_release_panics() {
        let mut pool = pool_of(64, 2);
        let slot = pool.acquire().unwrap();
        pool.release(slot);
        pool.release(slot);
    }

    #[test]
    fn test_write_req_pool_recycles() {
        let mut pool = WriteReqPool::new(2);

        let mut req = pool.take();
        req.buf.extend_from_slice(b"payload");
        req.conn = Some(ConnId::new(3));
        pool.put(req);
        assert_eq!(pool.pooled_count(), 1);

        let req = pool.take();
        assert!(req.buf.is_empty());
        assert!(req.conn.is_none());
    }

    #[test]
    fn test_write_req_pool_caps_retention() {
        let mut pool = WriteReqPool::new(1);
        pool.put(WriteReq::default());
        pool.put(WriteReq::default());
        assert_eq!(pool.pooled_count(), 1);
    }
}
