//! Bounded, lock-free buffer pool for the forwarding pipeline.
//!
//! Buffers are sized for a full wire frame (MTU + header + AEAD tag +
//! slack) and recycled through an [`ArrayQueue`]. When the pool runs dry
//! a fresh allocation is handed out instead of blocking a pump; the
//! fallback count is visible so sustained misses show up in snapshots.
//!
//! Buffers never cross the pump boundary: each pump acquires per frame
//! and the guard releases on the same path.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

use crate::core::constants::{pooled_buffer_capacity, MAX_IN_FLIGHT_FRAMES};

/// Shared frame-buffer pool.
pub struct BufferPool {
    queue: ArrayQueue<Vec<u8>>,
    buffer_capacity: usize,
    fallback_allocs: AtomicU64,
}

impl BufferPool {
    /// Pool for a device with the given MTU, holding twice the maximum
    /// in-flight frame count for each direction.
    pub fn new(mtu: usize) -> Arc<Self> {
        Self::with_slots(mtu, 2 * MAX_IN_FLIGHT_FRAMES * 2)
    }

    /// Pool with an explicit slot count.
    pub fn with_slots(mtu: usize, slots: usize) -> Arc<Self> {
        let buffer_capacity = pooled_buffer_capacity(mtu);
        let queue = ArrayQueue::new(slots);
        for _ in 0..slots {
            let _ = queue.push(Vec::with_capacity(buffer_capacity));
        }
        Arc::new(Self {
            queue,
            buffer_capacity,
            fallback_allocs: AtomicU64::new(0),
        })
    }

    /// Take a zero-length buffer backed by full-capacity storage.
    pub fn acquire(self: &Arc<Self>) -> PooledBuffer {
        let buf = match self.queue.pop() {
            Some(mut buf) => {
                buf.clear();
                buf
            }
            None => {
                self.fallback_allocs.fetch_add(1, Ordering::Relaxed);
                Vec::with_capacity(self.buffer_capacity)
            }
        };
        PooledBuffer {
            buf: Some(buf),
            pool: Arc::clone(self),
        }
    }

    /// Capacity of every pooled buffer.
    pub fn buffer_capacity(&self) -> usize {
        self.buffer_capacity
    }

    /// Number of acquisitions served by fresh allocations.
    pub fn fallback_allocations(&self) -> u64 {
        self.fallback_allocs.load(Ordering::Relaxed)
    }

    fn release(&self, buf: Vec<u8>) {
        // Oversized strays (a fallback that grew) are dropped rather than
        // poisoning the pool with odd capacities.
        if buf.capacity() >= self.buffer_capacity {
            let _ = self.queue.push(buf);
        }
    }
}

/// A pooled buffer; returns to its pool on drop.
pub struct PooledBuffer {
    buf: Option<Vec<u8>>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        self.buf.as_ref().expect("buffer present until drop")
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        self.buf.as_mut().expect("buffer present until drop")
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}
