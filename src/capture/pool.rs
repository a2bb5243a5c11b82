//! Pooled buffers for encoder output.
//!
//! Frames are published as shared read-only values, so the encoder output
//! buffer rides inside the frame and returns to the pool when the last
//! subscriber drops it. Capacity is sized by a capped estimator so a 4K
//! monitor does not pin tens of megabytes across the pool.

use std::ops::Deref;
use std::sync::{Arc, Mutex};

/// Buffers retained for reuse; extras beyond this are freed on return.
const MAX_POOLED: usize = 8;

const MIN_CAPACITY: usize = 64 * 1024;
const MAX_CAPACITY: usize = 10 * 1024 * 1024;

/// Estimated JPEG output size for a frame of the given dimensions,
/// clamped to `[64 KiB, 10 MiB]`.
pub fn estimate_capacity(width: u32, height: u32) -> usize {
    let estimate = (width as usize * height as usize * 3) / 10 + 10 * 1024;
    estimate.clamp(MIN_CAPACITY, MAX_CAPACITY)
}

#[derive(Default)]
pub struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Take a cleared buffer with at least `capacity` reserved.
    pub fn rent(self: &Arc<Self>, capacity: usize) -> Vec<u8> {
        let mut buffers = self.buffers.lock().unwrap();
        let mut buffer = match buffers.iter().position(|b| b.capacity() >= capacity) {
            Some(index) => buffers.swap_remove(index),
            None => Vec::with_capacity(capacity),
        };
        buffer.clear();
        buffer
    }

    /// Wrap an encoded buffer so it returns here when the frame drops.
    pub fn attach(self: &Arc<Self>, buffer: Vec<u8>) -> PooledBytes {
        PooledBytes {
            buffer,
            pool: Some(Arc::clone(self)),
        }
    }

    fn give_back(&self, buffer: Vec<u8>) {
        let mut buffers = self.buffers.lock().unwrap();
        if buffers.len() < MAX_POOLED {
            buffers.push(buffer);
        }
    }

    #[cfg(test)]
    fn pooled_count(&self) -> usize {
        self.buffers.lock().unwrap().len()
    }
}

/// Read-only bytes that return to their pool on drop.
pub struct PooledBytes {
    buffer: Vec<u8>,
    pool: Option<Arc<BufferPool>>,
}

impl PooledBytes {
    /// Bytes with no backing pool; freed normally.
    pub fn unpooled(buffer: Vec<u8>) -> Self {
        Self { buffer, pool: None }
    }
}

impl Deref for PooledBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buffer
    }
}

impl AsRef<[u8]> for PooledBytes {
    fn as_ref(&self) -> &[u8] {
        &self.buffer
    }
}

impl std::fmt::Debug for PooledBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PooledBytes({} bytes)", self.buffer.len())
    }
}

impl Drop for PooledBytes {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.give_back(std::mem::take(&mut self.buffer));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimator_clamps_small_and_large() {
        assert_eq!(estimate_capacity(16, 16), MIN_CAPACITY);
        assert_eq!(estimate_capacity(16384, 16384), MAX_CAPACITY);

        let hd = estimate_capacity(1920, 1080);
        assert_eq!(hd, 1920 * 1080 * 3 / 10 + 10 * 1024);
    }

    #[test]
    fn buffers_cycle_through_the_pool() {
        let pool = BufferPool::new();
        let mut buffer = pool.rent(1024);
        buffer.extend_from_slice(b"frame");
        let bytes = pool.attach(buffer);
        assert_eq!(&*bytes, b"frame");
        drop(bytes);
        assert_eq!(pool.pooled_count(), 1);

        // Rented again: same storage, cleared.
        let buffer = pool.rent(16);
        assert!(buffer.is_empty());
        assert!(buffer.capacity() >= 1024);
        assert_eq!(pool.pooled_count(), 0);
    }

    #[test]
    fn pool_retention_is_bounded() {
        let pool = BufferPool::new();
        let rented: Vec<_> = (0..MAX_POOLED + 4).map(|_| pool.rent(64)).collect();
        for buffer in rented {
            drop(pool.attach(buffer));
        }
        assert_eq!(pool.pooled_count(), MAX_POOLED);
    }

    #[test]
    fn unpooled_bytes_do_not_return() {
        let pool = BufferPool::new();
        drop(PooledBytes::unpooled(vec![1, 2, 3]));
        assert_eq!(pool.pooled_count(), 0);
    }
}
