//! Fixed-pool buffer management for ingress datagrams.
//!
//! The pool is bounded: every buffer is pre-allocated at session start and
//! exhaustion is a visible failure (`try_get` returns `None`), at which point
//! the ingress datagram is silently dropped. Queue nodes own their buffer and
//! release it exactly once, on send, drop, or shutdown drain.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

use crate::MAX_MTU;

/// Default buffer size for relayed datagrams.
pub const DEFAULT_BUFFER_SIZE: usize = MAX_MTU;

/// A reusable packet buffer.
#[derive(Debug)]
pub struct PacketBuffer {
    data: Vec<u8>,
    len: usize,
}

impl PacketBuffer {
    /// Create a buffer with specific capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity],
            len: 0,
        }
    }

    /// Get the valid data as a slice.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Get the full capacity as a mutable slice.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Set the length of valid data.
    pub fn set_len(&mut self, len: usize) {
        assert!(len <= self.data.len());
        self.len = len;
    }

    /// Get the length of valid data.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Clear the buffer.
    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Copy data into the buffer, truncating to capacity.
    pub fn copy_from(&mut self, data: &[u8]) {
        let len = data.len().min(self.data.len());
        self.data[..len].copy_from_slice(&data[..len]);
        self.len = len;
    }
}

impl AsRef<[u8]> for PacketBuffer {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

/// Fixed pool of reusable datagram buffers.
pub struct BufferPool {
    pool: ArrayQueue<PacketBuffer>,
    buffer_size: usize,
    capacity: usize,
    in_use: AtomicUsize,
}

impl BufferPool {
    /// Create a pool with `count` pre-allocated buffers of `buffer_size` bytes.
    pub fn new(count: usize, buffer_size: usize) -> Arc<Self> {
        let pool = ArrayQueue::new(count.max(1));
        for _ in 0..count.max(1) {
            let _ = pool.push(PacketBuffer::with_capacity(buffer_size));
        }

        Arc::new(Self {
            pool,
            buffer_size,
            capacity: count.max(1),
            in_use: AtomicUsize::new(0),
        })
    }

    /// Take a buffer from the pool. Returns `None` when the pool is exhausted.
    pub fn try_get(self: &Arc<Self>) -> Option<PooledBuffer> {
        let buffer = self.pool.pop()?;
        self.in_use.fetch_add(1, Ordering::Relaxed);
        Some(PooledBuffer {
            buffer: Some(buffer),
            pool: Arc::clone(self),
        })
    }

    /// Take a buffer and fill it with `data`. Returns `None` on exhaustion.
    pub fn try_get_filled(self: &Arc<Self>, data: &[u8]) -> Option<PooledBuffer> {
        let mut buf = self.try_get()?;
        buf.copy_from(data);
        Some(buf)
    }

    fn return_buffer(&self, mut buffer: PacketBuffer) {
        buffer.clear();
        self.in_use.fetch_sub(1, Ordering::Relaxed);
        // The queue was sized to hold every buffer, so this cannot fail for
        // buffers that came out of it.
        let _ = self.pool.push(buffer);
    }

    /// Get pool statistics.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            available: self.pool.len(),
            in_use: self.in_use.load(Ordering::Relaxed),
            capacity: self.capacity,
            buffer_size: self.buffer_size,
        }
    }
}

/// A buffer that automatically returns to its pool when dropped.
pub struct PooledBuffer {
    buffer: Option<PacketBuffer>,
    pool: Arc<BufferPool>,
}

impl PooledBuffer {
    /// Get the valid data as a slice.
    pub fn as_slice(&self) -> &[u8] {
        self.buffer.as_ref().expect("buffer present").as_slice()
    }

    /// Get the full capacity as a mutable slice.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.buffer.as_mut().expect("buffer present").as_mut_slice()
    }

    /// Set the length of valid data.
    pub fn set_len(&mut self, len: usize) {
        self.buffer.as_mut().expect("buffer present").set_len(len);
    }

    /// Get the length of valid data.
    pub fn len(&self) -> usize {
        self.buffer.as_ref().expect("buffer present").len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy data into the buffer.
    pub fn copy_from(&mut self, data: &[u8]) {
        self.buffer
            .as_mut()
            .expect("buffer present")
            .copy_from(data);
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.len())
            .finish()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.pool.return_buffer(buffer);
        }
    }
}

impl AsRef<[u8]> for PooledBuffer {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

/// Pool statistics.
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub available: usize,
    pub in_use: usize,
    pub capacity: usize,
    pub buffer_size: usize,
}

impl std::fmt::Display for PoolStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "available={}/{} in_use={} buffer_size={}",
            self.available, self.capacity, self.in_use, self.buffer_size
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_buffer() {
        let mut buf = PacketBuffer::with_capacity(64);
        buf.copy_from(b"hello world");
        assert_eq!(buf.len(), 11);
        assert_eq!(buf.as_slice(), b"hello world");
    }

    #[test]
    fn test_pool_exhaustion() {
        let pool = BufferPool::new(2, 128);

        let buf1 = pool.try_get().unwrap();
        let buf2 = pool.try_get().unwrap();
        assert!(pool.try_get().is_none(), "fixed pool must not grow");

        let stats = pool.stats();
        assert_eq!(stats.available, 0);
        assert_eq!(stats.in_use, 2);

        drop(buf1);
        assert!(pool.try_get().is_some());
        drop(buf2);
    }

    #[test]
    fn test_buffer_returns_cleared() {
        let pool = BufferPool::new(1, 64);

        let mut buf = pool.try_get_filled(b"payload").unwrap();
        assert_eq!(buf.as_slice(), b"payload");
        buf.set_len(3);
        assert_eq!(buf.as_slice(), b"pay");
        drop(buf);

        let buf = pool.try_get().unwrap();
        assert!(buf.is_empty());
    }

    #[test]
    fn test_copy_truncates_to_capacity() {
        let pool = BufferPool::new(1, 4);
        let buf = pool.try_get_filled(b"too long for this buffer").unwrap();
        assert_eq!(buf.len(), 4);
    }
}
