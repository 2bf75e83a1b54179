//! Pooled byte buffers for per-connection reads and writes
//!
//! A `PooledBuffer` is exclusively owned by one connection. Dropping it hands
//! the allocation back to its pool, so every exit path of a connection
//! (normal completion, framing error, I/O error, disconnect, shutdown) returns
//! its buffers without any explicit release call.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

// ----------------------------------------------------------------------------
// Buffer Pool
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct PoolInner {
    buffer_size: usize,
    max_idle: usize,
    idle: Mutex<Vec<Vec<u8>>>,
    outstanding: AtomicUsize,
    allocated: AtomicUsize,
}

/// Shared pool of fixed-size byte buffers
#[derive(Debug, Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

/// Snapshot of pool usage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferPoolStats {
    /// Buffers currently owned by connections
    pub outstanding: usize,
    /// Buffers sitting in the free list
    pub idle: usize,
    /// Total allocations performed since the pool was created
    pub allocated: usize,
}

impl BufferPool {
    /// Create a pool handing out buffers of `buffer_size` bytes, retaining at
    /// most `max_idle` free buffers
    pub fn new(buffer_size: usize, max_idle: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                buffer_size: buffer_size.max(1),
                max_idle,
                idle: Mutex::new(Vec::new()),
                outstanding: AtomicUsize::new(0),
                allocated: AtomicUsize::new(0),
            }),
        }
    }

    /// Take a buffer from the pool, allocating when the free list is empty
    pub fn acquire(&self) -> PooledBuffer {
        let reused = self
            .inner
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        let data = match reused {
            Some(data) => data,
            None => {
                self.inner.allocated.fetch_add(1, Ordering::Relaxed);
                vec![0u8; self.inner.buffer_size]
            }
        };
        self.inner.outstanding.fetch_add(1, Ordering::AcqRel);
        PooledBuffer {
            data,
            start: 0,
            end: 0,
            pool: self.inner.clone(),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// Number of buffers currently checked out
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> BufferPoolStats {
        let idle = self
            .inner
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        BufferPoolStats {
            outstanding: self.outstanding(),
            idle,
            allocated: self.inner.allocated.load(Ordering::Relaxed),
        }
    }
}

// ----------------------------------------------------------------------------
// Pooled Buffer
// ----------------------------------------------------------------------------

/// A buffer checked out of a `BufferPool`
///
/// Holds readable bytes in `start..end`; the region after `end` is free space
/// for the next read.
#[derive(Debug)]
pub struct PooledBuffer {
    data: Vec<u8>,
    start: usize,
    end: usize,
    pool: Arc<PoolInner>,
}

impl PooledBuffer {
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Discard all readable bytes
    pub fn clear(&mut self) {
        self.start = 0;
        self.end = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Bytes available to read
    pub fn readable(&self) -> &[u8] {
        &self.data[self.start..self.end]
    }

    /// Mark `n` readable bytes as consumed
    pub fn consume(&mut self, n: usize) {
        self.start = (self.start + n).min(self.end);
        if self.start == self.end {
            self.clear();
        }
    }

    /// Free space after the readable region, compacting first if needed
    pub fn writable_mut(&mut self) -> &mut [u8] {
        if self.end == self.data.len() && self.start > 0 {
            self.data.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }
        &mut self.data[self.end..]
    }

    /// Mark `n` bytes written into `writable_mut` as readable
    pub fn commit(&mut self, n: usize) {
        self.end = (self.end + n).min(self.data.len());
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let data = std::mem::take(&mut self.data);
        {
            let mut idle = self.pool.idle.lock().unwrap_or_else(PoisonError::into_inner);
            if idle.len() < self.pool.max_idle {
                idle.push(data);
            }
        }
        self.pool.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}
