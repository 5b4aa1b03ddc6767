//! # Buffer Pool
//!
//! Pool of fixed-size scratch buffers used by the packet codec to marshal
//! packets without allocating per send.
//!
//! Every buffer handed out has exactly `buffer_size` initialized bytes. Callers
//! write into a prefix and slice the written region out; the remaining bytes hold
//! stale data from earlier use and must not be read.
//!
//! ## Usage
//! ```rust
//! use mesh_protocol::utils::buffer_pool::BufferPool;
//!
//! let pool = BufferPool::new(4, 4096);
//! let mut scratch = pool.acquire();
//! scratch[0] = 7;
//! assert_eq!(scratch.len(), 4096);
//! // Buffer automatically returned to pool on drop
//! ```

use std::sync::{Arc, Mutex};

/// Default scratch buffer size in bytes
pub const DEFAULT_SCRATCH_SIZE: usize = 4096;

/// Upper bound on idle buffers kept around
const MAX_IDLE_BUFFERS: usize = 256;

/// A pooled buffer that returns itself to the pool when dropped
pub struct PooledBuffer {
    buffer: Vec<u8>,
    pool: Arc<Mutex<Vec<Vec<u8>>>>,
    buffer_size: usize,
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        // Buffers resized by a caller are not reusable as scratch space
        if self.buffer.len() != self.buffer_size {
            return;
        }
        if let Ok(mut pool) = self.pool.lock() {
            if pool.len() < MAX_IDLE_BUFFERS {
                pool.push(std::mem::take(&mut self.buffer));
            }
        }
    }
}

impl std::ops::Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.buffer
    }
}

impl std::ops::DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buffer
    }
}

/// Thread-safe pool of equally sized scratch buffers
pub struct BufferPool {
    pool: Arc<Mutex<Vec<Vec<u8>>>>,
    buffer_size: usize,
}

impl BufferPool {
    /// Create a pool pre-filled with `pool_size` buffers of `buffer_size` bytes
    pub fn new(pool_size: usize, buffer_size: usize) -> Self {
        let pool = (0..pool_size.min(MAX_IDLE_BUFFERS))
            .map(|_| vec![0u8; buffer_size])
            .collect();

        Self {
            pool: Arc::new(Mutex::new(pool)),
            buffer_size,
        }
    }

    /// Acquire a buffer from the pool (or allocate a new one if pool is empty)
    pub fn acquire(&self) -> PooledBuffer {
        let buffer = self
            .pool
            .lock()
            .ok()
            .and_then(|mut pool| pool.pop())
            .unwrap_or_else(|| vec![0u8; self.buffer_size]);

        PooledBuffer {
            buffer,
            pool: self.pool.clone(),
            buffer_size: self.buffer_size,
        }
    }

    /// Size in bytes of every buffer this pool hands out
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Get the current number of available buffers in the pool
    pub fn available(&self) -> usize {
        self.pool.lock().map(|p| p.len()).unwrap_or(0)
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(8, DEFAULT_SCRATCH_SIZE)
    }
}

impl Clone for BufferPool {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            buffer_size: self.buffer_size,
        }
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.buffer_size)
            .field("available", &self.available())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_pool_basic() {
        let pool = BufferPool::new(2, 64);
        assert_eq!(pool.available(), 2);

        let mut buf = pool.acquire();
        assert_eq!(pool.available(), 1);
        assert_eq!(buf.len(), 64);

        buf[0] = 42;
        assert_eq!(buf[0], 42);

        drop(buf);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_buffer_pool_empty_allocates() {
        let pool = BufferPool::new(1, 16);
        let _buf1 = pool.acquire();
        let buf2 = pool.acquire();

        assert_eq!(buf2.len(), 16);
        assert_eq!(pool.available(), 0);
        drop(buf2);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_shared_between_clones() {
        let pool = BufferPool::new(1, 8);
        let clone = pool.clone();
        let buf = clone.acquire();
        assert_eq!(pool.available(), 0);
        drop(buf);
        assert_eq!(pool.available(), 1);
        assert_eq!(clone.buffer_size(), 8);
    }
}
