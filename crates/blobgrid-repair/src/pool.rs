//! Byte-buffer pool
//!
//! Recovery buffers are chunk-sized (one per replica touched by a
//! recovery) and short-lived, so they are recycled through a free list
//! instead of hitting the allocator per task. The pool is bounded:
//! exceeding `max_buffers` outstanding chunks is an error the recovery
//! propagates, not a wait.

use crate::error::PoolError;
use bytes::BytesMut;
use parking_lot::Mutex;

/// Pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Size of every buffer handed out, in bytes. Must cover one chunk's
    /// worth of bid data; the caller guarantees the fit.
    pub chunk_size: usize,
    /// Maximum buffers outstanding at once
    pub max_buffers: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            chunk_size: 16 * 1024 * 1024, // 16MiB
            max_buffers: 128,
        }
    }
}

struct PoolInner {
    free: Vec<BytesMut>,
    outstanding: usize,
}

/// Bounded free-list pool of chunk-sized `BytesMut` buffers
pub struct ByteBufferPool {
    config: PoolConfig,
    inner: Mutex<PoolInner>,
}

impl ByteBufferPool {
    /// Create a pool with the given configuration
    #[must_use]
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(PoolInner {
                free: Vec::new(),
                outstanding: 0,
            }),
        }
    }

    /// Buffer size handed out by this pool
    #[must_use]
    pub const fn chunk_size(&self) -> usize {
        self.config.chunk_size
    }

    /// Take a zeroed chunk-sized buffer
    ///
    /// Reuses a free buffer when available, allocates otherwise. Errors
    /// when `max_buffers` are already outstanding.
    pub fn get(&self) -> Result<BytesMut, PoolError> {
        let mut inner = self.inner.lock();
        if inner.outstanding >= self.config.max_buffers {
            return Err(PoolError::Exhausted {
                outstanding: inner.outstanding,
            });
        }

        let buf = match inner.free.pop() {
            Some(mut buf) => {
                buf.clear();
                buf.resize(self.config.chunk_size, 0);
                buf
            }
            None => BytesMut::zeroed(self.config.chunk_size),
        };
        inner.outstanding += 1;
        Ok(buf)
    }

    /// Return a buffer to the free list
    ///
    /// Accepts buffers of any length; they are restored to chunk size on
    /// the next `get`.
    pub fn put(&self, buf: BytesMut) {
        let mut inner = self.inner.lock();
        inner.outstanding = inner.outstanding.saturating_sub(1);
        inner.free.push(buf);
    }

    /// Buffers currently handed out
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.inner.lock().outstanding
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_pool(max: usize) -> ByteBufferPool {
        ByteBufferPool::new(PoolConfig {
            chunk_size: 4096,
            max_buffers: max,
        })
    }

    #[test]
    fn test_get_returns_zeroed_chunk() {
        let pool = small_pool(2);
        let buf = pool.get().unwrap();
        assert_eq!(buf.len(), 4096);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_exhaustion() {
        let pool = small_pool(2);
        let a = pool.get().unwrap();
        let _b = pool.get().unwrap();
        assert!(matches!(
            pool.get(),
            Err(PoolError::Exhausted { outstanding: 2 })
        ));

        pool.put(a);
        assert!(pool.get().is_ok());
    }

    #[test]
    fn test_put_restores_dirty_buffers() {
        let pool = small_pool(1);
        let mut buf = pool.get().unwrap();
        buf[0] = 0xAB;
        let _short = buf.split_off(100);
        pool.put(buf);

        let reused = pool.get().unwrap();
        assert_eq!(reused.len(), 4096);
        assert!(reused.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_outstanding_tracking() {
        let pool = small_pool(4);
        assert_eq!(pool.outstanding(), 0);
        let a = pool.get().unwrap();
        let b = pool.get().unwrap();
        assert_eq!(pool.outstanding(), 2);
        pool.put(a);
        pool.put(b);
        assert_eq!(pool.outstanding(), 0);
    }
}
