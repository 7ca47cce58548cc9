//! Shared buffer pool management.
//!
//! Provides reusable scratch buffers without per-message malloc overhead.
//! Buffers are grouped into power-of-two size classes; each class keeps a
//! bounded free list so a burst of rentals does not pin memory forever.
//!
//! ## Rentals
//!
//! `BufferPool::rent` hands out a `RentedBuffer` that owns its storage
//! until it is dropped. Dropping the rental is the only way to return it,
//! so a buffer goes back to the pool exactly once on every exit path
//! (normal return, `?` propagation, or task cancellation) and is never
//! reachable from two holders at the same time.
//!
//! Contents of a rented buffer are whatever the previous holder left
//! behind. Treat it as scratch space.

use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

/// Smallest size class handed out.
const MIN_BUFFER_SIZE: usize = 16;

/// Largest size class kept in the pool. Bigger rentals are allocated on
/// demand and discarded on return.
const MAX_POOLED_SIZE: usize = 1024 * 1024;

/// Default number of idle buffers kept per size class.
pub const DEFAULT_MAX_RETAINED: usize = 1024;

/// Concurrent pool of reusable byte buffers.
///
/// Safe to share across any number of tasks; rent and return only take a
/// short per-class lock.
pub struct BufferPool {
    /// One free list per size class, smallest first.
    classes: Vec<SizeClass>,
    /// Idle buffers retained per class.
    max_retained: usize,
    rented: AtomicU64,
    returned: AtomicU64,
}

struct SizeClass {
    size: usize,
    /// Stack of idle buffers (LIFO for cache locality).
    free: Mutex<Vec<Vec<u8>>>,
}

/// Snapshot of pool rental counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Total rentals handed out.
    pub rented: u64,
    /// Total rentals handed back.
    pub returned: u64,
}

impl PoolStats {
    /// Rentals currently checked out.
    pub fn outstanding(&self) -> u64 {
        self.rented - self.returned
    }
}

impl BufferPool {
    /// Create a new, empty buffer pool.
    ///
    /// # Arguments
    /// * `max_retained` - Idle buffers kept per size class
    pub fn new(max_retained: usize) -> Arc<Self> {
        let mut classes = Vec::new();
        let mut size = MIN_BUFFER_SIZE;
        while size <= MAX_POOLED_SIZE {
            classes.push(SizeClass {
                size,
                free: Mutex::new(Vec::new()),
            });
            size *= 2;
        }

        Arc::new(Self {
            classes,
            max_retained,
            rented: AtomicU64::new(0),
            returned: AtomicU64::new(0),
        })
    }

    /// The process-wide pool used by the server and client.
    pub fn shared() -> Arc<Self> {
        static SHARED: OnceLock<Arc<BufferPool>> = OnceLock::new();
        Arc::clone(SHARED.get_or_init(|| BufferPool::new(DEFAULT_MAX_RETAINED)))
    }

    /// Rent a buffer of at least `min_size` bytes.
    ///
    /// The returned buffer's length is its full capacity, which may be
    /// larger than requested.
    pub fn rent(self: &Arc<Self>, min_size: usize) -> RentedBuffer {
        let buf = match self.class_for(min_size) {
            Some(class) => class
                .free
                .lock()
                .pop()
                .unwrap_or_else(|| vec![0u8; class.size]),
            None => vec![0u8; min_size],
        };

        self.rented.fetch_add(1, Ordering::Relaxed);

        RentedBuffer {
            buf,
            pool: Arc::clone(self),
        }
    }

    /// Current rental counters.
    pub fn stats(&self) -> PoolStats {
        // Load `returned` first so a concurrent return can never make
        // `returned` appear larger than `rented`.
        let returned = self.returned.load(Ordering::Acquire);
        let rented = self.rented.load(Ordering::Acquire);
        PoolStats { rented, returned }
    }

    /// Number of idle buffers that would serve a rental of `size` bytes.
    pub fn available(&self, size: usize) -> usize {
        self.class_for(size).map_or(0, |class| class.free.lock().len())
    }

    fn class_for(&self, size: usize) -> Option<&SizeClass> {
        if size > MAX_POOLED_SIZE {
            return None;
        }
        let rounded = size.max(MIN_BUFFER_SIZE).next_power_of_two();
        let idx = (rounded.trailing_zeros() - MIN_BUFFER_SIZE.trailing_zeros()) as usize;
        self.classes.get(idx)
    }

    fn give_back(&self, buf: Vec<u8>) {
        if let Some(class) = self.class_for(buf.len()) {
            if class.size == buf.len() {
                let mut free = class.free.lock();
                if free.len() < self.max_retained {
                    free.push(buf);
                }
            }
        }
        self.returned.fetch_add(1, Ordering::Release);
    }
}

/// A buffer checked out of a `BufferPool`.
///
/// Returned to its pool when dropped.
pub struct RentedBuffer {
    buf: Vec<u8>,
    pool: Arc<BufferPool>,
}

impl RentedBuffer {
    /// Capacity of the rental in bytes.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }
}

impl Deref for RentedBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for RentedBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for RentedBuffer {
    fn drop(&mut self) {
        self.pool.give_back(std::mem::take(&mut self.buf));
    }
}

impl std::fmt::Debug for RentedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RentedBuffer")
            .field("capacity", &self.buf.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rent_rounds_up_to_size_class() {
        let pool = BufferPool::new(4);

        let buf = pool.rent(4096);
        assert_eq!(buf.capacity(), 4096);

        let buf = pool.rent(1000);
        assert_eq!(buf.capacity(), 1024);

        let buf = pool.rent(0);
        assert_eq!(buf.capacity(), MIN_BUFFER_SIZE);
    }

    #[test]
    fn test_return_and_reuse() {
        let pool = BufferPool::new(4);

        let mut buf = pool.rent(1024);
        buf[0] = 42;
        let ptr = buf.as_ptr();
        drop(buf);

        assert_eq!(pool.available(1024), 1);

        // LIFO reuse, contents are not cleared
        let buf = pool.rent(1024);
        assert_eq!(buf.as_ptr(), ptr);
        assert_eq!(buf[0], 42);
        assert_eq!(pool.available(1024), 0);
    }

    #[test]
    fn test_oversize_rental_is_not_retained() {
        let pool = BufferPool::new(4);

        let buf = pool.rent(MAX_POOLED_SIZE + 1);
        assert_eq!(buf.capacity(), MAX_POOLED_SIZE + 1);
        drop(buf);

        assert_eq!(pool.available(MAX_POOLED_SIZE + 1), 0);
        assert_eq!(pool.stats().outstanding(), 0);
    }

    #[test]
    fn test_retention_is_bounded() {
        let pool = BufferPool::new(2);

        let rentals: Vec<_> = (0..5).map(|_| pool.rent(64)).collect();
        assert_eq!(pool.stats().outstanding(), 5);
        drop(rentals);

        assert_eq!(pool.available(64), 2);
        assert_eq!(
            pool.stats(),
            PoolStats {
                rented: 5,
                returned: 5
            }
        );
    }

    #[test]
    fn test_returned_once_on_error_path() {
        fn fails(pool: &Arc<BufferPool>) -> Result<(), &'static str> {
            let _buf = pool.rent(256);
            if pool.stats().rented > 0 {
                return Err("boom");
            }
            Ok(())
        }

        let pool = BufferPool::new(4);
        assert!(fails(&pool).is_err());
        assert!(fails(&pool).is_err());

        let stats = pool.stats();
        assert_eq!(stats.rented, 2);
        assert_eq!(stats.returned, 2);
        assert_eq!(pool.available(256), 1);
    }

    #[test]
    fn test_shared_pool_is_process_wide() {
        let a = BufferPool::shared();
        let b = BufferPool::shared();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_rentals_are_exclusive() {
        let pool = BufferPool::new(16);
        let mut handles = Vec::new();

        for task in 0..64u8 {
            let pool = Arc::clone(&pool);
            handles.push(tokio::spawn(async move {
                for round in 0..50u8 {
                    let mut buf = pool.rent(512);
                    buf.fill(task ^ round);
                    tokio::task::yield_now().await;
                    // Nobody else wrote into our rental while we were parked
                    assert!(buf.iter().all(|&b| b == task ^ round));
                }
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        let stats = pool.stats();
        assert_eq!(stats.rented, 64 * 50);
        assert_eq!(stats.outstanding(), 0);
    }
}
