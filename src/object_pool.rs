use std::{collections::VecDeque, fmt, sync::Arc, time::Duration};

use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::error::{Error, Result};

/// A fixed-capacity pool of pre-built objects.
///
/// Every object is created up front; the pool never builds more. In blocking
/// mode [`allocate`](Self::allocate) parks the caller until another thread
/// calls [`release`](Self::release). In non-blocking mode an empty pool is
/// reported immediately, which is how the engine refuses new connections
/// instead of growing without bound.
pub struct BoundedObjectPool<T> {
    inner: Arc<PoolInner<T>>,
}

struct PoolInner<T> {
    free: Mutex<VecDeque<T>>,
    available: Condvar,
    capacity: usize,
    blocking: bool,
}

impl<T> Clone for BoundedObjectPool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> BoundedObjectPool<T> {
    /// Pre-builds `capacity` objects with `create_fn`.
    pub fn new<F>(capacity: usize, blocking: bool, mut create_fn: F) -> Self
    where
        F: FnMut() -> T,
    {
        let mut free = VecDeque::with_capacity(capacity);
        for _ in 0..capacity {
            free.push_back(create_fn());
        }

        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(free),
                available: Condvar::new(),
                capacity,
                blocking,
            }),
        }
    }

    /// Takes an object out of the pool.
    ///
    /// Blocks until one is released when the pool was built in blocking mode;
    /// otherwise returns `None` as soon as the pool is empty.
    pub fn allocate(&self) -> Option<T> {
        let mut free = self.inner.free.lock();
        if self.inner.blocking {
            while free.is_empty() {
                self.inner.available.wait(&mut free);
            }
        }
        free.pop_front()
    }

    /// Non-blocking allocation regardless of the pool's mode.
    pub fn try_allocate(&self) -> Result<T> {
        self.inner
            .free
            .lock()
            .pop_front()
            .ok_or(Error::ResourceExhausted("object pool is empty"))
    }

    /// Waits at most `timeout` for an object.
    pub fn allocate_timeout(&self, timeout: Duration) -> Option<T> {
        let mut free = self.inner.free.lock();
        if free.is_empty() {
            let _ = self
                .inner
                .available
                .wait_while_for(&mut free, |free| free.is_empty(), timeout);
        }
        free.pop_front()
    }

    /// Gives an object back and wakes one waiter.
    ///
    /// Releasing into a full pool means the object never came from it; the
    /// object is dropped so the free count stays within capacity.
    pub fn release(&self, object: T) {
        {
            let mut free = self.inner.free.lock();
            if free.len() >= self.inner.capacity {
                warn!(
                    capacity = self.inner.capacity,
                    "released an object into a full pool, dropping it"
                );
                return;
            }
            free.push_back(object);
        }
        self.inner.available.notify_one();
    }

    /// Allocates behind a guard that releases on drop.
    pub fn acquire(&self) -> Option<PooledObject<T>> {
        self.allocate().map(|object| PooledObject {
            object: Some(object),
            pool: self.clone(),
        })
    }

    /// Number of free objects. Advisory only: it can change right after.
    pub fn space(&self) -> usize {
        self.inner.free.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn is_blocking(&self) -> bool {
        self.inner.blocking
    }
}

impl<T> fmt::Debug for BoundedObjectPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedObjectPool")
            .field("capacity", &self.inner.capacity)
            .field("blocking", &self.inner.blocking)
            .finish()
    }
}

/// A guard that returns the object to its pool when dropped.
pub struct PooledObject<T: Send + 'static> {
    object: Option<T>,
    pool: BoundedObjectPool<T>,
}

impl<T: Send + 'static> PooledObject<T> {
    /// Detaches the object; it will not go back to the pool.
    pub fn take(mut self) -> Option<T> {
        self.object.take()
    }
}

impl<T: Send + 'static> std::ops::Deref for PooledObject<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &Self::Target {
        // only `take` empties the option, and it consumes the guard
        self.object.as_ref().expect("PooledObject is empty")
    }
}

impl<T: Send + 'static> std::ops::DerefMut for PooledObject<T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.object.as_mut().expect("PooledObject is empty")
    }
}

impl<T: Send + 'static> Drop for PooledObject<T> {
    #[inline]
    fn drop(&mut self) {
        if let Some(object) = self.object.take() {
            self.pool.release(object);
        }
    }
}
