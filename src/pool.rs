//! Object pools with explicit checkout/return.
//!
//! A [`Pool`] hands out [`Pooled`] guards. Dropping a guard resets the object and puts it back,
//! unless the pool already holds `capacity` idle objects, in which case the object is freed. An
//! empty pool never blocks: it allocates a fresh object instead.
use std::{
    fmt,
    ops::{Deref, DerefMut},
    sync::{Arc, Mutex, PoisonError},
};

use log::trace;

type Factory<T> = Box<dyn Fn() -> T + Send + Sync>;
type Reset<T> = Box<dyn Fn(&mut T) + Send + Sync>;

struct PoolInner<T> {
    idle: Mutex<Vec<T>>,
    capacity: usize,
    factory: Factory<T>,
    reset: Reset<T>,
}

pub struct Pool<T> {
    inner: Arc<PoolInner<T>>,
}

impl<T> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Pool<T> {
    /// Number of objects ready to be checked out.
    pub fn idle(&self) -> usize {
        self.inner
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }
}

impl<T> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("capacity", &self.inner.capacity)
            .field("idle", &self.idle())
            .finish()
    }
}

impl<T: Send + 'static> Pool<T> {
    /// Creates a pool pre-filled with `capacity` objects.
    pub fn new<F, R>(capacity: usize, factory: F, reset: R) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
        R: Fn(&mut T) + Send + Sync + 'static,
    {
        let idle = (0..capacity).map(|_| factory()).collect();
        Self {
            inner: Arc::new(PoolInner {
                idle: Mutex::new(idle),
                capacity,
                factory: Box::new(factory),
                reset: Box::new(reset),
            }),
        }
    }

    pub fn checkout(&self) -> Pooled<T> {
        let item = self
            .inner
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();

        let item = match item {
            Some(item) => item,
            None => {
                trace!("pool exhausted, allocating a temporary object");
                (self.inner.factory)()
            }
        };

        Pooled {
            item: Some(item),
            pool: Arc::clone(&self.inner),
        }
    }

}

/// An object checked out of a [`Pool`].
pub struct Pooled<T> {
    item: Option<T>,
    pool: Arc<PoolInner<T>>,
}

impl<T> Pooled<T> {
    /// Takes the object out of the pool's custody for good.
    pub fn detach(mut self) -> T {
        match self.item.take() {
            Some(item) => item,
            None => unreachable!("pooled object is only taken on detach or drop"),
        }
    }
}

impl<T> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.item {
            Some(item) => item,
            None => unreachable!("pooled object is only taken on detach or drop"),
        }
    }
}

impl<T> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.item {
            Some(item) => item,
            None => unreachable!("pooled object is only taken on detach or drop"),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pooled").field(&self.item).finish()
    }
}

impl<T> Drop for Pooled<T> {
    fn drop(&mut self) {
        let Some(mut item) = self.item.take() else {
            return;
        };

        (self.pool.reset)(&mut item);
        let mut idle = self
            .pool
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if idle.len() < self.pool.capacity {
            idle.push(item);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffers(capacity: usize) -> Pool<Vec<u8>> {
        Pool::new(capacity, || vec![0; 8], |buf| buf.fill(0))
    }

    #[test]
    fn checkout_and_return() {
        let pool = buffers(2);
        assert_eq!(pool.idle(), 2);

        let mut a = pool.checkout();
        a[0] = 7;
        assert_eq!(pool.idle(), 1);

        drop(a);
        assert_eq!(pool.idle(), 2);

        // returned buffers are reset
        let a = pool.checkout();
        let b = pool.checkout();
        assert!(a.iter().all(|b| *b == 0));
        assert!(b.iter().all(|b| *b == 0));
    }

    #[test]
    fn empty_pool_allocates() {
        let pool = buffers(1);
        let a = pool.checkout();
        let b = pool.checkout();
        assert_eq!(pool.idle(), 0);

        drop(a);
        drop(b);
        // never grows past its capacity
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn detached_objects_do_not_return() {
        let pool = buffers(1);
        let buf = pool.checkout().detach();
        assert_eq!(buf.len(), 8);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn debug_shows_capacity_and_idle() {
        let pool = buffers(3);
        let _held = pool.checkout();
        assert_eq!(format!("{pool:?}"), "Pool { capacity: 3, idle: 2 }");
    }
}
