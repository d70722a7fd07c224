use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};

type Factory<T> = Box<dyn Fn() -> T + Send + Sync>;
type Reset<T> = Box<dyn Fn(&mut T) + Send + Sync>;

/// Bounded free list. Items beyond `capacity` are dropped on return.
pub struct Pool<T> {
    items: Mutex<Vec<T>>,
    capacity: usize,
    factory: Factory<T>,
    reset: Reset<T>,
    created: AtomicU64,
    reused: AtomicU64,
}

impl<T> Pool<T> {
    pub fn new(
        capacity: usize,
        factory: impl Fn() -> T + Send + Sync + 'static,
        reset: impl Fn(&mut T) + Send + Sync + 'static,
    ) -> Self {
        Self {
            items: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
            factory: Box::new(factory),
            reset: Box::new(reset),
            created: AtomicU64::new(0),
            reused: AtomicU64::new(0),
        }
    }

    pub fn take(&self) -> T {
        if let Some(item) = self.items.lock().pop() {
            self.reused.fetch_add(1, Ordering::Relaxed);
            return item;
        }
        self.created.fetch_add(1, Ordering::Relaxed);
        (self.factory)()
    }

    pub fn give(&self, mut item: T) {
        (self.reset)(&mut item);
        let mut items = self.items.lock();
        if items.len() < self.capacity {
            items.push(item);
        }
    }

    /// Borrows an item that returns itself to the pool on drop.
    pub fn get(&self) -> Pooled<'_, T> {
        Pooled {
            pool: self,
            item: Some(self.take()),
        }
    }

    pub fn available(&self) -> usize {
        self.items.lock().len()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            created: self.created.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            available: self.available(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub created: u64,
    pub reused: u64,
    pub available: usize,
}

pub struct Pooled<'a, T> {
    pool: &'a Pool<T>,
    item: Option<T>,
}

impl<T> Deref for Pooled<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Only `drop` takes the item out.
        self.item.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl<T> DerefMut for Pooled<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.item.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl<T> Drop for Pooled<'_, T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.pool.give(item);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};

    fn buffer_pool(capacity: usize) -> Pool<BytesMut> {
        Pool::new(capacity, || BytesMut::with_capacity(64), |b| b.clear())
    }

    #[test]
    fn test_reuse_after_return() {
        let pool = buffer_pool(4);
        {
            let mut buf = pool.get();
            buf.put_slice(b"hello");
        }
        assert_eq!(pool.available(), 1);

        let buf = pool.get();
        assert!(buf.is_empty());
        assert_eq!(pool.stats().created, 1);
        assert_eq!(pool.stats().reused, 1);
    }

    #[test]
    fn test_capacity_bound() {
        let pool = buffer_pool(2);
        let items: Vec<BytesMut> = (0..5).map(|_| pool.take()).collect();
        for item in items {
            pool.give(item);
        }
        assert_eq!(pool.available(), 2);
        assert_eq!(pool.stats().created, 5);
    }

    #[test]
    fn test_shared_across_threads() {
        let pool = buffer_pool(16);
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..100 {
                        let mut buf = pool.get();
                        buf.put_u8(1);
                    }
                });
            }
        });
        let stats = pool.stats();
        assert_eq!(stats.created + stats.reused, 400);
        assert!(stats.available <= 4);
    }
}
