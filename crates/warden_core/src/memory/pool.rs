//! # Pool Allocator
//!
//! Fixed-size slot recycler for records that must outlive every reference to
//! them, such as safety nodes.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use super::arena::PersistentArena;

/// Low half of the free-list head: slot index + 1, zero meaning empty.
const LINK_MASK: u64 = 0xFFFF_FFFF;

/// A slot that can sit on the pool's free list.
///
/// The pool threads its free list through the slots themselves, so each slot
/// carries one link word the pool owns while the slot is free.
pub trait PoolSlot: Default + Send + Sync {
    /// Returns the link word used while the slot is on the free list.
    fn free_link(&self) -> &AtomicU32;
}

/// A pool allocator for fixed-size slots backed by a [`PersistentArena`].
///
/// Released slots are pushed on a lock-free stack and handed out again by
/// later acquisitions. Slots are never freed or zeroed by the pool: their
/// contents survive release untouched, and the memory stays valid until the
/// pool is dropped.
///
/// # Thread Safety
///
/// `acquire` and `release` may race from any number of threads. The stack
/// head packs a 32-bit tag next to the top index and every successful update
/// bumps the tag, so a pop that read a stale `next` link cannot succeed (ABA).
///
/// # Example
///
/// ```rust,ignore
/// let pool: PoolAllocator<SafetyNode> = PoolAllocator::new(1024, 16);
///
/// let handle = pool.acquire()?;
/// pool.release(handle);
/// assert_eq!(pool.acquire(), Some(handle)); // Same slot reused
/// ```
pub struct PoolAllocator<T: PoolSlot> {
    /// The slot storage.
    arena: PersistentArena<T>,
    /// Free stack head: tag in the high half, link in the low half.
    head: AtomicU64,
    /// Slots pushed on the free stack and not yet popped. Counted before the
    /// push publishes, so it never trails the stack.
    free_count: AtomicUsize,
    /// Set by `drain`. A closed pool hands out nothing.
    closed: AtomicBool,
}

/// Handle to a slot in a pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolHandle {
    /// Index into the pool.
    index: u32,
}

impl PoolHandle {
    /// Returns the slot index.
    #[inline]
    #[must_use]
    pub const fn index(self) -> u32 {
        self.index
    }
}

impl<T: PoolSlot> PoolAllocator<T> {
    /// Creates an empty pool.
    ///
    /// # Arguments
    ///
    /// * `chunk_size` - Slots allocated at a time when the free list is empty
    /// * `max_chunks` - Upper bound on the number of chunks
    #[must_use]
    pub fn new(chunk_size: usize, max_chunks: usize) -> Self {
        Self {
            arena: PersistentArena::new(chunk_size, max_chunks),
            head: AtomicU64::new(0),
            free_count: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Returns the maximum number of slots.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.arena.capacity()
    }

    /// Returns the number of slots ever created.
    #[inline]
    #[must_use]
    pub fn allocated_count(&self) -> usize {
        self.arena.len()
    }

    /// Returns the number of slots waiting on the free list.
    ///
    /// A release in flight is already counted, so under contention this can
    /// run ahead of the stack by the number of racing releases.
    #[inline]
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.free_count.load(Ordering::Acquire)
    }

    /// Returns the number of slots currently handed out.
    ///
    /// Exact once releases have settled.
    #[inline]
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.allocated_count().saturating_sub(self.free_count())
    }

    /// Takes a slot, reusing a released one when available.
    ///
    /// The slot's previous contents are left as they were.
    ///
    /// # Returns
    ///
    /// A handle to the slot, or None if the pool is exhausted or drained.
    pub fn acquire(&self) -> Option<PoolHandle> {
        if self.is_closed() {
            return None;
        }
        if let Some(handle) = self.pop() {
            return Some(handle);
        }
        self.arena.push_default().map(|index| PoolHandle { index })
    }

    /// Returns a slot to the free list.
    ///
    /// Releasing the same handle twice without an acquire in between corrupts
    /// the free list. Callers guard against that with their own bookkeeping
    /// (safety nodes do it through their version numbers).
    pub fn release(&self, handle: PoolHandle) {
        if self.is_closed() {
            return;
        }
        let Some(slot) = self.arena.get(handle.index) else {
            return;
        };

        self.free_count.fetch_add(1, Ordering::AcqRel);
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            slot.free_link().store(link_of(head), Ordering::Release);
            let next = pack(next_tag(head), handle.index + 1);
            match self
                .head
                .compare_exchange_weak(head, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(current) => head = current,
            }
        }
    }

    /// Gets a slot by handle.
    #[inline]
    #[must_use]
    pub fn get(&self, handle: PoolHandle) -> Option<&T> {
        self.arena.get(handle.index)
    }

    /// Closes the pool and pops every slot off the free list.
    ///
    /// Used at shutdown. Later acquisitions fail and later releases are
    /// ignored. Slots stay dereferenceable for anyone still holding a
    /// reference; the chunks are freed when the pool drops.
    ///
    /// # Returns
    ///
    /// The number of slots drained.
    pub fn drain(&self) -> usize {
        self.closed.store(true, Ordering::Release);
        let mut drained = 0;
        while self.pop().is_some() {
            drained += 1;
        }
        drained
    }

    /// Returns true once the pool has been drained.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn pop(&self) -> Option<PoolHandle> {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            let link = link_of(head);
            if link == 0 {
                return None;
            }
            let index = link - 1;
            let next_link = self.arena.get(index)?.free_link().load(Ordering::Acquire);
            let next = pack(next_tag(head), next_link);
            match self
                .head
                .compare_exchange_weak(head, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    self.free_count.fetch_sub(1, Ordering::AcqRel);
                    return Some(PoolHandle { index });
                }
                Err(current) => head = current,
            }
        }
    }
}

#[inline]
fn link_of(head: u64) -> u32 {
    (head & LINK_MASK) as u32
}

#[inline]
fn next_tag(head: u64) -> u32 {
    ((head >> 32) as u32).wrapping_add(1)
}

#[inline]
fn pack(tag: u32, link: u32) -> u64 {
    (u64::from(tag) << 32) | u64::from(link)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[derive(Default)]
    struct Slot {
        link: AtomicU32,
        value: AtomicU32,
    }

    impl PoolSlot for Slot {
        fn free_link(&self) -> &AtomicU32 {
            &self.link
        }
    }

    #[test]
    fn test_pool_acquire_release() {
        let pool: PoolAllocator<Slot> = PoolAllocator::new(8, 2);

        let h1 = pool.acquire().unwrap();
        pool.get(h1).unwrap().value.store(42, Ordering::Relaxed);
        assert_eq!(pool.live_count(), 1);

        pool.release(h1);
        assert_eq!(pool.live_count(), 0);
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn test_pool_full() {
        let pool: PoolAllocator<Slot> = PoolAllocator::new(1, 2);

        let _ = pool.acquire().unwrap();
        let _ = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());
    }

    #[test]
    fn test_pool_reuse_keeps_contents() {
        let pool: PoolAllocator<Slot> = PoolAllocator::new(4, 1);

        let h1 = pool.acquire().unwrap();
        pool.get(h1).unwrap().value.store(7, Ordering::Relaxed);
        pool.release(h1);

        let h2 = pool.acquire().unwrap();
        assert_eq!(h1, h2); // Same slot reused
        assert_eq!(pool.get(h2).unwrap().value.load(Ordering::Relaxed), 7);
    }

    #[test]
    fn test_pool_lifo_order() {
        let pool: PoolAllocator<Slot> = PoolAllocator::new(4, 1);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.acquire(), Some(b));
        assert_eq!(pool.acquire(), Some(a));
    }

    #[test]
    fn test_pool_drain() {
        let pool: PoolAllocator<Slot> = PoolAllocator::new(4, 1);
        let handles: Vec<_> = (0..3).map(|_| pool.acquire().unwrap()).collect();
        for handle in handles {
            pool.release(handle);
        }
        assert_eq!(pool.drain(), 3);
        assert_eq!(pool.free_count(), 0);
        assert_eq!(pool.drain(), 0);
    }

    #[test]
    fn test_drained_pool_hands_out_nothing() {
        let pool: PoolAllocator<Slot> = PoolAllocator::new(4, 2);
        let kept = pool.acquire().unwrap();
        pool.drain();

        assert!(pool.is_closed());
        assert!(pool.acquire().is_none());
        assert_eq!(pool.allocated_count(), 1);

        // A late release does not put the slot back into circulation.
        pool.release(kept);
        assert_eq!(pool.free_count(), 0);
        assert!(pool.acquire().is_none());
        assert!(pool.get(kept).is_some());
    }

    #[test]
    fn test_free_count_never_underflows_under_contention() {
        let pool: Arc<PoolAllocator<Slot>> = Arc::new(PoolAllocator::new(8, 8));
        let seed: Vec<_> = (0..8).map(|_| pool.acquire().unwrap()).collect();
        for handle in seed {
            pool.release(handle);
        }

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || {
                    for _ in 0..5_000 {
                        if let Some(handle) = pool.acquire() {
                            assert!(pool.free_count() <= pool.allocated_count());
                            pool.release(handle);
                        }
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(pool.free_count(), pool.allocated_count());
        assert_eq!(pool.live_count(), 0);
    }

    #[test]
    fn test_pool_concurrent_never_hands_out_twice() {
        let pool: Arc<PoolAllocator<Slot>> = Arc::new(PoolAllocator::new(64, 64));

        let threads: Vec<_> = (0..8u32)
            .map(|thread| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || {
                    for round in 0..2_000u32 {
                        let handle = pool.acquire().unwrap();
                        let slot = pool.get(handle).unwrap();
                        let stamp = thread * 1_000_000 + round;
                        slot.value.store(stamp, Ordering::Relaxed);
                        std::hint::spin_loop();
                        // Nobody else may hold this slot while we do.
                        assert_eq!(slot.value.load(Ordering::Relaxed), stamp);
                        pool.release(handle);
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(pool.live_count(), 0);
        let mut seen = HashSet::new();
        while let Some(handle) = pool.acquire() {
            if !seen.insert(handle) {
                panic!("slot {handle:?} handed out twice");
            }
            if seen.len() == pool.allocated_count() {
                break;
            }
        }
    }
}
