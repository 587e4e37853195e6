//! # Persistent Arena
//!
//! Chunked, append-only storage whose slots never move and are never freed
//! before the arena itself is dropped.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

/// An append-only arena of `T` slots addressed by stable `u32` indices.
///
/// Slots are handed out in order. Chunks of `chunk_size` slots are allocated
/// on demand the first time an index inside them is reserved, and stay put
/// until the arena is dropped. Any index ever returned by [`push_default`]
/// therefore stays dereferenceable for the life of the arena.
///
/// # Thread Safety
///
/// Reservation is a single atomic bump. Lookup is lock-free: it only reads an
/// already-published chunk.
///
/// # Example
///
/// ```rust,ignore
/// let arena: PersistentArena<AtomicU32> = PersistentArena::new(64, 16);
///
/// let index = arena.push_default().unwrap();
/// arena.get(index).unwrap().store(7, Ordering::Relaxed);
/// ```
///
/// [`push_default`]: PersistentArena::push_default
pub struct PersistentArena<T> {
    /// Chunk directory. Each entry is filled at most once.
    chunks: Box<[OnceLock<Box<[T]>>]>,
    /// Slots per chunk.
    chunk_size: usize,
    /// Number of slots handed out so far.
    len: AtomicUsize,
}

impl<T: Default> PersistentArena<T> {
    /// Creates an empty arena.
    ///
    /// No slot storage is allocated until the first reservation.
    ///
    /// # Arguments
    ///
    /// * `chunk_size` - Slots per chunk
    /// * `max_chunks` - Upper bound on the number of chunks
    ///
    /// # Panics
    ///
    /// Panics if either argument is zero.
    #[must_use]
    pub fn new(chunk_size: usize, max_chunks: usize) -> Self {
        assert!(chunk_size > 0, "Chunk size must be greater than zero");
        assert!(max_chunks > 0, "Chunk count must be greater than zero");

        let chunks: Vec<OnceLock<Box<[T]>>> = (0..max_chunks).map(|_| OnceLock::new()).collect();

        Self {
            chunks: chunks.into_boxed_slice(),
            chunk_size,
            len: AtomicUsize::new(0),
        }
    }

    /// Returns the maximum number of slots this arena can hand out.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.chunk_size * self.chunks.len()
    }

    /// Returns the number of slots handed out.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// Returns true if no slot was ever handed out.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of chunks that have been allocated.
    #[must_use]
    pub fn allocated_chunks(&self) -> usize {
        self.chunks.iter().filter(|chunk| chunk.get().is_some()).count()
    }

    /// Reserves the next slot, allocating its chunk if needed.
    ///
    /// # Returns
    ///
    /// The index of the new slot, or None if the arena is full.
    pub fn push_default(&self) -> Option<u32> {
        let capacity = self.capacity();
        let index = self
            .len
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |len| {
                (len < capacity).then_some(len + 1)
            })
            .ok()?;
        let index = u32::try_from(index).ok()?;

        let chunk_index = index as usize / self.chunk_size;
        self.chunks[chunk_index].get_or_init(|| {
            tracing::debug!(chunk = chunk_index, slots = self.chunk_size, "arena chunk allocated");
            (0..self.chunk_size).map(|_| T::default()).collect()
        });

        Some(index)
    }

    /// Gets a slot by index.
    ///
    /// # Arguments
    ///
    /// * `index` - An index previously returned by `push_default`
    #[inline]
    #[must_use]
    pub fn get(&self, index: u32) -> Option<&T> {
        let index = index as usize;
        self.chunks
            .get(index / self.chunk_size)?
            .get()?
            .get(index % self.chunk_size)
    }
}
