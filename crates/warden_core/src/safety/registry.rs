//! # Static Safety Id Registry
//!
//! Interns owner and field names into small integer ids so that diagnostics
//! can name the jobs and fields involved in a conflict. Nothing here affects
//! whether an access is allowed.
//!
//! ## Layout
//!
//! ```text
//! buckets: [head+1][head+1][  0  ][head+1] ...
//!              │       │              │
//!              ▼       ▼              ▼
//! entries:  [ name | next ] [ name | next ] ...   (arena, id == index)
//! ```
//!
//! Lookups walk a bucket's chain without locking. A miss takes the insert
//! lock, walks again, then prepends a fresh entry and publishes it with a
//! release store on the bucket head.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;

use const_fnv1a_hash::fnv1a_hash_32;
use parking_lot::Mutex;

use crate::config::SafetyConfig;
use crate::memory::PersistentArena;

/// Interned diagnostic name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct StaticSafetyId(i32);

impl StaticSafetyId {
    /// No name recorded.
    pub const UNKNOWN: Self = Self(-1);

    /// Wraps a raw id.
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    /// Returns the raw id.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> i32 {
        self.0
    }

    /// Returns true for [`StaticSafetyId::UNKNOWN`].
    #[inline]
    #[must_use]
    pub const fn is_unknown(self) -> bool {
        self.0 < 0
    }
}

impl Default for StaticSafetyId {
    fn default() -> Self {
        Self::UNKNOWN
    }
}

#[derive(Default)]
struct StaticInfo {
    name: OnceLock<Box<[u8]>>,
    /// Next entry in the bucket chain, index + 1.
    next: AtomicU32,
}

/// Process-wide name table.
///
/// # Thread Safety
///
/// Any number of threads may look names up concurrently with one inserter.
/// Inserters are serialized by a mutex.
pub struct StaticSafetyIdRegistry {
    /// Chain heads, index + 1, zero meaning empty.
    buckets: Box<[AtomicU32]>,
    entries: PersistentArena<StaticInfo>,
    insert_lock: Mutex<()>,
    max_name_len: usize,
}

impl StaticSafetyIdRegistry {
    /// Creates an empty table sized from `config`.
    ///
    /// # Panics
    ///
    /// Panics if the registry sizes in `config` are zero. Validated configs
    /// never are.
    #[must_use]
    pub fn new(config: &SafetyConfig) -> Self {
        let buckets: Vec<AtomicU32> = (0..config.registry_buckets.next_power_of_two())
            .map(|_| AtomicU32::new(0))
            .collect();

        Self {
            buckets: buckets.into_boxed_slice(),
            entries: PersistentArena::new(config.registry_chunk_size, config.max_registry_chunks),
            insert_lock: Mutex::new(()),
            max_name_len: config.max_static_name_len,
        }
    }

    /// Returns the id for `name`, interning it on first use.
    ///
    /// Empty names, names longer than the configured maximum and inserts into
    /// a full table all yield [`StaticSafetyId::UNKNOWN`].
    pub fn get_or_create(&self, name: &[u8]) -> StaticSafetyId {
        if name.is_empty() {
            return StaticSafetyId::UNKNOWN;
        }
        if name.len() > self.max_name_len {
            tracing::warn!(
                len = name.len(),
                max = self.max_name_len,
                "static safety name too long, using unknown id"
            );
            return StaticSafetyId::UNKNOWN;
        }

        let bucket = &self.buckets[self.bucket_of(name)];
        if let Some(id) = self.find(bucket, name) {
            return id;
        }

        let _guard = self.insert_lock.lock();
        if let Some(id) = self.find(bucket, name) {
            return id;
        }

        let Some(index) = self.entries.push_default() else {
            tracing::warn!(capacity = self.entries.capacity(), "static safety id table full");
            return StaticSafetyId::UNKNOWN;
        };
        let Some(entry) = self.entries.get(index) else {
            return StaticSafetyId::UNKNOWN;
        };
        let _ = entry.name.set(name.into());
        entry
            .next
            .store(bucket.load(Ordering::Acquire), Ordering::Relaxed);
        bucket.store(index + 1, Ordering::Release);

        tracing::debug!(id = index, name = %String::from_utf8_lossy(name), "interned static safety id");
        i32::try_from(index).map_or(StaticSafetyId::UNKNOWN, StaticSafetyId)
    }

    /// Returns the id for the type name of `T`.
    pub fn get_or_create_for<T: ?Sized>(&self) -> StaticSafetyId {
        self.get_or_create(std::any::type_name::<T>().as_bytes())
    }

    /// Returns the name interned under `id`.
    #[must_use]
    pub fn name_of(&self, id: StaticSafetyId) -> Option<&[u8]> {
        let index = u32::try_from(id.raw()).ok()?;
        self.entries.get(index)?.name.get().map(|name| &**name)
    }

    /// Returns the number of interned names.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing has been interned.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    fn bucket_of(&self, name: &[u8]) -> usize {
        fnv1a_hash_32(name, None) as usize & (self.buckets.len() - 1)
    }

    fn find(&self, bucket: &AtomicU32, name: &[u8]) -> Option<StaticSafetyId> {
        let mut link = bucket.load(Ordering::Acquire);
        while link != 0 {
            let index = link - 1;
            let entry = self.entries.get(index)?;
            if entry.name.get().is_some_and(|stored| **stored == *name) {
                return i32::try_from(index).ok().map(StaticSafetyId);
            }
            link = entry.next.load(Ordering::Relaxed);
        }
        None
    }
}
