//! # Safety Nodes
//!
//! One node per live buffer. A node carries two version words and a flag word.
//! It also keeps a debug log of the jobs that last touched the buffer.
//!
//! ## Version word layout
//!
//! ```text
//!  31                                   4   3   2   1   0
//! ┌──────────────────────────────────────┬───┬───┬───┬───┐
//! │            generation                │ S │ D │ W │ R │
//! └──────────────────────────────────────┴───┴───┴───┴───┘
//!   R/W/D = read/write/dispose protect, S = secondary version marker
//! ```
//!
//! `version1` always carries `S`, `version0` never does. A handle compares its
//! snapshot against whichever word its own `S` bit selects.

use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::{Mutex, MutexGuard};

use crate::error::{SafetyError, SafetyResult};
use crate::jobs::Fence;
use crate::memory::{PoolAllocator, PoolHandle, PoolSlot};

use super::registry::StaticSafetyId;

/// Reads are blocked.
pub const READ_PROTECT: u32 = 1 << 0;
/// Writes are blocked.
pub const WRITE_PROTECT: u32 = 1 << 1;
/// Disposal is blocked.
pub const DISPOSE_PROTECT: u32 = 1 << 2;
/// Read and write protect together.
pub const READ_WRITE_PROTECT: u32 = READ_PROTECT | WRITE_PROTECT;
/// All three protection bits.
pub const READ_WRITE_DISPOSE_PROTECT: u32 = READ_WRITE_PROTECT | DISPOSE_PROTECT;
/// Marks a version word (or handle snapshot) as the secondary version.
pub const SECONDARY_VERSION: u32 = 1 << 3;
/// One generation step.
pub const VERSION_INC: u32 = 1 << 4;

/// The secondary view may be written.
pub const ALLOW_SECONDARY_WRITING: u32 = 1 << 0;
/// The node has been initialized at least once.
pub const IS_INIT: u32 = 1 << 1;
/// The buffer may be disposed.
pub const ALLOW_DISPOSE: u32 = 1 << 2;
/// Scheduling a primary-version writer invalidates secondary snapshots.
pub const BUMP_SECONDARY_VERSION_ON_SCHEDULE_WRITE: u32 = 1 << 3;
/// Bits every real node carries. Shadow copies have them cleared.
pub const MAGIC: u32 = ((1 << 24) - 1) << 4;

/// Index of a node in the pool.
pub type NodeId = PoolHandle;

/// The pool every node lives in.
pub type SafetyNodePool = PoolAllocator<SafetyNode>;

/// Who touched a buffer, recorded at schedule time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferDebugData {
    /// Fence of the job.
    pub fence: Fence,
    /// The job was scheduled against the secondary view.
    pub scheduled_with_secondary: bool,
    /// Name id of the job.
    pub job: StaticSafetyId,
    /// Name id of the job field holding the buffer.
    pub field: StaticSafetyId,
}

impl Default for BufferDebugData {
    fn default() -> Self {
        Self {
            fence: Fence::NONE,
            scheduled_with_secondary: false,
            job: StaticSafetyId::UNKNOWN,
            field: StaticSafetyId::UNKNOWN,
        }
    }
}

/// Writer and readers of record for one node.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AccessLog {
    /// Last scheduled writer.
    pub writer: BufferDebugData,
    /// Scheduled readers not yet pruned.
    pub readers: Vec<BufferDebugData>,
}

impl AccessLog {
    /// Forgets every recorded job and frees the reader storage.
    pub fn clear(&mut self) {
        self.writer = BufferDebugData::default();
        self.readers = Vec::new();
    }

    /// Returns the writer fence and every reader fence.
    #[must_use]
    pub fn fences(&self) -> (Fence, Vec<Fence>) {
        (self.writer.fence, self.readers.iter().map(|r| r.fence).collect())
    }
}

/// Job-local copy of a node's permission words.
///
/// A running job checks its accesses against this copy so it never touches
/// the shared node. `MAGIC` is cleared in `flags`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct LocalPermissions {
    /// Primary version word.
    pub version0: u32,
    /// Secondary version word.
    pub version1: u32,
    /// Flag word without the magic bits.
    pub flags: u32,
}

impl LocalPermissions {
    /// Returns the version word a snapshot with `secondary` set compares to.
    #[inline]
    #[must_use]
    pub const fn version(&self, secondary: bool) -> u32 {
        if secondary {
            self.version1
        } else {
            self.version0
        }
    }
}

/// Versioned permission record for one buffer.
///
/// Nodes are only created by the pool and never freed while the pool lives.
/// Release bumps the generation instead, which invalidates every handle that
/// still holds the old one.
///
/// # Thread Safety
///
/// Version and flag words are atomics so workers can read them while the
/// owner thread updates them. The access log sits behind a mutex.
#[derive(Debug, Default)]
pub struct SafetyNode {
    next_free: AtomicU32,
    version0: AtomicU32,
    version1: AtomicU32,
    flags: AtomicU32,
    log: Mutex<AccessLog>,
}

impl PoolSlot for SafetyNode {
    fn free_link(&self) -> &AtomicU32 {
        &self.next_free
    }
}

impl SafetyNode {
    /// Prepares a node fresh out of the pool.
    ///
    /// First use stamps the magic bits and the starting versions. Reuse keeps
    /// the generation reached by the last release.
    ///
    /// # Errors
    ///
    /// Returns `SafetyError::Corrupted` if the magic bits are missing or a
    /// protection bit survived the last release.
    pub(crate) fn init(&self) -> SafetyResult<()> {
        if self.flags() & IS_INIT == 0 {
            self.version0.store(0, Ordering::Release);
            self.version1.store(SECONDARY_VERSION, Ordering::Release);
            self.flags.store(MAGIC | IS_INIT, Ordering::Release);
        }

        if self.flags() & MAGIC != MAGIC
            || self.version0() & READ_WRITE_DISPOSE_PROTECT != 0
            || self.version1() & READ_WRITE_DISPOSE_PROTECT != 0
        {
            return Err(SafetyError::Corrupted);
        }

        self.flags
            .fetch_or(ALLOW_DISPOSE | ALLOW_SECONDARY_WRITING, Ordering::AcqRel);
        self.flags
            .fetch_and(!BUMP_SECONDARY_VERSION_ON_SCHEDULE_WRITE, Ordering::AcqRel);
        self.log.lock().clear();
        Ok(())
    }

    /// Clears protection, advances both generations and forgets the log.
    pub(crate) fn retire(&self) {
        for word in [&self.version0, &self.version1] {
            let current = word.load(Ordering::Acquire);
            word.store(
                (current & !READ_WRITE_DISPOSE_PROTECT).wrapping_add(VERSION_INC),
                Ordering::Release,
            );
        }
        self.log.lock().clear();
    }

    /// Returns the primary version word.
    #[inline]
    #[must_use]
    pub fn version0(&self) -> u32 {
        self.version0.load(Ordering::Acquire)
    }

    /// Returns the secondary version word.
    #[inline]
    #[must_use]
    pub fn version1(&self) -> u32 {
        self.version1.load(Ordering::Acquire)
    }

    /// Returns the version word selected by `secondary`.
    #[inline]
    #[must_use]
    pub fn version(&self, secondary: bool) -> u32 {
        if secondary {
            self.version1()
        } else {
            self.version0()
        }
    }

    /// Returns the flag word.
    #[inline]
    #[must_use]
    pub fn flags(&self) -> u32 {
        self.flags.load(Ordering::Acquire)
    }

    /// Returns true if every bit of `flag` is set.
    #[inline]
    #[must_use]
    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags() & flag == flag
    }

    pub(crate) fn set_flag(&self, flag: u32, on: bool) {
        if on {
            self.flags.fetch_or(flag, Ordering::AcqRel);
        } else {
            self.flags.fetch_and(!flag, Ordering::AcqRel);
        }
    }

    /// Sets `bits` on both version words.
    pub(crate) fn protect(&self, bits: u32) {
        self.version0.fetch_or(bits, Ordering::AcqRel);
        self.version1.fetch_or(bits, Ordering::AcqRel);
    }

    /// Sets `bits` on the secondary version word only.
    pub(crate) fn protect_secondary(&self, bits: u32) {
        self.version1.fetch_or(bits, Ordering::AcqRel);
    }

    /// Clears `bits` on the primary word, and on the secondary word too when
    /// `secondary` is set.
    pub(crate) fn unprotect(&self, bits: u32, secondary: bool) {
        self.version0.fetch_and(!bits, Ordering::AcqRel);
        if secondary {
            self.version1.fetch_and(!bits, Ordering::AcqRel);
        }
    }

    /// Advances the secondary generation, keeping its protection bits.
    pub(crate) fn bump_secondary(&self) {
        // Only the owner thread writes version words, so a plain
        // read-modify-write cannot lose an update.
        let current = self.version1();
        self.version1
            .store(current.wrapping_add(VERSION_INC), Ordering::Release);
    }

    /// Locks the access log.
    pub fn log(&self) -> MutexGuard<'_, AccessLog> {
        self.log.lock()
    }

    /// Returns a job-local copy of the permission words with `MAGIC` cleared.
    #[must_use]
    pub fn local_permissions(&self) -> LocalPermissions {
        LocalPermissions {
            version0: self.version0(),
            version1: self.version1(),
            flags: self.flags() ^ MAGIC,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_masks_do_not_overlap() {
        assert_eq!(READ_WRITE_DISPOSE_PROTECT & SECONDARY_VERSION, 0);
        assert_eq!((READ_WRITE_DISPOSE_PROTECT | SECONDARY_VERSION) & VERSION_INC, 0);
        assert_eq!(MAGIC & (ALLOW_SECONDARY_WRITING | IS_INIT | ALLOW_DISPOSE), 0);
        assert_eq!(MAGIC & BUMP_SECONDARY_VERSION_ON_SCHEDULE_WRITE, 0);
    }

    #[test]
    fn test_first_init() {
        let node = SafetyNode::default();
        node.init().unwrap();

        assert_eq!(node.version0(), 0);
        assert_eq!(node.version1(), SECONDARY_VERSION);
        assert!(node.has_flag(MAGIC | IS_INIT | ALLOW_DISPOSE | ALLOW_SECONDARY_WRITING));
        assert!(!node.has_flag(BUMP_SECONDARY_VERSION_ON_SCHEDULE_WRITE));
    }

    #[test]
    fn test_retire_advances_both_generations() {
        let node = SafetyNode::default();
        node.init().unwrap();
        node.protect(READ_WRITE_DISPOSE_PROTECT);
        node.log().readers.push(BufferDebugData::default());

        node.retire();
        assert_eq!(node.version0(), VERSION_INC);
        assert_eq!(node.version1(), SECONDARY_VERSION | VERSION_INC);
        assert!(node.log().readers.is_empty());

        // Reinit keeps the generation.
        node.init().unwrap();
        assert_eq!(node.version0(), VERSION_INC);
    }

    #[test]
    fn test_init_rejects_protected_node() {
        let node = SafetyNode::default();
        node.init().unwrap();
        node.protect(WRITE_PROTECT);
        assert_eq!(node.init(), Err(SafetyError::Corrupted));
    }

    #[test]
    fn test_init_rejects_missing_magic() {
        let node = SafetyNode::default();
        node.init().unwrap();
        node.set_flag(MAGIC, false);
        assert_eq!(node.init(), Err(SafetyError::Corrupted));
    }

    #[test]
    fn test_init_resets_policy_flags() {
        let node = SafetyNode::default();
        node.init().unwrap();
        node.set_flag(ALLOW_DISPOSE, false);
        node.set_flag(BUMP_SECONDARY_VERSION_ON_SCHEDULE_WRITE, true);
        node.retire();

        node.init().unwrap();
        assert!(node.has_flag(ALLOW_DISPOSE));
        assert!(!node.has_flag(BUMP_SECONDARY_VERSION_ON_SCHEDULE_WRITE));
    }

    #[test]
    fn test_unprotect_secondary_is_optional() {
        let node = SafetyNode::default();
        node.init().unwrap();
        node.protect(WRITE_PROTECT);

        node.unprotect(WRITE_PROTECT, false);
        assert_eq!(node.version0() & WRITE_PROTECT, 0);
        assert_eq!(node.version1() & WRITE_PROTECT, WRITE_PROTECT);

        node.unprotect(WRITE_PROTECT, true);
        assert_eq!(node.version1() & WRITE_PROTECT, 0);
    }

    #[test]
    fn test_local_permissions_strip_magic() {
        let node = SafetyNode::default();
        node.init().unwrap();
        let local = node.local_permissions();
        assert_eq!(local.flags & MAGIC, 0);
        assert_eq!(local.flags & IS_INIT, IS_INIT);
        assert_eq!(local.version(true), node.version1());
    }
}
