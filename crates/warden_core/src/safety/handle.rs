//! # Safety Handles
//!
//! The copyable capability containers hold. A handle names a node and carries
//! the version it expects to find there; any mismatch means the buffer was
//! disposed or its permissions changed since the snapshot was taken.

use crate::error::{SafetyError, SafetyResult};

use super::node::{
    LocalPermissions, NodeId, SafetyNode, SafetyNodePool, DISPOSE_PROTECT, MAGIC, READ_PROTECT,
    READ_WRITE_DISPOSE_PROTECT, READ_WRITE_PROTECT, SECONDARY_VERSION, WRITE_PROTECT,
};
use super::registry::StaticSafetyId;

/// Mask a snapshot must match for reads: everything but the write and
/// dispose bits.
const VERSION_AND_READ_PROTECT: u32 = !(WRITE_PROTECT | DISPOSE_PROTECT);
/// Mask a snapshot must match for writes.
const VERSION_AND_WRITE_PROTECT: u32 = !(READ_PROTECT | DISPOSE_PROTECT);
/// Mask a snapshot must match for disposal.
const VERSION_AND_DISPOSE_PROTECT: u32 = !READ_WRITE_PROTECT;

/// What a handle points at.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum NodeTarget {
    /// No node, as in a default-constructed container.
    #[default]
    Unassigned,
    /// A shared node in the pool.
    Direct(NodeId),
    /// A job-local copy of a node's permissions.
    ///
    /// `original` is only used to find the real node again at release.
    LocalShadow {
        /// The node the copy was taken from.
        original: NodeId,
        /// The copied permission words.
        local: LocalPermissions,
    },
}

/// Access granted to a job-local shadow.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PatchMode {
    /// Reads only.
    ReadOnly,
    /// Writes only.
    WriteOnly,
    /// Reads and writes.
    ReadWrite,
}

impl PatchMode {
    const fn apply(self, version: u32) -> u32 {
        match self {
            Self::ReadOnly => (version & !READ_PROTECT) | WRITE_PROTECT | DISPOSE_PROTECT,
            Self::WriteOnly => (version & !WRITE_PROTECT) | READ_PROTECT | DISPOSE_PROTECT,
            Self::ReadWrite => (version & !READ_WRITE_PROTECT) | DISPOSE_PROTECT,
        }
    }
}

/// A versioned reference to a safety node.
///
/// Handles are plain values: copying one is free and dropping one does
/// nothing. Only an explicit release retires the node behind it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct SafetyHandle {
    pub(crate) target: NodeTarget,
    pub(crate) version: u32,
    pub(crate) static_safety_id: StaticSafetyId,
}

impl SafetyHandle {
    /// Takes a node from the pool and returns a handle on its primary version.
    ///
    /// # Errors
    ///
    /// Returns `PoolExhausted` if no node is free, or `Corrupted` if the
    /// recycled node fails its integrity check.
    pub(crate) fn create(pool: &SafetyNodePool) -> SafetyResult<Self> {
        let id = pool.acquire().ok_or(SafetyError::PoolExhausted {
            capacity: pool.capacity(),
        })?;
        let node = pool.get(id).ok_or(SafetyError::Corrupted)?;
        node.init()?;

        Ok(Self {
            target: NodeTarget::Direct(id),
            version: node.version0(),
            static_safety_id: StaticSafetyId::UNKNOWN,
        })
    }

    /// Retires the node and returns it to the pool.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyReleased` if the handle is stale or unassigned, and
    /// `Corrupted` if it is a job-local shadow.
    pub(crate) fn release(self, pool: &SafetyNodePool) -> SafetyResult<()> {
        let node = self.internal_node(pool)?.ok_or(SafetyError::AlreadyReleased)?;
        node.retire();
        if let NodeTarget::Direct(id) = self.target {
            pool.release(id);
        }
        Ok(())
    }

    /// Switches the snapshot to the node's secondary version.
    ///
    /// # Errors
    ///
    /// Returns `AlreadySecondaryVersion` if it is on the secondary version
    /// already, and `NotAllocated` for an unassigned handle.
    pub(crate) fn use_secondary_version(&mut self, pool: &SafetyNodePool) -> SafetyResult<()> {
        if self.is_secondary_version() {
            return Err(SafetyError::AlreadySecondaryVersion);
        }
        let version1 = match self.target {
            NodeTarget::Unassigned => return Err(SafetyError::NotAllocated),
            NodeTarget::Direct(id) => pool.get(id).ok_or(SafetyError::Corrupted)?.version1(),
            NodeTarget::LocalShadow { local, .. } => local.version1,
        };
        self.version = version1 & !READ_WRITE_DISPOSE_PROTECT;
        Ok(())
    }

    /// Replaces the shared node with a job-local copy granting `mode`.
    ///
    /// Unassigned handles are left alone.
    ///
    /// # Errors
    ///
    /// Returns `Corrupted` if the handle is already patched.
    pub(crate) fn patch_local(&mut self, pool: &SafetyNodePool, mode: PatchMode) -> SafetyResult<()> {
        let original = match self.target {
            NodeTarget::Unassigned => return Ok(()),
            NodeTarget::LocalShadow { .. } => return Err(SafetyError::Corrupted),
            NodeTarget::Direct(id) => id,
        };

        let mut local = pool.get(original).ok_or(SafetyError::Corrupted)?.local_permissions();
        self.version = local.version(self.is_secondary_version()) & !READ_WRITE_DISPOSE_PROTECT;
        local.version0 = mode.apply(local.version0);
        local.version1 = mode.apply(local.version1);
        self.target = NodeTarget::LocalShadow { original, local };
        Ok(())
    }

    /// Points a patched handle back at its shared node.
    pub(crate) fn unpatch(&mut self) {
        if let NodeTarget::LocalShadow { original, .. } = self.target {
            self.target = NodeTarget::Direct(original);
        }
    }

    /// Returns what the handle points at.
    #[inline]
    #[must_use]
    pub fn target(&self) -> NodeTarget {
        self.target
    }

    /// Returns the underlying node, looking through a shadow.
    #[inline]
    #[must_use]
    pub fn node_id(&self) -> Option<NodeId> {
        match self.target {
            NodeTarget::Unassigned => None,
            NodeTarget::Direct(id) | NodeTarget::LocalShadow { original: id, .. } => Some(id),
        }
    }

    /// Returns the version snapshot, secondary marker included.
    #[inline]
    #[must_use]
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Returns the diagnostic name id.
    #[inline]
    #[must_use]
    pub fn static_safety_id(&self) -> StaticSafetyId {
        self.static_safety_id
    }

    /// Sets the diagnostic name id.
    #[inline]
    pub fn set_static_safety_id(&mut self, id: StaticSafetyId) {
        self.static_safety_id = id;
    }

    /// Returns true if the snapshot tracks the secondary version.
    #[inline]
    #[must_use]
    pub fn is_secondary_version(&self) -> bool {
        self.version & SECONDARY_VERSION == SECONDARY_VERSION
    }

    /// Returns true for a handle that was never assigned a node.
    #[inline]
    #[must_use]
    pub fn is_default_value(&self) -> bool {
        self.version == 0 && self.target == NodeTarget::Unassigned
    }

    /// Returns true if the handle holds a job-local shadow.
    #[inline]
    #[must_use]
    pub fn is_patched(&self) -> bool {
        matches!(self.target, NodeTarget::LocalShadow { .. })
    }

    /// Returns the live version word this handle compares against.
    #[must_use]
    pub fn node_version(&self, pool: &SafetyNodePool) -> Option<u32> {
        let secondary = self.is_secondary_version();
        match self.target {
            NodeTarget::Unassigned => None,
            NodeTarget::Direct(id) => pool.get(id).map(|node| node.version(secondary)),
            NodeTarget::LocalShadow { local, .. } => Some(local.version(secondary)),
        }
    }

    #[inline]
    fn matches(&self, pool: &SafetyNodePool, mask: u32) -> bool {
        self.node_version(pool)
            .is_some_and(|version| self.version == version & mask)
    }

    /// Returns true if the node still has the generation this handle expects.
    #[must_use]
    pub fn is_valid(&self, pool: &SafetyNodePool) -> bool {
        self.matches(pool, !READ_WRITE_DISPOSE_PROTECT)
    }

    /// Returns true if the handle is valid and reads are not blocked.
    #[must_use]
    pub fn is_allowed_to_read(&self, pool: &SafetyNodePool) -> bool {
        self.matches(pool, VERSION_AND_READ_PROTECT)
    }

    /// Returns true if the handle is valid and writes are not blocked.
    #[must_use]
    pub fn is_allowed_to_write(&self, pool: &SafetyNodePool) -> bool {
        self.matches(pool, VERSION_AND_WRITE_PROTECT)
    }

    /// Returns true if the handle is valid and disposal is not blocked.
    #[must_use]
    pub fn is_allowed_to_dispose(&self, pool: &SafetyNodePool) -> bool {
        self.matches(pool, VERSION_AND_DISPOSE_PROTECT)
    }

    /// Resolves the shared node behind a valid handle.
    ///
    /// # Returns
    ///
    /// `Ok(None)` if the handle is stale or unassigned.
    ///
    /// # Errors
    ///
    /// Returns `Corrupted` if the target does not carry the magic bits, which
    /// is always the case for a job-local shadow.
    pub fn internal_node<'p>(&self, pool: &'p SafetyNodePool) -> SafetyResult<Option<&'p SafetyNode>> {
        if !self.is_valid(pool) {
            return Ok(None);
        }
        match self.target {
            NodeTarget::Direct(id) => match pool.get(id) {
                Some(node) if node.has_flag(MAGIC) => Ok(Some(node)),
                _ => Err(SafetyError::Corrupted),
            },
            NodeTarget::LocalShadow { .. } => Err(SafetyError::Corrupted),
            NodeTarget::Unassigned => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::safety::node::{ALLOW_SECONDARY_WRITING, VERSION_INC};

    fn pool() -> SafetyNodePool {
        SafetyNodePool::new(8, 4)
    }

    #[test]
    fn test_fresh_handle_is_fully_allowed() {
        let pool = pool();
        let handle = SafetyHandle::create(&pool).unwrap();

        assert!(handle.is_valid(&pool));
        assert!(handle.is_allowed_to_read(&pool));
        assert!(handle.is_allowed_to_write(&pool));
        assert!(handle.is_allowed_to_dispose(&pool));
        assert!(!handle.is_secondary_version());
        assert!(!handle.is_default_value());
    }

    #[test]
    fn test_default_handle() {
        let pool = pool();
        let handle = SafetyHandle::default();
        assert!(handle.is_default_value());
        assert!(!handle.is_valid(&pool));
        assert_eq!(handle.static_safety_id(), StaticSafetyId::UNKNOWN);
        assert!(matches!(handle.internal_node(&pool), Ok(None)));
    }

    #[test]
    fn test_release_invalidates_copies() {
        let pool = pool();
        let handle = SafetyHandle::create(&pool).unwrap();
        let copy = handle;

        handle.release(&pool).unwrap();
        assert!(!copy.is_valid(&pool));
        assert_eq!(copy.release(&pool), Err(SafetyError::AlreadyReleased));

        // The node comes back with a newer generation.
        let reused = SafetyHandle::create(&pool).unwrap();
        assert_eq!(reused.node_id(), handle.node_id());
        assert_eq!(reused.version(), handle.version() + VERSION_INC);
        assert!(!handle.is_valid(&pool));
        assert!(reused.is_valid(&pool));
    }

    #[test]
    fn test_protection_bits_gate_each_access() {
        let pool = pool();
        let handle = SafetyHandle::create(&pool).unwrap();
        let node = handle.internal_node(&pool).unwrap().unwrap();

        node.protect(WRITE_PROTECT);
        assert!(handle.is_valid(&pool));
        assert!(handle.is_allowed_to_read(&pool));
        assert!(!handle.is_allowed_to_write(&pool));
        assert!(handle.is_allowed_to_dispose(&pool));

        node.protect(READ_WRITE_DISPOSE_PROTECT);
        assert!(handle.is_valid(&pool));
        assert!(!handle.is_allowed_to_read(&pool));
        assert!(!handle.is_allowed_to_dispose(&pool));
    }

    #[test]
    fn test_secondary_version_switch() {
        let pool = pool();
        let primary = SafetyHandle::create(&pool).unwrap();
        let mut secondary = primary;

        secondary.use_secondary_version(&pool).unwrap();
        assert!(secondary.is_secondary_version());
        assert!(secondary.is_valid(&pool));
        assert_eq!(
            secondary.use_secondary_version(&pool),
            Err(SafetyError::AlreadySecondaryVersion)
        );

        // Bumping the secondary generation leaves the primary handle alone.
        let node = primary.internal_node(&pool).unwrap().unwrap();
        node.bump_secondary();
        assert!(primary.is_valid(&pool));
        assert!(!secondary.is_valid(&pool));
    }

    #[test]
    fn test_use_secondary_on_unassigned() {
        let pool = pool();
        let mut handle = SafetyHandle::default();
        assert_eq!(handle.use_secondary_version(&pool), Err(SafetyError::NotAllocated));
    }

    #[test]
    fn test_patch_read_only() {
        let pool = pool();
        let original = SafetyHandle::create(&pool).unwrap();
        let mut patched = original;

        patched.patch_local(&pool, PatchMode::ReadOnly).unwrap();
        assert!(patched.is_patched());
        assert_eq!(patched.node_id(), original.node_id());
        assert!(patched.is_allowed_to_read(&pool));
        assert!(!patched.is_allowed_to_write(&pool));
        assert!(!patched.is_allowed_to_dispose(&pool));

        // The shared node is untouched.
        assert!(original.is_allowed_to_write(&pool));

        // Shadows have no magic and cannot be resolved.
        assert!(matches!(patched.internal_node(&pool), Err(SafetyError::Corrupted)));
        assert_eq!(
            patched.patch_local(&pool, PatchMode::ReadWrite),
            Err(SafetyError::Corrupted)
        );
    }

    #[test]
    fn test_patch_modes() {
        let pool = pool();
        let handle = SafetyHandle::create(&pool).unwrap();

        let mut write_only = handle;
        write_only.patch_local(&pool, PatchMode::WriteOnly).unwrap();
        assert!(!write_only.is_allowed_to_read(&pool));
        assert!(write_only.is_allowed_to_write(&pool));

        let mut read_write = handle;
        read_write.patch_local(&pool, PatchMode::ReadWrite).unwrap();
        assert!(read_write.is_allowed_to_read(&pool));
        assert!(read_write.is_allowed_to_write(&pool));
        assert!(!read_write.is_allowed_to_dispose(&pool));

        if let NodeTarget::LocalShadow { local, .. } = read_write.target() {
            assert_eq!(local.flags & ALLOW_SECONDARY_WRITING, ALLOW_SECONDARY_WRITING);
        } else {
            panic!("expected a shadow");
        }
    }

    #[test]
    fn test_patch_unassigned_is_noop() {
        let pool = pool();
        let mut handle = SafetyHandle::default();
        handle.patch_local(&pool, PatchMode::ReadOnly).unwrap();
        assert!(handle.is_default_value());
    }

    #[test]
    fn test_unpatch_then_release() {
        let pool = pool();
        let mut handle = SafetyHandle::create(&pool).unwrap();
        handle.patch_local(&pool, PatchMode::ReadWrite).unwrap();
        assert_eq!(handle.release(&pool), Err(SafetyError::Corrupted));

        handle.unpatch();
        assert!(!handle.is_patched());
        handle.release(&pool).unwrap();
        assert!(!handle.is_valid(&pool));
    }
}
