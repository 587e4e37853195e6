//! # Safety Configuration
//!
//! Loaded once at startup, from TOML or from defaults.
//!
//! ```toml
//! node_chunk_size = 1024
//! max_node_chunks = 4096
//! auto_sync_on_access = true
//! ```

use serde::Deserialize;

use crate::error::{SafetyError, SafetyResult};

/// Tunables for the safety system.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SafetyConfig {
    /// Safety nodes allocated per pool chunk.
    pub node_chunk_size: usize,
    /// Maximum number of pool chunks.
    pub max_node_chunks: usize,
    /// Nodes created and returned to the pool at construction.
    pub prewarm_nodes: usize,
    /// Bucket count of the static safety id table. Must be a power of two.
    pub registry_buckets: usize,
    /// Longest name, in bytes, the id table accepts.
    pub max_static_name_len: usize,
    /// Id table entries per chunk.
    pub registry_chunk_size: usize,
    /// Maximum number of id table chunks.
    pub max_registry_chunks: usize,
    /// Block on outstanding jobs from `check_*` calls instead of failing.
    pub auto_sync_on_access: bool,
    /// Require `check_*` recovery to run on the owner thread.
    pub enforce_owner_thread: bool,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            node_chunk_size: 1024,
            max_node_chunks: 4096,
            prewarm_nodes: 0,
            registry_buckets: 256,
            max_static_name_len: 112,
            registry_chunk_size: 512,
            max_registry_chunks: 1024,
            auto_sync_on_access: true,
            enforce_owner_thread: true,
        }
    }
}

impl SafetyConfig {
    /// Parses a configuration from TOML. Missing keys take their defaults.
    ///
    /// # Errors
    ///
    /// Returns `SafetyError::Config` if the text does not parse or fails
    /// [`validate`](Self::validate).
    pub fn from_toml_str(text: &str) -> SafetyResult<Self> {
        let config: Self = toml::from_str(text).map_err(|e| SafetyError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the values for consistency.
    ///
    /// # Errors
    ///
    /// Returns `SafetyError::Config` naming the first bad value.
    pub fn validate(&self) -> SafetyResult<()> {
        let sizes = [
            ("node_chunk_size", self.node_chunk_size),
            ("max_node_chunks", self.max_node_chunks),
            ("registry_buckets", self.registry_buckets),
            ("max_static_name_len", self.max_static_name_len),
            ("registry_chunk_size", self.registry_chunk_size),
            ("max_registry_chunks", self.max_registry_chunks),
        ];
        if let Some((name, _)) = sizes.iter().find(|(_, value)| *value == 0) {
            return Err(SafetyError::Config(format!("{name} must be greater than zero")));
        }
        if !self.registry_buckets.is_power_of_two() {
            return Err(SafetyError::Config(format!(
                "registry_buckets must be a power of two, got {}",
                self.registry_buckets
            )));
        }
        let node_capacity = self.node_chunk_size.saturating_mul(self.max_node_chunks);
        if u32::try_from(node_capacity).is_err() {
            return Err(SafetyError::Config(format!(
                "node pool capacity {node_capacity} exceeds the 32-bit index space"
            )));
        }
        if self.prewarm_nodes > node_capacity {
            return Err(SafetyError::Config(format!(
                "prewarm_nodes {} exceeds node pool capacity {node_capacity}",
                self.prewarm_nodes
            )));
        }
        Ok(())
    }

    /// Returns the node pool capacity.
    #[inline]
    #[must_use]
    pub fn node_capacity(&self) -> usize {
        self.node_chunk_size * self.max_node_chunks
    }
}
