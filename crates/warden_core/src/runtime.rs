//! # Process-wide Safety Runtime
//!
//! The host brackets all use of the safety system with exactly one
//! [`initialize`] and one [`shutdown`]. Between the two, [`get`] hands out the
//! shared [`ActiveSafety`] instance.
//!
//! ```rust,ignore
//! let graph = Arc::new(FenceGraph::new());
//! runtime::initialize(SafetyConfig::default(), graph, Arc::new(ThreadContext::current()))?;
//!
//! let safety = runtime::get()?;
//! let handle = safety.create()?;
//! // ...
//! safety.release(handle)?;
//!
//! let leaked = runtime::shutdown()?;
//! ```

use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::SafetyConfig;
use crate::error::{SafetyError, SafetyResult};
use crate::jobs::{ExecutionOracle, FenceOracle};
use crate::safety::{ActiveSafety, SafetyChecks};

static RUNTIME: RwLock<Option<Arc<ActiveSafety>>> = parking_lot::const_rwlock(None);

/// Builds the process-wide safety instance.
///
/// # Errors
///
/// Returns `AlreadyInitialized` if called twice without a [`shutdown`] in
/// between, and any construction error of [`ActiveSafety`].
pub fn initialize(
    config: SafetyConfig,
    fences: Arc<dyn FenceOracle>,
    execution: Arc<dyn ExecutionOracle>,
) -> SafetyResult<Arc<ActiveSafety>> {
    config.validate()?;

    let mut slot = RUNTIME.write();
    if slot.is_some() {
        return Err(SafetyError::AlreadyInitialized);
    }

    let safety = Arc::new(ActiveSafety::new(config, fences, execution)?);
    *slot = Some(Arc::clone(&safety));
    tracing::info!(checked = cfg!(feature = "collections-checks"), "safety runtime initialized");
    Ok(safety)
}

/// Returns the process-wide safety instance.
///
/// # Errors
///
/// Returns `NotInitialized` outside an [`initialize`] / [`shutdown`] bracket.
pub fn get() -> SafetyResult<Arc<ActiveSafety>> {
    RUNTIME.read().clone().ok_or(SafetyError::NotInitialized)
}

/// Returns true between [`initialize`] and [`shutdown`].
#[must_use]
pub fn is_initialized() -> bool {
    RUNTIME.read().is_some()
}

/// Tears the process-wide instance down.
///
/// Clones obtained through [`get`] fail every lifecycle call with
/// `NotInitialized` from here on. The node storage is freed as soon as the
/// last of them is dropped, immediately if there are none.
///
/// # Returns
///
/// The number of safety nodes that were never released.
///
/// # Errors
///
/// Returns `NotInitialized` if there is nothing to shut down.
pub fn shutdown() -> SafetyResult<usize> {
    let safety = RUNTIME.write().take().ok_or(SafetyError::NotInitialized)?;
    let leaked = safety.shutdown();
    let holders = Arc::strong_count(&safety) - 1;
    drop(safety);
    tracing::info!(leaked, holders, "safety runtime shut down");
    Ok(leaked)
}
