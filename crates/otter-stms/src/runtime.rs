//! Process-wide collector
//!
//! Initialized once during runtime startup and never torn down. Everything after
//! [`init`] reaches the coordinator through [`get`].

use std::sync::{Arc, OnceLock};

use crate::config::GcConfig;
use crate::coordinator::GcCoordinator;
use crate::error::{GcError, GcResult, invariant_violation};
use crate::heap::ObjectFactory;
use crate::scheduler::ThreadData;

static RUNTIME: OnceLock<Arc<GcCoordinator>> = OnceLock::new();

/// Build the process-wide coordinator over a fresh [`ObjectFactory`].
///
/// Fails with [`GcError::AlreadyInitialized`] on every call after the first.
pub fn init(config: GcConfig) -> GcResult<&'static Arc<GcCoordinator>> {
    init_with(config, ObjectFactory::new())
}

/// Like [`init`], over a caller-supplied factory (e.g. one with a capacity limit)
pub fn init_with(
    config: GcConfig,
    factory: ObjectFactory,
) -> GcResult<&'static Arc<GcCoordinator>> {
    let mut created = false;
    let runtime = RUNTIME.get_or_init(|| {
        created = true;
        tracing::info!(
            target: "otter::gc",
            safepoint_threshold = config.safepoint_threshold,
            allocation_threshold_bytes = config.allocation_threshold_bytes,
            cooldown_us = config.cooldown.as_micros() as u64,
            "GC runtime initialized"
        );
        Arc::new(GcCoordinator::new(config, Arc::new(factory)))
    });

    if created {
        Ok(runtime)
    } else {
        Err(GcError::AlreadyInitialized)
    }
}

/// The process-wide coordinator.
///
/// Calling this before [`init`] is a programming error.
pub fn get() -> &'static Arc<GcCoordinator> {
    RUNTIME
        .get()
        .unwrap_or_else(|| invariant_violation("GC runtime used before init"))
}

/// The process-wide coordinator, if initialized
pub fn try_get() -> Option<&'static Arc<GcCoordinator>> {
    RUNTIME.get()
}

/// Register the calling thread with the process-wide coordinator.
///
/// Fails with [`GcError::NotInitialized`] before [`init`].
pub fn attach_current_thread() -> GcResult<ThreadData> {
    let runtime = try_get().ok_or(GcError::NotInitialized)?;
    Ok(ThreadData::new(Arc::clone(runtime)))
}
