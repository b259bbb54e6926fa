//! Collector errors

use thiserror::Error;

/// Errors surfaced by the collector and its collaborators
#[derive(Debug, Error)]
pub enum GcError {
    /// A configuration override could not be parsed
    #[error("Invalid GC configuration value for {key}: {value:?}")]
    InvalidConfig {
        /// Environment key that carried the value
        key: &'static str,
        /// Raw value as found
        value: String,
    },

    /// The object factory has no room for the requested allocation
    #[error("Out of memory: requested {requested} bytes with a limit of {limit} bytes")]
    OutOfMemory {
        /// Bytes requested by the failed allocation
        requested: usize,
        /// Capacity limit of the factory
        limit: usize,
    },

    /// The process-wide runtime was already initialized
    #[error("GC runtime is already initialized")]
    AlreadyInitialized,

    /// The process-wide runtime was used before initialization
    #[error("GC runtime is not initialized")]
    NotInitialized,
}

/// Result type for collector operations
pub type GcResult<T> = std::result::Result<T, GcError>;

/// Report a broken collector invariant and stop.
///
/// Heap state is no longer trustworthy at this point, so there is nothing to recover.
/// Release builds abort on panic.
#[cold]
#[track_caller]
pub fn invariant_violation(message: &str) -> ! {
    tracing::error!(target: "otter::gc", reason = message, "GC invariant violated");
    panic!("GC invariant violated: {message}");
}
