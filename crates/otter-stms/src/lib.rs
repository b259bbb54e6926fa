//! # Otter VM Garbage Collector
//!
//! Stop-the-world, same-thread mark & sweep.
//!
//! ## Design
//!
//! - **No collector thread**: the mutator whose probe fires runs the whole cycle itself
//! - **Stop-the-world**: every other mutator parks at its next safepoint probe
//! - **Mark**: White/Black colors only, Gray is an explicit worklist
//! - **Sweep**: survivors go back to White, dead objects are freed or queued for finalization
//! - **Finalizers**: run by the collecting thread after the world resumes
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use otter_stms::{GcConfig, GcCoordinator, ObjectFactory, ObjectHeap, ThreadData};
//!
//! let gc = Arc::new(GcCoordinator::new(GcConfig::default(), Arc::new(ObjectFactory::new())));
//! let mut mutator = ThreadData::new(Arc::clone(&gc));
//!
//! let kept = mutator.allocate(42i64).unwrap();
//! mutator.thread().push_root(kept.as_header());
//! mutator.allocate(7i64).unwrap();
//!
//! mutator.perform_full_gc();
//! assert_eq!(gc.epoch(), 1);
//! assert_eq!(gc.heap().object_count(), 1);
//! ```

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod config;
pub mod coordinator;
pub mod error;
pub mod finalizer;
pub mod heap;
mod mark;
pub mod object;
pub mod roots;
pub mod runtime;
pub mod scheduler;
pub mod stats;
pub mod suspension;
mod sweep;
pub mod thread;

pub use config::GcConfig;
pub use coordinator::{GcCoordinator, GcPhase};
pub use error::{GcError, GcResult};
pub use finalizer::FinalizerQueue;
pub use heap::{Gc, ObjectFactory, ObjectHeap};
pub use object::{Color, GcHeader, MARKER, ObjectData, ObjectRef, Trace, is_null_or_marker};
pub use roots::{GlobalId, GlobalRoots, RootSet, RootSetCounts, RootSource, StableRef, StableRefRegistry};
pub use scheduler::ThreadData;
pub use stats::{CycleReport, GcObserver, GcStats};
pub use suspension::ThreadSuspension;
pub use thread::{MutatorThread, ThreadRegistry, ThreadState, ThreadStateGuard};
