//! Per-thread collection scheduling
//!
//! Compiled code calls the probes on [`ThreadData`] at function entry, loop back-edges,
//! exception unwinding and before every allocation. Each probe is also a safepoint: a pending
//! stop-the-world request parks the thread there.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;

use crate::coordinator::GcCoordinator;
use crate::error::GcResult;
use crate::heap::{Gc, GcBox, ObjectFactory, ObjectHeap};
use crate::object::Trace;
use crate::thread::{MutatorThread, ThreadState, ThreadStateGuard, switch_state};

/// Scheduler state of one mutator thread.
///
/// Registers the calling thread on creation and unregisters it on drop. Not `Send`: the
/// record belongs to the thread that created it.
pub struct ThreadData<H: ObjectHeap + 'static = ObjectFactory> {
    gc: Arc<GcCoordinator<H>>,
    thread: Arc<MutatorThread>,
    allocated_bytes: usize,
    safepoints_counter: usize,
    time_of_last_gc: Instant,
    _not_send: PhantomData<*const ()>,
}

impl<H: ObjectHeap + 'static> ThreadData<H> {
    /// Register the calling thread and enter managed code
    pub fn new(gc: Arc<GcCoordinator<H>>) -> Self {
        let thread = gc.threads().register_current();
        switch_state(&thread, gc.suspension(), ThreadState::Runnable);
        tracing::trace!(target: "otter::gc", thread = thread.id(), "Registered mutator");

        Self {
            gc,
            thread,
            allocated_bytes: 0,
            safepoints_counter: 0,
            time_of_last_gc: Instant::now(),
            _not_send: PhantomData,
        }
    }

    /// Coordinator this thread reports to
    pub fn gc(&self) -> &Arc<GcCoordinator<H>> {
        &self.gc
    }

    /// Registry record of this thread (its roots live here)
    pub fn thread(&self) -> &Arc<MutatorThread> {
        &self.thread
    }

    /// Bytes allocated since the counter last reset
    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes
    }

    /// Weighted safepoint visits since the counter last reset
    pub fn safepoints_counter(&self) -> usize {
        self.safepoints_counter
    }

    /// Probe at compiled function entry
    #[inline]
    pub fn safe_point_function_prologue(&mut self) {
        self.safe_point_regular(1);
    }

    /// Probe in loop bodies
    #[inline]
    pub fn safe_point_loop_body(&mut self) {
        self.safe_point_regular(1);
    }

    /// Probe on exception unwind paths
    #[inline]
    pub fn safe_point_exception_unwind(&mut self) {
        self.safe_point_regular(1);
    }

    /// Probe before allocating `size` bytes. Ignores the cooldown.
    pub fn safe_point_allocation(&mut self, size: usize) {
        let threshold = self.gc.config().allocation_threshold_bytes;
        let overhead = overhead(self.allocated_bytes, threshold);

        if self.gc.suspension().suspend_if_requested(&self.thread) {
            self.allocated_bytes = 0;
        } else if overhead.saturating_add(size) >= threshold {
            tracing::debug!(target: "otter::gc", size, "Attempt to GC at SafePointAllocation");
            self.allocated_bytes = 0;
            self.perform_full_gc();
        }
        self.allocated_bytes += size;
    }

    /// Allocation failed; collect regardless of thresholds and cooldown
    pub fn on_oom(&mut self, size: usize) {
        tracing::debug!(target: "otter::gc", size, "Attempt to GC on OOM");
        self.perform_full_gc();
    }

    /// Collect on this thread, then run the resulting finalizers. Returns the number
    /// finalized.
    ///
    /// If another thread is already collecting, waits for that cycle to release the world
    /// and returns 0.
    pub fn perform_full_gc(&mut self) -> usize {
        self.gc.collect_and_finalize(Some(&self.thread))
    }

    /// Leave managed code until the guard drops, e.g. around blocking calls.
    ///
    /// A thread in Native never holds up a collection. It must not touch managed objects.
    pub fn enter_native(&self) -> ThreadStateGuard<'_> {
        ThreadStateGuard::new(&self.thread, self.gc.suspension(), ThreadState::Native)
    }

    fn safe_point_regular(&mut self, weight: usize) {
        let threshold = self.gc.config().safepoint_threshold;
        let overhead = overhead(self.safepoints_counter, threshold);

        if self.gc.suspension().suspend_if_requested(&self.thread) {
            self.safepoints_counter = 0;
        } else if overhead.saturating_add(weight) >= threshold
            && self.time_of_last_gc.elapsed() >= self.gc.config().cooldown
        {
            tracing::debug!(target: "otter::gc", weight, "Attempt to GC at SafePointRegular");
            self.time_of_last_gc = Instant::now();
            self.safepoints_counter = 0;
            self.perform_full_gc();
        }
        self.safepoints_counter += weight;
    }
}

impl ThreadData<ObjectFactory> {
    /// Allocate through the allocation probe.
    ///
    /// If the factory refuses the bytes, runs an out-of-memory collection and tries once
    /// more; the factory's error is returned only when that retry fails too.
    pub fn allocate<T: Trace>(&mut self, value: T) -> GcResult<Gc<T>> {
        let size = std::mem::size_of::<GcBox<T>>();
        self.safe_point_allocation(size);

        let heap = Arc::clone(self.gc.heap());
        if heap.reserve(size).is_err() {
            self.on_oom(size);
            heap.reserve(size)?;
        }
        Ok(heap.allocate_reserved(value))
    }
}

impl<H: ObjectHeap + 'static> Drop for ThreadData<H> {
    fn drop(&mut self) {
        self.thread.swap_state(ThreadState::Native);
        self.gc.threads().unregister(&self.thread);
        tracing::trace!(target: "otter::gc", thread = self.thread.id(), "Unregistered mutator");
    }
}

impl<H: ObjectHeap + 'static> std::fmt::Debug for ThreadData<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadData")
            .field("thread", &self.thread.id())
            .field("allocated_bytes", &self.allocated_bytes)
            .field("safepoints_counter", &self.safepoints_counter)
            .finish()
    }
}

/// Progress towards the next multiple of `threshold`. A zero threshold fires every time.
#[inline]
fn overhead(counter: usize, threshold: usize) -> usize {
    if threshold == 0 {
        counter
    } else {
        counter % threshold
    }
}
