//! Collection cycle orchestration
//!
//! [`GcCoordinator`] owns everything one cycle touches: the heap, the thread registry, the
//! global and stable-handle roots and the suspension flag. Any mutator can drive a cycle; the
//! one that wins the stop-the-world request does all the work on its own thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

use crate::config::GcConfig;
use crate::error::invariant_violation;
use crate::finalizer::FinalizerQueue;
use crate::heap::{ObjectFactory, ObjectHeap};
use crate::mark::mark;
use crate::roots::{GlobalRoots, StableRefRegistry, collect_root_set};
use crate::stats::{CycleReport, GcObserver, GcStats};
use crate::suspension::ThreadSuspension;
use crate::sweep::sweep;
use crate::thread::{MutatorThread, ThreadRegistry, ThreadState, ThreadStateGuard};

const NEVER: u64 = 0;

/// Cycle progress, as seen from any thread
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcPhase {
    /// No cycle in progress
    Idle = 0,
    /// World stopped
    Suspended = 1,
    /// Root set enumerated
    RootsCollected = 2,
    /// Mark finished
    Marked = 3,
    /// Sweep finished
    Swept = 4,
    /// World being released
    Resumed = 5,
}

impl From<u8> for GcPhase {
    fn from(v: u8) -> Self {
        match v {
            1 => GcPhase::Suspended,
            2 => GcPhase::RootsCollected,
            3 => GcPhase::Marked,
            4 => GcPhase::Swept,
            5 => GcPhase::Resumed,
            _ => GcPhase::Idle,
        }
    }
}

/// Process-wide collector state
pub struct GcCoordinator<H: ObjectHeap = ObjectFactory> {
    config: GcConfig,
    heap: Arc<H>,
    threads: ThreadRegistry,
    globals: GlobalRoots,
    stable_refs: StableRefRegistry,
    suspension: ThreadSuspension,
    /// Completed cycles
    epoch: CachePadded<AtomicU64>,
    /// Completion of the latest cycle, in microseconds since `started` plus one; 0 is never
    last_gc_stamp: CachePadded<AtomicU64>,
    started: Instant,
    phase: AtomicU8,
    stats: Mutex<GcStats>,
    observer: Option<Arc<dyn GcObserver>>,
}

impl<H: ObjectHeap> GcCoordinator<H> {
    /// Create a coordinator over `heap`
    pub fn new(config: GcConfig, heap: Arc<H>) -> Self {
        Self {
            config,
            heap,
            threads: ThreadRegistry::new(),
            globals: GlobalRoots::new(),
            stable_refs: StableRefRegistry::new(),
            suspension: ThreadSuspension::new(),
            epoch: CachePadded::new(AtomicU64::new(0)),
            last_gc_stamp: CachePadded::new(AtomicU64::new(NEVER)),
            started: Instant::now(),
            phase: AtomicU8::new(GcPhase::Idle as u8),
            stats: Mutex::new(GcStats::default()),
            observer: None,
        }
    }

    /// Attach a diagnostics observer
    pub fn with_observer(mut self, observer: Arc<dyn GcObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Thresholds in effect
    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    /// Managed heap
    pub fn heap(&self) -> &Arc<H> {
        &self.heap
    }

    /// Registered mutators
    pub fn threads(&self) -> &ThreadRegistry {
        &self.threads
    }

    /// Global root slots
    pub fn globals(&self) -> &GlobalRoots {
        &self.globals
    }

    /// External handle table
    pub fn stable_refs(&self) -> &StableRefRegistry {
        &self.stable_refs
    }

    /// Stop-the-world flag
    pub fn suspension(&self) -> &ThreadSuspension {
        &self.suspension
    }

    /// Number of completed cycles
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Time since the last cycle completed, `None` before the first
    pub fn last_gc_elapsed(&self) -> Option<Duration> {
        match self.last_gc_stamp.load(Ordering::Acquire) {
            NEVER => None,
            stamp => Some(
                self.started
                    .elapsed()
                    .saturating_sub(Duration::from_micros(stamp - 1)),
            ),
        }
    }

    /// Record a cycle completion. Cycles may report out of order; the latest one wins.
    fn record_completion(&self, at: Instant) {
        let stamp = micros(at.saturating_duration_since(self.started)).saturating_add(1);
        self.last_gc_stamp.fetch_max(stamp, Ordering::AcqRel);
    }

    /// Current cycle phase
    pub fn phase(&self) -> GcPhase {
        GcPhase::from(self.phase.load(Ordering::Acquire))
    }

    /// Cumulative statistics snapshot
    pub fn stats(&self) -> GcStats {
        self.stats.lock().clone()
    }

    fn set_phase(&self, phase: GcPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    /// Run one full stop-the-world cycle on the calling thread.
    ///
    /// Returns the objects that need finalization; the caller must drain the queue with
    /// [`GcCoordinator::run_finalizers`] once this returns. If another thread is already
    /// collecting, returns an empty queue without touching the heap.
    ///
    /// A registered caller must be in [`ThreadState::Native`] so a competing collector does not
    /// wait on it.
    #[must_use = "dropping the queue leaves its objects unfinalized until teardown"]
    pub fn perform_full_gc(&self) -> FinalizerQueue {
        let epoch = self.epoch();
        tracing::debug!(
            target: "otter::gc",
            thread = ?std::thread::current().id(),
            "Attempt to suspend threads"
        );

        let time_start = Instant::now();
        if !self.suspension.request_suspend_all(&self.threads) {
            tracing::debug!(target: "otter::gc", epoch, "Failed to suspend threads");
            self.stats.lock().aborted_requests += 1;
            if let Some(observer) = &self.observer {
                observer.on_cycle_aborted(epoch);
            }
            return FinalizerQueue::new();
        }
        let time_suspend = Instant::now();
        self.set_phase(GcPhase::Suspended);

        let since_last_gc = self.last_gc_elapsed();
        tracing::debug!(
            target: "otter::gc",
            suspend_us = micros(time_suspend - time_start),
            "Suspended all threads"
        );
        tracing::info!(
            target: "otter::gc",
            epoch,
            since_last_gc_us = since_last_gc.map(micros),
            "Started GC epoch"
        );

        #[cfg(debug_assertions)]
        self.verify_all_white();

        let root_set = collect_root_set(&self.threads, &self.globals, &self.stable_refs);
        let time_root_set = Instant::now();
        self.set_phase(GcPhase::RootsCollected);

        // Stable while the world is stopped
        let objects_before = self.heap.object_count();

        tracing::debug!(
            target: "otter::gc",
            size = root_set.len(),
            elapsed_us = micros(time_root_set - time_suspend),
            "Collected root set"
        );

        let marked = mark(self.heap.as_ref(), &self.suspension, root_set.objects());
        let time_mark = Instant::now();
        self.set_phase(GcPhase::Marked);
        tracing::debug!(
            target: "otter::gc",
            marked,
            elapsed_us = micros(time_mark - time_root_set),
            "Marked"
        );

        let finalizers = sweep(self.heap.as_ref(), &self.suspension);
        let time_sweep = Instant::now();
        self.set_phase(GcPhase::Swept);
        tracing::debug!(
            target: "otter::gc",
            elapsed_us = micros(time_sweep - time_mark),
            "Swept"
        );

        let objects_after = self.heap.object_count();

        self.set_phase(GcPhase::Resumed);
        self.suspension.resume_all();
        let time_resume = Instant::now();
        tracing::debug!(
            target: "otter::gc",
            elapsed_us = micros(time_resume - time_sweep),
            "Resumed threads"
        );

        let to_finalize = finalizers.len();
        let collected = objects_before.saturating_sub(objects_after + to_finalize);
        let pause = time_resume - time_start;

        let completed = self.epoch.fetch_add(1, Ordering::AcqRel);
        self.record_completion(time_resume);
        let _ = self.phase.compare_exchange(
            GcPhase::Resumed as u8,
            GcPhase::Idle as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );

        tracing::info!(
            target: "otter::gc",
            epoch = completed,
            collected,
            to_finalize,
            remaining = objects_after,
            pause_us = micros(pause),
            "Finished GC epoch"
        );

        let report = CycleReport {
            epoch: completed,
            since_last_gc,
            suspend_time: time_suspend - time_start,
            root_set_time: time_root_set - time_suspend,
            mark_time: time_mark - time_root_set,
            sweep_time: time_sweep - time_mark,
            resume_time: time_resume - time_sweep,
            pause,
            roots: root_set.counts(),
            objects_before,
            marked,
            collected,
            to_finalize,
            remaining: objects_after,
        };
        self.stats.lock().record_cycle(&report);
        if let Some(observer) = &self.observer {
            observer.on_cycle_complete(&report);
        }

        finalizers
    }

    /// Drain a queue returned by [`GcCoordinator::perform_full_gc`]. Returns the number of
    /// objects finalized.
    pub fn run_finalizers(&self, queue: FinalizerQueue) -> usize {
        if self.suspension.is_held_by_current() {
            invariant_violation("running finalizers with the world stopped");
        }

        tracing::debug!(target: "otter::gc", count = queue.len(), "Starting to run finalizers");
        let started = Instant::now();
        let count = queue.finalize(self.heap.as_ref());
        let elapsed = started.elapsed();
        tracing::info!(
            target: "otter::gc",
            count,
            elapsed_us = micros(elapsed),
            "Finished running finalizers"
        );

        self.stats.lock().record_finalized(count);
        if let Some(observer) = &self.observer {
            observer.on_finalizers_run(count, elapsed);
        }
        count
    }

    /// Collect and finalize on the calling thread. Returns the number of objects finalized.
    ///
    /// Usable from registered and unregistered threads alike.
    pub fn collect_garbage(&self) -> usize {
        let current = self.threads.current();
        self.collect_and_finalize(current.as_deref())
    }

    /// Run a cycle as `thread`, which is parked in Native for its duration.
    ///
    /// If another thread wins the race, dropping the state guard parks this thread until that
    /// cycle resumes the world.
    pub(crate) fn collect_and_finalize(&self, thread: Option<&MutatorThread>) -> usize {
        let finalizers = {
            let _native = thread
                .map(|thread| ThreadStateGuard::new(thread, &self.suspension, ThreadState::Native));
            self.perform_full_gc()
        };
        self.run_finalizers(finalizers)
    }

    #[cfg(debug_assertions)]
    fn verify_all_white(&self) {
        for object in self.heap.snapshot_objects() {
            // SAFETY: the world is stopped and the snapshot only holds live objects
            if unsafe { self.heap.object_data(object) }.is_marked() {
                invariant_violation("object left Black by a previous cycle");
            }
        }
    }
}

impl<H: ObjectHeap> std::fmt::Debug for GcCoordinator<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcCoordinator")
            .field("config", &self.config)
            .field("epoch", &self.epoch())
            .field("phase", &self.phase())
            .field("threads", &self.threads.len())
            .finish()
    }
}

fn micros(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}
