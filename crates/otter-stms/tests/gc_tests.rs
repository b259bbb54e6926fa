//! GC correctness tests
//!
//! These tests verify that a full stop-the-world cycle keeps exactly the reachable objects,
//! resets colors and finalizes dead objects once.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use otter_stms::{
    Color, GcConfig, GcCoordinator, GcHeader, GcPhase, ObjectData, ObjectFactory, ObjectHeap,
    ObjectRef, Trace,
};
use parking_lot::Mutex;

/// Simple test object for GC testing
struct TestObject {
    value: i32,
    /// Optional reference to another object's header
    reference: AtomicPtr<GcHeader>,
}

impl TestObject {
    fn new(value: i32) -> Self {
        Self {
            value,
            reference: AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    fn point_to(&self, target: *const GcHeader) {
        self.reference.store(target.cast_mut(), Ordering::SeqCst);
    }
}

impl Trace for TestObject {
    const NEEDS_TRACE: bool = true;

    fn trace(&self, tracer: &mut dyn FnMut(*const GcHeader)) {
        tracer(self.reference.load(Ordering::SeqCst));
    }
}

/// Object with cleanup that counts how often it ran
struct Finalizable {
    finalized: Arc<AtomicUsize>,
}

impl Trace for Finalizable {
    const NEEDS_TRACE: bool = false;
    const NEEDS_FINALIZER: bool = true;

    fn trace(&self, _tracer: &mut dyn FnMut(*const GcHeader)) {}

    fn finalize(&mut self) {
        self.finalized.fetch_add(1, Ordering::SeqCst);
    }
}

fn new_gc() -> (Arc<ObjectFactory>, GcCoordinator) {
    let heap = Arc::new(ObjectFactory::new());
    let gc = GcCoordinator::new(GcConfig::default(), Arc::clone(&heap));
    (heap, gc)
}

fn color_of(heap: &ObjectFactory, object: ObjectRef) -> Color {
    unsafe { heap.object_data(object).color() }
}

#[test]
fn test_collect_simple_garbage() {
    let (heap, gc) = new_gc();
    heap.allocate(TestObject::new(42)).unwrap();

    assert_eq!(heap.object_count(), 1);
    assert!(heap.total_bytes() > 0);

    let queue = gc.perform_full_gc();

    assert!(queue.is_empty());
    assert_eq!(heap.object_count(), 0);
    assert_eq!(heap.total_bytes(), 0);
}

#[test]
fn test_reachable_retained_unreachable_reclaimed() {
    let (heap, gc) = new_gc();
    let threads = gc.threads();
    let mutator = threads.register_current();

    let a = heap.allocate(TestObject::new(1)).unwrap();
    let b = heap.allocate(TestObject::new(2)).unwrap();
    let c = heap.allocate(TestObject::new(3)).unwrap();
    unsafe { a.get().point_to(b.as_header()) };
    mutator.push_root(a.as_header());

    let epoch_before = gc.epoch();
    assert!(gc.perform_full_gc().is_empty());

    assert!(heap.contains(a.object()));
    assert!(heap.contains(b.object()));
    assert!(!heap.contains(c.object()));
    assert_eq!(color_of(&heap, a.object()), Color::White);
    assert_eq!(color_of(&heap, b.object()), Color::White);
    assert_eq!(gc.epoch(), epoch_before + 1);
    unsafe {
        assert_eq!(a.get().value, 1);
        assert_eq!(b.get().value, 2);
    }
}

#[test]
fn test_unreachable_finalizable_is_queued() {
    let (heap, gc) = new_gc();
    let finalized = Arc::new(AtomicUsize::new(0));

    let root = heap.allocate(TestObject::new(1)).unwrap();
    let dead = heap
        .allocate(Finalizable {
            finalized: Arc::clone(&finalized),
        })
        .unwrap();
    gc.globals().register(root.as_header());

    let queue = gc.perform_full_gc();
    assert_eq!(queue.len(), 1);
    assert_eq!(queue.iter().next(), Some(dead.object()));
    // Storage is held until the finalizer runs
    assert_eq!(heap.pending_finalization_count(), 1);
    assert_eq!(finalized.load(Ordering::SeqCst), 0);

    assert_eq!(gc.run_finalizers(queue), 1);
    assert_eq!(finalized.load(Ordering::SeqCst), 1);
    assert_eq!(heap.pending_finalization_count(), 0);

    // A second cycle does not see it again
    assert!(gc.perform_full_gc().is_empty());
    assert_eq!(finalized.load(Ordering::SeqCst), 1);

    let report = gc.stats().last_report.unwrap();
    assert_eq!(report.to_finalize, 0);
    assert_eq!(report.remaining, 1);
}

/// Finalizable object holding a managed reference it never dereferences
struct FinalizableParent {
    child: AtomicPtr<GcHeader>,
    finalized: Arc<AtomicUsize>,
}

impl Trace for FinalizableParent {
    const NEEDS_TRACE: bool = true;
    const NEEDS_FINALIZER: bool = true;

    fn trace(&self, tracer: &mut dyn FnMut(*const GcHeader)) {
        tracer(self.child.load(Ordering::SeqCst));
    }

    fn finalize(&mut self) {
        self.finalized.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_finalizable_object_does_not_retain_children() {
    let (heap, gc) = new_gc();
    let finalized = Arc::new(AtomicUsize::new(0));

    let child = heap.allocate(TestObject::new(9)).unwrap();
    let parent = heap
        .allocate(FinalizableParent {
            child: AtomicPtr::new(child.as_header().cast_mut()),
            finalized: Arc::clone(&finalized),
        })
        .unwrap();

    let queue = gc.perform_full_gc();
    assert_eq!(queue.iter().collect::<Vec<_>>(), vec![parent.object()]);
    // The child is freed before the parent's finalizer gets to run
    assert!(!heap.contains(child.object()));
    assert_eq!(gc.stats().last_report.unwrap().collected, 1);

    assert_eq!(gc.run_finalizers(queue), 1);
    assert_eq!(finalized.load(Ordering::SeqCst), 1);
}

#[test]
fn test_circular_references_collected() {
    let (heap, gc) = new_gc();

    let a = heap.allocate(TestObject::new(1)).unwrap();
    let b = heap.allocate(TestObject::new(2)).unwrap();
    unsafe {
        a.get().point_to(b.as_header());
        b.get().point_to(a.as_header());
    }

    assert!(gc.perform_full_gc().is_empty());

    assert_eq!(heap.object_count(), 0);
    assert_eq!(gc.stats().last_report.unwrap().collected, 2);
}

#[test]
fn test_cycle_reachable_from_root_survives() {
    let (heap, gc) = new_gc();

    let a = heap.allocate(TestObject::new(1)).unwrap();
    let b = heap.allocate(TestObject::new(2)).unwrap();
    unsafe {
        a.get().point_to(b.as_header());
        b.get().point_to(a.as_header());
    }
    let handle = gc.stable_refs().create(b.as_header());

    assert!(gc.perform_full_gc().is_empty());
    assert_eq!(heap.object_count(), 2);

    // Disposal takes effect at the next cycle
    gc.stable_refs().dispose(handle);
    assert!(gc.perform_full_gc().is_empty());
    assert_eq!(heap.object_count(), 0);
}

#[test]
fn test_buffered_thread_local_is_a_root() {
    let (heap, gc) = new_gc();
    let mutator = gc.threads().register_current();

    let object = heap.allocate(TestObject::new(5)).unwrap();
    let slot = mutator.add_tls_slot();
    mutator.write_tls(slot, object.as_header());

    assert!(gc.perform_full_gc().is_empty());

    assert!(heap.contains(object.object()));
    assert_eq!(gc.stats().last_report.unwrap().roots.thread_local, 1);
}

#[test]
fn test_colors_reset_after_repeated_cycles() {
    let (heap, gc) = new_gc();
    let mutator = gc.threads().register_current();

    let shared = heap.allocate(TestObject::new(0)).unwrap();
    for i in 1..=5 {
        let parent = heap.allocate(TestObject::new(i)).unwrap();
        unsafe { parent.get().point_to(shared.as_header()) };
        mutator.push_root(parent.as_header());
    }
    mutator.push_root(shared.as_header());

    for expected_epoch in 1..=3 {
        assert!(gc.perform_full_gc().is_empty());
        assert_eq!(gc.epoch(), expected_epoch);
        assert_eq!(heap.object_count(), 6);
        for object in heap.snapshot_objects() {
            assert_eq!(color_of(&heap, object), Color::White);
        }
    }
}

#[test]
fn test_epoch_only_counts_completed_cycles() {
    let (_heap, gc) = new_gc();
    assert_eq!(gc.epoch(), 0);
    assert_eq!(gc.phase(), GcPhase::Idle);

    let mut last = gc.epoch();
    for _ in 0..5 {
        gc.collect_garbage();
        let epoch = gc.epoch();
        assert_eq!(epoch, last + 1);
        last = epoch;
    }
    assert_eq!(gc.stats().collections, 5);
}

/// Heap wrapper counting how often each object's edges are scanned
struct CountingHeap {
    inner: ObjectFactory,
    scans: Mutex<HashMap<ObjectRef, usize>>,
}

impl ObjectHeap for CountingHeap {
    unsafe fn object_data(&self, object: ObjectRef) -> &ObjectData {
        unsafe { self.inner.object_data(object) }
    }

    unsafe fn trace_object(&self, object: ObjectRef, tracer: &mut dyn FnMut(*const GcHeader)) {
        *self.scans.lock().entry(object).or_default() += 1;
        unsafe { self.inner.trace_object(object, tracer) }
    }

    unsafe fn requires_finalizer(&self, object: ObjectRef) -> bool {
        unsafe { self.inner.requires_finalizer(object) }
    }

    fn object_count(&self) -> usize {
        self.inner.object_count()
    }

    fn snapshot_objects(&self) -> Vec<ObjectRef> {
        self.inner.snapshot_objects()
    }

    unsafe fn reclaim(&self, object: ObjectRef) {
        unsafe { self.inner.reclaim(object) }
    }

    unsafe fn detach_for_finalization(&self, object: ObjectRef) {
        unsafe { self.inner.detach_for_finalization(object) }
    }

    unsafe fn finalize(&self, object: ObjectRef) {
        unsafe { self.inner.finalize(object) }
    }
}

#[test]
fn test_shared_object_scanned_once() {
    let heap = Arc::new(CountingHeap {
        inner: ObjectFactory::new(),
        scans: Mutex::new(HashMap::new()),
    });
    let gc = GcCoordinator::new(GcConfig::default(), Arc::clone(&heap));

    let shared = heap.inner.allocate(TestObject::new(0)).unwrap();
    for i in 0..16 {
        let parent = heap.inner.allocate(TestObject::new(i)).unwrap();
        unsafe { parent.get().point_to(shared.as_header()) };
        gc.globals().register(parent.as_header());
    }
    // Root it directly as well
    gc.globals().register(shared.as_header());

    assert!(gc.perform_full_gc().is_empty());

    let scans = heap.scans.lock();
    assert_eq!(scans.len(), 17);
    assert!(scans.values().all(|&count| count == 1));
    assert_eq!(scans.get(&shared.object()), Some(&1));
}
