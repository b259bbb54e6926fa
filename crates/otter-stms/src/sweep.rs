//! Sweep phase

use crate::error::invariant_violation;
use crate::finalizer::FinalizerQueue;
use crate::heap::ObjectHeap;
use crate::suspension::ThreadSuspension;

/// Reclaim every White object and reset survivors to White.
///
/// Dead objects that need finalization are detached instead of freed and returned in the
/// queue. The calling thread must hold the stopped world.
pub(crate) fn sweep<H>(heap: &H, suspension: &ThreadSuspension) -> FinalizerQueue
where
    H: ObjectHeap + ?Sized,
{
    if !suspension.is_held_by_current() {
        invariant_violation("sweeping without holding the stopped world");
    }

    let mut finalizers = FinalizerQueue::new();

    for object in heap.snapshot_objects() {
        // SAFETY: the snapshot only holds objects owned by `heap`, and nothing else mutates
        // the heap while the world is stopped
        unsafe {
            if heap.object_data(object).try_reset_mark() {
                continue;
            }
            if heap.requires_finalizer(object) {
                heap.detach_for_finalization(object);
                finalizers.push(object);
            } else {
                heap.reclaim(object);
            }
        }
    }

    finalizers
}
