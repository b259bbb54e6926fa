//! Finalizer queue
//!
//! Dead objects that need cleanup leave the sweeper through a [`FinalizerQueue`]. The queue
//! belongs to whoever ran the cycle and must be drained after the world resumes.

use crate::heap::ObjectHeap;
use crate::object::ObjectRef;

/// Unreachable objects waiting for their finalizer
#[must_use = "queued objects are only finalized by `FinalizerQueue::finalize`"]
#[derive(Debug, Default)]
pub struct FinalizerQueue {
    objects: Vec<ObjectRef>,
}

impl FinalizerQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a detached object
    pub fn push(&mut self, object: ObjectRef) {
        self.objects.push(object);
    }

    /// Number of queued objects
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether nothing needs finalization
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Queued objects, in sweep order
    pub fn iter(&self) -> impl Iterator<Item = ObjectRef> + '_ {
        self.objects.iter().copied()
    }

    /// Run every finalizer once and release the objects. Returns the number finalized.
    ///
    /// Must run with the world resumed; finalizers may allocate or trigger a collection.
    pub fn finalize<H>(self, heap: &H) -> usize
    where
        H: ObjectHeap + ?Sized,
    {
        let count = self.objects.len();
        for object in self.objects {
            // SAFETY: queued objects were detached by this heap's sweep and are finalized
            // exactly once since the queue is consumed
            unsafe { heap.finalize(object) };
        }
        count
    }
}
