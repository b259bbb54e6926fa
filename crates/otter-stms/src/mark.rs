//! Mark phase

use crate::error::invariant_violation;
use crate::heap::ObjectHeap;
use crate::object::ObjectRef;
use crate::suspension::ThreadSuspension;

/// Mark everything reachable from `roots` Black.
///
/// Gray objects live only on an explicit worklist; an object may be pushed once per incoming
/// edge, but its edges are scanned only by the visitor that wins the White to Black transition.
/// Returns the number of objects scanned.
///
/// The calling thread must hold the stopped world, and every object must be White on entry.
pub(crate) fn mark<H>(
    heap: &H,
    suspension: &ThreadSuspension,
    roots: impl IntoIterator<Item = ObjectRef>,
) -> usize
where
    H: ObjectHeap + ?Sized,
{
    if !suspension.is_held_by_current() {
        invariant_violation("marking without holding the stopped world");
    }

    let mut worklist: Vec<ObjectRef> = roots.into_iter().collect();
    let mut scanned = 0;

    while let Some(object) = worklist.pop() {
        // SAFETY: roots and traced edges point at objects owned by `heap`
        let data = unsafe { heap.object_data(object) };
        if !data.try_mark() {
            continue;
        }
        scanned += 1;

        // SAFETY: as above
        unsafe {
            heap.trace_object(object, &mut |child| {
                if let Some(child) = ObjectRef::from_raw(child) {
                    worklist.push(child);
                }
            });
        }
    }

    scanned
}
