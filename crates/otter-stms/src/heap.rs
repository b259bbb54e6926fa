//! Object storage
//!
//! [`ObjectHeap`] is the narrow capability the collector needs from an allocator: per-object
//! color, per-object tracing, enumeration and reclamation. [`ObjectFactory`] is the allocator
//! the runtime uses; each object is an individual `#[repr(C)]` box whose header comes first.

use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHashSet;

use crate::error::{GcError, GcResult};
use crate::object::{FinalizeFn, GcHeader, GcVTable, ObjectData, ObjectRef, Trace, TraceFn};

/// What the collector needs from an object store.
///
/// Enumeration results are only meaningful while the world is stopped; the collector never
/// calls them otherwise.
pub trait ObjectHeap: Send + Sync {
    /// Collector state of `object`.
    ///
    /// # Safety
    /// `object` must be owned by this heap.
    unsafe fn object_data(&self, object: ObjectRef) -> &ObjectData;

    /// Report every outgoing reference of `object` to `tracer`.
    ///
    /// # Safety
    /// `object` must be owned by this heap.
    unsafe fn trace_object(&self, object: ObjectRef, tracer: &mut dyn FnMut(*const GcHeader));

    /// Whether `object` must be finalized rather than freed outright.
    ///
    /// # Safety
    /// `object` must be owned by this heap.
    unsafe fn requires_finalizer(&self, object: ObjectRef) -> bool;

    /// Number of live objects. Excludes objects waiting for finalization.
    fn object_count(&self) -> usize;

    /// Every live object.
    fn snapshot_objects(&self) -> Vec<ObjectRef>;

    /// Free `object` now.
    ///
    /// # Safety
    /// `object` must be owned by this heap and unreachable.
    unsafe fn reclaim(&self, object: ObjectRef);

    /// Stop enumerating `object` but keep its storage until [`ObjectHeap::finalize`].
    ///
    /// # Safety
    /// `object` must be owned by this heap and unreachable.
    unsafe fn detach_for_finalization(&self, object: ObjectRef);

    /// Run the finalizer of a detached object, then free it.
    ///
    /// # Safety
    /// `object` must have been detached by this heap and not finalized yet.
    unsafe fn finalize(&self, object: ObjectRef);
}

/// Header and value, laid out header-first so an `ObjectRef` is also the box address.
#[repr(C)]
pub(crate) struct GcBox<T> {
    header: GcHeader,
    value: T,
}

impl<T: Trace> GcBox<T> {
    const VTABLE: &'static GcVTable = &GcVTable {
        trace: if T::NEEDS_TRACE {
            Some(Self::trace_box as TraceFn)
        } else {
            None
        },
        finalize: if T::NEEDS_FINALIZER {
            Some(Self::finalize_box as FinalizeFn)
        } else {
            None
        },
        drop: Self::drop_box,
        size: std::mem::size_of::<GcBox<T>>(),
    };

    unsafe fn trace_box(header: *const GcHeader, tracer: &mut dyn FnMut(*const GcHeader)) {
        let gc_box = header.cast::<GcBox<T>>();
        // SAFETY: the vtable is only reachable from headers of GcBox<T>
        unsafe { (*gc_box).value.trace(tracer) }
    }

    unsafe fn finalize_box(header: *mut GcHeader) {
        let gc_box = header.cast::<GcBox<T>>();
        // SAFETY: the vtable is only reachable from headers of GcBox<T>; the object is
        // unreachable so nothing else holds a reference
        unsafe { (*gc_box).value.finalize() }
    }

    unsafe fn drop_box(header: *mut GcHeader) {
        // SAFETY: every GcBox is created by Box::new in ObjectFactory::allocate
        drop(unsafe { Box::from_raw(header.cast::<GcBox<T>>()) });
    }
}

/// Typed handle to an object allocated by an [`ObjectFactory`].
///
/// A `Gc` does not keep its object alive; store it in a root slot or in a traced field.
pub struct Gc<T> {
    ptr: NonNull<GcBox<T>>,
    _marker: PhantomData<T>,
}

impl<T> Clone for Gc<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Gc<T> {}

impl<T> PartialEq for Gc<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl<T> Eq for Gc<T> {}

// SAFETY: a Gc is an address of a value that is itself Send + Sync (see `Trace`)
unsafe impl<T: Send + Sync> Send for Gc<T> {}
unsafe impl<T: Send + Sync> Sync for Gc<T> {}

impl<T> Gc<T> {
    /// Untyped reference for the collector
    #[inline]
    pub fn object(self) -> ObjectRef {
        ObjectRef::from_non_null(self.ptr.cast::<GcHeader>())
    }

    /// Header pointer, the form stored in root slots and reported by [`Trace::trace`]
    #[inline]
    pub fn as_header(self) -> *const GcHeader {
        self.ptr.as_ptr().cast::<GcHeader>().cast_const()
    }

    /// Typed handle from a slot value; `None` for null and the marker.
    ///
    /// # Safety
    /// A non-null `ptr` must come from [`Gc::as_header`] of a `Gc<T>` with the same `T`.
    pub unsafe fn from_header(ptr: *const GcHeader) -> Option<Self> {
        ObjectRef::from_raw(ptr)
            .and_then(|object| NonNull::new(object.as_mut_ptr().cast::<GcBox<T>>()))
            .map(|ptr| Gc {
                ptr,
                _marker: PhantomData,
            })
    }

    /// Borrow the value.
    ///
    /// # Safety
    /// The object must not have been reclaimed, i.e. it was reachable at every collection
    /// since it was allocated.
    #[inline]
    pub unsafe fn get<'a>(self) -> &'a T {
        // SAFETY: caller guarantees liveness
        unsafe { &(*self.ptr.as_ptr()).value }
    }
}

impl<T> fmt::Debug for Gc<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Gc({:p})", self.ptr)
    }
}

/// Allocator owning every managed object.
pub struct ObjectFactory {
    /// Live objects, enumerated by the sweeper
    objects: Mutex<FxHashSet<ObjectRef>>,
    /// Unreachable objects whose storage is held until their finalizer runs
    finalizing: Mutex<FxHashSet<ObjectRef>>,
    /// Bytes held by live and finalizing objects
    total_bytes: AtomicUsize,
    /// Capacity in bytes, `None` for unbounded
    limit: Option<usize>,
}

impl ObjectFactory {
    /// Create an unbounded factory
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Create a factory that refuses allocations beyond `limit` bytes
    pub fn with_limit(limit: usize) -> Self {
        Self::build(Some(limit))
    }

    fn build(limit: Option<usize>) -> Self {
        Self {
            objects: Mutex::new(FxHashSet::default()),
            finalizing: Mutex::new(FxHashSet::default()),
            total_bytes: AtomicUsize::new(0),
            limit,
        }
    }

    /// Allocate a managed value.
    ///
    /// The new object is White and unrooted: root it before the next safepoint.
    pub fn allocate<T: Trace>(&self, value: T) -> GcResult<Gc<T>> {
        self.reserve(std::mem::size_of::<GcBox<T>>())?;
        Ok(self.allocate_reserved(value))
    }

    /// Box `value` into bytes already taken by [`ObjectFactory::reserve`].
    pub(crate) fn allocate_reserved<T: Trace>(&self, value: T) -> Gc<T> {
        let boxed = Box::new(GcBox {
            header: GcHeader::new(GcBox::<T>::VTABLE),
            value,
        });
        let ptr = NonNull::from(Box::leak(boxed));
        let handle = Gc {
            ptr,
            _marker: PhantomData,
        };
        self.objects.lock().insert(handle.object());

        handle
    }

    /// Whether an allocation of `size` bytes would currently fit
    pub fn has_room_for(&self, size: usize) -> bool {
        match self.limit {
            Some(limit) => self.total_bytes().saturating_add(size) <= limit,
            None => true,
        }
    }

    /// Take `size` bytes of capacity for an allocation that follows
    pub(crate) fn reserve(&self, size: usize) -> GcResult<()> {
        let Some(limit) = self.limit else {
            self.total_bytes.fetch_add(size, Ordering::Relaxed);
            return Ok(());
        };

        self.total_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_add(size).filter(|&next| next <= limit)
            })
            .map(|_| ())
            .map_err(|_| GcError::OutOfMemory {
                requested: size,
                limit,
            })
    }

    /// Get total allocated bytes, including objects waiting for finalization
    pub fn total_bytes(&self) -> usize {
        self.total_bytes.load(Ordering::Relaxed)
    }

    /// Capacity limit, if any
    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// Number of detached objects waiting for their finalizer
    pub fn pending_finalization_count(&self) -> usize {
        self.finalizing.lock().len()
    }

    /// Whether `object` is a live object of this factory
    pub fn contains(&self, object: ObjectRef) -> bool {
        self.objects.lock().contains(&object)
    }

    /// Free every object without marking or finalizing.
    ///
    /// Used at teardown. Returns the number of bytes released.
    pub fn dealloc_all(&self) -> usize {
        let total = self.total_bytes.swap(0, Ordering::AcqRel);

        let live: Vec<ObjectRef> = self.objects.lock().drain().collect();
        let finalizing: Vec<ObjectRef> = self.finalizing.lock().drain().collect();

        for object in live.into_iter().chain(finalizing) {
            // SAFETY: the object was owned by this factory and is no longer enumerable
            unsafe { GcHeader::destroy(object.as_mut_ptr()) };
        }

        total
    }

    fn release(&self, object: ObjectRef) {
        // SAFETY: callers pass objects they just removed from one of the sets
        unsafe {
            let size = object.header().size();
            GcHeader::destroy(object.as_mut_ptr());
            self.total_bytes.fetch_sub(size, Ordering::Relaxed);
        }
    }
}

impl ObjectHeap for ObjectFactory {
    unsafe fn object_data(&self, object: ObjectRef) -> &ObjectData {
        // SAFETY: caller guarantees the object is owned by this factory
        unsafe { object.header().data() }
    }

    unsafe fn trace_object(&self, object: ObjectRef, tracer: &mut dyn FnMut(*const GcHeader)) {
        // SAFETY: caller guarantees the object is owned by this factory
        unsafe { object.header().trace(tracer) }
    }

    unsafe fn requires_finalizer(&self, object: ObjectRef) -> bool {
        // SAFETY: caller guarantees the object is owned by this factory
        unsafe { object.header().needs_finalizer() }
    }

    fn object_count(&self) -> usize {
        self.objects.lock().len()
    }

    fn snapshot_objects(&self) -> Vec<ObjectRef> {
        self.objects.lock().iter().copied().collect()
    }

    unsafe fn reclaim(&self, object: ObjectRef) {
        let removed = self.objects.lock().remove(&object);
        debug_assert!(removed, "reclaiming {object:?} which is not live");
        if removed {
            self.release(object);
        }
    }

    unsafe fn detach_for_finalization(&self, object: ObjectRef) {
        if self.objects.lock().remove(&object) {
            self.finalizing.lock().insert(object);
        }
    }

    unsafe fn finalize(&self, object: ObjectRef) {
        if !self.finalizing.lock().remove(&object) {
            return;
        }
        // SAFETY: detached objects are unreachable, so the finalizer has exclusive access
        unsafe { GcHeader::finalize(object.as_mut_ptr()) };
        self.release(object);
    }
}

impl Default for ObjectFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ObjectFactory {
    fn drop(&mut self) {
        self.dealloc_all();
    }
}

impl fmt::Debug for ObjectFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectFactory")
            .field("objects", &self.object_count())
            .field("finalizing", &self.pending_finalization_count())
            .field("total_bytes", &self.total_bytes())
            .field("limit", &self.limit)
            .finish()
    }
}
