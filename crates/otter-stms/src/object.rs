//! GC object layout
//!
//! The collector only needs two things from an object: its color and a way to enumerate its
//! outgoing references. Both live in the [`GcHeader`] that precedes every managed value.

use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU8, Ordering};

/// Sentinel slot value that is never a real object.
///
/// Root slots and traced fields may hold it; it is skipped exactly like null.
pub const MARKER: *const GcHeader = std::ptr::without_provenance(1);

/// Returns true for null and for [`MARKER`].
#[inline]
pub fn is_null_or_marker(ptr: *const GcHeader) -> bool {
    ptr.addr() <= MARKER.addr()
}

/// Contents of a root slot: an object, null, or [`MARKER`].
///
/// SAFETY: slots are only read by their owner and by the collecting thread while the world is
/// stopped; every slot container is behind a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SlotValue(pub(crate) *const GcHeader);

// SAFETY: see above
unsafe impl Send for SlotValue {}
unsafe impl Sync for SlotValue {}

impl SlotValue {
    pub(crate) const NULL: SlotValue = SlotValue(std::ptr::null());
}

/// Mark color
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Color {
    /// Initial color at the start of every cycle, and the color of new objects.
    /// Objects still White once marking is done are garbage.
    White = 0,
    /// Reached during the mark phase
    Black = 1,
}

/// Per-object collector state.
///
/// Stored by the allocator alongside its own metadata; the collector touches nothing else.
#[derive(Debug)]
pub struct ObjectData {
    color: AtomicU8,
}

impl ObjectData {
    /// Fresh, White object data
    pub const fn new() -> Self {
        Self {
            color: AtomicU8::new(Color::White as u8),
        }
    }

    /// Current color
    #[inline]
    pub fn color(&self) -> Color {
        match self.color.load(Ordering::Acquire) {
            0 => Color::White,
            _ => Color::Black,
        }
    }

    /// Overwrite the color
    #[inline]
    pub fn set_color(&self, color: Color) {
        self.color.store(color as u8, Ordering::Release);
    }

    /// Whether the object was reached this cycle
    #[inline]
    pub fn is_marked(&self) -> bool {
        self.color() == Color::Black
    }

    /// Transition White to Black.
    ///
    /// Returns false when the object is already Black, i.e. someone visited it first.
    #[inline]
    pub fn try_mark(&self) -> bool {
        self.color
            .compare_exchange(
                Color::White as u8,
                Color::Black as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Transition Black back to White.
    ///
    /// Returns false when the object was White, i.e. unreachable this cycle.
    #[inline]
    pub fn try_reset_mark(&self) -> bool {
        self.color
            .compare_exchange(
                Color::Black as u8,
                Color::White as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

impl Default for ObjectData {
    fn default() -> Self {
        Self::new()
    }
}

/// Trace function signature
pub(crate) type TraceFn = unsafe fn(*const GcHeader, &mut dyn FnMut(*const GcHeader));
/// Finalize function signature
pub(crate) type FinalizeFn = unsafe fn(*mut GcHeader);
/// Drop-and-free function signature
pub(crate) type DropFn = unsafe fn(*mut GcHeader);

/// Type-erased operations for one managed type, shared by all its instances.
pub(crate) struct GcVTable {
    /// `None` for types without outgoing references
    pub(crate) trace: Option<TraceFn>,
    /// `None` for types without a finalizer
    pub(crate) finalize: Option<FinalizeFn>,
    /// Drops the value and releases the allocation
    pub(crate) drop: DropFn,
    /// Allocation size in bytes, header included
    pub(crate) size: usize,
}

/// GC object header
#[repr(C)]
pub struct GcHeader {
    data: ObjectData,
    vtable: &'static GcVTable,
}

impl GcHeader {
    pub(crate) const fn new(vtable: &'static GcVTable) -> Self {
        Self {
            data: ObjectData::new(),
            vtable,
        }
    }

    /// Collector state of this object
    #[inline]
    pub fn data(&self) -> &ObjectData {
        &self.data
    }

    /// Allocation size in bytes, header included
    #[inline]
    pub fn size(&self) -> usize {
        self.vtable.size
    }

    /// Whether the object must be finalized before its storage is released
    #[inline]
    pub fn needs_finalizer(&self) -> bool {
        self.vtable.finalize.is_some()
    }

    /// Report every outgoing reference to `tracer`.
    ///
    /// # Safety
    /// The header must belong to a live allocation.
    pub(crate) unsafe fn trace(&self, tracer: &mut dyn FnMut(*const GcHeader)) {
        if let Some(trace) = self.vtable.trace {
            // SAFETY: caller guarantees the allocation is live
            unsafe { trace(self, tracer) };
        }
    }

    /// Run the finalizer, if any.
    ///
    /// # Safety
    /// `this` must point to a live allocation that no mutator can reach anymore.
    pub(crate) unsafe fn finalize(this: *mut GcHeader) {
        // SAFETY: caller guarantees `this` is live
        let finalize = unsafe { (*this).vtable.finalize };
        if let Some(finalize) = finalize {
            // SAFETY: caller guarantees exclusive access
            unsafe { finalize(this) };
        }
    }

    /// Drop the value and release its storage.
    ///
    /// # Safety
    /// `this` must point to a live allocation; it is dangling afterwards.
    pub(crate) unsafe fn destroy(this: *mut GcHeader) {
        // SAFETY: caller guarantees `this` is live
        unsafe {
            let drop_fn = (*this).vtable.drop;
            drop_fn(this);
        }
    }
}

impl fmt::Debug for GcHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GcHeader")
            .field("color", &self.data.color())
            .field("size", &self.vtable.size)
            .finish()
    }
}

/// Non-null, non-marker reference to a managed object.
///
/// Only meaningful while the object is owned by its heap.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectRef(NonNull<GcHeader>);

// SAFETY: ObjectRef is an address. Dereferencing it is gated behind `unsafe` and is only done
// by the collecting thread while the world is stopped, or by the owning heap.
unsafe impl Send for ObjectRef {}
unsafe impl Sync for ObjectRef {}

impl ObjectRef {
    /// Wrap a slot value, rejecting null and [`MARKER`].
    #[inline]
    pub fn from_raw(ptr: *const GcHeader) -> Option<Self> {
        if is_null_or_marker(ptr) {
            return None;
        }
        NonNull::new(ptr.cast_mut()).map(Self)
    }

    #[inline]
    pub(crate) fn from_non_null(ptr: NonNull<GcHeader>) -> Self {
        Self(ptr)
    }

    /// Raw header pointer
    #[inline]
    pub fn as_ptr(self) -> *const GcHeader {
        self.0.as_ptr()
    }

    #[inline]
    pub(crate) fn as_mut_ptr(self) -> *mut GcHeader {
        self.0.as_ptr()
    }

    /// Borrow the header.
    ///
    /// # Safety
    /// The object must still be owned by its heap for the whole of `'a`.
    #[inline]
    pub unsafe fn header<'a>(self) -> &'a GcHeader {
        // SAFETY: caller guarantees liveness
        unsafe { self.0.as_ref() }
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({:p})", self.0)
    }
}

/// Trait for types that can live in a managed heap
pub trait Trace: Send + Sync + 'static {
    /// Whether this type contains GC references that need tracing
    const NEEDS_TRACE: bool;

    /// Whether dead instances are queued for [`Trace::finalize`] instead of being freed
    /// during sweep
    const NEEDS_FINALIZER: bool = false;

    /// Report all GC references in this value. Null and [`MARKER`] may be reported;
    /// the marker skips them.
    fn trace(&self, tracer: &mut dyn FnMut(*const GcHeader));

    /// Cleanup run once, after the world resumes, on the thread that collected.
    ///
    /// Objects referenced only by a finalizable object are reclaimed in the same cycle, so by
    /// the time this runs the managed references it holds may dangle. A finalizer must not
    /// dereference them; it may only release non-managed resources.
    fn finalize(&mut self) {}
}

impl Trace for () {
    const NEEDS_TRACE: bool = false;
    fn trace(&self, _tracer: &mut dyn FnMut(*const GcHeader)) {}
}

impl Trace for bool {
    const NEEDS_TRACE: bool = false;
    fn trace(&self, _tracer: &mut dyn FnMut(*const GcHeader)) {}
}

impl Trace for i32 {
    const NEEDS_TRACE: bool = false;
    fn trace(&self, _tracer: &mut dyn FnMut(*const GcHeader)) {}
}

impl Trace for i64 {
    const NEEDS_TRACE: bool = false;
    fn trace(&self, _tracer: &mut dyn FnMut(*const GcHeader)) {}
}

impl Trace for f64 {
    const NEEDS_TRACE: bool = false;
    fn trace(&self, _tracer: &mut dyn FnMut(*const GcHeader)) {}
}

impl Trace for String {
    const NEEDS_TRACE: bool = false;
    fn trace(&self, _tracer: &mut dyn FnMut(*const GcHeader)) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_data_marking() {
        let data = ObjectData::new();
        assert_eq!(data.color(), Color::White);
        assert!(!data.is_marked());

        assert!(data.try_mark());
        assert_eq!(data.color(), Color::Black);

        // Second visitor loses
        assert!(!data.try_mark());
        assert!(data.is_marked());
    }

    #[test]
    fn test_object_data_reset() {
        let data = ObjectData::new();
        assert!(!data.try_reset_mark());

        data.set_color(Color::Black);
        assert!(data.try_reset_mark());
        assert_eq!(data.color(), Color::White);
        assert!(!data.try_reset_mark());
    }

    #[test]
    fn test_null_and_marker_rejected() {
        assert!(is_null_or_marker(std::ptr::null()));
        assert!(is_null_or_marker(MARKER));
        assert!(ObjectRef::from_raw(std::ptr::null()).is_none());
        assert!(ObjectRef::from_raw(MARKER).is_none());

        let fake = std::ptr::without_provenance::<GcHeader>(64);
        assert!(!is_null_or_marker(fake));
        assert_eq!(ObjectRef::from_raw(fake).map(ObjectRef::as_ptr), Some(fake));
    }
}
