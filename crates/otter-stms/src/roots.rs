//! Root set enumeration
//!
//! Roots come from four places: each mutator's shadow stack and thread-local slots, the global
//! slots in [`GlobalRoots`], and the external handles in [`StableRefRegistry`].

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::object::{GcHeader, ObjectRef, SlotValue};
use crate::thread::ThreadRegistry;

/// Where a root was found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RootSource {
    /// A mutator's shadow stack
    Stack,
    /// A mutator's thread-local slot
    ThreadLocal,
    /// A global slot
    Global,
    /// An external stable handle
    StableRef,
}

/// One root reference with its origin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootSetEntry {
    /// Referenced object, never null or the marker
    pub object: ObjectRef,
    /// Where it was found
    pub source: RootSource,
}

/// Root counts per source
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RootSetCounts {
    /// Shadow stack roots, over all threads
    pub stack: usize,
    /// Thread-local roots, over all threads
    pub thread_local: usize,
    /// Global roots
    pub global: usize,
    /// Stable handle roots
    pub stable_ref: usize,
}

impl RootSetCounts {
    /// Sum over all sources
    pub fn total(&self) -> usize {
        self.stack + self.thread_local + self.global + self.stable_ref
    }

    fn record(&mut self, source: RootSource) {
        match source {
            RootSource::Stack => self.stack += 1,
            RootSource::ThreadLocal => self.thread_local += 1,
            RootSource::Global => self.global += 1,
            RootSource::StableRef => self.stable_ref += 1,
        }
    }
}

/// Roots of one cycle
#[derive(Debug, Default)]
pub struct RootSet {
    entries: Vec<RootSetEntry>,
    counts: RootSetCounts,
}

impl RootSet {
    /// Empty root set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `object` unless it is null or the marker. Returns whether it was added.
    pub fn push(&mut self, object: *const GcHeader, source: RootSource) -> bool {
        match ObjectRef::from_raw(object) {
            Some(object) => {
                self.entries.push(RootSetEntry { object, source });
                self.counts.record(source);
                true
            }
            None => false,
        }
    }

    /// All entries, in enumeration order
    pub fn entries(&self) -> &[RootSetEntry] {
        &self.entries
    }

    /// Referenced objects, possibly with duplicates
    pub fn objects(&self) -> impl Iterator<Item = ObjectRef> + '_ {
        self.entries.iter().map(|entry| entry.object)
    }

    /// Per-source counts
    pub fn counts(&self) -> RootSetCounts {
        self.counts
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no root was found
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Handle to a global slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GlobalId(usize);

/// Process-wide global variable slots
#[derive(Debug, Default)]
pub struct GlobalRoots {
    slots: RwLock<Vec<SlotValue>>,
}

impl GlobalRoots {
    /// Create an empty global table
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a global slot holding `object`
    pub fn register(&self, object: *const GcHeader) -> GlobalId {
        let mut slots = self.slots.write();
        slots.push(SlotValue(object));
        GlobalId(slots.len() - 1)
    }

    /// Overwrite a global slot
    pub fn set(&self, id: GlobalId, object: *const GcHeader) {
        if let Some(slot) = self.slots.write().get_mut(id.0) {
            *slot = SlotValue(object);
        }
    }

    /// Read a global slot
    pub fn get(&self, id: GlobalId) -> Option<*const GcHeader> {
        self.slots.read().get(id.0).map(|slot| slot.0)
    }

    /// Number of registered slots, including null ones
    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    /// Whether no slot was registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn for_each(&self, mut f: impl FnMut(*const GcHeader)) {
        for slot in self.slots.read().iter() {
            f(slot.0);
        }
    }
}

/// Handle to an object held from outside the managed heap.
///
/// Disposing consumes the handle.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct StableRef(u64);

impl StableRef {
    /// Registry-assigned id
    pub fn id(&self) -> u64 {
        self.0
    }
}

#[derive(Debug, Default)]
struct StableRefs {
    live: FxHashMap<u64, SlotValue>,
    pending_deletions: Vec<u64>,
}

/// External handle table.
///
/// Disposal is deferred: a disposed handle keeps its object alive until the next
/// [`StableRefRegistry::process_deletions`], which the collector runs with the world stopped.
#[derive(Debug, Default)]
pub struct StableRefRegistry {
    refs: Mutex<StableRefs>,
    next_id: AtomicU64,
}

impl StableRefRegistry {
    /// Create an empty handle table
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin `object` until the returned handle is disposed
    pub fn create(&self, object: *const GcHeader) -> StableRef {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.refs.lock().live.insert(id, SlotValue(object));
        StableRef(id)
    }

    /// Object behind `handle`
    pub fn get(&self, handle: &StableRef) -> Option<*const GcHeader> {
        self.refs.lock().live.get(&handle.0).map(|slot| slot.0)
    }

    /// Release `handle`. Takes effect at the next collection.
    pub fn dispose(&self, handle: StableRef) {
        self.refs.lock().pending_deletions.push(handle.0);
    }

    /// Drop every disposed handle. Returns the number removed.
    pub fn process_deletions(&self) -> usize {
        let mut refs = self.refs.lock();
        let StableRefs {
            live,
            pending_deletions,
        } = &mut *refs;
        pending_deletions
            .drain(..)
            .filter(|id| live.remove(id).is_some())
            .count()
    }

    /// Handles not yet removed, disposed ones included
    pub fn len(&self) -> usize {
        self.refs.lock().live.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Disposed handles waiting for [`StableRefRegistry::process_deletions`]
    pub fn pending_deletions(&self) -> usize {
        self.refs.lock().pending_deletions.len()
    }

    fn for_each(&self, mut f: impl FnMut(*const GcHeader)) {
        for slot in self.refs.lock().live.values() {
            f(slot.0);
        }
    }
}

/// Enumerate every root.
///
/// Must run with the world stopped. Buffered thread-local writes are published first, and
/// disposed stable handles are removed before the handle table is scanned.
pub fn collect_root_set(
    threads: &ThreadRegistry,
    globals: &GlobalRoots,
    stable_refs: &StableRefRegistry,
) -> RootSet {
    let mut root_set = RootSet::new();

    for thread in threads.lock_for_iter().iter() {
        thread.publish();
        let before = root_set.counts();
        thread.for_each_root(|ptr, source| {
            root_set.push(ptr, source);
        });
        let after = root_set.counts();
        let stack = after.stack - before.stack;
        let tls = after.thread_local - before.thread_local;
        tracing::debug!(
            target: "otter::gc",
            thread = thread.id(),
            stack,
            tls,
            "Collected root set for thread"
        );
    }

    let disposed = stable_refs.process_deletions();

    globals.for_each(|ptr| {
        root_set.push(ptr, RootSource::Global);
    });
    stable_refs.for_each(|ptr| {
        root_set.push(ptr, RootSource::StableRef);
    });

    let counts = root_set.counts();
    tracing::debug!(
        target: "otter::gc",
        global = counts.global,
        stable_ref = counts.stable_ref,
        disposed,
        "Collected global root set"
    );

    root_set
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::MARKER;

    fn fake(addr: usize) -> *const GcHeader {
        std::ptr::without_provenance(addr)
    }

    #[test]
    fn test_root_set_skips_null_and_marker() {
        let mut roots = RootSet::new();
        assert!(!roots.push(std::ptr::null(), RootSource::Stack));
        assert!(!roots.push(MARKER, RootSource::Global));
        assert!(roots.push(fake(64), RootSource::StableRef));

        assert_eq!(roots.len(), 1);
        assert_eq!(roots.counts().stable_ref, 1);
        assert_eq!(roots.counts().total(), 1);
    }

    #[test]
    fn test_globals() {
        let globals = GlobalRoots::new();
        let id = globals.register(std::ptr::null());
        assert_eq!(globals.get(id), Some(std::ptr::null()));

        globals.set(id, fake(64));
        assert_eq!(globals.get(id), Some(fake(64)));
        assert_eq!(globals.len(), 1);
    }

    #[test]
    fn test_stable_ref_disposal_is_deferred() {
        let registry = StableRefRegistry::new();
        let kept = registry.create(fake(64));
        let dropped = registry.create(fake(128));

        registry.dispose(dropped);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.pending_deletions(), 1);

        assert_eq!(registry.process_deletions(), 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(&kept), Some(fake(64)));
    }

    #[test]
    fn test_collect_root_set_sources() {
        let threads = ThreadRegistry::new();
        let globals = GlobalRoots::new();
        let stable_refs = StableRefRegistry::new();

        let thread = threads.register_current();
        thread.push_root(fake(64));
        thread.push_root(std::ptr::null());
        let slot = thread.add_tls_slot();
        thread.write_tls(slot, fake(128));

        globals.register(fake(192));
        globals.register(MARKER);
        let handle = stable_refs.create(fake(256));
        stable_refs.create(fake(320));
        stable_refs.dispose(handle);

        let roots = collect_root_set(&threads, &globals, &stable_refs);
        let counts = roots.counts();
        assert_eq!(counts.stack, 1);
        // Buffered write was published before enumeration
        assert_eq!(counts.thread_local, 1);
        assert_eq!(counts.global, 1);
        // Disposed handle is not a root
        assert_eq!(counts.stable_ref, 1);
        assert_eq!(roots.len(), 4);

        let sources: Vec<RootSource> = roots.entries().iter().map(|e| e.source).collect();
        assert_eq!(
            sources,
            vec![
                RootSource::Stack,
                RootSource::ThreadLocal,
                RootSource::Global,
                RootSource::StableRef
            ]
        );
    }
}
