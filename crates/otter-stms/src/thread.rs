//! Mutator thread registry
//!
//! Every thread that touches managed objects registers a [`MutatorThread`]. The record holds
//! the thread's roots (a shadow stack and thread-local slots) and the two bits the suspension
//! protocol reads: whether the thread is parked, and whether it is executing managed code.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::thread::{self, ThreadId};

use parking_lot::{Mutex, MutexGuard};

use crate::object::{GcHeader, SlotValue};
use crate::roots::RootSource;
use crate::suspension::ThreadSuspension;

/// Execution state of a mutator
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Executing managed code; must reach a safepoint before the world counts as stopped
    Runnable = 0,
    /// Outside managed code; never touches managed objects, so it does not block suspension
    Native = 1,
}

impl From<u8> for ThreadState {
    fn from(v: u8) -> Self {
        match v {
            0 => ThreadState::Runnable,
            _ => ThreadState::Native,
        }
    }
}

/// Per-thread GC record
pub struct MutatorThread {
    id: u64,
    owner: ThreadId,
    state: AtomicU8,
    suspended: AtomicBool,
    /// Shadow stack of local references
    stack_roots: Mutex<Vec<SlotValue>>,
    /// Published thread-local slots
    tls_slots: Mutex<Vec<SlotValue>>,
    /// Thread-local writes not yet visible to the collector
    pending_tls: Mutex<Vec<(usize, SlotValue)>>,
}

impl MutatorThread {
    fn new(id: u64, owner: ThreadId) -> Self {
        Self {
            id,
            owner,
            // Threads join in Native and enter managed code through a state switch, so a
            // collection already in flight parks them first.
            state: AtomicU8::new(ThreadState::Native as u8),
            suspended: AtomicBool::new(false),
            stack_roots: Mutex::new(Vec::new()),
            tls_slots: Mutex::new(Vec::new()),
            pending_tls: Mutex::new(Vec::new()),
        }
    }

    /// Registry-assigned id, unique for the registry's lifetime
    pub fn id(&self) -> u64 {
        self.id
    }

    /// OS thread that owns this record
    pub fn owner(&self) -> ThreadId {
        self.owner
    }

    /// Current execution state
    pub fn state(&self) -> ThreadState {
        ThreadState::from(self.state.load(Ordering::SeqCst))
    }

    /// Switch state, returning the previous one
    pub(crate) fn swap_state(&self, state: ThreadState) -> ThreadState {
        ThreadState::from(self.state.swap(state as u8, Ordering::SeqCst))
    }

    /// Whether the thread is parked at a safepoint
    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    pub(crate) fn set_suspended(&self, suspended: bool) {
        self.suspended.store(suspended, Ordering::SeqCst);
    }

    /// Whether this thread cannot touch managed objects right now
    pub fn is_suspended_or_native(&self) -> bool {
        self.is_suspended() || self.state() == ThreadState::Native
    }

    /// Push a local reference; returns its slot index
    pub fn push_root(&self, object: *const GcHeader) -> usize {
        let mut stack = self.stack_roots.lock();
        stack.push(SlotValue(object));
        stack.len() - 1
    }

    /// Pop the most recent local reference
    pub fn pop_root(&self) -> Option<*const GcHeader> {
        self.stack_roots.lock().pop().map(|slot| slot.0)
    }

    /// Overwrite a local reference slot
    pub fn set_root(&self, index: usize, object: *const GcHeader) {
        if let Some(slot) = self.stack_roots.lock().get_mut(index) {
            *slot = SlotValue(object);
        }
    }

    /// Read a local reference slot
    pub fn root(&self, index: usize) -> Option<*const GcHeader> {
        self.stack_roots.lock().get(index).map(|slot| slot.0)
    }

    /// Current shadow stack depth
    pub fn stack_depth(&self) -> usize {
        self.stack_roots.lock().len()
    }

    /// Drop every local reference above `depth` (frame exit)
    pub fn truncate_roots(&self, depth: usize) {
        self.stack_roots.lock().truncate(depth);
    }

    /// Reserve a thread-local slot, initially null
    pub fn add_tls_slot(&self) -> usize {
        let mut slots = self.tls_slots.lock();
        slots.push(SlotValue::NULL);
        slots.len() - 1
    }

    /// Write a thread-local slot.
    ///
    /// The write is buffered and reaches the collector at the next [`MutatorThread::publish`].
    pub fn write_tls(&self, index: usize, object: *const GcHeader) {
        self.pending_tls.lock().push((index, SlotValue(object)));
    }

    /// Read a thread-local slot, seeing this thread's own unpublished writes
    pub fn read_tls(&self, index: usize) -> Option<*const GcHeader> {
        let pending = self
            .pending_tls
            .lock()
            .iter()
            .rev()
            .find(|(slot, _)| *slot == index)
            .map(|(_, value)| value.0);
        pending.or_else(|| self.tls_slots.lock().get(index).map(|slot| slot.0))
    }

    /// Apply buffered thread-local writes. Returns the number applied.
    pub fn publish(&self) -> usize {
        let pending = std::mem::take(&mut *self.pending_tls.lock());
        let count = pending.len();
        let mut slots = self.tls_slots.lock();
        for (index, value) in pending {
            if let Some(slot) = slots.get_mut(index) {
                *slot = value;
            }
        }
        count
    }

    /// Visit every stack slot, then every published thread-local slot
    pub(crate) fn for_each_root(&self, mut f: impl FnMut(*const GcHeader, RootSource)) {
        for slot in self.stack_roots.lock().iter() {
            f(slot.0, RootSource::Stack);
        }
        for slot in self.tls_slots.lock().iter() {
            f(slot.0, RootSource::ThreadLocal);
        }
    }
}

impl std::fmt::Debug for MutatorThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutatorThread")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("state", &self.state())
            .field("suspended", &self.is_suspended())
            .field("stack_depth", &self.stack_depth())
            .finish()
    }
}

/// Registry of mutator threads
#[derive(Debug, Default)]
pub struct ThreadRegistry {
    threads: Mutex<Vec<Arc<MutatorThread>>>,
    next_id: AtomicU64,
}

impl ThreadRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the calling thread. The record starts in [`ThreadState::Native`].
    pub fn register_current(&self) -> Arc<MutatorThread> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let thread = Arc::new(MutatorThread::new(id, thread::current().id()));
        self.threads.lock().push(Arc::clone(&thread));
        thread
    }

    /// Remove a record; returns false if it was not registered
    pub fn unregister(&self, thread: &MutatorThread) -> bool {
        let mut threads = self.threads.lock();
        let before = threads.len();
        threads.retain(|t| t.id != thread.id);
        threads.len() != before
    }

    /// Record of the calling thread, if registered
    pub fn current(&self) -> Option<Arc<MutatorThread>> {
        let current = thread::current().id();
        self.threads
            .lock()
            .iter()
            .find(|t| t.owner == current)
            .cloned()
    }

    /// Lock the registry for iteration. Registration blocks until the guard drops.
    pub fn lock_for_iter(&self) -> MutexGuard<'_, Vec<Arc<MutatorThread>>> {
        self.threads.lock()
    }

    /// Number of registered threads
    pub fn len(&self) -> usize {
        self.threads.lock().len()
    }

    /// Whether no thread is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Scoped thread-state switch.
///
/// Restores the previous state on drop. Returning to [`ThreadState::Runnable`] is itself a
/// safepoint: if a stop-the-world request is pending, the thread parks before it continues
/// running managed code.
pub struct ThreadStateGuard<'a> {
    thread: &'a MutatorThread,
    suspension: &'a ThreadSuspension,
    previous: ThreadState,
}

impl<'a> ThreadStateGuard<'a> {
    /// Switch `thread` to `state` until the guard drops
    pub fn new(
        thread: &'a MutatorThread,
        suspension: &'a ThreadSuspension,
        state: ThreadState,
    ) -> Self {
        let previous = switch_state(thread, suspension, state);
        Self {
            thread,
            suspension,
            previous,
        }
    }
}

impl Drop for ThreadStateGuard<'_> {
    fn drop(&mut self) {
        switch_state(self.thread, self.suspension, self.previous);
    }
}

/// Switch `thread` to `state`, parking on the way into Runnable if suspension is requested.
pub fn switch_state(
    thread: &MutatorThread,
    suspension: &ThreadSuspension,
    state: ThreadState,
) -> ThreadState {
    let previous = thread.swap_state(state);
    if state == ThreadState::Runnable && previous == ThreadState::Native {
        suspension.suspend_if_requested(thread);
    }
    previous
}
