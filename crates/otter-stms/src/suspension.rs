//! Stop-the-world handshake
//!
//! One process-wide request flag. The thread that flips it owns the stopped world until it
//! calls [`ThreadSuspension::resume_all`]; everyone else parks at their next safepoint.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, ThreadId};
use std::time::Instant;

use crossbeam_utils::Backoff;
use parking_lot::{Condvar, Mutex};

use crate::thread::{MutatorThread, ThreadRegistry};

/// Suspension state shared by all mutators
#[derive(Debug, Default)]
pub struct ThreadSuspension {
    requested: AtomicBool,
    /// Guards flips of `requested` so parked threads never miss a wakeup
    lock: Mutex<()>,
    resumed: Condvar,
    owner: Mutex<Option<ThreadId>>,
}

impl ThreadSuspension {
    /// Create a suspension point with no request pending
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a stop-the-world request is pending
    #[inline]
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Whether the calling thread owns the current request
    pub fn is_held_by_current(&self) -> bool {
        *self.owner.lock() == Some(thread::current().id())
    }

    /// Ask every registered thread to park, then wait until all of them are parked or in
    /// Native state. The calling thread is exempt.
    ///
    /// Returns false without waiting if another thread already holds a request.
    pub fn request_suspend_all(&self, registry: &ThreadRegistry) -> bool {
        let current = thread::current().id();
        {
            let _lock = self.lock.lock();
            if self
                .requested
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return false;
            }
            *self.owner.lock() = Some(current);
        }

        let started = Instant::now();
        let backoff = Backoff::new();
        while !all_others_stopped(registry, current) {
            backoff.snooze();
        }

        tracing::trace!(
            target: "otter::gc",
            wait_us = started.elapsed().as_micros() as u64,
            "All mutators stopped"
        );
        true
    }

    /// Release the stopped world and wake every parked thread
    pub fn resume_all(&self) {
        {
            let _lock = self.lock.lock();
            self.requested.store(false, Ordering::SeqCst);
            *self.owner.lock() = None;
        }
        self.resumed.notify_all();
    }

    /// Park `thread` while a request is pending.
    ///
    /// Returns true if the thread actually parked. The owner of the request never parks.
    pub fn suspend_if_requested(&self, thread: &MutatorThread) -> bool {
        if !self.is_requested() {
            return false;
        }
        self.suspend_slow_path(thread)
    }

    #[cold]
    fn suspend_slow_path(&self, thread: &MutatorThread) -> bool {
        let mut lock = self.lock.lock();
        if !self.is_requested() || *self.owner.lock() == Some(thread.owner()) {
            return false;
        }

        thread.set_suspended(true);
        while self.is_requested() {
            self.resumed.wait(&mut lock);
        }
        thread.set_suspended(false);
        true
    }
}

fn all_others_stopped(registry: &ThreadRegistry, current: ThreadId) -> bool {
    registry
        .lock_for_iter()
        .iter()
        .filter(|thread| thread.owner() != current)
        .all(|thread| thread.is_suspended_or_native())
}
