//! Coordinator-wide count of in-flight requests, used as a barrier.

use std::{
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

#[derive(Debug, Default)]
struct Counts {
    pending: usize,
    /// Set once any proxy observed a protocol violation or a disconnect. Sticky.
    faulted: bool,
}

/// Outcome of [`PendingRequests::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The pending count reached zero.
    Drained,
    /// A proxy raised a fault; the caller must inspect the proxies.
    Faulted,
    TimedOut { pending: usize },
}

/// Count of requests dispatched to any slave proxy that have not been answered yet.
///
/// One instance is owned by each coordinator and shared with its proxies; replies may be
/// recorded from any thread.
#[derive(Debug, Default)]
pub struct PendingRequests {
    counts: Mutex<Counts>,
    cond: Condvar,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Counts> {
        // The counters stay consistent even if a holder panicked.
        self.counts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of requests currently outstanding.
    pub fn count(&self) -> usize {
        self.lock().pending
    }

    pub fn is_faulted(&self) -> bool {
        self.lock().faulted
    }

    pub(crate) fn increment(&self) {
        self.lock().pending += 1;
    }

    /// Record one answered request. Returns `false` if nothing was pending, in which case the
    /// count is left at zero.
    pub(crate) fn decrement(&self) -> bool {
        let mut counts = self.lock();
        let Some(pending) = counts.pending.checked_sub(1) else {
            return false;
        };
        counts.pending = pending;
        if pending == 0 {
            self.cond.notify_all();
        }
        true
    }

    pub(crate) fn raise_fault(&self) {
        self.lock().faulted = true;
        self.cond.notify_all();
    }

    /// Block until no request is outstanding, a fault is raised, or `timeout` elapses.
    ///
    /// Every call is a fresh barrier over whatever is outstanding at that moment.
    pub fn wait(&self, timeout: Option<Duration>) -> WaitOutcome {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut counts = self.lock();
        loop {
            if counts.faulted {
                return WaitOutcome::Faulted;
            }
            if counts.pending == 0 {
                return WaitOutcome::Drained;
            }
            counts = match deadline {
                None => self
                    .cond
                    .wait(counts)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return WaitOutcome::TimedOut {
                            pending: counts.pending,
                        };
                    }
                    self.cond
                        .wait_timeout(counts, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }
}
