use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Counts handler invocations that have not yet reached a terminal outcome.
#[derive(Debug, Default)]
pub struct InFlightTracker {
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl InFlightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(self: &Arc<Self>) -> InFlightGuard {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);
        InFlightGuard {
            tracker: Arc::clone(self),
        }
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously active handlers observed so far.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Marks one handler as in flight until dropped.
pub struct InFlightGuard {
    tracker: Arc<InFlightTracker>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.tracker.active.fetch_sub(1, Ordering::SeqCst);
    }
}
