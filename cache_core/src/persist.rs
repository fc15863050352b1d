//! Debounced index persistence.
//!
//! Mutations call [`Debouncer::mark_dirty`]; the first call after a flush
//! schedules one flush `debounce` later on the captured tokio runtime and
//! later calls only set the dirty flag. Without a runtime the flush runs
//! inline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::runtime::Handle;

#[derive(Debug)]
pub(crate) struct Debouncer {
    dirty: AtomicBool,
    scheduled: AtomicBool,
    debounce: Duration,
    runtime: Option<Handle>,
}

impl Debouncer {
    pub(crate) fn new(debounce: Duration) -> Self {
        Self {
            dirty: AtomicBool::new(false),
            scheduled: AtomicBool::new(false),
            debounce,
            runtime: Handle::try_current().ok(),
        }
    }

    /// Mark state dirty and schedule `flush` unless one is already pending.
    pub(crate) fn mark_dirty<F>(&self, flush: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.dirty.store(true, Ordering::SeqCst);
        if self.scheduled.swap(true, Ordering::SeqCst) {
            return;
        }

        match &self.runtime {
            Some(handle) => {
                let delay = self.debounce;
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Err(e) = tokio::task::spawn_blocking(flush).await {
                        tracing::error!("Cache index flush task failed: {e}");
                    }
                });
            }
            None => flush(),
        }
    }

    /// Called by the flush itself: clears the pending timer and reports
    /// whether there is anything to write.
    pub(crate) fn take_dirty(&self) -> bool {
        self.scheduled.store(false, Ordering::SeqCst);
        self.dirty.swap(false, Ordering::SeqCst)
    }

    /// Restore the dirty flag after a failed write so the next mutation retries.
    pub(crate) fn restore_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }
}
