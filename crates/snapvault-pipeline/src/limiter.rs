//! Semaphore gate bounding how many tasks of a stage do work at once.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bounds concurrent work within one stage.
///
/// Tasks are still spawned as soon as their input exists; each acquires a
/// permit before touching the provider, the exporter or the store.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    limit: Option<usize>,
    semaphore: Option<Arc<Semaphore>>,
}

impl ConcurrencyLimiter {
    /// Allow at most `max_concurrency` permits. `0` means no limit.
    pub fn new(max_concurrency: usize) -> Self {
        if max_concurrency == 0 {
            return Self::unbounded();
        }

        Self {
            limit: Some(max_concurrency),
            semaphore: Some(Arc::new(Semaphore::new(max_concurrency))),
        }
    }

    pub fn unbounded() -> Self {
        Self {
            limit: None,
            semaphore: None,
        }
    }

    /// Configured limit, or `None` when unbounded.
    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// Permits currently free, or `None` when unbounded.
    pub fn available(&self) -> Option<usize> {
        self.semaphore.as_ref().map(|s| s.available_permits())
    }

    /// Wait for a slot. The slot is released when the returned permit drops.
    ///
    /// Returns `None` when unbounded.
    pub async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        match &self.semaphore {
            // Never closed, so `acquire_owned` cannot fail.
            Some(semaphore) => semaphore.clone().acquire_owned().await.ok(),
            None => None,
        }
    }
}
