//! Bulkhead: a permit pool bounding concurrency over a shared downstream

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{Error, Result};

/// Default window to wait for a permit before rejecting
pub const DEFAULT_GRACE: Duration = Duration::from_millis(25);

/// Bounded permit pool
///
/// Callers that cannot acquire a permit within the grace window fail fast
/// with `BulkheadError` rather than queueing unboundedly.
pub struct Bulkhead {
    name: String,
    capacity: usize,
    grace: Duration,
    semaphore: Arc<Semaphore>,
}

impl Bulkhead {
    pub fn new(name: impl Into<String>, capacity: usize, grace: Duration) -> Self {
        Self {
            name: name.into(),
            capacity,
            grace,
            semaphore: Arc::new(Semaphore::new(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of permits currently available
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Acquire a permit within the grace window
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        match tokio::time::timeout(self.grace, Arc::clone(&self.semaphore).acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            _ => Err(Error::Bulkhead {
                name: self.name.clone(),
                capacity: self.capacity,
            }),
        }
    }
}
