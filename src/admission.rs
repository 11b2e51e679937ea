use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::trace;

#[derive(Debug, Error, Eq, PartialEq)]
#[error("All {capacity} stream slots are in use")]
pub struct ServerBusy {
    pub capacity: usize,
}

/// Bounds how many streams may be active at once.
///
/// Cloning shares the same slot pool, so one controller is created at startup
/// and handed to every request.
#[derive(Clone, Debug)]
pub struct AdmissionController {
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl AdmissionController {
    pub fn new(capacity: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Take a slot without waiting. The slot is released when the returned
    /// guard is dropped.
    pub fn try_acquire(&self) -> Result<AdmissionSlot, ServerBusy> {
        let permit = self
            .permits
            .clone()
            .try_acquire_owned()
            .map_err(|_| ServerBusy {
                capacity: self.capacity,
            })?;

        trace!(active = self.active(), capacity = self.capacity, "Stream slot acquired");
        Ok(AdmissionSlot { _permit: permit })
    }

    pub fn active(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// One granted unit of stream concurrency.
#[derive(Debug)]
pub struct AdmissionSlot {
    _permit: OwnedSemaphorePermit,
}

impl AdmissionSlot {
    /// Give the slot back now rather than at end of scope.
    pub fn release(self) {}
}
