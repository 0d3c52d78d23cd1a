//! Admission control for concurrent sessions.
//!
//! A fixed number of slots backed by a semaphore. Acquisition never waits:
//! the accept loop either gets a slot immediately or turns the connection
//! away. A slot returns to the pool when its `AdmissionSlot` is dropped.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Counting gate bounding the number of live sessions.
#[derive(Clone)]
pub struct AdmissionController {
    slots: Arc<Semaphore>,
    max_slots: usize,
}

impl AdmissionController {
    pub fn new(max_slots: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(max_slots)),
            max_slots,
        }
    }

    /// Take a slot if one is free, without waiting.
    pub fn try_acquire(&self) -> Option<AdmissionSlot> {
        Arc::clone(&self.slots)
            .try_acquire_owned()
            .ok()
            .map(|permit| AdmissionSlot { _permit: permit })
    }

    /// Slots currently free.
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.max_slots
    }

    /// Slots currently held by sessions.
    pub fn in_use(&self) -> usize {
        self.max_slots - self.available()
    }
}

/// A held admission slot. Dropping it releases the slot exactly once.
#[must_use = "dropping the slot releases it immediately"]
pub struct AdmissionSlot {
    _permit: OwnedSemaphorePermit,
}

impl AdmissionSlot {
    /// Release the slot now rather than at end of scope.
    pub fn release(self) {}
}
