//! Worker slot pools
//!
//! One [`JobSlots`] pool exists per job kind and is owned by the scheduler.
//! A slot is *allocated* the moment the scheduler decides to dispatch and
//! stays allocated until the [`SlotPermit`] is dropped, which happens exactly
//! once whatever way the worker ends. The *running* count only covers workers
//! that actually started executing.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Kind of worker job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    /// Key derivation
    KeyDerivation,
    /// Transfer
    Transfer,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KeyDerivation => write!(f, "key-derivation"),
            Self::Transfer => write!(f, "transfer"),
        }
    }
}

/// Bounded pool of worker slots for one job kind
#[derive(Debug)]
pub struct JobSlots {
    kind: JobKind,
    capacity: usize,
    semaphore: Arc<Semaphore>,
    running: Arc<AtomicUsize>,
}

impl JobSlots {
    /// Create a pool with `capacity` slots
    #[must_use]
    pub fn new(kind: JobKind, capacity: usize) -> Self {
        Self {
            kind,
            capacity,
            semaphore: Arc::new(Semaphore::new(capacity)),
            running: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Job kind served by this pool
    #[must_use]
    pub fn kind(&self) -> JobKind {
        self.kind
    }

    /// Total number of slots
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Reserve a slot without waiting
    pub fn try_allocate(&self) -> Option<SlotPermit> {
        let permit = Arc::clone(&self.semaphore).try_acquire_owned().ok()?;
        Some(SlotPermit {
            kind: self.kind,
            _permit: permit,
            running: Arc::clone(&self.running),
            is_running: false,
        })
    }

    /// True if at least one slot is free
    #[must_use]
    pub fn has_free(&self) -> bool {
        self.semaphore.available_permits() > 0
    }

    /// Number of allocated slots
    #[must_use]
    pub fn allocated(&self) -> usize {
        self.capacity - self.semaphore.available_permits()
    }

    /// Number of workers currently executing
    #[must_use]
    pub fn running(&self) -> usize {
        self.running.load(Ordering::Acquire)
    }
}

/// An allocated slot; released on drop
pub struct SlotPermit {
    kind: JobKind,
    _permit: OwnedSemaphorePermit,
    running: Arc<AtomicUsize>,
    is_running: bool,
}

impl SlotPermit {
    /// Job kind of the slot
    #[must_use]
    pub fn kind(&self) -> JobKind {
        self.kind
    }

    /// Count the worker holding this slot as running
    pub fn mark_running(&mut self) {
        if !self.is_running {
            self.is_running = true;
            self.running.fetch_add(1, Ordering::AcqRel);
        }
    }
}

impl fmt::Debug for SlotPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotPermit")
            .field("kind", &self.kind)
            .field("is_running", &self.is_running)
            .finish()
    }
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        if self.is_running {
            self.running.fetch_sub(1, Ordering::AcqRel);
        }
    }
}
