//! # haul core
//!
//! Scheduling and lifecycle management for outbound transfers of a
//! peer-to-peer content-distribution client.
//!
//! This crate provides:
//! - The upload item model and its state machine
//! - Per-item throughput and stall estimation
//! - The observable item collection with integrity checks and persistence
//! - A tick-driven scheduler with bounded transfer and key-derivation slots
//! - Completion handling: retry/backoff policy, log file, external command
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  tick   ┌────────────┐  spawn   ┌──────────────────┐
//! │  Collection  │<────────│ Scheduler  │─────────>│ workers (backend)│
//! │ (RwLock+bus) │         │ slot pools │          └────────┬─────────┘
//! └──────▲───────┘         └─────▲──────┘                   │
//!        │ state changes         │ WorkerEvent (mpsc)       │
//!        └─────── CompletionHandler <───────────────────────┘
//! ```
//!
//! The network side is abstracted behind [`TransferBackend`]; an optional
//! [`QueueManager`] represents a persistent backend-owned queue.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod collection;
pub mod completion;
pub mod config;
pub mod error;
pub mod hooks;
pub mod item;
pub mod scheduler;
pub mod selection;
pub mod slots;
pub mod speed;
pub mod store;

pub use backend::{
    CompletionSender, ProgressReporter, QueueManager, SharedSource, TransferBackend, TransferJob,
    TransferOutcome, WorkerEvent,
};
pub use collection::{AddOutcome, CollectionEvent, CollectionStats, TransferCollection};
pub use completion::CompletionHandler;
pub use config::SchedulerConfig;
pub use error::{QueueError, Result};
pub use item::{
    CompatMode, CompatModes, CryptoKey, ItemSource, ItemState, Priority, QueueId, SharedRef,
    Toggle, TransferItem,
};
pub use scheduler::{Scheduler, TickReport};
pub use slots::{JobKind, JobSlots, SlotPermit};
pub use speed::{BlockRate, SpeedTracker};
pub use store::{ItemStore, JsonFileStore};

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in milliseconds since the Unix epoch
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
