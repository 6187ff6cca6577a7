//! Collaborator interfaces and worker events
//!
//! The scheduler never talks to the network itself. It hands [`TransferJob`]s
//! to a [`TransferBackend`] and learns about progress and results through
//! [`WorkerEvent`]s sent over a channel. Workers and an external
//! [`QueueManager`] use the same channel, so every item mutation happens on
//! the scheduler task.

use crate::error::{QueueError, Result};
use crate::item::{CompatMode, CryptoKey, Priority, QueueId, SharedRef, TransferItem};
use crate::slots::SlotPermit;
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::sync::mpsc;

/// Snapshot of an item handed to a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferJob {
    /// Queue identifier
    pub queue_id: QueueId,
    /// Backing file
    pub path: PathBuf,
    /// Name published to the backend
    pub name: String,
    /// File size in bytes
    pub file_size: u64,
    /// Compress before transfer
    pub compress: bool,
    /// Compatibility mode
    pub compat_mode: CompatMode,
    /// User-supplied crypto key
    pub crypto_key: Option<CryptoKey>,
    /// Priority class
    pub priority: Priority,
    /// Start time of the attempt this job belongs to
    pub run: u64,
}

impl TransferJob {
    /// Build a job from a local item; external items have no job
    #[must_use]
    pub fn from_item(item: &TransferItem) -> Option<Self> {
        Some(Self {
            queue_id: item.queue_id().clone(),
            path: item.path()?.to_path_buf(),
            name: item.published_name(),
            file_size: item.file_size(),
            compress: item.compress(),
            compat_mode: item.compat_mode().clone(),
            crypto_key: item.crypto_key().copied(),
            priority: item.priority(),
            run: item.started_at(),
        })
    }
}

/// Result of one transfer attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Transfer finished; content is available under `content_id`
    Success {
        /// Backend-assigned content identifier
        content_id: String,
    },
    /// Content already existed under `content_id`
    KeyCollision {
        /// Backend-assigned content identifier
        content_id: String,
    },
    /// Attempt failed but may succeed later
    RetryableFailure {
        /// Backend error description
        description: String,
    },
    /// Attempt failed and will not succeed on retry
    FatalFailure {
        /// Backend error description
        description: String,
    },
}

impl TransferOutcome {
    /// Content identifier on success, the classified backend error otherwise
    pub fn into_result(self) -> std::result::Result<String, QueueError> {
        match self {
            TransferOutcome::Success { content_id }
            | TransferOutcome::KeyCollision { content_id } => Ok(content_id),
            TransferOutcome::RetryableFailure { description } => {
                Err(QueueError::BackendRetryable(description.into()))
            }
            TransferOutcome::FatalFailure { description } => {
                Err(QueueError::BackendFatal(description.into()))
            }
        }
    }
}

/// Network side of the transfer pipeline
#[async_trait]
pub trait TransferBackend: Send + Sync {
    /// Whether the backend connection is up
    async fn is_connected(&self) -> bool;

    /// Run one transfer to completion
    ///
    /// A backend refusing the job reports `RetryableFailure`.
    async fn start_transfer(&self, job: TransferJob, progress: ProgressReporter)
    -> TransferOutcome;

    /// Derive the content identifier without transferring
    async fn derive_key(&self, job: TransferJob) -> std::result::Result<String, String>;

    /// Whether a transfer for this identifier runs outside the scheduler
    fn is_direct_transfer_in_progress(&self, queue_id: &QueueId) -> bool;

    /// Whether the backend already has this identifier enqueued
    fn is_enqueued(&self, queue_id: &QueueId) -> bool;
}

/// External persistent transfer queue
#[async_trait]
pub trait QueueManager: Send + Sync {
    /// Remove entries; resolves once the manager acknowledged the removal
    async fn remove_requests(&self, ids: &[QueueId]) -> Result<()>;

    /// Whether the identifier is in the persistent queue
    fn is_enqueued(&self, queue_id: &QueueId) -> bool;

    /// Change the priority of an enqueued entry
    async fn change_priority(&self, queue_id: &QueueId, priority: Priority) -> Result<()>;
}

/// Secondary source of items (shared-file registrations)
#[async_trait]
pub trait SharedSource: Send + Sync {
    /// A linked item finished transferring
    async fn transfer_completed(&self, shared: SharedRef, content_id: &str);
}

/// Event delivered to the scheduler task
#[derive(Debug)]
pub enum WorkerEvent {
    /// Block progress of a running transfer
    Progress {
        /// Item
        queue_id: QueueId,
        /// Done blocks
        done: Option<u64>,
        /// Total blocks
        total: Option<u64>,
        /// Whether the counters refer to the main payload
        finalized: Option<bool>,
    },
    /// The persistent queue started a transfer on its own
    Started {
        /// Item
        queue_id: QueueId,
    },
    /// A transfer attempt ended
    TransferFinished {
        /// Item
        queue_id: QueueId,
        /// Attempt the outcome belongs to, if the scheduler started it
        ///
        /// Outcomes whose run no longer matches the item are dropped.
        run: Option<u64>,
        /// Result
        outcome: TransferOutcome,
        /// Slot held by the worker, if the scheduler started it
        permit: Option<SlotPermit>,
    },
    /// A key derivation ended
    KeyDerived {
        /// Item
        queue_id: QueueId,
        /// Content identifier or failure description
        result: std::result::Result<String, String>,
        /// Slot held by the worker
        permit: Option<SlotPermit>,
    },
    /// The persistent queue dropped an entry
    Dequeued {
        /// Item
        queue_id: QueueId,
    },
}

/// Sending side of the scheduler's event channel
#[derive(Debug, Clone)]
pub struct CompletionSender {
    tx: mpsc::UnboundedSender<WorkerEvent>,
}

impl CompletionSender {
    pub(crate) fn new(tx: mpsc::UnboundedSender<WorkerEvent>) -> Self {
        Self { tx }
    }

    /// Deliver a raw event; returns false once the scheduler is gone
    pub fn send(&self, event: WorkerEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    /// Report progress of an externally run transfer
    pub fn progress(
        &self,
        queue_id: QueueId,
        done: Option<u64>,
        total: Option<u64>,
        finalized: Option<bool>,
    ) -> bool {
        self.send(WorkerEvent::Progress {
            queue_id,
            done,
            total,
            finalized,
        })
    }

    /// Report that the persistent queue started a transfer
    pub fn started(&self, queue_id: QueueId) -> bool {
        self.send(WorkerEvent::Started { queue_id })
    }

    /// Report the end of an externally run transfer
    pub fn finished(&self, queue_id: QueueId, outcome: TransferOutcome) -> bool {
        self.send(WorkerEvent::TransferFinished {
            queue_id,
            run: None,
            outcome,
            permit: None,
        })
    }

    /// Report that the persistent queue dropped an entry
    pub fn dequeued(&self, queue_id: QueueId) -> bool {
        self.send(WorkerEvent::Dequeued { queue_id })
    }

    /// Progress handle bound to one item
    #[must_use]
    pub fn reporter(&self, queue_id: QueueId) -> ProgressReporter {
        ProgressReporter {
            queue_id,
            sender: self.clone(),
        }
    }
}

/// Progress handle given to a transfer worker
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    queue_id: QueueId,
    sender: CompletionSender,
}

impl ProgressReporter {
    /// Item this handle reports for
    #[must_use]
    pub fn queue_id(&self) -> &QueueId {
        &self.queue_id
    }

    /// Report block progress
    pub fn report(&self, done: Option<u64>, total: Option<u64>, finalized: Option<bool>) {
        self.sender
            .progress(self.queue_id.clone(), done, total, finalized);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::CompatModes;

    #[test]
    fn test_job_from_local_item() {
        let item = TransferItem::new_local(
            "/srv/a.iso",
            4096,
            true,
            CompatModes::default().default_mode(),
            1,
        )
        .with_name_prefix("x-");
        let job = TransferJob::from_item(&item).unwrap();
        assert_eq!(job.name, "x-a.iso");
        assert_eq!(job.path, PathBuf::from("/srv/a.iso"));
        assert_eq!(job.file_size, 4096);
        assert!(job.compress);
    }

    #[test]
    fn test_no_job_for_external_item() {
        let item = TransferItem::new_external(
            QueueId::new("ext"),
            "e",
            1,
            CompatModes::default().default_mode(),
            1,
        );
        assert!(TransferJob::from_item(&item).is_none());
    }

    #[test]
    fn test_outcome_classification() {
        let ok = TransferOutcome::KeyCollision {
            content_id: "CHK@a".to_string(),
        };
        assert_eq!(ok.into_result().unwrap(), "CHK@a");

        let retry = TransferOutcome::RetryableFailure {
            description: "busy".to_string(),
        }
        .into_result()
        .unwrap_err();
        assert!(retry.is_transient());
        assert_eq!(retry.detail(), "busy");

        let fatal = TransferOutcome::FatalFailure {
            description: "rejected".to_string(),
        }
        .into_result()
        .unwrap_err();
        assert!(fatal.is_permanent());
        assert!(matches!(fatal, QueueError::BackendFatal(_)));
    }

    #[tokio::test]
    async fn test_reporter_sends_progress() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sender = CompletionSender::new(tx);
        let reporter = sender.reporter(QueueId::new("q1"));
        reporter.report(Some(3), Some(10), Some(true));

        match rx.recv().await {
            Some(WorkerEvent::Progress {
                queue_id,
                done,
                total,
                finalized,
            }) => {
                assert_eq!(queue_id, QueueId::new("q1"));
                assert_eq!(done, Some(3));
                assert_eq!(total, Some(10));
                assert_eq!(finalized, Some(true));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_send_after_close() {
        let (tx, rx) = mpsc::unbounded_channel();
        let sender = CompletionSender::new(tx);
        drop(rx);
        assert!(!sender.dequeued(QueueId::new("q")));
    }
}
