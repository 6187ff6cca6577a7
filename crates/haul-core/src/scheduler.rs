//! Periodic upload scheduler
//!
//! Each tick performs, in order:
//!
//! 1. an integrity sweep over uncommitted items, at most once per sweep
//!    interval
//! 2. dispatch of at most one key derivation, when the backend is connected
//!    and a derivation slot is free
//! 3. dispatch of at most one transfer, unless a persistent-queue manager
//!    owns transfer starts
//!
//! Workers run as separate tasks and report back over the event channel.
//! An item stays busy for selection until the outcome of the worker holding
//! its slot has been applied, even if the item was restarted meanwhile.
//! [`Scheduler::run`] multiplexes ticks, worker events and shutdown on one
//! task, which keeps all item mutation in one place.

use crate::backend::{
    CompletionSender, QueueManager, SharedSource, TransferBackend, TransferJob, TransferOutcome,
    WorkerEvent,
};
use crate::collection::TransferCollection;
use crate::completion::CompletionHandler;
use crate::config::SchedulerConfig;
use crate::error::Result;
use crate::item::{ItemState, QueueId};
use crate::selection::select_next;
use crate::slots::{JobKind, JobSlots};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, trace};

/// What one tick did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// The integrity sweep ran
    pub swept: bool,
    /// Items failed by the sweep
    pub invalidated: Vec<QueueId>,
    /// Item whose key derivation was dispatched
    pub derivation: Option<QueueId>,
    /// Item whose transfer was dispatched
    pub transfer: Option<QueueId>,
}

/// Upload scheduler
pub struct Scheduler {
    config: Arc<SchedulerConfig>,
    collection: TransferCollection,
    backend: Arc<dyn TransferBackend>,
    manager: Option<Arc<dyn QueueManager>>,
    handler: CompletionHandler,
    derive_slots: JobSlots,
    transfer_slots: JobSlots,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    events_rx: mpsc::UnboundedReceiver<WorkerEvent>,
    in_flight: HashSet<QueueId>,
    last_sweep: Option<u64>,
}

impl Scheduler {
    /// Create a scheduler over `collection`
    pub fn new(
        config: SchedulerConfig,
        collection: TransferCollection,
        backend: Arc<dyn TransferBackend>,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(Self {
            handler: CompletionHandler::new(Arc::clone(&config), collection.clone(), None),
            derive_slots: JobSlots::new(JobKind::KeyDerivation, config.max_key_derivations),
            transfer_slots: JobSlots::new(JobKind::Transfer, config.max_transfers),
            config,
            collection,
            backend,
            manager: None,
            events_tx,
            events_rx,
            in_flight: HashSet::new(),
            last_sweep: None,
        })
    }

    /// Attach the persistent-queue manager
    #[must_use]
    pub fn with_queue_manager(mut self, manager: Arc<dyn QueueManager>) -> Self {
        self.manager = Some(manager);
        self
    }

    /// Attach the shared source notified of linked completions
    #[must_use]
    pub fn with_shared_source(mut self, source: Arc<dyn SharedSource>) -> Self {
        self.handler = CompletionHandler::new(
            Arc::clone(&self.config),
            self.collection.clone(),
            Some(source),
        );
        self
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// The collection being scheduled
    #[must_use]
    pub fn collection(&self) -> &TransferCollection {
        &self.collection
    }

    /// Handle for reporting externally run progress and completions
    #[must_use]
    pub fn completion_sender(&self) -> CompletionSender {
        CompletionSender::new(self.events_tx.clone())
    }

    /// Transfer slot pool
    #[must_use]
    pub fn transfer_slots(&self) -> &JobSlots {
        &self.transfer_slots
    }

    /// Key-derivation slot pool
    #[must_use]
    pub fn derivation_slots(&self) -> &JobSlots {
        &self.derive_slots
    }

    /// Run one scheduling pass
    pub async fn tick(&mut self, now: u64) -> TickReport {
        let mut report = TickReport::default();

        let sweep_ms = u64::try_from(self.config.sweep_interval.as_millis()).unwrap_or(u64::MAX);
        if self
            .last_sweep
            .is_none_or(|at| now.saturating_sub(at) >= sweep_ms)
        {
            report.invalidated = self.collection.validate_against_disk(None, now).await;
            report.swept = true;
            self.last_sweep = Some(now);
            trace!("Integrity sweep failed {} item(s)", report.invalidated.len());
        }

        if self.backend.is_connected().await {
            report.derivation = self.dispatch_key_derivation(now).await;
        }

        if !self.config.persistent_queue {
            report.transfer = self.dispatch_transfer(now).await;
        }

        report
    }

    async fn dispatch_key_derivation(&mut self, now: u64) -> Option<QueueId> {
        if !self.derive_slots.has_free() {
            return None;
        }
        let candidate = self
            .collection
            .read(|items| {
                items
                    .iter()
                    .find(|i| i.state() == ItemState::EncodingRequested && !i.is_external())
                    .map(|i| i.queue_id().clone())
            })
            .await?;

        let mut permit = self.derive_slots.try_allocate()?;
        let job = self
            .collection
            .with_item_mut(&candidate, |item| {
                if item.state() != ItemState::EncodingRequested {
                    return None;
                }
                item.set_state(ItemState::Encoding, now);
                TransferJob::from_item(item)
            })
            .await
            .flatten()?;

        debug!("Dispatching key derivation for {}", job.name);
        let backend = Arc::clone(&self.backend);
        let tx = self.events_tx.clone();
        let queue_id = candidate.clone();
        tokio::spawn(async move {
            permit.mark_running();
            let result = match tokio::spawn(async move { backend.derive_key(job).await }).await {
                Ok(result) => result,
                Err(e) => Err(format!("Key derivation worker failed: {e}")),
            };
            let _ = tx.send(WorkerEvent::KeyDerived {
                queue_id,
                result,
                permit: Some(permit),
            });
        });
        Some(candidate)
    }

    async fn dispatch_transfer(&mut self, now: u64) -> Option<QueueId> {
        if !self.transfer_slots.has_free() {
            return None;
        }

        let backoff = self.config.backoff_millis();
        let backend = Arc::clone(&self.backend);
        let manager = self.manager.clone();
        let in_flight = &self.in_flight;
        let chosen = self
            .collection
            .read(|items| {
                select_next(items, now, backoff, |id| {
                    in_flight.contains(id)
                        || backend.is_direct_transfer_in_progress(id)
                        || manager.as_ref().is_some_and(|m| m.is_enqueued(id))
                })
                .map(|i| i.queue_id().clone())
            })
            .await?;

        // The sweep may be minutes old
        let failed = self
            .collection
            .validate_against_disk(Some(std::slice::from_ref(&chosen)), now)
            .await;
        if !failed.is_empty() {
            return None;
        }

        let mut permit = self.transfer_slots.try_allocate()?;
        let job = self
            .collection
            .with_item_mut(&chosen, |item| {
                if item.state() != ItemState::Waiting {
                    return None;
                }
                item.set_state(ItemState::Progress, now);
                TransferJob::from_item(item)
            })
            .await
            .flatten()?;

        info!("Starting upload of {}", job.name);
        self.in_flight.insert(chosen.clone());
        let reporter = self.completion_sender().reporter(chosen.clone());
        let tx = self.events_tx.clone();
        let queue_id = chosen.clone();
        let run = Some(job.run);
        tokio::spawn(async move {
            permit.mark_running();
            let outcome = match tokio::spawn(async move {
                backend.start_transfer(job, reporter).await
            })
            .await
            {
                Ok(outcome) => outcome,
                Err(e) => TransferOutcome::RetryableFailure {
                    description: format!("Transfer worker failed: {e}"),
                },
            };
            let _ = tx.send(WorkerEvent::TransferFinished {
                queue_id,
                run,
                outcome,
                permit: Some(permit),
            });
        });
        Some(chosen)
    }

    /// Wait for the next worker event
    pub async fn next_event(&mut self) -> Option<WorkerEvent> {
        self.events_rx.recv().await
    }

    /// Apply one worker event
    pub async fn apply_event(&mut self, event: WorkerEvent, now: u64) {
        if let WorkerEvent::TransferFinished {
            queue_id,
            permit: Some(_),
            ..
        } = &event
        {
            self.in_flight.remove(queue_id);
        }
        self.handler.handle(event, now).await;
    }

    /// Apply all pending events without waiting; returns how many ran
    pub async fn drain_events(&mut self, now: u64) -> usize {
        let mut applied = 0;
        while let Ok(event) = self.events_rx.try_recv() {
            self.apply_event(event, now).await;
            applied += 1;
        }
        applied
    }

    /// Drive the scheduler until `shutdown` turns true or its sender drops
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Scheduler started ({} transfer slot(s), {} derivation slot(s))",
            self.transfer_slots.capacity(),
            self.derive_slots.capacity()
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.tick(crate::now_millis()).await;
                    trace!("Tick: {:?}", report);
                }
                Some(event) = self.events_rx.recv() => {
                    self.apply_event(event, crate::now_millis()).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Scheduler stopped");
    }

    /// Spawn [`run`](Self::run) on the runtime
    pub fn start(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}
