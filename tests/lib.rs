//! Shared fixtures for the haul integration tests
//!
//! [`ScriptedBackend`] plays back per-file transfer outcomes and can hold
//! workers until a test releases them, which lets the scenarios observe the
//! collection while jobs are in flight.

use async_trait::async_trait;
use haul_core::{
    CompatModes, ProgressReporter, QueueId, Scheduler, TransferBackend, TransferItem, TransferJob,
    TransferOutcome, WorkerEvent,
};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Semaphore;

/// Base timestamp used by the scenarios
pub const T0: u64 = 1_700_000_000_000;

/// Mock backend with scripted outcomes
pub struct ScriptedBackend {
    outcomes: Mutex<HashMap<String, VecDeque<TransferOutcome>>>,
    gate: Semaphore,
    connected: AtomicBool,
    transfers: AtomicUsize,
    derivations: AtomicUsize,
}

impl ScriptedBackend {
    /// Backend whose workers finish immediately
    pub fn open() -> Self {
        Self::with_gate(Semaphore::MAX_PERMITS)
    }

    /// Backend whose workers wait for [`release`](Self::release)
    pub fn gated() -> Self {
        Self::with_gate(0)
    }

    fn with_gate(permits: usize) -> Self {
        Self {
            outcomes: Mutex::new(HashMap::new()),
            gate: Semaphore::new(permits),
            connected: AtomicBool::new(true),
            transfers: AtomicUsize::new(0),
            derivations: AtomicUsize::new(0),
        }
    }

    /// Queue an outcome for the next transfer of the file called `name`
    ///
    /// Unscripted transfers succeed with `CHK@<name>`.
    pub fn script(&self, name: &str, outcome: TransferOutcome) {
        self.outcomes
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .push_back(outcome);
    }

    /// Let `n` held workers finish
    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    /// Flip the connection state
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Transfers started so far
    pub fn transfers(&self) -> usize {
        self.transfers.load(Ordering::SeqCst)
    }

    /// Key derivations started so far
    pub fn derivations(&self) -> usize {
        self.derivations.load(Ordering::SeqCst)
    }

    async fn pass_gate(&self) {
        if let Ok(permit) = self.gate.acquire().await {
            permit.forget();
        }
    }
}

#[async_trait]
impl TransferBackend for ScriptedBackend {
    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn start_transfer(&self, job: TransferJob, progress: ProgressReporter) -> TransferOutcome {
        self.transfers.fetch_add(1, Ordering::SeqCst);
        self.pass_gate().await;
        progress.report(Some(1), Some(1), Some(true));
        let scripted = self
            .outcomes
            .lock()
            .unwrap()
            .get_mut(&job.name)
            .and_then(VecDeque::pop_front);
        scripted.unwrap_or_else(|| TransferOutcome::Success {
            content_id: format!("CHK@{}", job.name),
        })
    }

    async fn derive_key(&self, job: TransferJob) -> Result<String, String> {
        self.derivations.fetch_add(1, Ordering::SeqCst);
        self.pass_gate().await;
        Ok(format!("CHK@{}", job.name))
    }

    fn is_direct_transfer_in_progress(&self, _queue_id: &QueueId) -> bool {
        false
    }

    fn is_enqueued(&self, _queue_id: &QueueId) -> bool {
        false
    }
}

/// Write a file of `len` bytes under `dir` and build a waiting item for it
pub fn local_item(dir: &Path, name: &str, len: usize, added_at: u64) -> TransferItem {
    let path = dir.join(name);
    std::fs::write(&path, vec![0x5a; len]).unwrap();
    TransferItem::new_local(
        path,
        len as u64,
        false,
        CompatModes::default().default_mode(),
        added_at,
    )
}

/// Apply worker events until the transfer or derivation of `id` has finished
pub async fn settle(scheduler: &mut Scheduler, id: &QueueId, now: u64) {
    loop {
        let event = scheduler.next_event().await.unwrap();
        let done = match &event {
            WorkerEvent::TransferFinished { queue_id, .. }
            | WorkerEvent::KeyDerived { queue_id, .. } => queue_id == id,
            _ => false,
        };
        scheduler.apply_event(event, now).await;
        if done {
            return;
        }
    }
}
