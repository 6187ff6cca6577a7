//! In-memory registry of upload items
//!
//! [`TransferCollection`] is the single source of truth for item state. It is
//! cheap to clone (shared `Arc` inside) and guarded by one collection-wide
//! `RwLock`; every mutation is announced on a broadcast channel.
//!
//! Local items are keyed by path, external items by queue identifier. Two
//! local items never share a path: a second add is rejected unless it comes
//! from a shared source, in which case it is linked into the existing entry.

use crate::backend::{QueueManager, TransferBackend};
use crate::config::SchedulerConfig;
use crate::error::{QueueError, Result};
use crate::item::{ItemState, Priority, QueueId, Toggle, TransferItem};
use crate::store::ItemStore;
use std::sync::Arc;
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Collection change notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectionEvent {
    /// Item inserted
    Added(QueueId),
    /// Item removed
    Removed(QueueId),
    /// Item fields changed
    Changed(QueueId),
}

/// Result of [`TransferCollection::add_if_new`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    /// Item inserted
    Added,
    /// Shared-source item merged into the existing entry with this identifier
    Linked(QueueId),
    /// Duplicate, nothing inserted
    Rejected,
}

/// Per-state item counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectionStats {
    /// All items
    pub total: usize,
    /// `Waiting`
    pub waiting: usize,
    /// `EncodingRequested` or `Encoding`
    pub encoding: usize,
    /// `Progress`
    pub in_progress: usize,
    /// `Done`
    pub done: usize,
    /// `Failed`
    pub failed: usize,
    /// Disabled items in any state
    pub disabled: usize,
    /// External queue entries
    pub external: usize,
}

/// Shared, observable list of upload items
#[derive(Debug, Clone)]
pub struct TransferCollection {
    items: Arc<RwLock<Vec<TransferItem>>>,
    events: broadcast::Sender<CollectionEvent>,
}

impl Default for TransferCollection {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferCollection {
    /// Create an empty collection
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            items: Arc::new(RwLock::new(Vec::new())),
            events,
        }
    }

    /// Subscribe to change notifications
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CollectionEvent> {
        self.events.subscribe()
    }

    fn notify(&self, event: CollectionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Number of items
    pub async fn len(&self) -> usize {
        self.items.read().await.len()
    }

    /// True if the collection holds no items
    pub async fn is_empty(&self) -> bool {
        self.items.read().await.is_empty()
    }

    /// Clone of all items in collection order
    pub async fn snapshot(&self) -> Vec<TransferItem> {
        self.items.read().await.clone()
    }

    /// Clone of one item
    pub async fn get(&self, id: &QueueId) -> Option<TransferItem> {
        self.items
            .read()
            .await
            .iter()
            .find(|i| i.queue_id() == id)
            .cloned()
    }

    /// Run `f` over all items under the read lock
    pub async fn read<R>(&self, f: impl FnOnce(&[TransferItem]) -> R) -> R {
        f(&self.items.read().await)
    }

    /// Mutate one item under the write lock
    ///
    /// Returns `None` if the item is not present.
    pub async fn with_item_mut<R>(
        &self,
        id: &QueueId,
        f: impl FnOnce(&mut TransferItem) -> R,
    ) -> Option<R> {
        let result = {
            let mut items = self.items.write().await;
            let item = items.iter_mut().find(|i| i.queue_id() == id)?;
            f(item)
        };
        self.notify(CollectionEvent::Changed(id.clone()));
        Some(result)
    }

    /// Insert `item` unless it duplicates an existing entry
    pub async fn add_if_new(&self, item: TransferItem) -> AddOutcome {
        let outcome = {
            let mut items = self.items.write().await;
            Self::insert_locked(&mut items, item)
        };
        match &outcome {
            (AddOutcome::Added, id) => self.notify(CollectionEvent::Added(id.clone())),
            (AddOutcome::Linked(existing), _) => {
                self.notify(CollectionEvent::Changed(existing.clone()));
            }
            (AddOutcome::Rejected, _) => {}
        }
        outcome.0
    }

    fn insert_locked(items: &mut Vec<TransferItem>, item: TransferItem) -> (AddOutcome, QueueId) {
        let id = item.queue_id().clone();

        if let Some(path) = item.path() {
            if let Some(existing) = items.iter_mut().find(|i| i.path() == Some(path)) {
                return match item.shared_ref() {
                    Some(shared) if existing.shared_ref().is_none() => {
                        debug!(
                            "Linking shared item {} into {}",
                            path.display(),
                            existing.queue_id()
                        );
                        existing.link_shared(shared);
                        (AddOutcome::Linked(existing.queue_id().clone()), id)
                    }
                    _ => (AddOutcome::Rejected, id),
                };
            }
        }
        if items.iter().any(|i| i.queue_id() == &id) {
            return (AddOutcome::Rejected, id);
        }

        items.push(item);
        (AddOutcome::Added, id)
    }

    /// Insert many items; returns the rejected duplicates
    pub async fn add_batch(&self, batch: Vec<TransferItem>) -> Vec<TransferItem> {
        let mut rejected = Vec::new();
        for item in batch {
            let candidate = item.clone();
            if self.add_if_new(item).await == AddOutcome::Rejected {
                rejected.push(candidate);
            }
        }
        if !rejected.is_empty() {
            info!("Rejected {} duplicate item(s)", rejected.len());
        }
        rejected
    }

    /// Check uncommitted local items against their backing files
    ///
    /// Only `Waiting` and `EncodingRequested` items are checked. A missing
    /// or resized file fails and disables the item. `ids = None` checks
    /// every item. Returns the identifiers that failed.
    pub async fn validate_against_disk(&self, ids: Option<&[QueueId]>, now: u64) -> Vec<QueueId> {
        let candidates: Vec<_> = {
            let items = self.items.read().await;
            items
                .iter()
                .filter(|i| ids.is_none_or(|ids| ids.contains(i.queue_id())))
                .filter(|i| i.state().is_uncommitted())
                .filter_map(|i| {
                    i.path()
                        .map(|p| (i.queue_id().clone(), p.to_path_buf(), i.file_size()))
                })
                .collect()
        };

        let mut failures = Vec::new();
        for (id, path, expected) in candidates {
            let reason = match tokio::fs::metadata(&path).await {
                Ok(meta) if meta.is_file() && meta.len() == expected => continue,
                Ok(meta) if meta.is_file() => format!(
                    "File size changed: expected {expected} bytes, found {}",
                    meta.len()
                ),
                Ok(_) => format!("Not a regular file: {}", path.display()),
                Err(_) => format!("File not found: {}", path.display()),
            };
            failures.push((id, QueueError::Validation(reason.into())));
        }

        let mut failed = Vec::new();
        {
            let mut items = self.items.write().await;
            for (id, error) in failures {
                let Some(item) = items.iter_mut().find(|i| i.queue_id() == &id) else {
                    continue;
                };
                if !item.state().is_uncommitted() {
                    continue;
                }
                warn!("{}: {}", item.name(), error);
                item.set_state(ItemState::Failed, now);
                item.set_error(error.to_string());
                item.set_enabled(Toggle::Off);
                item.set_last_stopped_at(now);
                failed.push(id);
            }
        }
        for id in &failed {
            self.notify(CollectionEvent::Changed(id.clone()));
        }
        failed
    }

    /// Restart items from scratch
    ///
    /// Eligible items are local and not busy deriving a key. Each is removed
    /// at once. Items still enqueued in the persistent queue are flagged
    /// *removal expected* and dequeued there; re-insertion waits for the
    /// manager's acknowledgment so the identifier is never resubmitted
    /// before its removal is processed. Without a manager no removal is
    /// sent, so nothing is flagged. Returns the restarted identifiers.
    pub async fn restart(
        &self,
        ids: &[QueueId],
        backend: &dyn TransferBackend,
        manager: Option<&dyn QueueManager>,
    ) -> Result<Vec<QueueId>> {
        let mut removed = Vec::new();
        let mut enqueued = Vec::new();
        {
            let mut items = self.items.write().await;
            let mut idx = 0;
            while idx < items.len() {
                let item = &items[idx];
                let eligible = ids.contains(item.queue_id())
                    && !item.is_external()
                    && !item.state().is_encoding();
                if !eligible {
                    idx += 1;
                    continue;
                }
                let mut item = items.remove(idx);
                let id = item.queue_id().clone();
                match manager {
                    Some(m) if backend.is_enqueued(&id) || m.is_enqueued(&id) => {
                        item.mark_removal_expected();
                        enqueued.push(id);
                    }
                    Some(_) => {}
                    // Nobody sends the removal, so no dequeue notification will follow
                    None => {
                        item.take_removal_expected();
                    }
                }
                removed.push(item);
            }
        }
        for item in &removed {
            self.notify(CollectionEvent::Removed(item.queue_id().clone()));
        }
        if removed.is_empty() {
            return Ok(Vec::new());
        }

        let ack = match manager {
            Some(manager) if !enqueued.is_empty() => manager.remove_requests(&enqueued).await,
            _ => Ok(()),
        };

        let restart = ack.is_ok();
        let mut restarted = Vec::with_capacity(removed.len());
        {
            let mut items = self.items.write().await;
            for mut item in removed {
                if restart {
                    item.reset_for_restart();
                } else {
                    item.take_removal_expected();
                }
                restarted.push(item.queue_id().clone());
                items.push(item);
            }
        }
        for id in &restarted {
            self.notify(CollectionEvent::Added(id.clone()));
        }

        ack?;
        info!("Restarted {} item(s)", restarted.len());
        Ok(restarted)
    }

    /// Request key derivation for eligible items
    ///
    /// Eligible items are local, `Waiting`, without a content identifier and
    /// not linked to a shared source.
    pub async fn generate_key_for(&self, ids: &[QueueId], now: u64) -> Vec<QueueId> {
        let mut requested = Vec::new();
        {
            let mut items = self.items.write().await;
            for item in items.iter_mut().filter(|i| ids.contains(i.queue_id())) {
                if item.is_external()
                    || item.state() != ItemState::Waiting
                    || item.content_id().is_some()
                    || item.shared_ref().is_some()
                {
                    continue;
                }
                item.set_state(ItemState::EncodingRequested, now);
                requested.push(item.queue_id().clone());
            }
        }
        for id in &requested {
            self.notify(CollectionEvent::Changed(id.clone()));
        }
        requested
    }

    /// Remove items matching `pred`
    pub async fn remove_where(&self, pred: impl Fn(&TransferItem) -> bool) -> Vec<TransferItem> {
        let removed: Vec<_> = {
            let mut items = self.items.write().await;
            let (gone, kept) = std::mem::take(&mut *items)
                .into_iter()
                .partition(|i| pred(i));
            *items = kept;
            gone
        };
        for item in &removed {
            self.notify(CollectionEvent::Removed(item.queue_id().clone()));
        }
        removed
    }

    /// Remove the given items
    pub async fn remove(&self, ids: &[QueueId]) -> Vec<TransferItem> {
        self.remove_where(|i| ids.contains(i.queue_id())).await
    }

    /// Remove all `Done` items
    pub async fn remove_finished(&self) -> Vec<TransferItem> {
        self.remove_where(|i| i.state() == ItemState::Done).await
    }

    /// Remove all external queue entries
    pub async fn remove_external(&self) -> Vec<TransferItem> {
        self.remove_where(TransferItem::is_external).await
    }

    /// Enable, disable or toggle items; returns how many were touched
    pub async fn set_enabled(&self, ids: &[QueueId], toggle: Toggle) -> usize {
        let touched: Vec<_> = {
            let mut items = self.items.write().await;
            items
                .iter_mut()
                .filter(|i| ids.contains(i.queue_id()))
                .map(|i| {
                    i.set_enabled(toggle);
                    i.queue_id().clone()
                })
                .collect()
        };
        for id in &touched {
            self.notify(CollectionEvent::Changed(id.clone()));
        }
        touched.len()
    }

    /// Change the priority class of items
    ///
    /// Entries enqueued in the persistent queue are updated there as well.
    pub async fn change_priority(
        &self,
        ids: &[QueueId],
        priority: Priority,
        manager: Option<&dyn QueueManager>,
    ) -> Result<()> {
        let changed: Vec<_> = {
            let mut items = self.items.write().await;
            items
                .iter_mut()
                .filter(|i| ids.contains(i.queue_id()))
                .map(|i| {
                    i.set_priority(priority);
                    i.queue_id().clone()
                })
                .collect()
        };
        if changed.is_empty() {
            return Err(QueueError::NotFound(
                ids.iter().map(QueueId::as_str).collect::<Vec<_>>().join(", "),
            ));
        }
        for id in &changed {
            self.notify(CollectionEvent::Changed(id.clone()));
        }
        if let Some(manager) = manager {
            for id in changed.iter().filter(|id| manager.is_enqueued(id)) {
                manager.change_priority(id, priority).await?;
            }
        }
        Ok(())
    }

    /// First item in `state`, in collection order
    pub async fn first_in_state(&self, state: ItemState) -> Option<TransferItem> {
        self.items
            .read()
            .await
            .iter()
            .find(|i| i.state() == state)
            .cloned()
    }

    /// Number of items in `state`
    pub async fn count_in_state(&self, state: ItemState) -> usize {
        self.items
            .read()
            .await
            .iter()
            .filter(|i| i.state() == state)
            .count()
    }

    /// Per-state item counts
    pub async fn stats(&self) -> CollectionStats {
        let items = self.items.read().await;
        let mut stats = CollectionStats {
            total: items.len(),
            ..Default::default()
        };
        for item in items.iter() {
            match item.state() {
                ItemState::Waiting => stats.waiting += 1,
                ItemState::EncodingRequested | ItemState::Encoding => stats.encoding += 1,
                ItemState::Progress => stats.in_progress += 1,
                ItemState::Done => stats.done += 1,
                ItemState::Failed => stats.failed += 1,
            }
            if !item.is_enabled() {
                stats.disabled += 1;
            }
            if item.is_external() {
                stats.external += 1;
            }
        }
        stats
    }

    /// Replace the collection with the persisted queue
    ///
    /// Interrupted work is demoted per [`TransferItem::rehydrate`] and
    /// compatibility modes are resolved against the configured set.
    pub async fn load(
        &self,
        store: &dyn ItemStore,
        config: &SchedulerConfig,
        now: u64,
    ) -> Result<usize> {
        let loaded = store.load_items().await?;
        let mut added = Vec::new();
        {
            let mut items = self.items.write().await;
            items.clear();
            for mut item in loaded {
                item.rehydrate(config.persistent_queue, now);
                item.resolve_compat_mode(&config.compat_modes);
                match Self::insert_locked(&mut items, item) {
                    (AddOutcome::Added, id) => added.push(id),
                    (_, id) => warn!("Dropping duplicate persisted item {}", id),
                }
            }
        }
        for id in &added {
            self.notify(CollectionEvent::Added(id.clone()));
        }
        info!("Loaded {} item(s) from storage", added.len());
        Ok(added.len())
    }

    /// Persist the whole collection
    pub async fn save(&self, store: &dyn ItemStore) -> Result<()> {
        let items = self.snapshot().await;
        store.save_items(&items).await?;
        debug!("Saved {} item(s)", items.len());
        Ok(())
    }
}
