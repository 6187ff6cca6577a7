//! Applying worker results to items
//!
//! [`CompletionHandler`] is the only place transfer and derivation results
//! turn into state changes. It runs on the scheduler task, so each event is
//! applied exactly once and in receipt order.
//!
//! | Outcome | Result |
//! |---|---|
//! | success, key collision | content id recorded, disabled, `Done` |
//! | fatal failure | disabled, `Failed` |
//! | retryable failure | `retries + 1`; `Failed` past the cap, else `Waiting` |
//!
//! Every transfer outcome stamps the stop time that backoff is measured
//! from. Failures are classified through [`QueueError`]: transient errors
//! are retried, anything else fails the item. An outcome from a scheduler
//! run the item has since left (restart, removal) is dropped.

use crate::backend::{SharedSource, TransferOutcome, WorkerEvent};
use crate::collection::TransferCollection;
use crate::config::SchedulerConfig;
use crate::error::QueueError;
use crate::hooks::{self, CommandSpec, CompletionRecord};
use crate::item::{ItemState, QueueId, SharedRef, Toggle, TransferItem};
use std::sync::Arc;
use tracing::{debug, info, warn};

enum Followup {
    Nothing,
    Shared(SharedRef, String),
    Local {
        record: CompletionRecord,
        log: bool,
        run_hook: bool,
    },
}

/// Applies worker events to the collection
#[derive(Clone)]
pub struct CompletionHandler {
    config: Arc<SchedulerConfig>,
    collection: TransferCollection,
    shared_source: Option<Arc<dyn SharedSource>>,
}

impl CompletionHandler {
    /// Create a handler
    pub fn new(
        config: Arc<SchedulerConfig>,
        collection: TransferCollection,
        shared_source: Option<Arc<dyn SharedSource>>,
    ) -> Self {
        Self {
            config,
            collection,
            shared_source,
        }
    }

    /// Apply one event
    ///
    /// A slot permit carried by the event is released only after the
    /// resulting state change is visible.
    pub async fn handle(&self, event: WorkerEvent, now: u64) {
        match event {
            WorkerEvent::Progress {
                queue_id,
                done,
                total,
                finalized,
            } => {
                self.collection
                    .with_item_mut(&queue_id, |item| {
                        item.update_progress(done, total, finalized, now);
                    })
                    .await;
            }
            WorkerEvent::Started { queue_id } => self.on_started(&queue_id, now).await,
            WorkerEvent::TransferFinished {
                queue_id,
                run,
                outcome,
                permit,
            } => {
                if self.is_current_run(&queue_id, run).await {
                    self.on_transfer_finished(&queue_id, outcome, now).await;
                }
                drop(permit);
            }
            WorkerEvent::KeyDerived {
                queue_id,
                result,
                permit,
            } => {
                self.on_key_derived(&queue_id, result, now).await;
                drop(permit);
            }
            WorkerEvent::Dequeued { queue_id } => self.on_dequeued(&queue_id, now).await,
        }
    }

    async fn on_started(&self, id: &QueueId, now: u64) {
        self.collection
            .with_item_mut(id, |item| {
                if item.state() != ItemState::Progress {
                    info!("{} started by the persistent queue", item.name());
                    item.set_state(ItemState::Progress, now);
                }
            })
            .await;
    }

    async fn is_current_run(&self, id: &QueueId, run: Option<u64>) -> bool {
        let Some(run) = run else {
            return true;
        };
        let current = self
            .collection
            .read(|items| {
                items.iter().any(|i| {
                    i.queue_id() == id && i.state() == ItemState::Progress && i.started_at() == run
                })
            })
            .await;
        if !current {
            debug!("Dropping outcome of a superseded run of {}", id);
        }
        current
    }

    /// Apply a transfer outcome; returns the item's new state
    pub async fn on_transfer_finished(
        &self,
        id: &QueueId,
        outcome: TransferOutcome,
        now: u64,
    ) -> Option<ItemState> {
        let max_retries = self.config.max_retries;
        let log_enabled = self.config.log_completions;
        let hook_enabled = self.config.completion_command.is_some();

        let (state, followup) = self
            .collection
            .with_item_mut(id, |item| {
                item.set_last_stopped_at(now);
                let followup = match outcome.into_result() {
                    Ok(content_id) => {
                        item.set_content_id(content_id.clone());
                        item.set_enabled(Toggle::Off);
                        item.set_state(ItemState::Done, now);
                        item.set_finished_at(now);
                        item.clear_error();
                        info!("Upload of {} finished: {}", item.name(), content_id);

                        match item.shared_ref() {
                            Some(shared) => Followup::Shared(shared, content_id),
                            None => Followup::Local {
                                record: CompletionRecord::from_item(item, &content_id),
                                log: log_enabled && item.mark_logged(),
                                run_hook: hook_enabled && item.mark_hook_ran(),
                            },
                        }
                    }
                    Err(error) => {
                        Self::apply_failure(item, &error, max_retries, now);
                        Followup::Nothing
                    }
                };
                (item.state(), followup)
            })
            .await?;

        match followup {
            Followup::Nothing => {}
            Followup::Shared(shared, content_id) => {
                self.collection.remove(std::slice::from_ref(id)).await;
                if let Some(source) = &self.shared_source {
                    source.transfer_completed(shared, &content_id).await;
                }
            }
            Followup::Local {
                record,
                log,
                run_hook,
            } => {
                if log {
                    if let Err(e) =
                        hooks::append_completion_log(&self.config.local_data_dir, &record, now)
                            .await
                    {
                        warn!("Failed to write completion log: {}", e);
                    }
                }
                if run_hook {
                    let spec = self.config.completion_command.as_deref().and_then(|cmd| {
                        CommandSpec::build(cmd, &record, &self.config.env_prefix)
                    });
                    if let Some(spec) = spec {
                        hooks::spawn_completion_command(spec);
                    }
                }
                if self.config.auto_remove_finished {
                    self.collection.remove_finished().await;
                }
            }
        }
        Some(state)
    }

    fn apply_failure(item: &mut TransferItem, error: &QueueError, max_retries: u32, now: u64) {
        let retry = error.is_transient() && item.increment_retries() <= max_retries;
        if retry {
            debug!(
                "Upload of {} will be retried ({}/{}): {}",
                item.name(),
                item.retries(),
                max_retries,
                error
            );
            item.set_state(ItemState::Waiting, now);
        } else {
            warn!("Upload of {} failed: {}", item.name(), error);
            item.set_enabled(Toggle::Off);
            item.set_state(ItemState::Failed, now);
        }
        item.set_error(error.detail());
    }

    async fn on_key_derived(&self, id: &QueueId, result: Result<String, String>, now: u64) {
        self.collection
            .with_item_mut(id, |item| {
                match result {
                    Ok(content_id) => {
                        info!("Derived key for {}: {}", item.name(), content_id);
                        item.set_content_id(content_id);
                        item.clear_error();
                    }
                    Err(description) => {
                        warn!("Key derivation for {} failed: {}", item.name(), description);
                        item.set_error(description);
                    }
                }
                if item.state().is_encoding() {
                    item.set_state(ItemState::Waiting, now);
                }
            })
            .await;
    }

    async fn on_dequeued(&self, id: &QueueId, now: u64) {
        let remove = self
            .collection
            .with_item_mut(id, |item| {
                if item.take_removal_expected() {
                    debug!("Expected removal of {} from the persistent queue", item.name());
                    return false;
                }
                if item.is_external() {
                    return true;
                }
                if item.state() == ItemState::Progress {
                    warn!("{} vanished from the persistent queue", item.name());
                    item.set_enabled(Toggle::Off);
                    item.set_state(ItemState::Failed, now);
                    item.set_error("Removed from the persistent queue");
                    item.set_last_stopped_at(now);
                }
                false
            })
            .await;
        if remove == Some(true) {
            self.collection.remove(std::slice::from_ref(id)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{CompatModes, TransferItem};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    const T: u64 = 1_700_000_000_000;

    #[derive(Default)]
    struct Source {
        completed: Mutex<Vec<(SharedRef, String)>>,
    }

    #[async_trait]
    impl SharedSource for Source {
        async fn transfer_completed(&self, shared: SharedRef, content_id: &str) {
            self.completed
                .lock()
                .unwrap()
                .push((shared, content_id.to_string()));
        }
    }

    fn running(path: &str) -> TransferItem {
        let mut item =
            TransferItem::new_local(path, 10, false, CompatModes::default().default_mode(), T);
        item.set_state(ItemState::Progress, T);
        item
    }

    async fn setup(
        config: SchedulerConfig,
        item: TransferItem,
    ) -> (CompletionHandler, TransferCollection, QueueId) {
        let collection = TransferCollection::new();
        let id = item.queue_id().clone();
        collection.add_if_new(item).await;
        let handler = CompletionHandler::new(Arc::new(config), collection.clone(), None);
        (handler, collection, id)
    }

    fn quiet_config(dir: &TempDir) -> SchedulerConfig {
        SchedulerConfig {
            local_data_dir: dir.path().to_path_buf(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_success() {
        let dir = TempDir::new().unwrap();
        let (handler, coll, id) = setup(quiet_config(&dir), running("/d/a.txt")).await;

        let state = handler
            .on_transfer_finished(
                &id,
                TransferOutcome::Success {
                    content_id: "abc123".into(),
                },
                T + 100,
            )
            .await;
        assert_eq!(state, Some(ItemState::Done));

        let item = coll.get(&id).await.unwrap();
        assert_eq!(item.content_id(), Some("abc123"));
        assert!(!item.is_enabled());
        assert_eq!(item.finished_at(), T + 100);
        assert_eq!(item.last_stopped_at(), T + 100);

        let logs: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(logs.len(), 1);
    }

    #[tokio::test]
    async fn test_repeated_success_logs_once() {
        let dir = TempDir::new().unwrap();
        let (handler, _coll, id) = setup(quiet_config(&dir), running("/d/a.txt")).await;
        for _ in 0..2 {
            handler
                .on_transfer_finished(
                    &id,
                    TransferOutcome::KeyCollision {
                        content_id: "dup".into(),
                    },
                    T,
                )
                .await;
        }
        let log = std::fs::read_dir(dir.path())
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .path();
        let contents = std::fs::read_to_string(log).unwrap();
        assert_eq!(contents.matches("Key=dup").count(), 1);
    }

    #[tokio::test]
    async fn test_auto_remove_finished() {
        let dir = TempDir::new().unwrap();
        let config = SchedulerConfig {
            auto_remove_finished: true,
            log_completions: false,
            ..quiet_config(&dir)
        };
        let (handler, coll, id) = setup(config, running("/d/a.txt")).await;
        handler
            .on_transfer_finished(
                &id,
                TransferOutcome::Success {
                    content_id: "abc123".into(),
                },
                T,
            )
            .await;
        assert!(coll.get(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_shared_completion_notifies_and_removes() {
        let dir = TempDir::new().unwrap();
        let collection = TransferCollection::new();
        let item = running("/d/shared.bin").with_shared_ref(SharedRef(42));
        let id = item.queue_id().clone();
        collection.add_if_new(item).await;

        let source = Arc::new(Source::default());
        let handler = CompletionHandler::new(
            Arc::new(quiet_config(&dir)),
            collection.clone(),
            Some(source.clone() as Arc<dyn SharedSource>),
        );
        handler
            .on_transfer_finished(
                &id,
                TransferOutcome::Success {
                    content_id: "k".into(),
                },
                T,
            )
            .await;

        assert!(collection.get(&id).await.is_none());
        assert_eq!(
            *source.completed.lock().unwrap(),
            vec![(SharedRef(42), "k".to_string())]
        );
        // Shared completions are never logged
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_fatal_failure() {
        let dir = TempDir::new().unwrap();
        let (handler, coll, id) = setup(quiet_config(&dir), running("/d/a")).await;
        handler
            .on_transfer_finished(
                &id,
                TransferOutcome::FatalFailure {
                    description: "rejected".into(),
                },
                T + 1,
            )
            .await;
        let item = coll.get(&id).await.unwrap();
        assert_eq!(item.state(), ItemState::Failed);
        assert!(!item.is_enabled());
        assert_eq!(item.error_description(), Some("rejected"));
        assert_eq!(item.retries(), 0);
    }

    #[tokio::test]
    async fn test_retry_cap() {
        let dir = TempDir::new().unwrap();
        let config = SchedulerConfig {
            max_retries: 1,
            ..quiet_config(&dir)
        };
        let (handler, coll, id) = setup(config, running("/d/a")).await;
        let fail = || TransferOutcome::RetryableFailure {
            description: "busy".into(),
        };

        assert_eq!(
            handler.on_transfer_finished(&id, fail(), T).await,
            Some(ItemState::Waiting)
        );
        let item = coll.get(&id).await.unwrap();
        assert!(item.is_enabled());
        assert_eq!(item.error_description(), Some("busy"));

        assert_eq!(
            handler.on_transfer_finished(&id, fail(), T + 1).await,
            Some(ItemState::Failed)
        );
        let item = coll.get(&id).await.unwrap();
        assert_eq!(item.retries(), 2);
        assert!(!item.is_enabled());
    }

    #[tokio::test]
    async fn test_unknown_item_ignored() {
        let dir = TempDir::new().unwrap();
        let (handler, _coll, _id) = setup(quiet_config(&dir), running("/d/a")).await;
        let state = handler
            .on_transfer_finished(
                &QueueId::new("missing"),
                TransferOutcome::Success {
                    content_id: "x".into(),
                },
                T,
            )
            .await;
        assert!(state.is_none());
    }

    #[tokio::test]
    async fn test_key_derivation_results() {
        let dir = TempDir::new().unwrap();
        let mut item =
            TransferItem::new_local("/d/k", 1, false, CompatModes::default().default_mode(), T);
        item.set_state(ItemState::Encoding, T);
        let (handler, coll, id) = setup(quiet_config(&dir), item).await;

        handler
            .handle(
                WorkerEvent::KeyDerived {
                    queue_id: id.clone(),
                    result: Err("node offline".into()),
                    permit: None,
                },
                T,
            )
            .await;
        let item = coll.get(&id).await.unwrap();
        assert_eq!(item.state(), ItemState::Waiting);
        assert!(item.content_id().is_none());
        assert_eq!(item.error_description(), Some("node offline"));

        coll.with_item_mut(&id, |i| i.set_state(ItemState::Encoding, T))
            .await;
        handler
            .handle(
                WorkerEvent::KeyDerived {
                    queue_id: id.clone(),
                    result: Ok("derived".into()),
                    permit: None,
                },
                T,
            )
            .await;
        let item = coll.get(&id).await.unwrap();
        assert_eq!(item.state(), ItemState::Waiting);
        assert_eq!(item.content_id(), Some("derived"));
        assert!(item.error_description().is_none());
    }

    #[tokio::test]
    async fn test_dequeue_handling() {
        let dir = TempDir::new().unwrap();
        let (handler, coll, id) = setup(quiet_config(&dir), running("/d/a")).await;

        coll.with_item_mut(&id, |i| i.mark_removal_expected()).await;
        handler
            .handle(WorkerEvent::Dequeued { queue_id: id.clone() }, T)
            .await;
        assert_eq!(coll.get(&id).await.unwrap().state(), ItemState::Progress);

        handler
            .handle(WorkerEvent::Dequeued { queue_id: id.clone() }, T)
            .await;
        let item = coll.get(&id).await.unwrap();
        assert_eq!(item.state(), ItemState::Failed);
        assert!(item.error_description().is_some());
    }

    #[tokio::test]
    async fn test_external_dequeue_removes_entry() {
        let dir = TempDir::new().unwrap();
        let item = TransferItem::new_external(
            QueueId::new("ext"),
            "ext",
            1,
            CompatModes::default().default_mode(),
            T,
        );
        let (handler, coll, id) = setup(quiet_config(&dir), item).await;
        handler
            .handle(WorkerEvent::Dequeued { queue_id: id.clone() }, T)
            .await;
        assert!(coll.get(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_progress_and_started_events() {
        let dir = TempDir::new().unwrap();
        let item =
            TransferItem::new_local("/d/p", 1, false, CompatModes::default().default_mode(), T);
        let (handler, coll, id) = setup(quiet_config(&dir), item).await;

        handler
            .handle(WorkerEvent::Started { queue_id: id.clone() }, T + 5)
            .await;
        handler
            .handle(
                WorkerEvent::Progress {
                    queue_id: id.clone(),
                    done: Some(4),
                    total: Some(8),
                    finalized: Some(true),
                },
                T + 6,
            )
            .await;

        let item = coll.get(&id).await.unwrap();
        assert_eq!(item.state(), ItemState::Progress);
        assert_eq!(item.started_at(), T + 5);
        assert_eq!(item.percent_done(), Some(50.0));
    }

    #[tokio::test]
    async fn test_outcome_of_superseded_run_is_dropped() {
        let dir = TempDir::new().unwrap();
        let (handler, coll, id) = setup(quiet_config(&dir), running("/d/r.txt")).await;
        let busy = || TransferOutcome::RetryableFailure {
            description: "busy".to_string(),
        };

        handler
            .handle(
                WorkerEvent::TransferFinished {
                    queue_id: id.clone(),
                    run: Some(T - 1),
                    outcome: busy(),
                    permit: None,
                },
                T + 1,
            )
            .await;
        let item = coll.get(&id).await.unwrap();
        assert_eq!(item.state(), ItemState::Progress);
        assert_eq!(item.retries(), 0);
        assert!(item.error_description().is_none());

        handler
            .handle(
                WorkerEvent::TransferFinished {
                    queue_id: id.clone(),
                    run: Some(T),
                    outcome: busy(),
                    permit: None,
                },
                T + 2,
            )
            .await;
        let item = coll.get(&id).await.unwrap();
        assert_eq!(item.state(), ItemState::Waiting);
        assert_eq!(item.retries(), 1);
        assert_eq!(item.error_description(), Some("busy"));
    }
}
