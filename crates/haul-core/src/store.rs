//! Queue persistence
//!
//! [`ItemStore`] is the persistence bridge used by
//! [`TransferCollection`](crate::collection::TransferCollection).
//! [`JsonFileStore`] keeps the whole queue in one JSON document.

use crate::error::{QueueError, Result};
use crate::item::TransferItem;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;

/// Current queue file format version
pub const QUEUE_FILE_VERSION: u32 = 1;

/// Persistence collaborator
#[async_trait]
pub trait ItemStore: Send + Sync {
    /// Load all persisted items
    async fn load_items(&self) -> Result<Vec<TransferItem>>;

    /// Replace the persisted queue with `items`
    async fn save_items(&self, items: &[TransferItem]) -> Result<()>;

    /// Insert or replace one item
    async fn update_item(&self, item: &TransferItem) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct QueueFile {
    version: u32,
    items: Vec<TransferItem>,
}

/// Queue stored as a single pretty-printed JSON file
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    /// Create a store backed by `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Backing file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<Vec<TransferItem>> {
        let json = match fs::read_to_string(&self.path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(QueueError::Storage(Cow::Owned(format!(
                    "Failed to read {}: {e}",
                    self.path.display()
                ))));
            }
        };
        let file: QueueFile = serde_json::from_str(&json).map_err(|e| {
            QueueError::Storage(Cow::Owned(format!(
                "Failed to parse {}: {e}",
                self.path.display()
            )))
        })?;
        if file.version > QUEUE_FILE_VERSION {
            return Err(QueueError::Storage(Cow::Owned(format!(
                "Unsupported queue file version {}",
                file.version
            ))));
        }
        Ok(file.items)
    }

    async fn write(&self, items: &[TransferItem]) -> Result<()> {
        let file = QueueFile {
            version: QUEUE_FILE_VERSION,
            items: items.to_vec(),
        };
        let json = serde_json::to_string_pretty(&file).map_err(|e| {
            QueueError::Storage(Cow::Owned(format!("Failed to serialize queue: {e}")))
        })?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await.map_err(|e| storage_io("create", parent, e))?;
            }
        }

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)
            .await
            .map_err(|e| storage_io("write", &tmp, e))?;
        fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| storage_io("replace", &self.path, e))?;
        Ok(())
    }
}

fn storage_io(action: &str, path: &Path, err: std::io::Error) -> QueueError {
    QueueError::Storage(Cow::Owned(format!(
        "Failed to {action} {}: {err}",
        path.display()
    )))
}

#[async_trait]
impl ItemStore for JsonFileStore {
    async fn load_items(&self) -> Result<Vec<TransferItem>> {
        let _guard = self.write_lock.lock().await;
        self.read().await
    }

    async fn save_items(&self, items: &[TransferItem]) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.write(items).await
    }

    async fn update_item(&self, item: &TransferItem) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut items = self.read().await?;
        match items.iter_mut().find(|i| i.queue_id() == item.queue_id()) {
            Some(existing) => *existing = item.clone(),
            None => items.push(item.clone()),
        }
        self.write(&items).await
    }
}
