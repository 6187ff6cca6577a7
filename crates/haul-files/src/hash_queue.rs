//! Share-registration hash queue
//!
//! Files a user wants to share must be checksummed before they can be
//! registered. [`spawn`] starts one long-lived consumer that drains an
//! unbounded FIFO of [`HashRequest`]s: each file is hashed, registered with
//! the [`ShareRegistry`], and its pending record removed.
//!
//! Per-request failures are counted and skipped. Once more than
//! `max_failures` requests have failed the consumer stops for good and its
//! join handle resolves to [`FilesError::SubsystemFatal`].

use crate::error::FilesError;
use crate::hasher::{FileChecksum, hash_file};
use async_trait::async_trait;
use std::borrow::Cow;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Failures tolerated before the consumer gives up
pub const DEFAULT_MAX_FAILURES: u32 = 10;

/// A file waiting for its checksum
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashRequest {
    /// Identifier of the pending-share record
    pub pending_id: u64,
    /// File to hash
    pub path: PathBuf,
}

/// A hashed file ready to be shared
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedFileRegistration {
    /// Identifier of the pending-share record it replaces
    pub pending_id: u64,
    /// Shared file
    pub path: PathBuf,
    /// Content checksum
    pub checksum: FileChecksum,
    /// File size in bytes
    pub size: u64,
}

/// Owner of shared-file and pending-share records
#[async_trait]
pub trait ShareRegistry: Send + Sync {
    /// Create a shared-file registration
    async fn register(&self, registration: SharedFileRegistration) -> Result<(), FilesError>;

    /// Drop the pending record a registration replaced
    async fn remove_pending(&self, pending_id: u64) -> Result<(), FilesError>;
}

/// Producer handle of the hash queue
#[derive(Debug, Clone)]
pub struct HashQueue {
    tx: mpsc::UnboundedSender<HashRequest>,
}

impl HashQueue {
    /// Queue a file for hashing
    pub fn enqueue(&self, request: HashRequest) -> Result<(), FilesError> {
        self.tx
            .send(request)
            .map_err(|_| FilesError::SubsystemFatal(Cow::Borrowed("hash queue stopped")))
    }
}

/// Start the consumer
///
/// The join handle resolves to the number of registered files once every
/// producer handle is dropped.
pub fn spawn(
    registry: Arc<dyn ShareRegistry>,
    max_failures: u32,
) -> (HashQueue, JoinHandle<Result<u64, FilesError>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(consume(rx, registry, max_failures));
    (HashQueue { tx }, handle)
}

async fn consume(
    mut rx: mpsc::UnboundedReceiver<HashRequest>,
    registry: Arc<dyn ShareRegistry>,
    max_failures: u32,
) -> Result<u64, FilesError> {
    let mut failures = 0u32;
    let mut registered = 0u64;

    while let Some(request) = rx.recv().await {
        match process(registry.as_ref(), &request).await {
            Ok(()) => registered += 1,
            Err(e) => {
                failures += 1;
                warn!(
                    "Hashing {} failed ({}/{}): {}",
                    request.path.display(),
                    failures,
                    max_failures,
                    e
                );
                if failures > max_failures {
                    error!("Hash queue stopped after {} failures", failures);
                    return Err(FilesError::SubsystemFatal(Cow::Owned(format!(
                        "hash queue stopped after {failures} failures"
                    ))));
                }
            }
        }
    }

    info!("Hash queue drained, {} file(s) registered", registered);
    Ok(registered)
}

async fn process(registry: &dyn ShareRegistry, request: &HashRequest) -> Result<(), FilesError> {
    let path = request.path.clone();
    let (checksum, size) = tokio::task::spawn_blocking(move || {
        let size = std::fs::metadata(&path)?.len();
        Ok::<_, std::io::Error>((hash_file(&path)?, size))
    })
    .await
    .map_err(|e| FilesError::Io(e.to_string()))??;

    debug!("Hashed {}: {}", request.path.display(), checksum);
    registry
        .register(SharedFileRegistration {
            pending_id: request.pending_id,
            path: request.path.clone(),
            checksum,
            size,
        })
        .await?;
    registry.remove_pending(request.pending_id).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct MemoryRegistry {
        registered: Mutex<Vec<SharedFileRegistration>>,
        pending_removed: Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl ShareRegistry for MemoryRegistry {
        async fn register(&self, registration: SharedFileRegistration) -> Result<(), FilesError> {
            self.registered.lock().unwrap().push(registration);
            Ok(())
        }

        async fn remove_pending(&self, pending_id: u64) -> Result<(), FilesError> {
            self.pending_removed.lock().unwrap().push(pending_id);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_registers_hashed_files_in_order() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        std::fs::write(&a, b"alpha").unwrap();
        std::fs::write(&b, b"bravo!").unwrap();

        let registry = Arc::new(MemoryRegistry::default());
        let (queue, handle) = spawn(registry.clone(), DEFAULT_MAX_FAILURES);
        queue
            .enqueue(HashRequest {
                pending_id: 1,
                path: a.clone(),
            })
            .unwrap();
        queue
            .enqueue(HashRequest {
                pending_id: 2,
                path: b,
            })
            .unwrap();
        drop(queue);

        assert_eq!(handle.await.unwrap().unwrap(), 2);
        let registered = registry.registered.lock().unwrap();
        assert_eq!(registered[0].path, a);
        assert_eq!(registered[0].size, 5);
        assert_eq!(registered[0].checksum, crate::hasher::hash_bytes(b"alpha"));
        assert_eq!(*registry.pending_removed.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_failures_below_threshold_are_skipped() {
        let dir = TempDir::new().unwrap();
        let good = dir.path().join("good");
        std::fs::write(&good, b"x").unwrap();

        let registry = Arc::new(MemoryRegistry::default());
        let (queue, handle) = spawn(registry.clone(), 2);
        for id in 0..2 {
            queue
                .enqueue(HashRequest {
                    pending_id: id,
                    path: dir.path().join("missing"),
                })
                .unwrap();
        }
        queue
            .enqueue(HashRequest {
                pending_id: 9,
                path: good,
            })
            .unwrap();
        drop(queue);

        assert_eq!(handle.await.unwrap().unwrap(), 1);
        assert_eq!(*registry.pending_removed.lock().unwrap(), vec![9]);
    }

    #[tokio::test]
    async fn test_stops_past_threshold() {
        let registry = Arc::new(MemoryRegistry::default());
        let (queue, handle) = spawn(registry, 1);
        for id in 0..2 {
            queue
                .enqueue(HashRequest {
                    pending_id: id,
                    path: PathBuf::from("/definitely/missing"),
                })
                .unwrap();
        }

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(FilesError::SubsystemFatal(_))));

        // Consumer is gone; producers see it
        let late = queue.enqueue(HashRequest {
            pending_id: 5,
            path: PathBuf::from("/x"),
        });
        assert!(late.unwrap_err().is_fatal());
    }
}
