//! haul CLI
//!
//! Manages the persisted upload queue: add files, inspect state, and apply
//! the same bulk operations the scheduler host exposes.

mod config;
mod progress;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use console::style;
use haul_core::{
    CryptoKey, JsonFileStore, Priority, ProgressReporter, QueueId,
    SchedulerConfig, Toggle, TransferBackend, TransferCollection, TransferItem, TransferJob,
    TransferOutcome, now_millis,
};
use haul_files::{FilesError, HashRequest, ShareRegistry, SharedFileRegistration};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use config::Config;
use progress::{format_bytes, state_label, summarize};

/// haul - upload queue manager
#[derive(Parser)]
#[command(name = "haul")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue files for upload
    Add {
        /// Files to queue
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Prefix for the published name
        #[arg(long)]
        prefix: Option<String>,

        /// 32-byte crypto key as 64 lowercase hex characters
        #[arg(long)]
        crypto_key: Option<String>,

        /// Disable compression
        #[arg(long)]
        no_compress: bool,

        /// Compatibility mode
        #[arg(long)]
        mode: Option<String>,

        /// Priority class (0 = highest, 6 = lowest)
        #[arg(long, default_value_t = 3)]
        priority: u8,
    },

    /// List queued items
    List,

    /// Show per-state counts
    Stats,

    /// Enable items
    Enable {
        /// Queue ids or file paths
        #[arg(required = true)]
        items: Vec<String>,
    },

    /// Disable items
    Disable {
        /// Queue ids or file paths
        #[arg(required = true)]
        items: Vec<String>,
    },

    /// Flip the enabled flag of items
    Toggle {
        /// Queue ids or file paths
        #[arg(required = true)]
        items: Vec<String>,
    },

    /// Restart items from scratch
    ///
    /// Only offline queues can be restarted here; with
    /// `queue.persistent_queue` set, entries are owned by the queue manager.
    Restart {
        /// Queue ids or file paths
        #[arg(required = true)]
        items: Vec<String>,
    },

    /// Request key derivation for items
    GenerateKey {
        /// Queue ids or file paths
        #[arg(required = true)]
        items: Vec<String>,
    },

    /// Change the priority class of items
    Priority {
        /// Priority class (0 = highest, 6 = lowest)
        class: u8,

        /// Queue ids or file paths
        #[arg(required = true)]
        items: Vec<String>,
    },

    /// Remove items
    Remove {
        /// Queue ids or file paths
        #[arg(required = true)]
        items: Vec<String>,
    },

    /// Remove finished items
    RemoveFinished,

    /// Remove external queue entries
    RemoveExternal,

    /// Check waiting items against their files
    Validate,

    /// Print BLAKE3 checksums of files
    Hash {
        /// Files to hash
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };
    config.validate()?;

    let level = if cli.verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(level))
        .init();

    if let Commands::Hash { files } = &cli.command {
        return hash_files(files).await;
    }

    let sched_config = config.scheduler_config();
    let store = JsonFileStore::new(&config.storage.queue_file);
    let collection = TransferCollection::new();
    collection.load(&store, &sched_config, now_millis()).await?;

    let dirty = match cli.command {
        Commands::Add {
            files,
            prefix,
            crypto_key,
            no_compress,
            mode,
            priority,
        } => {
            let options = AddOptions {
                prefix,
                crypto_key: crypto_key.map(|k| k.parse::<CryptoKey>()).transpose()?,
                compress: config.queue.compress && !no_compress,
                mode,
                priority: Priority::try_from(priority)?,
            };
            add_files(&collection, &sched_config, files, options).await?
        }
        Commands::List => {
            list_items(&collection).await;
            false
        }
        Commands::Stats => {
            show_stats(&collection).await;
            false
        }
        Commands::Enable { items } => toggle(&collection, &items, Toggle::On).await?,
        Commands::Disable { items } => toggle(&collection, &items, Toggle::Off).await?,
        Commands::Toggle { items } => toggle(&collection, &items, Toggle::Invert).await?,
        Commands::Restart { items } => restart_items(&collection, &sched_config, &items).await?,
        Commands::GenerateKey { items } => {
            let ids = resolve_ids(&collection, &items).await?;
            let requested = collection.generate_key_for(&ids, now_millis()).await;
            println!("Requested key derivation for {} item(s)", requested.len());
            !requested.is_empty()
        }
        Commands::Priority { class, items } => {
            let ids = resolve_ids(&collection, &items).await?;
            collection
                .change_priority(&ids, Priority::try_from(class)?, None)
                .await?;
            true
        }
        Commands::Remove { items } => {
            let ids = resolve_ids(&collection, &items).await?;
            let removed = collection.remove(&ids).await;
            println!("Removed {} item(s)", removed.len());
            !removed.is_empty()
        }
        Commands::RemoveFinished => {
            let removed = collection.remove_finished().await;
            println!("Removed {} finished item(s)", removed.len());
            !removed.is_empty()
        }
        Commands::RemoveExternal => {
            let removed = collection.remove_external().await;
            println!("Removed {} external item(s)", removed.len());
            !removed.is_empty()
        }
        Commands::Validate => {
            let failed = collection.validate_against_disk(None, now_millis()).await;
            for id in &failed {
                if let Some(item) = collection.get(id).await {
                    println!(
                        "{} {}: {}",
                        style("FAILED").red(),
                        item.name(),
                        item.error_description().unwrap_or_default()
                    );
                }
            }
            println!("{} item(s) failed validation", failed.len());
            !failed.is_empty()
        }
        Commands::Hash { .. } => false,
    };

    if dirty {
        collection.save(&store).await?;
        tracing::debug!("Queue saved to {}", store.path().display());
    }

    Ok(())
}

struct AddOptions {
    prefix: Option<String>,
    crypto_key: Option<CryptoKey>,
    compress: bool,
    mode: Option<String>,
    priority: Priority,
}

/// Queue files; returns true if anything was added
async fn add_files(
    collection: &TransferCollection,
    config: &SchedulerConfig,
    files: Vec<PathBuf>,
    options: AddOptions,
) -> anyhow::Result<bool> {
    let mode = match &options.mode {
        Some(tag) => config.compat_modes.resolve(tag),
        None => config.compat_modes.default_mode(),
    };
    let now = now_millis();

    let mut batch = Vec::with_capacity(files.len());
    for file in files {
        let meta = std::fs::metadata(&file)?;
        if !meta.is_file() {
            anyhow::bail!("Not a regular file: {}", file.display());
        }
        let path = std::fs::canonicalize(&file)?;
        let mut item = TransferItem::new_local(path, meta.len(), options.compress, mode.clone(), now)
            .with_priority(options.priority);
        if let Some(prefix) = &options.prefix {
            item = item.with_name_prefix(prefix.clone());
        }
        if let Some(key) = options.crypto_key {
            item = item.with_crypto_key(key);
        }
        batch.push(item);
    }

    let total = batch.len();
    let rejected = collection.add_batch(batch).await;
    for item in &rejected {
        println!(
            "{} {} is already queued",
            style("SKIPPED").yellow(),
            item.path()
                .map_or_else(|| item.name().to_string(), |p| p.display().to_string())
        );
    }
    println!("Queued {} of {} file(s)", total - rejected.len(), total);
    Ok(rejected.len() < total)
}

/// Print all items
async fn list_items(collection: &TransferCollection) {
    let items = collection.snapshot().await;
    if items.is_empty() {
        println!("Queue is empty");
        return;
    }

    let now = now_millis();
    for item in &items {
        let enabled = if item.is_enabled() { " " } else { "-" };
        println!(
            "{enabled} {:<22} {:<20} {:>10}  {}  [{}]",
            item.queue_id(),
            state_label(item.state()),
            format_bytes(item.file_size()),
            item.published_name(),
            summarize(item, now)
        );
        if let Some(key) = item.content_id() {
            println!("    key: {key}");
        }
        if item.retries() > 0 {
            println!("    retries: {}", item.retries());
        }
        if let Some(err) = item.error_description() {
            println!("    {}", style(err).red());
        }
    }
}

/// Print per-state counts
async fn show_stats(collection: &TransferCollection) {
    let stats = collection.stats().await;
    println!("Items:       {}", stats.total);
    println!("  waiting:   {}", stats.waiting);
    println!("  encoding:  {}", stats.encoding);
    println!("  running:   {}", stats.in_progress);
    println!("  done:      {}", stats.done);
    println!("  failed:    {}", stats.failed);
    println!("  disabled:  {}", stats.disabled);
    println!("  external:  {}", stats.external);
}

/// Apply an enable/disable request
async fn toggle(
    collection: &TransferCollection,
    items: &[String],
    toggle: Toggle,
) -> anyhow::Result<bool> {
    let ids = resolve_ids(collection, items).await?;
    let touched = collection.set_enabled(&ids, toggle).await;
    println!("Updated {touched} item(s)");
    Ok(touched > 0)
}

/// Restart items without a queue manager
async fn restart_items(
    collection: &TransferCollection,
    config: &SchedulerConfig,
    items: &[String],
) -> anyhow::Result<bool> {
    if config.persistent_queue {
        anyhow::bail!(
            "Restarting needs the persistent queue manager; the CLI only restarts offline queues"
        );
    }
    let ids = resolve_ids(collection, items).await?;
    let restarted = collection.restart(&ids, &OfflineBackend, None).await?;
    println!("Restarted {} item(s)", restarted.len());
    Ok(!restarted.is_empty())
}

/// Map queue ids or file paths to queue ids
async fn resolve_ids(
    collection: &TransferCollection,
    selectors: &[String],
) -> anyhow::Result<Vec<QueueId>> {
    let items = collection.snapshot().await;
    let mut ids = Vec::with_capacity(selectors.len());
    for selector in selectors {
        let canonical = std::fs::canonicalize(selector).ok();
        let found = items.iter().find(|item| {
            item.queue_id().as_str() == selector
                || item.path().is_some_and(|p| {
                    p == Path::new(selector) || canonical.as_deref() == Some(p)
                })
        });
        match found {
            Some(item) => ids.push(item.queue_id().clone()),
            None => anyhow::bail!("No queued item matches {selector}"),
        }
    }
    Ok(ids)
}

/// Backend used when the CLI edits the queue without a node connection
struct OfflineBackend;

#[async_trait]
impl TransferBackend for OfflineBackend {
    async fn is_connected(&self) -> bool {
        false
    }

    async fn start_transfer(&self, _job: TransferJob, _progress: ProgressReporter) -> TransferOutcome {
        TransferOutcome::RetryableFailure {
            description: "No backend connection".to_string(),
        }
    }

    async fn derive_key(&self, _job: TransferJob) -> Result<String, String> {
        Err("No backend connection".to_string())
    }

    fn is_direct_transfer_in_progress(&self, _queue_id: &QueueId) -> bool {
        false
    }

    fn is_enqueued(&self, _queue_id: &QueueId) -> bool {
        false
    }
}

/// Registry that prints checksums instead of sharing
struct PrintRegistry;

#[async_trait]
impl ShareRegistry for PrintRegistry {
    async fn register(&self, registration: SharedFileRegistration) -> Result<(), FilesError> {
        println!(
            "{}  {}  ({})",
            registration.checksum,
            registration.path.display(),
            format_bytes(registration.size)
        );
        Ok(())
    }

    async fn remove_pending(&self, _pending_id: u64) -> Result<(), FilesError> {
        Ok(())
    }
}

/// Hash files through the hash queue
async fn hash_files(files: &[PathBuf]) -> anyhow::Result<()> {
    let (queue, handle) =
        haul_files::hash_queue::spawn(Arc::new(PrintRegistry), haul_files::DEFAULT_MAX_FAILURES);
    for (pending_id, path) in (0u64..).zip(files) {
        queue.enqueue(HashRequest {
            pending_id,
            path: path.clone(),
        })?;
    }
    drop(queue);

    let hashed = handle.await??;
    if hashed < files.len() as u64 {
        anyhow::bail!("{} file(s) could not be hashed", files.len() as u64 - hashed);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use haul_core::ItemState;
    use tempfile::TempDir;

    fn options() -> AddOptions {
        AddOptions {
            prefix: None,
            crypto_key: None,
            compress: true,
            mode: None,
            priority: Priority::DEFAULT,
        }
    }

    #[tokio::test]
    async fn test_add_and_resolve() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("a.bin");
        std::fs::write(&file, b"abc").unwrap();

        let collection = TransferCollection::new();
        let config = SchedulerConfig::default();
        assert!(
            add_files(&collection, &config, vec![file.clone()], options())
                .await
                .unwrap()
        );
        // Second add is a duplicate
        assert!(
            !add_files(&collection, &config, vec![file.clone()], options())
                .await
                .unwrap()
        );

        let ids = resolve_ids(&collection, &[file.display().to_string()])
            .await
            .unwrap();
        assert_eq!(ids.len(), 1);
        let item = collection.get(&ids[0]).await.unwrap();
        assert_eq!(item.file_size(), 3);
        assert_eq!(item.state(), ItemState::Waiting);

        assert!(
            resolve_ids(&collection, &["nope".to_string()])
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_add_rejects_directory() {
        let dir = TempDir::new().unwrap();
        let collection = TransferCollection::new();
        let result = add_files(
            &collection,
            &SchedulerConfig::default(),
            vec![dir.path().to_path_buf()],
            options(),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_offline_restart() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("a.bin");
        std::fs::write(&file, b"abc").unwrap();
        let collection = TransferCollection::new();
        add_files(&collection, &SchedulerConfig::default(), vec![file.clone()], options())
            .await
            .unwrap();

        let ids: Vec<_> = collection
            .snapshot()
            .await
            .iter()
            .map(|i| i.queue_id().clone())
            .collect();
        collection
            .with_item_mut(&ids[0], |i| i.set_state(ItemState::Failed, 1))
            .await;
        let selectors = [file.display().to_string()];
        assert!(
            restart_items(&collection, &SchedulerConfig::default(), &selectors)
                .await
                .unwrap()
        );
        assert_eq!(
            collection.get(&ids[0]).await.unwrap().state(),
            ItemState::Waiting
        );
    }

    #[tokio::test]
    async fn test_restart_refused_for_persistent_queue() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("a.bin");
        std::fs::write(&file, b"abc").unwrap();
        let collection = TransferCollection::new();
        add_files(&collection, &SchedulerConfig::default(), vec![file.clone()], options())
            .await
            .unwrap();
        let id = collection.snapshot().await[0].queue_id().clone();
        collection
            .with_item_mut(&id, |i| i.set_state(ItemState::Failed, 1))
            .await;

        let config = SchedulerConfig {
            persistent_queue: true,
            ..SchedulerConfig::default()
        };
        let result = restart_items(&collection, &config, &[file.display().to_string()]).await;
        assert!(result.unwrap_err().to_string().contains("offline"));
        assert_eq!(collection.get(&id).await.unwrap().state(), ItemState::Failed);
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from(["haul", "priority", "1", "haul-00"]).unwrap();
        assert!(matches!(cli.command, Commands::Priority { class: 1, .. }));

        let cli = Cli::try_parse_from(["haul", "-v", "remove-finished"]).unwrap();
        assert!(cli.verbose);
        assert!(matches!(cli.command, Commands::RemoveFinished));
    }
}
