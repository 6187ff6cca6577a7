//! Completion side effects
//!
//! After a local item finishes, two optional actions run:
//!
//! - an entry appended to `<data dir>/Uploads_<yyyy-MM>.log` (UTC month)
//! - a user-configured command, launched in the file's directory with the
//!   result passed as trailing arguments `[name, content id, mode, compress,
//!   crypto key or "auto"]` and as `<PREFIX>_*` environment variables
//!
//! Command launch failures are only logged.

use crate::error::Result;
use crate::item::{CryptoKey, TransferItem};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Placeholder passed when no crypto key was supplied
pub const AUTO_KEY: &str = "auto";

/// Facts about one finished upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRecord {
    /// Published name
    pub name: String,
    /// Content identifier
    pub content_id: String,
    /// Compatibility mode
    pub compat_mode: String,
    /// Compression flag
    pub compress: bool,
    /// User-supplied crypto key
    pub crypto_key: Option<CryptoKey>,
    /// Backing file
    pub path: Option<PathBuf>,
    /// File size in bytes
    pub file_size: u64,
}

impl CompletionRecord {
    /// Build a record from a finished item
    #[must_use]
    pub fn from_item(item: &TransferItem, content_id: &str) -> Self {
        Self {
            name: item.published_name(),
            content_id: content_id.to_string(),
            compat_mode: item.compat_mode().to_string(),
            compress: item.compress(),
            crypto_key: item.crypto_key().copied(),
            path: item.path().map(Path::to_path_buf),
            file_size: item.file_size(),
        }
    }

    fn crypto_key_arg(&self) -> String {
        self.crypto_key
            .map_or_else(|| AUTO_KEY.to_string(), |k| k.to_string())
    }
}

fn to_utc(now_ms: u64) -> DateTime<Utc> {
    i64::try_from(now_ms)
        .ok()
        .and_then(DateTime::from_timestamp_millis)
        .unwrap_or_else(Utc::now)
}

/// Log file for the UTC month containing `at`
#[must_use]
pub fn log_file_path(dir: &Path, at: DateTime<Utc>) -> PathBuf {
    dir.join(format!("Uploads_{}.log", at.format("%Y-%m")))
}

/// One log entry
#[must_use]
pub fn format_log_entry(record: &CompletionRecord, at: DateTime<Utc>) -> String {
    let mut entry = format!("[ {} ]\n", at.format("%Y.%m.%d - %H:%M:%SGMT"));
    entry.push_str(&format!("Name={}\n", record.name));
    entry.push_str(&format!("Key={}\n", record.content_id));
    entry.push_str(&format!("Size={}\n", record.file_size));
    entry.push_str(&format!("Mode={}\n", record.compat_mode));
    entry.push_str(&format!("Compress={}\n", record.compress));
    entry.push_str(&format!("CryptoKey={}\n", record.crypto_key_arg()));
    entry
}

/// Append a completion entry to the monthly log file
pub async fn append_completion_log(
    dir: &Path,
    record: &CompletionRecord,
    now_ms: u64,
) -> Result<PathBuf> {
    let at = to_utc(now_ms);
    let path = log_file_path(dir, at);
    tokio::fs::create_dir_all(dir).await?;

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await?;
    file.write_all(format_log_entry(record, at).as_bytes())
        .await?;
    file.flush().await?;

    debug!("Logged completion of {} to {}", record.name, path.display());
    Ok(path)
}

/// Fully resolved completion command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// Program to run
    pub program: String,
    /// Arguments: configured ones followed by the result fields
    pub args: Vec<String>,
    /// Environment variables
    pub envs: Vec<(String, String)>,
    /// Working directory
    pub current_dir: Option<PathBuf>,
}

impl CommandSpec {
    /// Build the invocation for `record`; `None` for a blank command line
    #[must_use]
    pub fn build(command_line: &str, record: &CompletionRecord, env_prefix: &str) -> Option<Self> {
        let mut words = command_line.split_whitespace().map(str::to_string);
        let program = words.next()?;
        let crypto_key = record.crypto_key_arg();

        let mut args: Vec<String> = words.collect();
        args.extend([
            record.name.clone(),
            record.content_id.clone(),
            record.compat_mode.clone(),
            record.compress.to_string(),
            crypto_key.clone(),
        ]);

        let envs = vec![
            (format!("{env_prefix}_FILENAME"), record.name.clone()),
            (format!("{env_prefix}_KEY"), record.content_id.clone()),
            (format!("{env_prefix}_MODE"), record.compat_mode.clone()),
            (format!("{env_prefix}_COMPRESS"), record.compress.to_string()),
            (format!("{env_prefix}_CRYPTOKEY"), crypto_key),
        ];

        let current_dir = record
            .path
            .as_deref()
            .and_then(Path::parent)
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf);

        Some(Self {
            program,
            args,
            envs,
            current_dir,
        })
    }
}

/// Launch the completion command in the background
pub fn spawn_completion_command(spec: CommandSpec) {
    let mut command = tokio::process::Command::new(&spec.program);
    command.args(&spec.args).envs(spec.envs.iter().cloned());
    if let Some(dir) = &spec.current_dir {
        command.current_dir(dir);
    }

    match command.spawn() {
        Ok(mut child) => {
            info!("Started completion command {} (PID: {:?})", spec.program, child.id());
            let program = spec.program;
            tokio::spawn(async move {
                match child.wait().await {
                    Ok(status) if status.success() => {
                        debug!("Completion command {} finished", program);
                    }
                    Ok(status) => warn!("Completion command {} exited with {}", program, status),
                    Err(e) => warn!("Failed to wait for completion command {}: {}", program, e),
                }
            });
        }
        Err(e) => warn!("Failed to launch completion command {}: {}", spec.program, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn record() -> CompletionRecord {
        CompletionRecord {
            name: "cat.jpg".to_string(),
            content_id: "abc123".to_string(),
            compat_mode: "COMPAT_CURRENT".to_string(),
            compress: true,
            crypto_key: None,
            path: Some(PathBuf::from("/data/photos/cat.jpg")),
            file_size: 1000,
        }
    }

    #[test]
    fn test_log_file_name_uses_utc_month() {
        let at = Utc.with_ymd_and_hms(2024, 3, 31, 23, 59, 0).unwrap();
        assert_eq!(
            log_file_path(Path::new("/data"), at),
            PathBuf::from("/data/Uploads_2024-03.log")
        );
    }

    #[test]
    fn test_log_entry_format() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 8, 4, 9).unwrap();
        let entry = format_log_entry(&record(), at);
        assert!(entry.starts_with("[ 2024.05.01 - 08:04:09GMT ]\n"));
        assert!(entry.contains("Name=cat.jpg\n"));
        assert!(entry.contains("Key=abc123\n"));
        assert!(entry.contains("CryptoKey=auto\n"));
        assert!(entry.ends_with('\n'));
    }

    #[tokio::test]
    async fn test_append_log() {
        let dir = TempDir::new().unwrap();
        let now = Utc
            .with_ymd_and_hms(2024, 5, 1, 0, 0, 0)
            .unwrap()
            .timestamp_millis() as u64;

        let path = append_completion_log(dir.path(), &record(), now)
            .await
            .unwrap();
        append_completion_log(dir.path(), &record(), now)
            .await
            .unwrap();

        assert!(path.ends_with("Uploads_2024-05.log"));
        let contents = std::fs::read_to_string(path).unwrap();
        assert_eq!(contents.matches("Key=abc123").count(), 2);
    }

    #[test]
    fn test_command_spec() {
        let mut rec = record();
        rec.crypto_key = Some(CryptoKey::from_bytes([0xab; 32]));
        let spec = CommandSpec::build("notify-send --urgency low", &rec, "HAUL").unwrap();

        assert_eq!(spec.program, "notify-send");
        assert_eq!(
            spec.args,
            vec![
                "--urgency".to_string(),
                "low".to_string(),
                "cat.jpg".to_string(),
                "abc123".to_string(),
                "COMPAT_CURRENT".to_string(),
                "true".to_string(),
                "ab".repeat(32),
            ]
        );
        assert!(
            spec.envs
                .contains(&("HAUL_FILENAME".to_string(), "cat.jpg".to_string()))
        );
        assert!(
            spec.envs
                .contains(&("HAUL_CRYPTOKEY".to_string(), "ab".repeat(32)))
        );
        assert_eq!(spec.current_dir, Some(PathBuf::from("/data/photos")));
    }

    #[test]
    fn test_blank_command_builds_nothing() {
        assert!(CommandSpec::build("   ", &record(), "HAUL").is_none());
    }

    #[tokio::test]
    async fn test_launch_failure_is_swallowed() {
        let spec = CommandSpec::build("/nonexistent/haul-hook", &record(), "HAUL").unwrap();
        spawn_completion_command(CommandSpec {
            current_dir: None,
            ..spec
        });
    }
}
