//! Configuration file for the haul CLI.

use haul_core::{CompatModes, SchedulerConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// haul configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Scheduling configuration
    #[serde(default)]
    pub queue: QueueConfig,
    /// Storage locations
    #[serde(default)]
    pub storage: StorageConfig,
    /// Completion hooks
    #[serde(default)]
    pub hooks: HooksConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Scheduling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum concurrent transfers
    #[serde(default = "default_max_transfers")]
    pub max_transfers: usize,
    /// Retryable failures tolerated per item
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Seconds to wait before retrying a stopped item
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: u64,
    /// Remove finished items automatically
    #[serde(default)]
    pub auto_remove_finished: bool,
    /// A persistent backend queue starts transfers
    #[serde(default)]
    pub persistent_queue: bool,
    /// Compress new items
    #[serde(default = "default_true")]
    pub compress: bool,
    /// Known compatibility modes
    #[serde(default = "default_compat_modes")]
    pub compat_modes: Vec<String>,
    /// Compatibility mode for new items
    #[serde(default = "default_compat_mode")]
    pub default_compat_mode: String,
}

/// Storage locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Persisted queue
    #[serde(default = "default_queue_file")]
    pub queue_file: PathBuf,
    /// Directory for completion logs
    #[serde(default = "default_data_dir")]
    pub local_data_dir: PathBuf,
}

/// Completion hooks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HooksConfig {
    /// Append completions to the monthly log file
    #[serde(default = "default_true")]
    pub log_completions: bool,
    /// Command run after each completion
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_command: Option<String>,
    /// Prefix of the environment variables passed to the command
    #[serde(default = "default_env_prefix")]
    pub env_prefix: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_max_transfers() -> usize {
    3
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_secs() -> u64 {
    5 * 60
}

fn default_true() -> bool {
    true
}

fn default_compat_modes() -> Vec<String> {
    CompatModes::default().known().to_vec()
}

fn default_compat_mode() -> String {
    CompatModes::DEFAULT_MODE.to_string()
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("haul")
}

fn default_queue_file() -> PathBuf {
    default_data_dir().join("queue.json")
}

fn default_env_prefix() -> String {
    "HAUL".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_transfers: default_max_transfers(),
            max_retries: default_max_retries(),
            backoff_secs: default_backoff_secs(),
            auto_remove_finished: false,
            persistent_queue: false,
            compress: true,
            compat_modes: default_compat_modes(),
            default_compat_mode: default_compat_mode(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            queue_file: default_queue_file(),
            local_data_dir: default_data_dir(),
        }
    }
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            log_completions: true,
            completion_command: None,
            env_prefix: default_env_prefix(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("haul/config.toml")
    }

    /// Load config from default path, or create default if it doesn't exist
    ///
    /// # Errors
    ///
    /// Returns an error if reading or creating the config fails.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load(&path)
        } else {
            let config = Self::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    /// Known compatibility modes
    #[must_use]
    pub fn compat_modes(&self) -> CompatModes {
        CompatModes::new(
            self.queue.compat_modes.clone(),
            self.queue.default_compat_mode.clone(),
        )
    }

    /// Scheduler configuration derived from this file
    #[must_use]
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_transfers: self.queue.max_transfers,
            max_retries: self.queue.max_retries,
            backoff_interval: Duration::from_secs(self.queue.backoff_secs),
            auto_remove_finished: self.queue.auto_remove_finished,
            persistent_queue: self.queue.persistent_queue,
            compat_modes: self.compat_modes(),
            log_completions: self.hooks.log_completions,
            completion_command: self.hooks.completion_command.clone(),
            env_prefix: self.hooks.env_prefix.clone(),
            local_data_dir: self.storage.local_data_dir.clone(),
            ..SchedulerConfig::default()
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        if self.queue.max_transfers == 0 || self.queue.max_transfers > 100 {
            anyhow::bail!("Max transfers must be between 1 and 100");
        }

        if self.storage.queue_file.as_os_str().is_empty() {
            anyhow::bail!("Queue file path is empty");
        }

        self.scheduler_config().validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.queue.max_transfers, 3);
        assert_eq!(config.queue.backoff_secs, 300);
        assert!(config.hooks.log_completions);
        assert!(config.storage.queue_file.ends_with("haul/queue.json"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());

        config.logging.level = "debug".to_string();
        config.queue.max_transfers = 0;
        assert!(config.validate().is_err());

        config.queue.max_transfers = 2;
        config.hooks.env_prefix = "bad prefix".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [queue]
            max_transfers = 5

            [hooks]
            completion_command = "notify-send uploaded"
            "#,
        )
        .unwrap();
        assert_eq!(config.queue.max_transfers, 5);
        assert_eq!(config.queue.max_retries, 3);
        assert_eq!(
            config.hooks.completion_command.as_deref(),
            Some("notify-send uploaded")
        );
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_scheduler_config_conversion() {
        let mut config = Config::default();
        config.queue.backoff_secs = 10;
        config.queue.default_compat_mode = "COMPAT_1468".to_string();
        let sched = config.scheduler_config();
        assert_eq!(sched.backoff_interval, Duration::from_secs(10));
        assert_eq!(sched.compat_modes.default_mode().as_str(), "COMPAT_1468");
        assert_eq!(sched.max_key_derivations, 1);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested/config.toml");
        let mut config = Config::default();
        config.queue.persistent_queue = true;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert!(loaded.queue.persistent_queue);
        assert_eq!(loaded.hooks.env_prefix, "HAUL");
    }
}
