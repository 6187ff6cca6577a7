//! Scheduler configuration

use crate::error::{QueueError, Result};
use crate::item::CompatModes;
use std::path::PathBuf;
use std::time::Duration;

/// Scheduler and completion-handling configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Interval between scheduler ticks
    pub tick_interval: Duration,

    /// Minimum interval between two integrity sweeps
    pub sweep_interval: Duration,

    /// Maximum number of concurrent transfers started by the scheduler
    pub max_transfers: usize,

    /// Maximum number of concurrent key derivations
    pub max_key_derivations: usize,

    /// Minimum wait after a stopped attempt before the item is selected again
    pub backoff_interval: Duration,

    /// Retryable failures tolerated before an item fails permanently
    pub max_retries: u32,

    /// Remove finished items from the collection after each completion
    pub auto_remove_finished: bool,

    /// Append completions to the monthly log file
    pub log_completions: bool,

    /// Command line run after each completion
    pub completion_command: Option<String>,

    /// Prefix of the environment variables passed to the completion command
    pub env_prefix: String,

    /// Directory holding the completion log files
    pub local_data_dir: PathBuf,

    /// An external persistent-queue manager starts transfers
    pub persistent_queue: bool,

    /// Known compatibility modes
    pub compat_modes: CompatModes,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            sweep_interval: Duration::from_secs(5 * 60),
            max_transfers: 3,
            max_key_derivations: 1,
            backoff_interval: Duration::from_secs(5 * 60),
            max_retries: 3,
            auto_remove_finished: false,
            log_completions: true,
            completion_command: None,
            env_prefix: "HAUL".to_string(),
            local_data_dir: PathBuf::from("localdata"),
            persistent_queue: false,
            compat_modes: CompatModes::default(),
        }
    }
}

impl SchedulerConfig {
    /// Check the configuration for values the scheduler cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.tick_interval.is_zero() {
            return Err(QueueError::invalid_config("tick_interval must be non-zero"));
        }
        if self.max_transfers == 0 {
            return Err(QueueError::invalid_config("max_transfers must be at least 1"));
        }
        if self.max_key_derivations == 0 {
            return Err(QueueError::invalid_config(
                "max_key_derivations must be at least 1",
            ));
        }
        if self.env_prefix.is_empty()
            || !self
                .env_prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(QueueError::invalid_config(
                "env_prefix must be non-empty ASCII alphanumerics or '_'",
            ));
        }
        if let Some(cmd) = &self.completion_command {
            if cmd.trim().is_empty() {
                return Err(QueueError::invalid_config("completion_command is empty"));
            }
        }
        Ok(())
    }

    /// Milliseconds of the backoff interval
    #[must_use]
    pub fn backoff_millis(&self) -> u64 {
        u64::try_from(self.backoff_interval.as_millis()).unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = SchedulerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_key_derivations, 1);
        assert_eq!(config.tick_interval, Duration::from_secs(1));
        assert_eq!(config.backoff_millis(), 300_000);
    }

    #[test]
    fn test_zero_slots_rejected() {
        let config = SchedulerConfig {
            max_transfers: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(QueueError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_bad_env_prefix_rejected() {
        let config = SchedulerConfig {
            env_prefix: "MY-PREFIX".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_blank_command_rejected() {
        let config = SchedulerConfig {
            completion_command: Some("   ".to_string()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
