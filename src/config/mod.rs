//! Engine configuration
//!
//! Loaded from `~/.config/jobstage/config.toml` unless a path is given.
//! Every field has a default, so an empty file is a valid configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Poll cadence for submitted jobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PollPolicy {
    /// Delay before the first poll and lower bound between polls
    pub min_interval_ms: u64,
    /// Upper bound the backoff grows to
    pub max_interval_ms: u64,
    /// Growth factor applied after each poll
    pub multiplier: f64,
    /// Consecutive Unknown results tolerated before the job is declared lost
    pub max_unknown_polls: u32,
    /// Consecutive failed poll attempts tolerated
    pub max_poll_errors: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            min_interval_ms: 2000,
            max_interval_ms: 60_000,
            multiplier: 1.5,
            max_unknown_polls: 5,
            max_poll_errors: 5,
        }
    }
}

/// Upper bound on `polling.multiplier`
pub const MAX_MULTIPLIER: f64 = 10.0;

impl PollPolicy {
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_interval_ms == 0 {
            return Err(ConfigError::out_of_bounds(
                "polling.min_interval_ms",
                "must be greater than 0",
            ));
        }
        if self.max_interval_ms < self.min_interval_ms {
            return Err(ConfigError::out_of_bounds(
                "polling.max_interval_ms",
                format!("must be at least min_interval_ms ({})", self.min_interval_ms),
            ));
        }
        if !(1.0..=MAX_MULTIPLIER).contains(&self.multiplier) {
            return Err(ConfigError::out_of_bounds(
                "polling.multiplier",
                format!("must be in [1.0, {}], got {}", MAX_MULTIPLIER, self.multiplier),
            ));
        }
        if self.max_unknown_polls == 0 {
            return Err(ConfigError::out_of_bounds(
                "polling.max_unknown_polls",
                "must be at least 1",
            ));
        }
        if self.max_poll_errors == 0 {
            return Err(ConfigError::out_of_bounds(
                "polling.max_poll_errors",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Retries for a single failing transport operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 2000,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt `attempt` (1-based), doubling up to the max
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(
            self.initial_delay_ms
                .saturating_mul(factor)
                .min(self.max_delay_ms),
        )
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 || self.max_attempts > 20 {
            return Err(ConfigError::out_of_bounds(
                "retry.max_attempts",
                format!("must be in [1, 20], got {}", self.max_attempts),
            ));
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(ConfigError::out_of_bounds(
                "retry.max_delay_ms",
                format!("must be at least initial_delay_ms ({})", self.initial_delay_ms),
            ));
        }
        Ok(())
    }
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Job records and retrieved files
    pub state_dir: PathBuf,
    /// Parent for staging areas; the system temp dir when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub staging_dir: Option<PathBuf>,
    pub polling: PollPolicy,
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            staging_dir: None,
            polling: PollPolicy::default(),
            retry: RetryPolicy::default(),
        }
    }
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

fn default_state_dir() -> PathBuf {
    home_dir()
        .map(|home| home.join(".local/state/jobstage"))
        .unwrap_or_else(|| PathBuf::from(".jobstage"))
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("{field} {reason}")]
    OutOfBounds { field: &'static str, reason: String },
}

impl ConfigError {
    fn out_of_bounds(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::OutOfBounds {
            field,
            reason: reason.into(),
        }
    }
}

impl EngineConfig {
    /// `~/.config/jobstage`, or `.jobstage` when HOME is unset
    pub fn config_dir() -> PathBuf {
        home_dir()
            .map(|home| home.join(".config/jobstage"))
            .unwrap_or_else(|| PathBuf::from(".jobstage"))
    }

    pub fn default_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Load from `path`; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<string>"),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.polling.validate()?;
        self.retry.validate()
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}
