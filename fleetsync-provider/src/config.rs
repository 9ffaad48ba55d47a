//! Provider configuration.
//!
//! Loaded from a TOML or JSON file (picked by extension), then overridden by
//! `FLEETSYNC_*` environment variables. Every field has a default, so an
//! empty file is a valid configuration.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fleetsync_core::{CallGate, RetryPolicy, UnknownDeleteVerdict};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse TOML config {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to parse JSON config {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("unsupported config format {0} (expected .toml or .json)")]
    UnsupportedFormat(PathBuf),

    #[error("invalid value {value:?} for {var}: {reason}")]
    InvalidEnv {
        var: String,
        value: String,
        reason: String,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Lifecycle operation a timeout applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Read,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Read => "read",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const DEFAULT_TIMEOUT_SECS: u64 = 180;

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

/// Per-operation timeouts in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_timeout")]
    pub create_timeout_secs: u64,
    #[serde(default = "default_timeout")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_timeout")]
    pub update_timeout_secs: u64,
    #[serde(default = "default_timeout")]
    pub delete_timeout_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            create_timeout_secs: DEFAULT_TIMEOUT_SECS,
            read_timeout_secs: DEFAULT_TIMEOUT_SECS,
            update_timeout_secs: DEFAULT_TIMEOUT_SECS,
            delete_timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

fn default_max_attempts() -> u32 {
    fleetsync_core::DEFAULT_MAX_ATTEMPTS
}

fn default_interval_ms() -> u64 {
    2_000
}

/// Retry defaults applied to every operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the initial attempt, before the deadline cap.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            interval_ms: default_interval_ms(),
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Hold one shared lock around every remote call.
    #[serde(default = "default_true")]
    pub serialize_calls: bool,
    #[serde(default)]
    pub unknown_delete_errors: UnknownDeleteVerdict,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            timeouts: TimeoutConfig::default(),
            retry: RetryConfig::default(),
            serialize_calls: true,
            unknown_delete_errors: UnknownDeleteVerdict::default(),
        }
    }
}

impl ProviderConfig {
    /// Load from `path`, apply environment overrides and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut config: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&content).map_err(|source| ConfigError::Toml {
                path: path.to_path_buf(),
                source,
            })?,
            Some("json") => serde_json::from_str(&content).map_err(|source| ConfigError::Json {
                path: path.to_path_buf(),
                source,
            })?,
            _ => return Err(ConfigError::UnsupportedFormat(path.to_path_buf())),
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, for runs without a config file.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|var| std::env::var(var).ok())
    }

    /// Apply `FLEETSYNC_*` overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let timeouts = [
            ("FLEETSYNC_CREATE_TIMEOUT", &mut self.timeouts.create_timeout_secs),
            ("FLEETSYNC_READ_TIMEOUT", &mut self.timeouts.read_timeout_secs),
            ("FLEETSYNC_UPDATE_TIMEOUT", &mut self.timeouts.update_timeout_secs),
            ("FLEETSYNC_DELETE_TIMEOUT", &mut self.timeouts.delete_timeout_secs),
        ];
        for (var, slot) in timeouts {
            if let Some(value) = lookup(var) {
                *slot = parse_env(var, &value)?;
            }
        }

        if let Some(value) = lookup("FLEETSYNC_RETRY_MAX_ATTEMPTS") {
            self.retry.max_attempts = parse_env("FLEETSYNC_RETRY_MAX_ATTEMPTS", &value)?;
        }
        if let Some(value) = lookup("FLEETSYNC_RETRY_INTERVAL_MS") {
            self.retry.interval_ms = parse_env("FLEETSYNC_RETRY_INTERVAL_MS", &value)?;
        }
        if let Some(value) = lookup("FLEETSYNC_SERIALIZE_CALLS") {
            self.serialize_calls = parse_bool("FLEETSYNC_SERIALIZE_CALLS", &value)?;
        }
        if let Some(value) = lookup("FLEETSYNC_UNKNOWN_DELETE_ERRORS") {
            self.unknown_delete_errors = match value.trim().to_ascii_lowercase().as_str() {
                "retry" => UnknownDeleteVerdict::Retry,
                "fail" => UnknownDeleteVerdict::Fail,
                _ => {
                    return Err(ConfigError::InvalidEnv {
                        var: "FLEETSYNC_UNKNOWN_DELETE_ERRORS".into(),
                        value,
                        reason: "expected retry or fail".into(),
                    });
                }
            };
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.retry.interval_ms == 0 {
            return Err(ConfigError::Invalid("retry.interval_ms must be greater than zero".into()));
        }
        let t = &self.timeouts;
        for (name, secs) in [
            ("create", t.create_timeout_secs),
            ("read", t.read_timeout_secs),
            ("update", t.update_timeout_secs),
            ("delete", t.delete_timeout_secs),
        ] {
            if secs == 0 {
                return Err(ConfigError::Invalid(format!(
                    "timeouts.{name}_timeout_secs must be greater than zero"
                )));
            }
        }
        Ok(())
    }

    pub fn timeout(&self, op: Operation) -> Duration {
        let secs = match op {
            Operation::Create => self.timeouts.create_timeout_secs,
            Operation::Read => self.timeouts.read_timeout_secs,
            Operation::Update => self.timeouts.update_timeout_secs,
            Operation::Delete => self.timeouts.delete_timeout_secs,
        };
        Duration::from_secs(secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.retry.interval_ms)
    }

    /// Base retry policy for `op` on `resource_type`.
    pub fn retry_policy(&self, op: Operation, resource_type: &str) -> RetryPolicy {
        RetryPolicy::new(op.as_str(), resource_type)
            .with_max_attempts(self.retry.max_attempts)
            .with_interval(self.interval())
            .with_unknown_delete(self.unknown_delete_errors)
    }

    pub fn call_gate(&self) -> CallGate {
        if self.serialize_calls {
            CallGate::serialized()
        } else {
            CallGate::open()
        }
    }
}

fn parse_env<T>(var: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidEnv {
        var: var.to_string(),
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn parse_bool(var: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            var: var.to_string(),
            value: value.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}
