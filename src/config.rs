//! Configuration management for taskmesh.
//!
//! Configuration is read from environment variables:
//! - `HOST` - Optional. Server host. Defaults to `127.0.0.1`.
//! - `PORT` - Optional. Server port. Defaults to `3000`.
//! - `WORKSPACE_PATH` - Optional. Workspace directory; relative file claims are
//!   checked against it and command workers run in it. Defaults to current directory.
//! - `MAX_CONCURRENT_AGENTS` - Optional. Global in-flight task ceiling. Defaults to `3`.
//! - `TASK_TIMEOUT_SECS` - Optional. Per-attempt timeout. Defaults to `120`.
//! - `TASK_MAX_RETRIES` - Optional. Retries after a timeout. Defaults to `1`.
//! - `VALIDATION_MIN_EVIDENCE` - Optional. Evidence items needed for `Accepted`. Defaults to `1`.
//! - `CANCEL_GRACE_MS` - Optional. How long cancelled attempts get to stop. Defaults to `2000`.
//! - `FEEDBACK_STORE` - Optional. `memory`, `file` or `sqlite`. Defaults to `sqlite`.
//! - `FEEDBACK_DIR` - Optional. Feedback store directory. Defaults to `<workspace>/.taskmesh`.
//! - `FEEDBACK_FSYNC` - Optional. Sync the feedback file after each record. Defaults to `true`.
//! - `WORKERS_FILE` - Optional. Worker registry YAML. Defaults to `<workspace>/workers.yaml`.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::feedback::FeedbackStoreKind;
use crate::util::{env_var_bool, env_var_parse};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

impl From<(String, String)> for ConfigError {
    fn from((name, message): (String, String)) -> Self {
        ConfigError::InvalidValue(name, message)
    }
}

/// Pipeline tuning shared by the dispatcher, runner and validator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Ceiling on Dispatched + Running tasks across all requests
    pub max_concurrent_agents: usize,

    /// Per-attempt execution timeout
    pub task_timeout: Duration,

    /// Retries allowed after a timed-out attempt
    pub max_retries: u32,

    /// Evidence items an output needs to be accepted
    pub min_evidence: usize,

    /// Time cancelled attempts get to wind down before they are aborted
    pub cancel_grace: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_agents: 3,
            task_timeout: Duration::from_secs(120),
            max_retries: 1,
            min_evidence: 1,
            cancel_grace: Duration::from_millis(2000),
        }
    }
}

/// Feedback store configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub kind: FeedbackStoreKind,
    pub dir: PathBuf,
    pub fsync: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub workspace_path: PathBuf,
    pub workers_file: PathBuf,
    pub pipeline: PipelineConfig,
    pub store: StoreConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    /// `ConfigError::InvalidValue` for any variable that is set but unparseable.
    pub fn from_env() -> Result<Self, ConfigError> {
        let workspace_path = match std::env::var("WORKSPACE_PATH") {
            Ok(path) => PathBuf::from(path),
            Err(_) => std::env::current_dir()
                .map_err(|_| ConfigError::MissingEnvVar("WORKSPACE_PATH".to_string()))?,
        };

        let host = std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env_var_parse("PORT", 3000u16)?;

        let max_concurrent_agents: usize = env_var_parse("MAX_CONCURRENT_AGENTS", 3)?;
        if max_concurrent_agents == 0 {
            return Err(ConfigError::InvalidValue(
                "MAX_CONCURRENT_AGENTS".to_string(),
                "must be at least 1".to_string(),
            ));
        }
        let timeout_secs: u64 = env_var_parse("TASK_TIMEOUT_SECS", 120)?;
        if timeout_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "TASK_TIMEOUT_SECS".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        let pipeline = PipelineConfig {
            max_concurrent_agents,
            task_timeout: Duration::from_secs(timeout_secs),
            max_retries: env_var_parse("TASK_MAX_RETRIES", 1)?,
            min_evidence: env_var_parse("VALIDATION_MIN_EVIDENCE", 1)?,
            cancel_grace: Duration::from_millis(env_var_parse("CANCEL_GRACE_MS", 2000)?),
        };

        let kind = match std::env::var("FEEDBACK_STORE") {
            Ok(raw) => raw
                .parse()
                .map_err(|e| ConfigError::InvalidValue("FEEDBACK_STORE".to_string(), e))?,
            Err(_) => FeedbackStoreKind::default(),
        };
        let store = StoreConfig {
            kind,
            dir: std::env::var("FEEDBACK_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| workspace_path.join(".taskmesh")),
            fsync: env_var_bool("FEEDBACK_FSYNC", true),
        };

        let workers_file = std::env::var("WORKERS_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| workspace_path.join("workers.yaml"));

        Ok(Self {
            host,
            port,
            workspace_path,
            workers_file,
            pipeline,
            store,
        })
    }

    /// Create a config with defaults rooted at `workspace_path` (useful for testing).
    pub fn new(workspace_path: PathBuf) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            workers_file: workspace_path.join("workers.yaml"),
            pipeline: PipelineConfig::default(),
            store: StoreConfig {
                kind: FeedbackStoreKind::Memory,
                dir: workspace_path.join(".taskmesh"),
                fsync: false,
            },
            workspace_path,
        }
    }
}
