//! Configuration management
//!
//! This module handles loading, validation, and management of the Anvil configuration.
//! Configuration is read from an optional TOML file (`~/.anvil/config.toml` by default)
//! and then overlaid with environment variables, which always win.
//!
//! # Configuration Sections
//!
//! - **core**: Data directory (status database, session clones), log level
//! - **repo**: Target repository URL, branch prefix, git credentials
//! - **llm**: Text-generation provider endpoint and model
//! - **worker**: Task queue name and capacity
//! - **retry**: Retry/timeout policy for task invocations
//!
//! # Environment Keys
//!
//! | Key | Field |
//! |---|---|
//! | `ANVIL_REPO_URL` | `repo.url` |
//! | `ANVIL_BRANCH_PREFIX` | `repo.branch_prefix` |
//! | `ANVIL_TASK_QUEUE` | `worker.task_queue` |
//! | `ANVIL_DATA_DIR` | `core.data_dir` |
//! | `ANVIL_LOG_LEVEL` | `core.log_level` |
//! | `GIT_USERNAME` / `GIT_PASSWORD` | push credentials |
//! | `OPENAI_API_KEY` | text-generation credential (required to run) |
//! | `OPENAI_BASE_URL` / `OPENAI_MODEL` | provider endpoint and model |
//!
//! Secrets are never read from or written to the TOML file.
//!
//! # Examples
//!
//! ```no_run
//! use anvil_engine::config::Config;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load(None)?;
//! println!("Task queue: {}", config.worker.task_queue);
//! # Ok(())
//! # }
//! ```

use crate::secrets::SecretString;
use crate::vcs::Credentials;
use regex::Regex;
use sdk::errors::PipelineError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Default task queue name
pub const DEFAULT_TASK_QUEUE: &str = "anvil-code-gen-task-queue";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Core engine settings
    #[serde(default)]
    pub core: CoreConfig,

    /// Target repository settings
    #[serde(default)]
    pub repo: RepoConfig,

    /// Text-generation provider configuration
    #[serde(default)]
    pub llm: LLMConfig,

    /// Worker / task queue settings
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Retry policies for task invocations
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Core engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Data directory path (supports ~ expansion)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Target repository configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RepoConfig {
    /// Repository to clone for each run
    #[serde(default)]
    pub url: Option<String>,

    /// Prefix for generated branch names
    #[serde(default)]
    pub branch_prefix: String,

    /// Username for clone/push over HTTPS
    #[serde(default)]
    pub git_username: Option<String>,

    // Note: password / token only comes from the environment
    #[serde(skip)]
    pub git_password: Option<SecretString>,
}

/// Text-generation provider configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LLMConfig {
    /// OpenAI-compatible provider settings
    #[serde(default)]
    pub openai: OpenAIConfig,

    // Note: API key only comes from the environment
    #[serde(skip)]
    pub api_key: Option<SecretString>,
}

/// OpenAI provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAIConfig {
    /// Base URL for OpenAI API
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,

    /// Model used for planning and code generation
    #[serde(default = "default_openai_model")]
    pub model: String,

    /// Cheaper model used for relevance filtering
    #[serde(default = "default_openai_fast_model")]
    pub fast_model: String,
}

/// Worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Name of the task queue runs are dispatched on
    #[serde(default = "default_task_queue")]
    pub task_queue: String,

    /// Maximum number of queued, not yet started runs
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

/// Retry policies for the two classes of task invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Capability calls: text generation and version control
    #[serde(default = "RetrySettings::activity")]
    pub activity: RetrySettings,

    /// Status-store writes
    #[serde(default = "RetrySettings::local")]
    pub local: RetrySettings,
}

/// One retry policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    pub initial_interval_ms: u64,
    pub backoff_coefficient: f64,
    pub maximum_interval_ms: u64,
    pub maximum_attempts: u32,
    pub timeout_secs: u64,
}

impl RetrySettings {
    pub fn activity() -> Self {
        Self {
            initial_interval_ms: 1_000,
            backoff_coefficient: 2.0,
            maximum_interval_ms: 60_000,
            maximum_attempts: 3,
            timeout_secs: 180,
        }
    }

    pub fn local() -> Self {
        Self {
            initial_interval_ms: 1_000,
            backoff_coefficient: 2.0,
            maximum_interval_ms: 60_000,
            maximum_attempts: 5,
            timeout_secs: 15,
        }
    }
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("~/.anvil")
}

fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_openai_model() -> String {
    "gpt-4o".to_string()
}

fn default_openai_fast_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_task_queue() -> String {
    DEFAULT_TASK_QUEUE.to_string()
}

fn default_queue_capacity() -> usize {
    32
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: default_log_level(),
        }
    }
}

impl Default for OpenAIConfig {
    fn default() -> Self {
        Self {
            base_url: default_openai_base_url(),
            model: default_openai_model(),
            fast_model: default_openai_fast_model(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            task_queue: default_task_queue(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            activity: RetrySettings::activity(),
            local: RetrySettings::local(),
        }
    }
}

impl Config {
    /// Load configuration from `path` (or the default location), overlay the
    /// process environment, and validate.
    ///
    /// A missing file is not an error: defaults plus environment are used.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The file exists but cannot be read or parsed
    /// - Validation fails (invalid log level, invalid branch prefix)
    pub fn load(path: Option<&Path>) -> Result<Self, PipelineError> {
        let path = match path {
            Some(p) => Some(p.to_path_buf()),
            None => Self::default_config_path(),
        };

        let mut config = match path {
            Some(p) if p.exists() => Self::parse_file(&p)?,
            _ => Self::default(),
        };

        config.apply_env(|key| std::env::var(key).ok());
        config.validate_and_process()?;
        Ok(config)
    }

    /// Load configuration from a specific path without consulting the environment
    pub fn load_from_path(path: &Path) -> Result<Self, PipelineError> {
        let mut config = Self::parse_file(path)?;
        config.validate_and_process()?;
        Ok(config)
    }

    fn parse_file(path: &Path) -> Result<Self, PipelineError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| PipelineError::Config(format!("Failed to read config file: {}", e)))?;

        toml::from_str(&contents)
            .map_err(|e| PipelineError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Get the default configuration file path (~/.anvil/config.toml)
    fn default_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".anvil").join("config.toml"))
    }

    /// Overlay environment-style keys. Empty values are treated as unset.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = get("ANVIL_REPO_URL") {
            self.repo.url = Some(url);
        }
        if let Some(prefix) = lookup("ANVIL_BRANCH_PREFIX") {
            self.repo.branch_prefix = prefix.trim().to_string();
        }
        if let Some(queue) = get("ANVIL_TASK_QUEUE") {
            self.worker.task_queue = queue;
        }
        if let Some(dir) = get("ANVIL_DATA_DIR") {
            self.core.data_dir = PathBuf::from(dir);
        }
        if let Some(level) = get("ANVIL_LOG_LEVEL") {
            self.core.log_level = level.to_lowercase();
        }
        if let Some(user) = get("GIT_USERNAME") {
            self.repo.git_username = Some(user);
        }
        if let Some(password) = get("GIT_PASSWORD") {
            self.repo.git_password = Some(SecretString::new(password));
        }
        if let Some(key) = get("OPENAI_API_KEY") {
            self.llm.api_key = Some(SecretString::new(key));
        }
        if let Some(base_url) = get("OPENAI_BASE_URL") {
            self.llm.openai.base_url = base_url;
        }
        if let Some(model) = get("OPENAI_MODEL") {
            self.llm.openai.model = model;
        }
    }

    /// Text-generation credential; its absence is fatal for anything that runs a pipeline.
    pub fn require_api_key(&self) -> Result<&SecretString, PipelineError> {
        self.llm
            .api_key
            .as_ref()
            .ok_or_else(|| PipelineError::MissingCredential("OPENAI_API_KEY is not set".into()))
    }

    /// Git credentials, present only when both username and secret are configured.
    pub fn git_credentials(&self) -> Option<Credentials> {
        match (&self.repo.git_username, &self.repo.git_password) {
            (Some(user), Some(secret)) => Some(Credentials::new(user.clone(), secret.clone())),
            _ => None,
        }
    }

    /// Path of the sqlite status database
    pub fn database_path(&self) -> PathBuf {
        self.core.data_dir.join("anvil.db")
    }

    /// Root directory for per-session repository clones
    pub fn sessions_dir(&self) -> PathBuf {
        self.core.data_dir.join("sessions")
    }

    /// Validate and process configuration
    ///
    /// This method:
    /// - Validates the log level
    /// - Validates the branch prefix as a git ref fragment
    /// - Expands ~ in the data directory
    fn validate_and_process(&mut self) -> Result<(), PipelineError> {
        // Validate log level
        let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_log_levels.contains(&self.core.log_level.as_str()) {
            return Err(PipelineError::Config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.core.log_level,
                valid_log_levels.join(", ")
            )));
        }

        if !is_valid_ref_fragment(&self.repo.branch_prefix) {
            return Err(PipelineError::Config(format!(
                "Invalid branch prefix '{}'",
                self.repo.branch_prefix
            )));
        }

        if self.worker.task_queue.trim().is_empty() {
            return Err(PipelineError::Config("task_queue must not be empty".into()));
        }

        if self.retry.activity.maximum_attempts == 0 || self.retry.local.maximum_attempts == 0 {
            return Err(PipelineError::Config(
                "maximum_attempts must be at least 1".into(),
            ));
        }

        self.core.data_dir = expand_path(&self.core.data_dir)?;

        Ok(())
    }
}

/// True when `fragment` can prefix a git branch name.
///
/// Empty is valid (no prefix).
pub fn is_valid_ref_fragment(fragment: &str) -> bool {
    if fragment.is_empty() {
        return true;
    }
    let Ok(allowed) = Regex::new(r"^[A-Za-z0-9._/-]+$") else {
        return false;
    };
    allowed.is_match(fragment)
        && !fragment.starts_with('/')
        && !fragment.starts_with('-')
        && !fragment.contains("..")
        && !fragment.contains("//")
        && !fragment.ends_with(".lock")
}

/// Expand ~ in path to user's home directory
fn expand_path(path: &Path) -> Result<PathBuf, PipelineError> {
    let path_str = path
        .to_str()
        .ok_or_else(|| PipelineError::Config("Invalid UTF-8 in path".to_string()))?;

    if let Some(rest) = path_str.strip_prefix("~/") {
        let home = dirs::home_dir().ok_or_else(|| {
            PipelineError::Config("Could not determine home directory".to_string())
        })?;

        Ok(home.join(rest))
    } else if path_str == "~" {
        dirs::home_dir()
            .ok_or_else(|| PipelineError::Config("Could not determine home directory".to_string()))
    } else {
        Ok(path.to_path_buf())
    }
}
