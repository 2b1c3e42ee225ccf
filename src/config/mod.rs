//! File-based configuration for metaloop
//!
//! The kill switch and feature flags live in the database; this file only
//! describes where things are and how long things may take.

use crate::llm::LlmConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application configuration, loaded from TOML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// SQLite database file (defaults to the platform data directory)
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    /// JSON-lines usage event log read by self-audit and gap analysis
    #[serde(default)]
    pub usage_log: Option<PathBuf>,

    /// Root of the source tree the code review and refactor actions inspect
    #[serde(default = "default_project_root")]
    pub project_root: PathBuf,

    /// Files or directories (relative to `project_root`) to review
    #[serde(default = "default_review_paths")]
    pub review_paths: Vec<String>,

    /// File extensions considered source code
    #[serde(default = "default_review_extensions")]
    pub review_extensions: Vec<String>,

    /// Directory names never descended into
    #[serde(default = "default_ignore_dirs")]
    pub ignore_dirs: Vec<String>,

    /// Upper bound on files reviewed per run
    #[serde(default = "default_max_review_files")]
    pub max_review_files: usize,

    /// Files larger than this are skipped by code review
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,

    /// Timing and threshold settings
    #[serde(default)]
    pub schedule: ScheduleConfig,

    /// LLM endpoint configuration
    #[serde(default)]
    pub llm: LlmSettings,
}

/// Time bounds and thresholds for orchestration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Lookback window for usage statistics, in hours
    #[serde(default = "default_window_hours")]
    pub window_hours: u32,

    /// Upper bound for one whole action, in seconds
    #[serde(default = "default_action_timeout_secs")]
    pub action_timeout_secs: u64,

    /// Upper bound for one text-generation call, in seconds
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,

    /// A run lock older than this is considered abandoned
    #[serde(default = "default_lock_stale_secs")]
    pub lock_stale_secs: u64,

    /// Audit error count above which gap analysis raises an error-triage gap
    #[serde(default = "default_error_gap_threshold")]
    pub error_gap_threshold: u32,
}

/// LLM section of the config file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSettings {
    /// API endpoint URL (e.g., http://localhost:11434 for Ollama)
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Model name to use
    #[serde(default = "default_model")]
    pub model: String,

    /// API key (falls back to METALOOP_LLM_API_KEY)
    #[serde(default)]
    pub api_key: Option<String>,

    /// Maximum tokens for response
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    /// Temperature for generation
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_project_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_review_paths() -> Vec<String> {
    vec!["src".to_string()]
}

fn default_review_extensions() -> Vec<String> {
    ["rs", "py", "ts", "js"].iter().map(|s| s.to_string()).collect()
}

fn default_ignore_dirs() -> Vec<String> {
    ["target", "node_modules", ".git", "dist"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_max_review_files() -> usize {
    10
}

fn default_max_file_bytes() -> u64 {
    64 * 1024
}

fn default_window_hours() -> u32 {
    24
}

fn default_action_timeout_secs() -> u64 {
    600
}

fn default_call_timeout_secs() -> u64 {
    120
}

fn default_lock_stale_secs() -> u64 {
    3600
}

fn default_error_gap_threshold() -> u32 {
    10
}

fn default_endpoint() -> String {
    "http://localhost:11434".to_string()
}

fn default_model() -> String {
    "llama3".to_string()
}

fn default_max_tokens() -> usize {
    2048
}

fn default_temperature() -> f32 {
    0.3
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            window_hours: default_window_hours(),
            action_timeout_secs: default_action_timeout_secs(),
            call_timeout_secs: default_call_timeout_secs(),
            lock_stale_secs: default_lock_stale_secs(),
            error_gap_threshold: default_error_gap_threshold(),
        }
    }
}

impl ScheduleConfig {
    pub fn action_timeout(&self) -> Duration {
        Duration::from_secs(self.action_timeout_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn window(&self) -> chrono::Duration {
        chrono::Duration::hours(self.window_hours as i64)
    }

    /// Longest a run can hold the lock: every action at its full timeout
    pub fn max_run_secs(&self) -> u64 {
        self.action_timeout_secs
            .saturating_mul(crate::records::Feature::ALL.len() as u64)
    }

    /// A live run must never look abandoned to a second run
    pub fn validate(&self) -> Result<()> {
        if self.max_run_secs() >= self.lock_stale_secs {
            anyhow::bail!(
                "schedule.lock_stale_secs ({}) must exceed {} actions x schedule.action_timeout_secs ({} s)",
                self.lock_stale_secs,
                crate::records::Feature::ALL.len(),
                self.max_run_secs()
            );
        }
        Ok(())
    }
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            model: default_model(),
            api_key: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        }
    }
}

impl LlmSettings {
    /// Client configuration, with the per-call timeout applied
    pub fn client_config(&self, timeout: Duration) -> LlmConfig {
        LlmConfig {
            endpoint: self.endpoint.trim_end_matches('/').to_string(),
            model: self.model.clone(),
            api_key: self
                .api_key
                .clone()
                .or_else(|| std::env::var("METALOOP_LLM_API_KEY").ok()),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            timeout,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            usage_log: None,
            project_root: default_project_root(),
            review_paths: default_review_paths(),
            review_extensions: default_review_extensions(),
            ignore_dirs: default_ignore_dirs(),
            max_review_files: default_max_review_files(),
            max_file_bytes: default_max_file_bytes(),
            schedule: ScheduleConfig::default(),
            llm: LlmSettings::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from `path` or return defaults if it does not exist
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            let config: AppConfig = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?;
            config
                .schedule
                .validate()
                .with_context(|| format!("Invalid config file: {:?}", path))?;
            Ok(config)
        } else {
            tracing::debug!("No config file at {:?}; using defaults", path);
            Ok(Self::default())
        }
    }

    /// Save configuration to `path`
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }

    /// Database path, preferring an explicit override
    pub fn resolve_database_path(&self, override_path: Option<&Path>) -> PathBuf {
        override_path
            .map(Path::to_path_buf)
            .or_else(|| self.database_path.clone())
            .unwrap_or_else(default_database_path)
    }

    /// Whether a file extension is one the code review looks at
    pub fn is_reviewable(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|ext| self.review_extensions.iter().any(|allowed| allowed == ext))
            .unwrap_or(false)
    }
}

/// Default location of the config file
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(crate::APP_NAME)
        .join("config.toml")
}

/// Default location of the database
pub fn default_database_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(crate::APP_NAME)
        .join("metaloop.db")
}
