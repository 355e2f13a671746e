//! Startup configuration.
//!
//! Loaded once at process start from a TOML file. Invalid required settings
//! are fatal: nothing else in the core may terminate the process.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tokio::fs;

use crate::provider::{ApprovalPolicy, SandboxMode};

/// Default debounce interval between outbound message edits.
fn default_rate_limit_ms() -> u64 {
    500
}

/// Default session retention window.
fn default_retention_hours() -> u64 {
    72
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".coderelay")
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

// ============================================================================
// Config (root)
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Allow every user identity. When false, `allowed_users` is the gate.
    #[serde(default)]
    pub allow_all_users: bool,

    /// User identities allowed to drive sessions.
    #[serde(default)]
    pub allowed_users: Vec<String>,

    /// Root directories sessions may be created under. Required, absolute.
    pub allowed_roots: Vec<PathBuf>,

    /// Directory used when a session request does not name one.
    #[serde(default)]
    pub default_directory: Option<PathBuf>,

    /// Debounce interval for incremental message edits, in milliseconds.
    #[serde(default = "default_rate_limit_ms")]
    pub rate_limit_ms: u64,

    /// Sessions idle longer than this are expired.
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,

    /// Application data directory for snapshots.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub providers: ProviderDefaults,
}

/// Per-provider policy defaults applied to new sessions.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderDefaults {
    #[serde(default)]
    pub claude: ClaudeDefaults,
    #[serde(default)]
    pub codex: CodexDefaults,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClaudeDefaults {
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CodexDefaults {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub sandbox_mode: Option<SandboxMode>,
    #[serde(default)]
    pub approval_policy: Option<ApprovalPolicy>,
    #[serde(default)]
    pub network_access: Option<bool>,
}

impl Config {
    /// Load and validate the config file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path.as_ref()).await?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse from a string. Used by tests and embedded callers.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Check required settings. Errors here are fatal at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.allowed_roots.is_empty() {
            return Err(ConfigError::Invalid(
                "allowed_roots must list at least one directory".to_string(),
            ));
        }
        for root in &self.allowed_roots {
            if !root.is_absolute() {
                return Err(ConfigError::Invalid(format!(
                    "allowed root is not absolute: {}",
                    root.display()
                )));
            }
        }
        if let Some(dir) = &self.default_directory
            && !self.directory_allowed(dir)
        {
            return Err(ConfigError::Invalid(format!(
                "default_directory is outside the allowed roots: {}",
                dir.display()
            )));
        }
        if self.rate_limit_ms == 0 {
            return Err(ConfigError::Invalid(
                "rate_limit_ms must be positive".to_string(),
            ));
        }
        if self.retention_hours == 0 {
            return Err(ConfigError::Invalid(
                "retention_hours must be positive".to_string(),
            ));
        }
        if !self.allow_all_users && self.allowed_users.is_empty() {
            return Err(ConfigError::Invalid(
                "allowed_users is empty and allow_all_users is false".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether a user identity may drive sessions.
    pub fn user_allowed(&self, user_id: &str) -> bool {
        self.allow_all_users || self.allowed_users.iter().any(|u| u == user_id)
    }

    /// Whether a directory lies under one of the allowed roots.
    pub fn directory_allowed(&self, dir: &Path) -> bool {
        self.allowed_roots.iter().any(|root| dir.starts_with(root))
    }
}
