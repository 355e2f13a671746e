//! Session model and registry.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::provider::{ApprovalPolicy, ProviderError, ProviderKind, SandboxMode};

pub mod registry;
pub mod snapshot;

pub use registry::{CreateSessionSpec, SessionRegistry};

// ============================================================================
// Mode
// ============================================================================

/// Behavioral policy overlay injected into the system prompt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    /// No added constraints.
    Auto,
    /// Plan-then-confirm workflow.
    Plan,
    /// Confirmation before destructive operations.
    #[default]
    Normal,
}

impl SessionMode {
    pub const ALL: [SessionMode; 3] = [SessionMode::Auto, SessionMode::Plan, SessionMode::Normal];

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionMode::Auto => "auto",
            SessionMode::Plan => "plan",
            SessionMode::Normal => "normal",
        }
    }

    /// The behavioral constraint injected for this mode, if any.
    pub fn constraint(&self) -> Option<&'static str> {
        match self {
            SessionMode::Auto => None,
            SessionMode::Plan => Some(
                "Before making any changes, present a concise plan and wait for the user \
                 to confirm it. Do not modify files or run state-changing commands until \
                 the plan is approved.",
            ),
            SessionMode::Normal => Some(
                "Ask for confirmation before destructive or hard-to-reverse operations: \
                 deleting files, rewriting history, dropping data, or touching anything \
                 outside the working directory.",
            ),
        }
    }
}

impl std::fmt::Display for SessionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SessionMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(SessionMode::Auto),
            "plan" => Ok(SessionMode::Plan),
            "normal" => Ok(SessionMode::Normal),
            _ => Err(()),
        }
    }
}

// ============================================================================
// Session
// ============================================================================

/// One conversation thread bound to a working directory and a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Stable slug, unique among live sessions.
    pub id: String,
    /// Front-end destination. `None` is a placeholder: the session is not
    /// yet addressable and must never be indexed or persisted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    pub directory: PathBuf,
    pub provider: ProviderKind,
    /// Opaque backend resume token. May reset mid-turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_mode: Option<SandboxMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_policy: Option<ApprovalPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_access: Option<bool>,
    #[serde(default)]
    pub mode: SessionMode,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_persona: Option<String>,
    /// Single-flight generation flag. Runtime-only.
    #[serde(skip)]
    pub is_generating: bool,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    #[serde(default)]
    pub message_count: u64,
    /// Monotonically increasing accumulated cost.
    #[serde(default)]
    pub total_cost: f64,
}

impl Session {
    pub fn new(
        id: impl Into<String>,
        directory: impl Into<PathBuf>,
        provider: ProviderKind,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            channel_id: None,
            directory: directory.into(),
            provider,
            provider_session_id: None,
            model: None,
            sandbox_mode: None,
            approval_policy: None,
            network_access: None,
            mode: SessionMode::default(),
            verbose: false,
            agent_persona: None,
            is_generating: false,
            created_at: now,
            last_activity: now,
            message_count: 0,
            total_cost: 0.0,
        }
    }

    /// Record activity now.
    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    /// Whether the session has a durable front-end address.
    pub fn has_channel(&self) -> bool {
        self.channel_id.is_some()
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("session name already in use: {0}")]
    NameTaken(String),

    #[error("channel already bound to another session: {0}")]
    ChannelClaimed(String),

    #[error("session is already generating: {0}")]
    Busy(String),

    #[error("directory does not exist or is not a directory: {0}")]
    InvalidDirectory(String),

    #[error("directory is outside the allowed roots: {0}")]
    DirectoryNotAllowed(String),

    #[error("provider does not support {0}")]
    Unsupported(&'static str),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}
