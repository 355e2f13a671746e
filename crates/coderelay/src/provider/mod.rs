//! Provider abstraction: the unified event vocabulary and adapter contract.
//!
//! Every backend adapter translates its native streaming protocol into
//! [`ProviderEvent`]s. The registry and renderer depend only on this closed
//! set of variants; adding a backend means writing one adapter, never
//! touching the core.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub mod claude;
pub mod codex;
pub mod registry;

pub use registry::ProviderRegistry;

/// Buffer depth for adapter event channels.
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 256;

// ============================================================================
// Provider Identity & Capabilities
// ============================================================================

/// The available backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Terminal-integrated backend driven through its CLI in streaming mode.
    Claude,
    /// Sandboxed autonomous backend driven through its stdio protocol.
    Codex,
}

impl ProviderKind {
    /// All known kinds, in registry order.
    pub const ALL: [ProviderKind; 2] = [ProviderKind::Claude, ProviderKind::Codex];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Claude => "claude",
            ProviderKind::Codex => "codex",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "claude" => Ok(ProviderKind::Claude),
            "codex" => Ok(ProviderKind::Codex),
            other => Err(ProviderError::UnknownProvider(other.to_string())),
        }
    }
}

/// Capabilities an adapter can advertise for negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feature {
    /// A terminal-multiplexer mirror of the backend session exists.
    Tmux,
    /// The backend can continue a finished turn without new user input.
    Continue,
    /// The backend emits structured multi-choice questions.
    AnswerPrompt,
}

// ============================================================================
// Prompt Input
// ============================================================================

/// What the user submitted for one turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptInput {
    /// Plain text.
    Text(String),
    /// A sequence of typed content blocks (text and images).
    Blocks(Vec<ContentBlock>),
}

impl PromptInput {
    /// Concatenated text content, ignoring images.
    pub fn text_content(&self) -> String {
        match self {
            PromptInput::Text(text) => text.clone(),
            PromptInput::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// Whether any image blocks are present.
    pub fn has_images(&self) -> bool {
        match self {
            PromptInput::Text(_) => false,
            PromptInput::Blocks(blocks) => blocks
                .iter()
                .any(|b| !matches!(b, ContentBlock::Text { .. })),
        }
    }
}

/// One typed block of prompt content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    /// Base64-encoded inline image.
    ImageInline {
        media_type: String,
        data: String,
    },
    /// Reference to an image file on the local filesystem.
    ImageFile {
        path: PathBuf,
    },
}

// ============================================================================
// Provider Options
// ============================================================================

/// Sandbox filesystem policy for the autonomous backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SandboxMode {
    ReadOnly,
    WorkspaceWrite,
    DangerFullAccess,
}

impl SandboxMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxMode::ReadOnly => "read-only",
            SandboxMode::WorkspaceWrite => "workspace-write",
            SandboxMode::DangerFullAccess => "danger-full-access",
        }
    }
}

/// Command approval policy for the autonomous backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalPolicy {
    Untrusted,
    OnFailure,
    OnRequest,
    Never,
}

impl ApprovalPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalPolicy::Untrusted => "untrusted",
            ApprovalPolicy::OnFailure => "on-failure",
            ApprovalPolicy::OnRequest => "on-request",
            ApprovalPolicy::Never => "never",
        }
    }
}

/// An auxiliary tool server made available to the backend for a turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolServer {
    pub name: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

/// Everything an adapter needs to run one turn.
#[derive(Debug, Clone)]
pub struct ProviderOptions {
    /// Working directory for the backend process.
    pub directory: PathBuf,
    /// Backend resume token from a previous turn, if any.
    pub resume: Option<String>,
    /// Model override.
    pub model: Option<String>,
    /// Sandbox policy (autonomous backend only).
    pub sandbox_mode: Option<SandboxMode>,
    /// Approval policy (autonomous backend only).
    pub approval_policy: Option<ApprovalPolicy>,
    /// Network access inside the sandbox (autonomous backend only).
    pub network_access: Option<bool>,
    /// Ordered system-prompt fragments, concatenated by the adapter.
    pub system_prompt_parts: Vec<String>,
    /// Auxiliary tool servers registered for the project.
    pub tool_servers: Vec<ToolServer>,
    /// Cooperative cancellation handle; adapters observe it at their own
    /// suspension points and treat it as clean termination.
    pub cancel: CancellationToken,
}

impl ProviderOptions {
    /// Options for a fresh turn in `directory` with no overrides.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            resume: None,
            model: None,
            sandbox_mode: None,
            approval_policy: None,
            network_access: None,
            system_prompt_parts: Vec::new(),
            tool_servers: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// The concatenated system prompt, or `None` when no fragments are set.
    pub fn joined_system_prompt(&self) -> Option<String> {
        let parts: Vec<&str> = self
            .system_prompt_parts
            .iter()
            .map(String::as_str)
            .filter(|p| !p.trim().is_empty())
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n\n"))
        }
    }
}

// ============================================================================
// Unified Event Vocabulary
// ============================================================================

/// Status of one entry on a task board or todo list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
}

/// One entry of a task-board mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub subject: String,
    pub status: TaskStatus,
}

/// One entry of a todo-list update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoItem {
    pub text: String,
    pub status: TaskStatus,
}

/// A structured question the backend wants the user to answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserQuestion {
    pub question: String,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub multi_select: bool,
}

/// Kind of a reported file change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileChangeKind {
    Add,
    Modify,
    Delete,
}

/// The unified, provider-agnostic event stream vocabulary.
///
/// This is the system's central interface: exhaustive and stable. Adapters
/// must emit exactly these shapes, with no leakage of native protocol types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderEvent {
    /// Incremental assistant text.
    TextDelta { text: String },

    /// A tool invocation began.
    ToolStart {
        id: String,
        name: String,
        input: serde_json::Value,
    },

    /// A tool invocation finished.
    ToolResult {
        id: String,
        output: String,
        #[serde(default)]
        is_error: bool,
    },

    /// The backend asks the user structured multi-choice questions.
    AskUser { questions: Vec<UserQuestion> },

    /// Task-board mutation.
    TaskUpdate { tasks: Vec<TaskItem> },

    /// The backend produced an image file.
    ImageFile { path: PathBuf },

    /// A shell command executed by the backend.
    CommandExec {
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<String>,
    },

    /// The backend changed a file.
    FileChange { path: PathBuf, kind: FileChangeKind },

    /// Model reasoning text.
    Reasoning { text: String },

    /// Todo-list update.
    TodoList { items: Vec<TodoItem> },

    /// Carries the backend resume token as soon as it is known.
    ///
    /// An empty `session_id` is a reset signal: the previous token must be
    /// discarded before any retry output follows.
    SessionInit { session_id: String },

    /// Terminal turn summary.
    #[serde(rename = "result")]
    TurnResult {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cost_usd: Option<f64>,
        duration_ms: u64,
        turns: u32,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        errors: Vec<String>,
    },

    /// Non-fatal backend error surfaced mid-stream.
    Error { message: String },
}

/// Stream of unified events from one turn.
pub type EventRx = mpsc::Receiver<Result<ProviderEvent, ProviderError>>;

/// Sender half used inside adapters.
pub(crate) type EventTx = mpsc::Sender<Result<ProviderEvent, ProviderError>>;

// ============================================================================
// Errors & Cancellation Classification
// ============================================================================

/// Errors produced by adapters and the provider registry.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("failed to spawn backend process: {0}")]
    Spawn(String),

    #[error("backend protocol error: {0}")]
    Protocol(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Keywords that classify an error as user-initiated cancellation.
///
/// The backends do not reliably raise a single typed cancellation signal, so
/// classification is by substring match against the error text.
const ABORT_KEYWORDS: [&str; 5] = ["abort", "cancel", "interrupt", "killed", "signal"];

/// Whether an error message looks like a cancellation rather than a failure.
pub fn is_abort_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    ABORT_KEYWORDS.iter().any(|kw| lower.contains(kw))
}

// ============================================================================
// Provider Contract
// ============================================================================

/// A backend adapter.
///
/// Both entry points return a stream whose final item is a `TurnResult`
/// event (or an `Err` for adapter-level failures). Cancellation via
/// [`ProviderOptions::cancel`] ends the stream cleanly without an error
/// item.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Which backend this adapter drives.
    fn kind(&self) -> ProviderKind;

    /// Capability negotiation.
    fn supports(&self, feature: Feature) -> bool;

    /// Run one turn with new user input.
    async fn send_prompt(
        &self,
        prompt: PromptInput,
        opts: ProviderOptions,
    ) -> Result<EventRx, ProviderError>;

    /// Continue the previous turn without new user input.
    async fn continue_session(&self, opts: ProviderOptions) -> Result<EventRx, ProviderError>;
}
