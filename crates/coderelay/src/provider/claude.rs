//! Terminal-integrated backend adapter.
//!
//! Drives the `claude` CLI in streaming JSON mode and translates its NDJSON
//! output into the unified event vocabulary. The CLI is spawned once per
//! turn; the session resume token arrives in the init message and is
//! surfaced immediately so the caller can persist it before the turn
//! completes.
//!
//! Failure policy: a turn that fails while resuming a previously-known
//! session is retried once with a fresh session, after emitting a
//! `session_init` reset signal. A fresh session's first-turn failure is not
//! retried.

use std::process::Stdio;

use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{
    ContentBlock, EVENT_CHANNEL_CAPACITY, EventRx, EventTx, Feature, FileChangeKind, Provider,
    ProviderError, ProviderEvent, ProviderKind, ProviderOptions, PromptInput, TaskStatus,
    TodoItem, UserQuestion,
};

/// Prompt used when continuing a finished turn without new user input.
const CONTINUE_PROMPT: &str = "Continue.";

/// Adapter for the terminal-integrated backend.
pub struct ClaudeProvider {
    binary: String,
}

impl Default for ClaudeProvider {
    fn default() -> Self {
        Self::new("claude")
    }
}

impl ClaudeProvider {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait::async_trait]
impl Provider for ClaudeProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Claude
    }

    fn supports(&self, feature: Feature) -> bool {
        matches!(
            feature,
            Feature::Tmux | Feature::Continue | Feature::AnswerPrompt
        )
    }

    async fn send_prompt(
        &self,
        prompt: PromptInput,
        opts: ProviderOptions,
    ) -> Result<EventRx, ProviderError> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let binary = self.binary.clone();
        tokio::spawn(async move {
            run_turn(binary, prompt, opts, tx).await;
        });
        Ok(rx)
    }

    async fn continue_session(&self, opts: ProviderOptions) -> Result<EventRx, ProviderError> {
        self.send_prompt(PromptInput::Text(CONTINUE_PROMPT.to_string()), opts)
            .await
    }
}

// ============================================================================
// Turn Execution
// ============================================================================

/// Outcome of one CLI invocation.
enum Attempt {
    /// Turn completed; its result event was already forwarded.
    Done,
    /// Backend reported a failed turn; the result event was withheld.
    Failed(ProviderEvent),
    /// Cancelled by the caller; stream ends cleanly.
    Cancelled,
    /// Receiver went away; nothing left to do.
    Closed,
}

/// Run one turn, applying the resume-retry policy.
async fn run_turn(binary: String, prompt: PromptInput, opts: ProviderOptions, tx: EventTx) {
    let had_resume = opts.resume.is_some();

    match stream_attempt(&binary, &prompt, &opts, opts.resume.as_deref(), &tx).await {
        Ok(Attempt::Done | Attempt::Cancelled | Attempt::Closed) => {}
        Ok(Attempt::Failed(result_event)) => {
            if had_resume {
                warn!("resumed turn failed, retrying with a fresh session");
                // Reset signal first so persisted state stays consistent even
                // if the retry itself fails.
                if tx
                    .send(Ok(ProviderEvent::SessionInit {
                        session_id: String::new(),
                    }))
                    .await
                    .is_err()
                {
                    return;
                }
                match stream_attempt(&binary, &prompt, &opts, None, &tx).await {
                    Ok(Attempt::Failed(retry_result)) => {
                        let _ = tx.send(Ok(retry_result)).await;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                    }
                }
            } else {
                let _ = tx.send(Ok(result_event)).await;
            }
        }
        Err(e) => {
            let _ = tx.send(Err(e)).await;
        }
    }
}

/// Spawn the CLI once and stream its output into `tx`.
async fn stream_attempt(
    binary: &str,
    prompt: &PromptInput,
    opts: &ProviderOptions,
    resume: Option<&str>,
    tx: &EventTx,
) -> Result<Attempt, ProviderError> {
    let stdin_payload = if prompt.has_images() {
        Some(build_stdin_message(prompt).await?)
    } else {
        None
    };
    let args = build_args(opts, resume, stdin_payload.is_none().then(|| prompt.text_content()));

    let mut cmd = Command::new(binary);
    cmd.args(&args)
        .current_dir(&opts.directory)
        .stdin(if stdin_payload.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    harden_child(&mut cmd);

    let mut child = cmd.spawn().map_err(|e| ProviderError::Spawn(e.to_string()))?;

    if let Some(payload) = stdin_payload
        && let Some(mut stdin) = child.stdin.take()
    {
        stdin.write_all(payload.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        drop(stdin);
    }

    let stdout = child.stdout.take().expect("stdout is piped");
    let stderr = child.stderr.take().expect("stderr is piped");

    // Drain stderr concurrently so a chatty backend cannot deadlock the pipe.
    let stderr_task = tokio::spawn(async move {
        let mut buf = String::new();
        let mut reader = BufReader::new(stderr);
        let _ = reader.read_to_string(&mut buf).await;
        buf
    });

    let mut lines = BufReader::new(stdout).lines();
    let mut failed_result: Option<ProviderEvent> = None;
    let mut saw_result = false;

    loop {
        tokio::select! {
            _ = opts.cancel.cancelled() => {
                debug!("turn cancelled, killing backend process");
                let _ = child.kill().await;
                return Ok(Attempt::Cancelled);
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    match parse_line(trimmed) {
                        Some(events) => {
                            for event in events {
                                if let ProviderEvent::TurnResult { success, .. } = &event {
                                    saw_result = true;
                                    if !*success {
                                        failed_result = Some(event);
                                        continue;
                                    }
                                }
                                if tx.send(Ok(event)).await.is_err() {
                                    let _ = child.kill().await;
                                    return Ok(Attempt::Closed);
                                }
                            }
                        }
                        None => {
                            debug!(line = %trimmed, "unrecognized backend output line");
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = child.kill().await;
                    return Err(ProviderError::Io(e));
                }
            }
        }
    }

    let status = child.wait().await?;
    if let Some(result) = failed_result {
        return Ok(Attempt::Failed(result));
    }
    if !saw_result {
        let stderr_out = stderr_task.await.unwrap_or_default();
        let tail = tail_chars(&stderr_out, 500);
        return Err(ProviderError::Backend(format!(
            "backend exited with {status} before reporting a result: {}",
            tail.trim()
        )));
    }
    Ok(Attempt::Done)
}

/// Last `n` characters of a string, on char boundaries.
fn tail_chars(s: &str, n: usize) -> &str {
    let count = s.chars().count();
    if count <= n {
        return s;
    }
    let skip = count - n;
    let (idx, _) = s.char_indices().nth(skip).unwrap_or((s.len(), ' '));
    &s[idx..]
}

/// Apply the parent-death signal so orphaned backends do not outlive us.
fn harden_child(cmd: &mut Command) {
    #[cfg(target_os = "linux")]
    unsafe {
        cmd.pre_exec(|| {
            if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
    let _ = cmd;
}

// ============================================================================
// Argument & Stdin Construction
// ============================================================================

/// Build the CLI argument list for one attempt.
fn build_args(
    opts: &ProviderOptions,
    resume: Option<&str>,
    prompt_arg: Option<String>,
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-p".to_string(),
        "--output-format".to_string(),
        "stream-json".to_string(),
        "--verbose".to_string(),
    ];

    if let Some(model) = &opts.model {
        args.push("--model".to_string());
        args.push(model.clone());
    }
    if let Some(token) = resume {
        args.push("--resume".to_string());
        args.push(token.to_string());
    }
    if let Some(system_prompt) = opts.joined_system_prompt() {
        args.push("--append-system-prompt".to_string());
        args.push(system_prompt);
    }
    if !opts.tool_servers.is_empty() {
        let servers: serde_json::Map<String, Value> = opts
            .tool_servers
            .iter()
            .map(|s| {
                (
                    s.name.clone(),
                    json!({ "command": s.command, "args": s.args }),
                )
            })
            .collect();
        args.push("--mcp-config".to_string());
        args.push(json!({ "mcpServers": servers }).to_string());
    }

    match prompt_arg {
        Some(text) => args.push(text),
        None => {
            args.push("--input-format".to_string());
            args.push("stream-json".to_string());
        }
    }

    args
}

/// Build the stream-json stdin message for prompts with image blocks.
async fn build_stdin_message(prompt: &PromptInput) -> Result<String, ProviderError> {
    use base64::Engine as _;

    let blocks = match prompt {
        PromptInput::Text(text) => vec![json!({ "type": "text", "text": text })],
        PromptInput::Blocks(blocks) => {
            let mut out = Vec::with_capacity(blocks.len());
            for block in blocks {
                out.push(match block {
                    ContentBlock::Text { text } => json!({ "type": "text", "text": text }),
                    ContentBlock::ImageInline { media_type, data } => json!({
                        "type": "image",
                        "source": { "type": "base64", "media_type": media_type, "data": data },
                    }),
                    ContentBlock::ImageFile { path } => {
                        let bytes = tokio::fs::read(path).await?;
                        let media_type = match path.extension().and_then(|e| e.to_str()) {
                            Some("jpg") | Some("jpeg") => "image/jpeg",
                            Some("gif") => "image/gif",
                            Some("webp") => "image/webp",
                            _ => "image/png",
                        };
                        json!({
                            "type": "image",
                            "source": {
                                "type": "base64",
                                "media_type": media_type,
                                "data": base64::engine::general_purpose::STANDARD.encode(bytes),
                            },
                        })
                    }
                });
            }
            out
        }
    };

    Ok(json!({
        "type": "user",
        "message": { "role": "user", "content": blocks },
    })
    .to_string())
}

// ============================================================================
// Native Protocol
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum NativeMessage {
    System {
        #[serde(default)]
        subtype: String,
        #[serde(default)]
        session_id: Option<String>,
    },
    Assistant {
        message: NativeInnerMessage,
    },
    User {
        message: NativeInnerMessage,
    },
    Result {
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        duration_ms: u64,
        #[serde(default)]
        num_turns: u32,
        #[serde(default)]
        total_cost_usd: Option<f64>,
        #[serde(default)]
        result: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct NativeInnerMessage {
    #[serde(default)]
    content: Vec<NativeContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum NativeContentBlock {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Unknown,
}

/// Translate one NDJSON line into unified events.
///
/// Returns `None` for lines that are not valid protocol messages.
fn parse_line(line: &str) -> Option<Vec<ProviderEvent>> {
    let message: NativeMessage = serde_json::from_str(line).ok()?;
    Some(translate_message(message))
}

fn translate_message(message: NativeMessage) -> Vec<ProviderEvent> {
    match message {
        NativeMessage::System {
            subtype,
            session_id,
        } => {
            if subtype == "init"
                && let Some(id) = session_id
            {
                vec![ProviderEvent::SessionInit { session_id: id }]
            } else {
                Vec::new()
            }
        }
        NativeMessage::Assistant { message } | NativeMessage::User { message } => message
            .content
            .into_iter()
            .filter_map(translate_block)
            .collect(),
        NativeMessage::Result {
            is_error,
            duration_ms,
            num_turns,
            total_cost_usd,
            result,
        } => {
            let errors = if is_error {
                result.into_iter().collect()
            } else {
                Vec::new()
            };
            vec![ProviderEvent::TurnResult {
                success: !is_error,
                cost_usd: total_cost_usd,
                duration_ms,
                turns: num_turns,
                errors,
            }]
        }
        NativeMessage::Unknown => Vec::new(),
    }
}

fn translate_block(block: NativeContentBlock) -> Option<ProviderEvent> {
    match block {
        NativeContentBlock::Text { text } => Some(ProviderEvent::TextDelta { text }),
        NativeContentBlock::Thinking { thinking } => {
            Some(ProviderEvent::Reasoning { text: thinking })
        }
        NativeContentBlock::ToolUse { id, name, input } => Some(translate_tool_use(id, name, input)),
        NativeContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => Some(ProviderEvent::ToolResult {
            id: tool_use_id,
            output: stringify_tool_content(&content),
            is_error,
        }),
        NativeContentBlock::Unknown => None,
    }
}

/// Map well-known tool invocations onto richer event variants; everything
/// else becomes a generic tool-start.
fn translate_tool_use(id: String, name: String, input: Value) -> ProviderEvent {
    match name.as_str() {
        "Bash" => {
            let command = input
                .get("command")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            ProviderEvent::CommandExec {
                command,
                exit_code: None,
                output: None,
            }
        }
        "Write" | "Edit" => {
            let path = input
                .get("file_path")
                .and_then(Value::as_str)
                .unwrap_or_default();
            ProviderEvent::FileChange {
                path: path.into(),
                kind: if name == "Write" {
                    FileChangeKind::Add
                } else {
                    FileChangeKind::Modify
                },
            }
        }
        "TodoWrite" => {
            let items = input
                .get("todos")
                .and_then(Value::as_array)
                .map(|todos| {
                    todos
                        .iter()
                        .filter_map(|t| {
                            let text = t.get("content").and_then(Value::as_str)?.to_string();
                            let status = match t.get("status").and_then(Value::as_str) {
                                Some("in_progress") => TaskStatus::InProgress,
                                Some("completed") => TaskStatus::Completed,
                                _ => TaskStatus::Pending,
                            };
                            Some(TodoItem { text, status })
                        })
                        .collect()
                })
                .unwrap_or_default();
            ProviderEvent::TodoList { items }
        }
        "AskUserQuestion" => {
            let questions = input
                .get("questions")
                .and_then(Value::as_array)
                .map(|qs| qs.iter().filter_map(parse_question).collect())
                .unwrap_or_default();
            ProviderEvent::AskUser { questions }
        }
        _ => ProviderEvent::ToolStart { id, name, input },
    }
}

fn parse_question(value: &Value) -> Option<UserQuestion> {
    let question = value.get("question").and_then(Value::as_str)?.to_string();
    let options = value
        .get("options")
        .and_then(Value::as_array)
        .map(|opts| {
            opts.iter()
                .filter_map(|o| {
                    o.as_str()
                        .map(str::to_string)
                        .or_else(|| o.get("label").and_then(Value::as_str).map(str::to_string))
                })
                .collect()
        })
        .unwrap_or_default();
    let multi_select = value
        .get("multiSelect")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    Some(UserQuestion {
        question,
        options,
        multi_select,
    })
}

/// Tool result content can be a plain string or an array of typed blocks.
fn stringify_tool_content(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| {
                if b.get("type").and_then(Value::as_str) == Some("text") {
                    b.get("text").and_then(Value::as_str).map(str::to_string)
                } else {
                    None
                }
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
