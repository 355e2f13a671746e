//! Sandboxed autonomous backend adapter.
//!
//! Drives the `codex` CLI through its stdio protocol: one submission is
//! written to stdin, events stream back as JSON lines until the turn
//! completes. Sandbox and approval policy are passed as config overrides.
//!
//! System-prompt fragments are injected by appending to `AGENTS.md` in the
//! working directory, which the backend reads on startup. The original file
//! contents (or its absence) are restored on every exit path, including
//! cancellation and errors.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{
    ContentBlock, EVENT_CHANNEL_CAPACITY, EventRx, EventTx, Feature, FileChangeKind, Provider,
    ProviderError, ProviderEvent, ProviderKind, ProviderOptions, PromptInput, TaskItem,
    TaskStatus,
};

/// Instructions file the backend picks up from the working directory.
const INSTRUCTIONS_FILE: &str = "AGENTS.md";

/// Prompt used when continuing a finished turn without new user input.
const CONTINUE_PROMPT: &str = "Continue.";

/// Adapter for the sandboxed autonomous backend.
pub struct CodexProvider {
    binary: String,
}

impl Default for CodexProvider {
    fn default() -> Self {
        Self::new("codex")
    }
}

impl CodexProvider {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait::async_trait]
impl Provider for CodexProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Codex
    }

    fn supports(&self, feature: Feature) -> bool {
        matches!(feature, Feature::Continue)
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
// Instructions Guard
// ============================================================================

/// Scoped injection of system-prompt fragments into the instructions file.
///
/// Captures the original content (or absence) before mutating; `restore`
/// must be called on every exit path.
struct InstructionsGuard {
    path: PathBuf,
    /// `None` when the file did not exist before injection.
    original: Option<Vec<u8>>,
}

impl InstructionsGuard {
    /// Append `fragments` to the instructions file in `dir`.
    async fn inject(dir: &Path, fragments: &str) -> std::io::Result<Self> {
        let path = dir.join(INSTRUCTIONS_FILE);
        let original = match tokio::fs::read(&path).await {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e),
        };

        let mut content = original.clone().unwrap_or_default();
        if !content.is_empty() && !content.ends_with(b"\n") {
            content.push(b'\n');
        }
        if !content.is_empty() {
            content.push(b'\n');
        }
        content.extend_from_slice(fragments.as_bytes());
        content.push(b'\n');
        tokio::fs::write(&path, content).await?;

        Ok(Self { path, original })
    }

    /// Put the file back the way it was.
    async fn restore(self) {
        let result = match &self.original {
            Some(bytes) => tokio::fs::write(&self.path, bytes).await,
            None => match tokio::fs::remove_file(&self.path).await {
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                other => other,
            },
        };
        if let Err(e) = result {
            warn!(path = %self.path.display(), error = %e, "failed to restore instructions file");
        }
    }
}

// ============================================================================
// Turn Execution
// ============================================================================

async fn run_turn(binary: String, prompt: PromptInput, opts: ProviderOptions, tx: EventTx) {
    // Inject instructions under a guard; restoration below is the
    // finally-equivalent for every outcome of the stream.
    let guard = match opts.joined_system_prompt() {
        Some(fragments) => match InstructionsGuard::inject(&opts.directory, &fragments).await {
            Ok(guard) => Some(guard),
            Err(e) => {
                let _ = tx.send(Err(ProviderError::Io(e))).await;
                return;
            }
        },
        None => None,
    };

    let outcome = stream_turn(&binary, &prompt, &opts, &tx).await;

    if let Some(guard) = guard {
        guard.restore().await;
    }

    if let Err(e) = outcome {
        let _ = tx.send(Err(e)).await;
    }
}

async fn stream_turn(
    binary: &str,
    prompt: &PromptInput,
    opts: &ProviderOptions,
    tx: &EventTx,
) -> Result<(), ProviderError> {
    let args = build_args(opts);

    let mut cmd = Command::new(binary);
    cmd.args(&args)
        .current_dir(&opts.directory)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| ProviderError::Spawn(e.to_string()))?;

    let mut stdin = child.stdin.take().expect("stdin is piped");
    let submission = build_submission(prompt);
    stdin.write_all(submission.to_string().as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await?;

    let stdout = child.stdout.take().expect("stdout is piped");
    let mut lines = BufReader::new(stdout).lines();

    let started = Instant::now();
    let mut turns: u32 = 0;
    let mut errors: Vec<String> = Vec::new();
    let mut completed = false;

    loop {
        tokio::select! {
            _ = opts.cancel.cancelled() => {
                debug!("turn cancelled, killing backend process");
                let _ = child.kill().await;
                return Ok(());
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    let Some(native) = parse_line(trimmed) else {
                        debug!(line = %trimmed, "unrecognized backend output line");
                        continue;
                    };
                    match step(native, &mut turns, &mut errors) {
                        Step::Emit(events) => {
                            for event in events {
                                if tx.send(Ok(event)).await.is_err() {
                                    let _ = child.kill().await;
                                    return Ok(());
                                }
                            }
                        }
                        Step::Complete => {
                            completed = true;
                            break;
                        }
                        Step::Aborted => {
                            // Clean end when we initiated it; otherwise an
                            // abort-classified failure.
                            if !opts.cancel.is_cancelled() {
                                errors.push("turn aborted by backend".to_string());
                            }
                            completed = opts.cancel.is_cancelled();
                            break;
                        }
                        Step::Ignore => {}
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

    let _ = child.kill().await;
    let _ = child.wait().await;

    if completed && opts.cancel.is_cancelled() {
        return Ok(());
    }
    if !completed && errors.is_empty() {
        return Err(ProviderError::Protocol(
            "backend stream ended before turn completion".to_string(),
        ));
    }

    let result = ProviderEvent::TurnResult {
        success: errors.is_empty(),
        cost_usd: None,
        duration_ms: started.elapsed().as_millis() as u64,
        turns: turns.max(1),
        errors,
    };
    let _ = tx.send(Ok(result)).await;
    Ok(())
}

// ============================================================================
// Argument & Submission Construction
// ============================================================================

/// Build the CLI argument list: the proto subcommand plus config overrides.
fn build_args(opts: &ProviderOptions) -> Vec<String> {
    let mut args = vec!["proto".to_string()];

    let mut push_override = |kv: String| {
        args.push("-c".to_string());
        args.push(kv);
    };

    if let Some(model) = &opts.model {
        push_override(format!("model={model}"));
    }
    if let Some(mode) = opts.sandbox_mode {
        push_override(format!("sandbox_mode={}", mode.as_str()));
    }
    if let Some(policy) = opts.approval_policy {
        push_override(format!("approval_policy={}", policy.as_str()));
    }
    if let Some(network) = opts.network_access {
        push_override(format!("sandbox_workspace_write.network_access={network}"));
    }
    if let Some(token) = &opts.resume {
        push_override(format!("experimental_resume={token}"));
    }

    args
}

/// Build the single user-input submission for the turn.
fn build_submission(prompt: &PromptInput) -> Value {
    let items: Vec<Value> = match prompt {
        PromptInput::Text(text) => vec![json!({ "type": "text", "text": text })],
        PromptInput::Blocks(blocks) => blocks
            .iter()
            .map(|block| match block {
                ContentBlock::Text { text } => json!({ "type": "text", "text": text }),
                ContentBlock::ImageInline { media_type, data } => json!({
                    "type": "image",
                    "image_url": format!("data:{media_type};base64,{data}"),
                }),
                ContentBlock::ImageFile { path } => json!({
                    "type": "local_image",
                    "path": path,
                }),
            })
            .collect(),
    };

    json!({
        "id": "1",
        "op": { "type": "user_input", "items": items },
    })
}

// ============================================================================
// Native Protocol
// ============================================================================

#[derive(Debug, Deserialize)]
struct NativeEnvelope {
    #[allow(dead_code)]
    #[serde(default)]
    id: String,
    msg: NativeEvent,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum NativeEvent {
    SessionConfigured {
        session_id: String,
    },
    #[serde(alias = "turn_started")]
    TaskStarted,
    AgentMessageDelta {
        delta: String,
    },
    AgentMessage {
        #[allow(dead_code)]
        message: String,
    },
    AgentReasoningDelta {
        delta: String,
    },
    AgentReasoning {
        text: String,
    },
    ExecCommandBegin {
        call_id: String,
        command: Vec<String>,
    },
    ExecCommandEnd {
        call_id: String,
        #[serde(default)]
        aggregated_output: String,
        exit_code: i32,
    },
    McpToolCallBegin {
        call_id: String,
        invocation: NativeInvocation,
    },
    McpToolCallEnd {
        call_id: String,
        #[serde(default)]
        result: Value,
    },
    PatchApplyBegin {
        #[allow(dead_code)]
        call_id: String,
        changes: serde_json::Map<String, Value>,
    },
    PlanUpdate {
        #[serde(default)]
        plan: Vec<NativePlanItem>,
    },
    ViewImageToolCall {
        path: PathBuf,
    },
    #[serde(alias = "turn_complete")]
    TaskComplete {
        #[allow(dead_code)]
        #[serde(default)]
        last_agent_message: Option<String>,
    },
    TurnAborted {
        #[allow(dead_code)]
        #[serde(default)]
        reason: Value,
    },
    Error {
        message: String,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct NativeInvocation {
    server: String,
    tool: String,
    #[serde(default)]
    arguments: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct NativePlanItem {
    step: String,
    #[serde(default)]
    status: Option<String>,
}

/// What the stream loop should do with one native event.
enum Step {
    Emit(Vec<ProviderEvent>),
    Complete,
    Aborted,
    Ignore,
}

fn parse_line(line: &str) -> Option<NativeEvent> {
    serde_json::from_str::<NativeEnvelope>(line)
        .ok()
        .map(|e| e.msg)
}

/// Translate one native event into the unified vocabulary.
fn step(event: NativeEvent, turns: &mut u32, errors: &mut Vec<String>) -> Step {
    match event {
        NativeEvent::SessionConfigured { session_id } => {
            Step::Emit(vec![ProviderEvent::SessionInit { session_id }])
        }
        NativeEvent::TaskStarted => {
            *turns += 1;
            Step::Ignore
        }
        NativeEvent::AgentMessageDelta { delta } => {
            Step::Emit(vec![ProviderEvent::TextDelta { text: delta }])
        }
        // Full agent messages duplicate the deltas already streamed.
        NativeEvent::AgentMessage { .. } => Step::Ignore,
        NativeEvent::AgentReasoningDelta { delta } => {
            Step::Emit(vec![ProviderEvent::Reasoning { text: delta }])
        }
        NativeEvent::AgentReasoning { text } => {
            Step::Emit(vec![ProviderEvent::Reasoning { text }])
        }
        NativeEvent::ExecCommandBegin { command, .. } => Step::Emit(vec![
            ProviderEvent::CommandExec {
                command: command.join(" "),
                exit_code: None,
                output: None,
            },
        ]),
        NativeEvent::ExecCommandEnd {
            call_id: _,
            aggregated_output,
            exit_code,
        } => Step::Emit(vec![ProviderEvent::CommandExec {
            command: String::new(),
            exit_code: Some(exit_code),
            output: Some(aggregated_output),
        }]),
        NativeEvent::McpToolCallBegin {
            call_id,
            invocation,
        } => Step::Emit(vec![ProviderEvent::ToolStart {
            id: call_id,
            name: format!("{}.{}", invocation.server, invocation.tool),
            input: invocation.arguments.unwrap_or(Value::Null),
        }]),
        NativeEvent::McpToolCallEnd { call_id, result } => {
            let is_error = result.get("Err").is_some();
            Step::Emit(vec![ProviderEvent::ToolResult {
                id: call_id,
                output: result.to_string(),
                is_error,
            }])
        }
        NativeEvent::PatchApplyBegin { changes, .. } => {
            let events = changes
                .into_iter()
                .map(|(path, change)| {
                    let kind = match change.get("type").and_then(Value::as_str) {
                        Some("add") => FileChangeKind::Add,
                        Some("delete") => FileChangeKind::Delete,
                        _ => FileChangeKind::Modify,
                    };
                    ProviderEvent::FileChange {
                        path: path.into(),
                        kind,
                    }
                })
                .collect();
            Step::Emit(events)
        }
        NativeEvent::PlanUpdate { plan } => {
            let tasks = plan
                .into_iter()
                .map(|item| TaskItem {
                    id: None,
                    subject: item.step,
                    status: match item.status.as_deref() {
                        Some("in_progress") => TaskStatus::InProgress,
                        Some("completed") => TaskStatus::Completed,
                        _ => TaskStatus::Pending,
                    },
                })
                .collect();
            Step::Emit(vec![ProviderEvent::TaskUpdate { tasks }])
        }
        NativeEvent::ViewImageToolCall { path } => {
            Step::Emit(vec![ProviderEvent::ImageFile { path }])
        }
        NativeEvent::TaskComplete { .. } => Step::Complete,
        NativeEvent::TurnAborted { .. } => Step::Aborted,
        NativeEvent::Error { message } => {
            errors.push(message.clone());
            Step::Emit(vec![ProviderEvent::Error { message }])
        }
        NativeEvent::Unknown => Step::Ignore,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ApprovalPolicy, SandboxMode};
    use tempfile::TempDir;

    fn opts_with_policies() -> ProviderOptions {
        let mut opts = ProviderOptions::new("/work/repo");
        opts.model = Some("o4-mini".to_string());
        opts.sandbox_mode = Some(SandboxMode::WorkspaceWrite);
        opts.approval_policy = Some(ApprovalPolicy::OnRequest);
        opts.network_access = Some(true);
        opts.resume = Some("thread-9".to_string());
        opts
    }

    #[test]
    fn args_carry_policy_overrides() {
        let args = build_args(&opts_with_policies());
        assert_eq!(args[0], "proto");
        let joined = args.join(" ");
        assert!(joined.contains("sandbox_mode=workspace-write"));
        assert!(joined.contains("approval_policy=on-request"));
        assert!(joined.contains("sandbox_workspace_write.network_access=true"));
        assert!(joined.contains("experimental_resume=thread-9"));
        assert!(joined.contains("model=o4-mini"));
    }

    #[test]
    fn args_minimal_without_overrides() {
        let args = build_args(&ProviderOptions::new("/work"));
        assert_eq!(args, vec!["proto".to_string()]);
    }

    #[test]
    fn submission_wraps_text_prompt() {
        let sub = build_submission(&PromptInput::Text("hello".to_string()));
        assert_eq!(sub["op"]["type"], "user_input");
        assert_eq!(sub["op"]["items"][0]["text"], "hello");
    }

    #[test]
    fn submission_encodes_image_blocks() {
        let sub = build_submission(&PromptInput::Blocks(vec![
            ContentBlock::Text {
                text: "look".to_string(),
            },
            ContentBlock::ImageInline {
                media_type: "image/png".to_string(),
                data: "AAAA".to_string(),
            },
            ContentBlock::ImageFile {
                path: "/tmp/shot.png".into(),
            },
        ]));
        let items = sub["op"]["items"].as_array().unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(items[1]["type"], "image");
        assert!(items[1]["image_url"]
            .as_str()
            .unwrap()
            .starts_with("data:image/png;base64,"));
        assert_eq!(items[2]["type"], "local_image");
    }

    #[test]
    fn session_configured_yields_session_init() {
        let native =
            parse_line(r#"{"id":"1","msg":{"type":"session_configured","session_id":"t-42","model":"gpt-5"}}"#)
                .unwrap();
        let mut turns = 0;
        let mut errors = Vec::new();
        let Step::Emit(events) = step(native, &mut turns, &mut errors) else {
            panic!("expected emit");
        };
        assert_eq!(
            events,
            vec![ProviderEvent::SessionInit {
                session_id: "t-42".to_string()
            }]
        );
    }

    #[test]
    fn deltas_translate_to_text_and_reasoning() {
        let mut turns = 0;
        let mut errors = Vec::new();

        let text = parse_line(r#"{"id":"1","msg":{"type":"agent_message_delta","delta":"hi"}}"#)
            .unwrap();
        let Step::Emit(events) = step(text, &mut turns, &mut errors) else {
            panic!();
        };
        assert_eq!(
            events,
            vec![ProviderEvent::TextDelta {
                text: "hi".to_string()
            }]
        );

        let reasoning =
            parse_line(r#"{"id":"1","msg":{"type":"agent_reasoning_delta","delta":"think"}}"#)
                .unwrap();
        let Step::Emit(events) = step(reasoning, &mut turns, &mut errors) else {
            panic!();
        };
        assert_eq!(
            events,
            vec![ProviderEvent::Reasoning {
                text: "think".to_string()
            }]
        );
    }

    #[test]
    fn exec_events_translate_to_command_exec() {
        let mut turns = 0;
        let mut errors = Vec::new();

        let begin = parse_line(
            r#"{"id":"1","msg":{"type":"exec_command_begin","call_id":"c1","turn_id":"t","command":["bash","-lc","ls"],"cwd":"/w"}}"#,
        )
        .unwrap();
        let Step::Emit(events) = step(begin, &mut turns, &mut errors) else {
            panic!();
        };
        assert_eq!(
            events,
            vec![ProviderEvent::CommandExec {
                command: "bash -lc ls".to_string(),
                exit_code: None,
                output: None,
            }]
        );

        let end = parse_line(
            r#"{"id":"1","msg":{"type":"exec_command_end","call_id":"c1","turn_id":"t","command":["ls"],"cwd":"/w","aggregated_output":"a.rs\n","exit_code":0,"duration":"1s","formatted_output":""}}"#,
        )
        .unwrap();
        let Step::Emit(events) = step(end, &mut turns, &mut errors) else {
            panic!();
        };
        assert!(matches!(
            &events[0],
            ProviderEvent::CommandExec { exit_code: Some(0), .. }
        ));
    }

    #[test]
    fn plan_update_translates_to_task_board() {
        let native = parse_line(
            r#"{"id":"1","msg":{"type":"plan_update","explanation":null,"plan":[
                {"step":"read code","status":"completed"},
                {"step":"write fix","status":"in_progress"},
                {"step":"run tests","status":"pending"}
            ]}}"#,
        )
        .unwrap();
        let mut turns = 0;
        let mut errors = Vec::new();
        let Step::Emit(events) = step(native, &mut turns, &mut errors) else {
            panic!();
        };
        let ProviderEvent::TaskUpdate { tasks } = &events[0] else {
            panic!("expected task update");
        };
        assert_eq!(tasks.len(), 3);
        assert_eq!(tasks[0].status, TaskStatus::Completed);
        assert_eq!(tasks[1].status, TaskStatus::InProgress);
        assert_eq!(tasks[2].status, TaskStatus::Pending);
    }

    #[test]
    fn patch_apply_translates_file_changes() {
        let native = parse_line(
            r#"{"id":"1","msg":{"type":"patch_apply_begin","call_id":"p1","auto_approved":true,"changes":{
                "/w/new.rs":{"type":"add","content":"x"},
                "/w/old.rs":{"type":"update","unified_diff":"..","move_path":null}
            }}}"#,
        )
        .unwrap();
        let mut turns = 0;
        let mut errors = Vec::new();
        let Step::Emit(mut events) = step(native, &mut turns, &mut errors) else {
            panic!();
        };
        events.sort_by_key(|e| match e {
            ProviderEvent::FileChange { path, .. } => path.clone(),
            _ => PathBuf::new(),
        });
        assert_eq!(
            events,
            vec![
                ProviderEvent::FileChange {
                    path: "/w/new.rs".into(),
                    kind: FileChangeKind::Add,
                },
                ProviderEvent::FileChange {
                    path: "/w/old.rs".into(),
                    kind: FileChangeKind::Modify,
                },
            ]
        );
    }

    #[test]
    fn task_complete_and_abort_steps() {
        let mut turns = 0;
        let mut errors = Vec::new();

        let done = parse_line(r#"{"id":"1","msg":{"type":"task_complete","last_agent_message":"ok"}}"#)
            .unwrap();
        assert!(matches!(step(done, &mut turns, &mut errors), Step::Complete));

        let aborted =
            parse_line(r#"{"id":"1","msg":{"type":"turn_aborted","reason":"interrupted"}}"#)
                .unwrap();
        assert!(matches!(
            step(aborted, &mut turns, &mut errors),
            Step::Aborted
        ));
    }

    #[tokio::test]
    async fn guard_restores_preexisting_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(INSTRUCTIONS_FILE);
        tokio::fs::write(&path, "original instructions\n").await.unwrap();

        let guard = InstructionsGuard::inject(dir.path(), "injected overlay")
            .await
            .unwrap();

        let injected = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(injected.starts_with("original instructions\n"));
        assert!(injected.contains("injected overlay"));

        guard.restore().await;
        let restored = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(restored, "original instructions\n");
    }

    #[tokio::test]
    async fn guard_deletes_file_it_created() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(INSTRUCTIONS_FILE);
        assert!(!path.exists());

        let guard = InstructionsGuard::inject(dir.path(), "overlay only")
            .await
            .unwrap();
        assert!(path.exists());

        guard.restore().await;
        assert!(!path.exists());
    }

    #[test]
    fn capability_surface() {
        let provider = CodexProvider::default();
        assert!(provider.supports(Feature::Continue));
        assert!(!provider.supports(Feature::Tmux));
        assert!(!provider.supports(Feature::AnswerPrompt));
    }
}
