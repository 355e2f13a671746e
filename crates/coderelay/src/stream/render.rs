//! Renderers for structured provider events.
//!
//! Each distinct event type gets its own message shape. Oversized payloads
//! are truncated to a preview with a "show full" control backed by the
//! expandable-content store.

use coderelay_chat_protocol::{Button, ButtonStyle, Component, OutboundMessage, SelectMenu, SelectOption};
use serde_json::Value;

use crate::provider::{FileChangeKind, TaskItem, TaskStatus, TodoItem, UserQuestion};
use crate::session::SessionMode;

use super::detect::{detect_numbered_options, detect_yes_no};
use super::expand::ExpandableStore;

/// Tool calls with these names render even when the session is not verbose.
pub const ALWAYS_VISIBLE_TOOLS: [&str; 4] = ["Task", "WebSearch", "WebFetch", "NotebookEdit"];

/// Above this many options, a question renders as a selection menu.
pub const MAX_BUTTON_OPTIONS: usize = 5;

/// Buttons per component row.
const ROW_WIDTH: usize = 5;

/// Preview size before content is deferred behind an expand control.
const PREVIEW_LIMIT: usize = 600;

/// Task-board status symbols.
const SYMBOL_PENDING: &str = "☐";
const SYMBOL_IN_PROGRESS: &str = "◐";
const SYMBOL_COMPLETED: &str = "☑";

fn status_symbol(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Pending => SYMBOL_PENDING,
        TaskStatus::InProgress => SYMBOL_IN_PROGRESS,
        TaskStatus::Completed => SYMBOL_COMPLETED,
    }
}

/// Whether a tool call/result should be rendered at all.
pub fn tool_visible(name: &str, verbose: bool) -> bool {
    verbose || ALWAYS_VISIBLE_TOOLS.contains(&name)
}

// ============================================================================
// Previews
// ============================================================================

/// Truncate `content`, parking the full text behind an expand control when
/// it exceeds the preview limit.
fn preview(content: &str, expand: &ExpandableStore) -> (String, Option<Component>) {
    if content.len() <= PREVIEW_LIMIT {
        return (content.to_string(), None);
    }

    let mut cut = PREVIEW_LIMIT;
    while cut > 0 && !content.is_char_boundary(cut) {
        cut -= 1;
    }
    let id = expand.insert(content.to_string());
    let button = Component::Buttons {
        buttons: vec![
            Button::new(format!("expand:{id}"), "Show full").style(ButtonStyle::Secondary),
        ],
    };
    (format!("{}…", &content[..cut]), Some(button))
}

// ============================================================================
// Event Renderers
// ============================================================================

pub fn render_tool_start(name: &str, input: &Value, expand: &ExpandableStore) -> OutboundMessage {
    let input_text = match input {
        Value::Null => String::new(),
        other => serde_json::to_string_pretty(other).unwrap_or_default(),
    };
    let (shown, control) = preview(&input_text, expand);

    let mut msg = OutboundMessage::text(format!("🔧 **{name}**"));
    if !shown.is_empty() {
        msg = msg.with_field("Input", format!("```json\n{shown}\n```"));
    }
    if let Some(control) = control {
        msg.components.push(control);
    }
    msg
}

pub fn render_tool_result(output: &str, is_error: bool, expand: &ExpandableStore) -> OutboundMessage {
    let (shown, control) = preview(output, expand);
    let marker = if is_error { "❌" } else { "✅" };
    let body = if shown.is_empty() {
        format!("{marker} (no output)")
    } else {
        format!("{marker} ```\n{shown}\n```")
    };
    let mut msg = OutboundMessage::text(body);
    if let Some(control) = control {
        msg.components.push(control);
    }
    msg
}

pub fn render_task_board(tasks: &[TaskItem]) -> OutboundMessage {
    let lines: Vec<String> = tasks
        .iter()
        .map(|t| format!("{} {}", status_symbol(t.status), t.subject))
        .collect();
    OutboundMessage::text(format!("**Tasks**\n{}", lines.join("\n")))
}

pub fn render_todo_list(items: &[TodoItem]) -> OutboundMessage {
    let lines: Vec<String> = items
        .iter()
        .map(|t| format!("{} {}", status_symbol(t.status), t.text))
        .collect();
    OutboundMessage::text(format!("**Todo**\n{}", lines.join("\n")))
}

pub fn render_command(command: &str, exit_code: Option<i32>, output: Option<&str>, expand: &ExpandableStore) -> OutboundMessage {
    match exit_code {
        None => OutboundMessage::text(format!("💻 `{command}`")),
        Some(code) => {
            let marker = if code == 0 { "✅" } else { "❌" };
            let (shown, control) = preview(output.unwrap_or_default(), expand);
            let mut text = format!("{marker} exit {code}");
            if !shown.is_empty() {
                text.push_str(&format!("\n```\n{shown}\n```"));
            }
            let mut msg = OutboundMessage::text(text);
            if let Some(control) = control {
                msg.components.push(control);
            }
            msg
        }
    }
}

pub fn render_file_change(path: &std::path::Path, kind: FileChangeKind) -> OutboundMessage {
    let verb = match kind {
        FileChangeKind::Add => "created",
        FileChangeKind::Modify => "modified",
        FileChangeKind::Delete => "deleted",
    };
    OutboundMessage::text(format!("📝 {verb} `{}`", path.display()))
}

pub fn render_image(path: &std::path::Path) -> OutboundMessage {
    OutboundMessage::text(format!("🖼️ image written to `{}`", path.display()))
}

pub fn render_reasoning(text: &str) -> OutboundMessage {
    let quoted: Vec<String> = text.lines().map(|l| format!("> {l}")).collect();
    OutboundMessage::text(quoted.join("\n"))
}

pub fn render_error(message: &str, session_reset: bool) -> OutboundMessage {
    let mut text = format!("⚠️ {message}");
    if session_reset {
        text.push_str("\n\nThe backend session was reset; the next message starts a fresh conversation.");
    }
    OutboundMessage::text(text)
}

// ============================================================================
// Questions
// ============================================================================

/// Render structured questions.
///
/// A single question submits immediately on selection; multiple questions
/// collect answers and submit together. Small option sets render as
/// buttons, larger ones as a selection menu.
pub fn render_questions(questions: &[UserQuestion]) -> OutboundMessage {
    let single = questions.len() == 1;
    let mut body = String::new();
    let mut components = Vec::new();

    for (qi, question) in questions.iter().enumerate() {
        if qi > 0 {
            body.push('\n');
        }
        if single {
            body.push_str(&format!("❓ **{}**", question.question));
        } else {
            body.push_str(&format!("❓ **{}. {}**", qi + 1, question.question));
        }

        if question.options.len() <= MAX_BUTTON_OPTIONS {
            for (chunk, row) in question.options.chunks(ROW_WIDTH).enumerate() {
                let buttons = row
                    .iter()
                    .enumerate()
                    .map(|(ri, label)| {
                        let oi = chunk * ROW_WIDTH + ri;
                        let id = if single {
                            format!("pick:{oi}")
                        } else {
                            format!("ask:{qi}:{oi}")
                        };
                        Button::new(id, truncate_label(label))
                    })
                    .collect();
                components.push(Component::Buttons { buttons });
            }
        } else {
            let id = if single {
                "pick_menu".to_string()
            } else {
                format!("ask_menu:{qi}")
            };
            components.push(Component::Select {
                menu: SelectMenu {
                    id,
                    placeholder: truncate_label(&question.question),
                    options: question
                        .options
                        .iter()
                        .enumerate()
                        .map(|(oi, label)| SelectOption {
                            value: oi.to_string(),
                            label: truncate_label(label),
                        })
                        .collect(),
                },
            });
        }
    }

    if !single {
        components.push(Component::Buttons {
            buttons: vec![
                Button::new("ask_submit", "Submit answers").style(ButtonStyle::Success),
            ],
        });
    }

    OutboundMessage::text(body).with_components(components)
}

fn truncate_label(label: &str) -> String {
    const LABEL_LIMIT: usize = 80;
    if label.len() <= LABEL_LIMIT {
        return label.to_string();
    }
    let mut cut = LABEL_LIMIT;
    while cut > 0 && !label.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…", &label[..cut])
}

// ============================================================================
// Turn Summary & Controls
// ============================================================================

/// Render the end-of-turn summary with its interactive controls.
#[allow(clippy::too_many_arguments)]
pub fn render_result_summary(
    success: bool,
    cost_usd: Option<f64>,
    duration_ms: u64,
    turns: u32,
    mode: SessionMode,
    errors: &[String],
    session_reset: bool,
    trailing_text: &str,
) -> OutboundMessage {
    let marker = if success { "✅" } else { "⚠️" };
    let mut msg = OutboundMessage::text(format!("{marker} turn finished"))
        .with_field("Duration", format_duration(duration_ms))
        .with_field("Turns", turns.to_string())
        .with_field("Mode", mode.to_string());
    if let Some(cost) = cost_usd {
        msg = msg.with_field("Cost", format!("${cost:.4}"));
    }
    if !success {
        let mut shown: Vec<&str> = errors.iter().map(String::as_str).take(3).collect();
        if errors.len() > 3 {
            shown.push("…");
        }
        if !shown.is_empty() {
            msg = msg.with_field("Errors", shown.join("\n"));
        }
        if session_reset {
            msg = msg.with_field(
                "Session",
                "reset: the next message starts a fresh backend conversation",
            );
        }
    }

    msg.components = turn_controls(mode, trailing_text);
    msg
}

/// Interactive controls appended after a turn: detected inline prompts,
/// then mode switching and continue.
pub fn turn_controls(mode: SessionMode, trailing_text: &str) -> Vec<Component> {
    let mut components = Vec::new();

    let options = detect_numbered_options(trailing_text);
    if options.len() >= 2 {
        for (start, row) in options.chunks(ROW_WIDTH).enumerate() {
            let buttons = row
                .iter()
                .enumerate()
                .map(|(i, label)| {
                    let n = start * ROW_WIDTH + i + 1;
                    Button::new(format!("opt:{n}"), format!("{n}. {}", truncate_label(label)))
                })
                .collect();
            components.push(Component::Buttons { buttons });
        }
    } else if detect_yes_no(trailing_text) {
        components.push(Component::Buttons {
            buttons: vec![
                Button::new("yn:yes", "Yes").style(ButtonStyle::Success),
                Button::new("yn:no", "No").style(ButtonStyle::Danger),
            ],
        });
    }

    components.push(mode_selector(mode));
    components.push(Component::Buttons {
        buttons: vec![Button::new("continue", "Continue").style(ButtonStyle::Secondary)],
    });
    components
}

/// Mode-switch buttons with the current mode disabled.
pub fn mode_selector(current: SessionMode) -> Component {
    Component::Buttons {
        buttons: SessionMode::ALL
            .into_iter()
            .map(|mode| {
                Button::new(format!("mode:{mode}"), mode_label(mode))
                    .style(ButtonStyle::Secondary)
                    .disabled(mode == current)
            })
            .collect(),
    }
}

fn mode_label(mode: SessionMode) -> &'static str {
    match mode {
        SessionMode::Auto => "Auto",
        SessionMode::Plan => "Plan",
        SessionMode::Normal => "Normal",
    }
}

/// The stop control shown on a live streaming message.
pub fn stop_control() -> Component {
    Component::Buttons {
        buttons: vec![Button::new("stop", "Stop").style(ButtonStyle::Danger)],
    }
}

fn format_duration(ms: u64) -> String {
    if ms < 1000 {
        format!("{ms}ms")
    } else {
        format!("{:.1}s", ms as f64 / 1000.0)
    }
}
