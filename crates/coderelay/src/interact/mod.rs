//! Interactive response routing.
//!
//! Inbound UI actions carry an opaque colon-delimited identifier. The
//! router maps each onto a session operation: stop, continue, expand
//! truncated content, quick replies, multi-question answer collection, and
//! mode switching. Every branch re-validates that the session still exists;
//! a vanished session is reported, never thrown.

use std::sync::Arc;
use std::time::Duration;

use coderelay_chat_protocol::{
    ActionData, ChatClient, Component, MessageRef, OutboundMessage, chunk_message,
};
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::session::{SessionMode, SessionRegistry};
use crate::stream::render;
use crate::stream::ExpandableStore;

pub mod pending;

pub use pending::{NO_ANSWER, PendingQuestions, PendingStore};

// ============================================================================
// Shared interaction state
// ============================================================================

/// How long rendered control messages stay editable from the cache.
const CONTROL_TTL: Duration = Duration::from_secs(60 * 60);

/// Cache of rendered interactive messages, so controls can be re-rendered
/// (e.g. disabling the current mode) without platform read-back.
#[derive(Default)]
pub struct ControlCache {
    entries: DashMap<String, (OutboundMessage, Instant)>,
}

impl ControlCache {
    fn key(message: &MessageRef) -> String {
        format!("{}:{}", message.channel_id, message.message_id)
    }

    pub fn insert(&self, message: &MessageRef, content: OutboundMessage) {
        self.entries
            .retain(|_, (_, at)| at.elapsed() <= CONTROL_TTL);
        self.entries
            .insert(Self::key(message), (content, Instant::now()));
    }

    pub fn get(&self, message: &MessageRef) -> Option<OutboundMessage> {
        let entry = self.entries.get(&Self::key(message))?;
        if entry.1.elapsed() > CONTROL_TTL {
            return None;
        }
        Some(entry.0.clone())
    }
}

/// The stores shared between the output streamer and the action router.
#[derive(Default)]
pub struct InteractionState {
    pub expand: ExpandableStore,
    pub pending: PendingStore,
    pub controls: ControlCache,
}

impl InteractionState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

// ============================================================================
// Action identifiers
// ============================================================================

/// A parsed UI action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Stop the current generation.
    Stop,
    /// Continue the finished turn.
    Continue,
    /// Expand previously truncated content.
    Expand(String),
    /// Reply with a detected numbered option.
    NumberedReply(usize),
    /// Reply yes or no.
    YesNo(bool),
    /// Single-question immediate submit by option index (button).
    Pick(usize),
    /// Single-question immediate submit via menu (index in values).
    PickMenu,
    /// Record one answer of a multi-question set (button).
    Answer { question: usize, option: usize },
    /// Record one answer via menu (option index in values).
    AnswerMenu { question: usize },
    /// Submit all collected answers.
    SubmitAnswers,
    /// Switch the session mode.
    SetMode(SessionMode),
}

/// Parse a colon-delimited action identifier.
pub fn parse_action(id: &str) -> Option<Action> {
    let mut parts = id.split(':');
    let tag = parts.next()?;
    match tag {
        "stop" => Some(Action::Stop),
        "continue" => Some(Action::Continue),
        "expand" => Some(Action::Expand(parts.next()?.to_string())),
        "opt" => Some(Action::NumberedReply(parts.next()?.parse().ok()?)),
        "yn" => match parts.next()? {
            "yes" => Some(Action::YesNo(true)),
            "no" => Some(Action::YesNo(false)),
            _ => None,
        },
        "pick" => Some(Action::Pick(parts.next()?.parse().ok()?)),
        "pick_menu" => Some(Action::PickMenu),
        "ask" => Some(Action::Answer {
            question: parts.next()?.parse().ok()?,
            option: parts.next()?.parse().ok()?,
        }),
        "ask_menu" => Some(Action::AnswerMenu {
            question: parts.next()?.parse().ok()?,
        }),
        "ask_submit" => Some(Action::SubmitAnswers),
        "mode" => Some(Action::SetMode(parts.next()?.parse().ok()?)),
        _ => None,
    }
}

// ============================================================================
// Router
// ============================================================================

/// What the caller must do after an action was routed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    /// Fully handled inside the router.
    Handled,
    /// The session this action referred to no longer exists.
    SessionNotFound,
    /// Submit `prompt` to the session as a new generation.
    SubmitPrompt { session_id: String, prompt: String },
    /// Continue the session's finished turn.
    ContinueRequested { session_id: String },
}

/// Routes inbound UI actions onto session operations.
#[derive(Clone)]
pub struct ActionRouter {
    registry: SessionRegistry,
    client: Arc<dyn ChatClient>,
    state: Arc<InteractionState>,
}

impl ActionRouter {
    pub fn new(
        registry: SessionRegistry,
        client: Arc<dyn ChatClient>,
        state: Arc<InteractionState>,
    ) -> Self {
        Self {
            registry,
            client,
            state,
        }
    }

    /// Route one inbound action.
    pub async fn handle(&self, data: &ActionData) -> ActionOutcome {
        let Some(action) = parse_action(&data.action_id) else {
            debug!(action_id = %data.action_id, "ignoring unrecognized action");
            return ActionOutcome::Handled;
        };

        let channel_id = data.message.channel_id.clone();

        match action {
            Action::Stop => {
                let Some(session) = self.registry.get_by_channel(&channel_id).await else {
                    return ActionOutcome::SessionNotFound;
                };
                let acted = self.registry.abort_session(&session.id).await;
                debug!(session_id = %session.id, acted, "stop requested");
                ActionOutcome::Handled
            }

            Action::Continue => match self.registry.get_by_channel(&channel_id).await {
                Some(session) => ActionOutcome::ContinueRequested {
                    session_id: session.id,
                },
                None => ActionOutcome::SessionNotFound,
            },

            Action::Expand(id) => {
                match self.state.expand.get(&id) {
                    Some(content) => {
                        for chunk in chunk_message(&content) {
                            if let Err(e) = self
                                .client
                                .send(&channel_id, OutboundMessage::text(chunk))
                                .await
                            {
                                warn!(error = %e, "failed to send expanded content");
                                break;
                            }
                        }
                    }
                    None => {
                        self.notify(&channel_id, "That content has expired.").await;
                    }
                }
                ActionOutcome::Handled
            }

            Action::NumberedReply(n) => self
                .submit_for_channel(&channel_id, n.to_string())
                .await,

            Action::YesNo(yes) => {
                let reply = if yes { "Yes" } else { "No" };
                self.submit_for_channel(&channel_id, reply.to_string()).await
            }

            Action::Pick(option) => self.pick(&data.message, option).await,

            Action::PickMenu => {
                let Some(option) = first_value_index(data) else {
                    return ActionOutcome::Handled;
                };
                self.pick(&data.message, option).await
            }

            Action::Answer { question, option } => self.record(&data.message, question, option).await,

            Action::AnswerMenu { question } => {
                let Some(option) = first_value_index(data) else {
                    return ActionOutcome::Handled;
                };
                self.record(&data.message, question, option).await
            }

            Action::SubmitAnswers => {
                let Some(state) = self.state.pending.take(&data.message) else {
                    self.notify(&channel_id, "Those questions have expired.").await;
                    return ActionOutcome::Handled;
                };
                if self.registry.get(&state.session_id).await.is_none() {
                    return ActionOutcome::SessionNotFound;
                }
                ActionOutcome::SubmitPrompt {
                    session_id: state.session_id.clone(),
                    prompt: state.format_reply(),
                }
            }

            Action::SetMode(mode) => {
                let Some(session) = self.registry.get_by_channel(&channel_id).await else {
                    return ActionOutcome::SessionNotFound;
                };
                if let Err(e) = self.registry.set_mode(&session.id, mode).await {
                    warn!(error = %e, "failed to set mode");
                    return ActionOutcome::SessionNotFound;
                }
                // Re-render the selector with the now-current mode disabled.
                if let Some(mut cached) = self.state.controls.get(&data.message) {
                    for component in cached.components.iter_mut() {
                        if is_mode_row(component) {
                            *component = render::mode_selector(mode);
                        }
                    }
                    if self.client.edit(&data.message, cached.clone()).await.is_ok() {
                        self.state.controls.insert(&data.message, cached);
                    }
                }
                ActionOutcome::Handled
            }
        }
    }

    /// Single-question immediate submit: resolve the chosen label and turn
    /// it into a prompt.
    async fn pick(&self, message: &MessageRef, option: usize) -> ActionOutcome {
        let Some(state) = self.state.pending.take(message) else {
            self.notify(&message.channel_id, "That prompt has expired.").await;
            return ActionOutcome::Handled;
        };
        if self.registry.get(&state.session_id).await.is_none() {
            return ActionOutcome::SessionNotFound;
        }
        let Some(label) = state
            .questions
            .first()
            .and_then(|q| q.options.get(option))
        else {
            return ActionOutcome::Handled;
        };
        ActionOutcome::SubmitPrompt {
            session_id: state.session_id.clone(),
            prompt: label.clone(),
        }
    }

    /// Record one answer of a multi-question set and mark it on the
    /// originating message.
    async fn record(&self, message: &MessageRef, question: usize, option: usize) -> ActionOutcome {
        let Some(state) = self.state.pending.record(message, question, option) else {
            self.notify(&message.channel_id, "Those questions have expired.").await;
            return ActionOutcome::Handled;
        };
        if self.registry.get(&state.session_id).await.is_none() {
            return ActionOutcome::SessionNotFound;
        }
        if let Err(e) = self
            .client
            .edit(message, render_answers_marked(&state))
            .await
        {
            warn!(error = %e, "failed to mark recorded answer");
        }
        ActionOutcome::Handled
    }

    async fn submit_for_channel(&self, channel_id: &str, prompt: String) -> ActionOutcome {
        match self.registry.get_by_channel(channel_id).await {
            Some(session) => ActionOutcome::SubmitPrompt {
                session_id: session.id,
                prompt,
            },
            None => ActionOutcome::SessionNotFound,
        }
    }

    async fn notify(&self, channel_id: &str, text: &str) {
        if let Err(e) = self
            .client
            .send(channel_id, OutboundMessage::text(text))
            .await
        {
            warn!(error = %e, "failed to send notice");
        }
    }
}

/// Re-render a question set with recorded answers marked.
fn render_answers_marked(state: &PendingQuestions) -> OutboundMessage {
    let mut message = render::render_questions(&state.questions);
    let marks: Vec<String> = state
        .questions
        .iter()
        .zip(&state.answers)
        .filter_map(|(question, answer)| {
            let option = answer.and_then(|i| question.options.get(i))?;
            Some(format!("☑ {} — {}", question.question, option))
        })
        .collect();
    if !marks.is_empty() {
        message.text.push_str("\n\n");
        message.text.push_str(&marks.join("\n"));
    }
    message
}

fn is_mode_row(component: &Component) -> bool {
    matches!(component, Component::Buttons { buttons }
        if buttons.first().is_some_and(|b| b.id.starts_with("mode:")))
}

fn first_value_index(data: &ActionData) -> Option<usize> {
    data.values.first()?.parse().ok()
}
