//! Output streamer: turns the unified event stream into incrementally
//! edited chat messages.
//!
//! Text deltas buffer into a draft that flushes on a debounce interval, so
//! outbound edit volume stays bounded no matter how fast the backend
//! streams. Structured events short-circuit the draft: pending text is
//! finalized (or, for questions, discarded) before the event renders its
//! own message, so free text and structured events never share a bubble.
//!
//! The internal `flushing` bit guarantees at most one outbound edit in
//! flight per live message; a flush requested while one is running is
//! coalesced into exactly one follow-up.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use coderelay_chat_protocol::{
    ChatClient, ChatError, MessageRef, OutboundMessage, chunk_message,
};
use tokio::sync::{Mutex, Notify};
use tracing::warn;

use crate::interact::InteractionState;
use crate::provider::{ProviderEvent, is_abort_error};
use crate::session::SessionMode;

pub mod detect;
pub mod expand;
pub mod render;

pub use expand::ExpandableStore;

/// Per-turn rendering options.
#[derive(Debug, Clone)]
pub struct StreamerConfig {
    /// Debounce interval between incremental edits.
    pub rate_limit: Duration,
    /// Render all tool calls, not just the always-visible set.
    pub verbose: bool,
    /// Session mode, shown in the summary and mode selector.
    pub mode: SessionMode,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            rate_limit: Duration::from_millis(500),
            verbose: false,
            mode: SessionMode::Normal,
        }
    }
}

/// Side effect the caller must apply after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamDirective {
    /// Clear the session's backend resume token.
    ResetSession,
}

#[derive(Default)]
struct State {
    /// Full intended content of the live message.
    draft: String,
    /// The currently editable message, if any.
    live: Option<MessageRef>,
    /// An outbound edit is in flight.
    flushing: bool,
    /// Text arrived while flushing; exactly one follow-up flush is owed.
    dirty: bool,
    /// A debounce timer is pending.
    timer_scheduled: bool,
    /// All text streamed this turn, for inline-prompt detection.
    turn_text: String,
    /// Tool invocation ids whose start was rendered.
    rendered_tools: HashSet<String>,
}

/// Renders one turn's event stream into a channel.
#[derive(Clone)]
pub struct OutputStreamer {
    client: Arc<dyn ChatClient>,
    channel_id: String,
    session_id: String,
    cfg: StreamerConfig,
    interaction: Arc<InteractionState>,
    state: Arc<Mutex<State>>,
    flush_done: Arc<Notify>,
}

impl OutputStreamer {
    pub fn new(
        client: Arc<dyn ChatClient>,
        channel_id: impl Into<String>,
        session_id: impl Into<String>,
        cfg: StreamerConfig,
        interaction: Arc<InteractionState>,
    ) -> Self {
        Self {
            client,
            channel_id: channel_id.into(),
            session_id: session_id.into(),
            cfg,
            interaction,
            state: Arc::new(Mutex::new(State::default())),
            flush_done: Arc::new(Notify::new()),
        }
    }

    // ------------------------------------------------------------------------
    // Event handling
    // ------------------------------------------------------------------------

    /// Render one unified event.
    pub async fn handle_event(
        &self,
        event: &ProviderEvent,
    ) -> Result<Option<StreamDirective>, ChatError> {
        match event {
            ProviderEvent::TextDelta { text } => {
                self.append_text(text).await;
                Ok(None)
            }

            ProviderEvent::Reasoning { text } => {
                if self.cfg.verbose {
                    self.finalize_text().await?;
                    self.send(render::render_reasoning(text)).await?;
                }
                Ok(None)
            }

            ProviderEvent::ToolStart { id, name, input } => {
                if render::tool_visible(name, self.cfg.verbose) {
                    self.finalize_text().await?;
                    self.send(render::render_tool_start(
                        name,
                        input,
                        &self.interaction.expand,
                    ))
                    .await?;
                    self.state.lock().await.rendered_tools.insert(id.clone());
                }
                Ok(None)
            }

            ProviderEvent::ToolResult {
                id,
                output,
                is_error,
            } => {
                // A result renders only when its start did.
                let show = self.state.lock().await.rendered_tools.remove(id);
                if show {
                    self.finalize_text().await?;
                    self.send(render::render_tool_result(
                        output,
                        *is_error,
                        &self.interaction.expand,
                    ))
                    .await?;
                }
                Ok(None)
            }

            ProviderEvent::AskUser { questions } => {
                // Speculative partial text streamed just before a question is
                // noise: discard it rather than finalize.
                self.discard_draft().await?;
                let message = self.send(render::render_questions(questions)).await?;
                self.interaction
                    .pending
                    .insert(&message, &self.session_id, questions.clone());
                Ok(None)
            }

            ProviderEvent::TaskUpdate { tasks } => {
                self.finalize_text().await?;
                self.send(render::render_task_board(tasks)).await?;
                Ok(None)
            }

            ProviderEvent::TodoList { items } => {
                self.finalize_text().await?;
                self.send(render::render_todo_list(items)).await?;
                Ok(None)
            }

            ProviderEvent::CommandExec {
                command,
                exit_code,
                output,
            } => {
                self.finalize_text().await?;
                self.send(render::render_command(
                    command,
                    *exit_code,
                    output.as_deref(),
                    &self.interaction.expand,
                ))
                .await?;
                Ok(None)
            }

            ProviderEvent::FileChange { path, kind } => {
                self.finalize_text().await?;
                self.send(render::render_file_change(path, *kind)).await?;
                Ok(None)
            }

            ProviderEvent::ImageFile { path } => {
                self.finalize_text().await?;
                self.send(render::render_image(path)).await?;
                Ok(None)
            }

            // Registry side effect; nothing to render.
            ProviderEvent::SessionInit { .. } => Ok(None),

            ProviderEvent::TurnResult {
                success,
                cost_usd,
                duration_ms,
                turns,
                errors,
            } => {
                self.finalize_text().await?;
                let trailing = self.state.lock().await.turn_text.clone();
                let reset = !*success && !errors.iter().any(|e| is_abort_error(e));
                let summary = render::render_result_summary(
                    *success,
                    *cost_usd,
                    *duration_ms,
                    *turns,
                    self.cfg.mode,
                    errors,
                    reset,
                    &trailing,
                );
                let message = self.send(summary.clone()).await?;
                // Cached so the router can re-render the mode selector later.
                self.interaction.controls.insert(&message, summary);
                Ok(reset.then_some(StreamDirective::ResetSession))
            }

            ProviderEvent::Error { message } => {
                self.finalize_text().await?;
                self.send(render::render_error(message, false)).await?;
                Ok(None)
            }
        }
    }

    /// Adapter-level stream failure: finalize pending text and, unless the
    /// error is abort-classified, render it with a session-reset notice.
    pub async fn on_stream_error(
        &self,
        message: &str,
    ) -> Result<Option<StreamDirective>, ChatError> {
        self.finalize_text().await?;
        if is_abort_error(message) {
            return Ok(None);
        }
        self.send(render::render_error(message, true)).await?;
        Ok(Some(StreamDirective::ResetSession))
    }

    /// Terminal finalize: drain the timer, wait out an in-flight flush, do
    /// one last flush, and strip interactive controls from the settled
    /// message.
    pub async fn finalize(&self) -> Result<(), ChatError> {
        self.finalize_text().await
    }

    // ------------------------------------------------------------------------
    // Text buffering & flush machine
    // ------------------------------------------------------------------------

    async fn append_text(&self, text: &str) {
        {
            let mut s = self.state.lock().await;
            s.draft.push_str(text);
            s.turn_text.push_str(text);
        }
        self.schedule_flush().await;
    }

    /// Schedule a debounced flush. A flush in progress suppresses new timer
    /// scheduling and instead owes exactly one follow-up.
    fn schedule_flush(
        &self,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        // Returning an explicitly boxed `Send` future (rather than an
        // `async fn` opaque type) breaks the recursive-async `Send`
        // inference cycle: schedule_flush -> spawn -> release_flush_slot
        // -> schedule_flush.
        Box::pin(async move {
            {
                let mut s = self.state.lock().await;
                if s.flushing {
                    s.dirty = true;
                    return;
                }
                if s.timer_scheduled {
                    return;
                }
                s.timer_scheduled = true;
            }

            let streamer = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(streamer.cfg.rate_limit).await;
                {
                    let mut s = streamer.state.lock().await;
                    s.timer_scheduled = false;
                    if s.flushing {
                        s.dirty = true;
                        return;
                    }
                    if s.draft.is_empty() {
                        return;
                    }
                    s.flushing = true;
                }
                if let Err(e) = streamer.run_flush().await {
                    warn!(error = %e, "flush failed");
                }
                streamer.release_flush_slot().await;
            });
        })
    }

    /// Flush the draft. Caller must hold the flush slot (`flushing` set).
    ///
    /// Overflowing drafts finalize their head chunks into immutable
    /// messages; only the tail stays live-editable.
    async fn run_flush(&self) -> Result<(), ChatError> {
        loop {
            let (content, live, overflow) = {
                let s = self.state.lock().await;
                if s.draft.is_empty() {
                    (String::new(), None, false)
                } else {
                    let chunks = chunk_message(&s.draft);
                    (chunks[0].to_string(), s.live.clone(), chunks.len() > 1)
                }
            };

            if content.is_empty() {
                break;
            }

            // The live message keeps a stop control; a finalized overflow
            // head does not.
            let message = if overflow {
                OutboundMessage::text(content.clone())
            } else {
                OutboundMessage::text(content.clone())
                    .with_components(vec![render::stop_control()])
            };

            let new_live = match &live {
                Some(r) => {
                    self.client.edit(r, message).await?;
                    live.clone()
                }
                None => Some(self.client.send(&self.channel_id, message).await?),
            };

            let mut s = self.state.lock().await;
            if overflow {
                s.draft = s.draft[content.len()..]
                    .trim_start_matches('\n')
                    .to_string();
                s.live = None;
                // Loop again: flush the tail immediately.
            } else {
                s.live = new_live;
                break;
            }
        }

        Ok(())
    }

    async fn release_flush_slot(&self) {
        let owed = {
            let mut s = self.state.lock().await;
            s.flushing = false;
            std::mem::take(&mut s.dirty)
        };
        self.flush_done.notify_waiters();
        if owed {
            // No lost updates: exactly one follow-up.
            self.schedule_flush().await;
        }
    }

    /// Acquire the flush slot, waiting out any in-flight flush.
    async fn claim_flush_slot(&self) {
        loop {
            let notified = self.flush_done.notified();
            {
                let mut s = self.state.lock().await;
                if !s.flushing {
                    s.flushing = true;
                    // Any pending timer becomes a no-op: it finds the slot
                    // taken and defers to the owed-flush accounting.
                    s.timer_scheduled = false;
                    break;
                }
            }
            notified.await;
        }
    }

    /// Flush remaining text and settle the live message: its interactive
    /// controls are stripped and it will never be edited again.
    async fn finalize_text(&self) -> Result<(), ChatError> {
        self.claim_flush_slot().await;
        let result = self.finalize_text_locked().await;
        self.release_flush_slot().await;
        result
    }

    /// Finalize while holding the flush slot.
    async fn finalize_text_locked(&self) -> Result<(), ChatError> {
        self.run_flush().await?;
        let (live, content) = {
            let mut s = self.state.lock().await;
            (s.live.take(), std::mem::take(&mut s.draft))
        };
        if let Some(r) = live {
            self.client
                .edit(&r, OutboundMessage::text(content))
                .await?;
        }
        Ok(())
    }

    /// Drop the speculative draft: the live message, if any, is deleted
    /// rather than finalized.
    async fn discard_draft(&self) -> Result<(), ChatError> {
        self.claim_flush_slot().await;
        let live = {
            let mut s = self.state.lock().await;
            s.draft.clear();
            s.live.take()
        };
        self.release_flush_slot().await;
        if let Some(r) = live {
            self.client.delete(&r).await?;
        }
        Ok(())
    }

    async fn send(&self, message: OutboundMessage) -> Result<MessageRef, ChatError> {
        self.client.send(&self.channel_id, message).await
    }
}
