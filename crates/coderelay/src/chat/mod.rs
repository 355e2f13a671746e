//! Inbound boundary: user messages and UI actions from the chat platform.
//!
//! One handler per process. Messages are gated by the user allow-list,
//! routed to the session owning the channel, and drive one turn: prompt →
//! provider events → output streamer. A new message while a turn is running
//! pre-empts it: the turn is cancelled and the handler waits a short grace
//! period before proceeding regardless.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use coderelay_chat_protocol::{ActionData, ChatClient, InboundAttachment, Sender};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::Config;
use crate::interact::{ActionOutcome, ActionRouter, InteractionState};
use crate::project::ProjectStore;
use crate::provider::{ContentBlock, EventRx, PromptInput};
use crate::session::{Session, SessionError, SessionRegistry};
use crate::stream::{OutputStreamer, StreamDirective, StreamerConfig};

/// How long a pre-empting message waits for the cancelled turn to wind down
/// before proceeding regardless.
const PREEMPT_GRACE: Duration = Duration::from_secs(2);

/// Messages starting with this sigil invoke a project skill.
const SKILL_SIGIL: char = '+';

/// Handles inbound chat traffic for every session.
#[derive(Clone)]
pub struct ChatHandler {
    registry: SessionRegistry,
    projects: ProjectStore,
    client: Arc<dyn ChatClient>,
    config: Arc<Config>,
    interaction: Arc<InteractionState>,
    router: ActionRouter,
    http: reqwest::Client,
}

impl ChatHandler {
    pub fn new(
        registry: SessionRegistry,
        projects: ProjectStore,
        client: Arc<dyn ChatClient>,
        config: Arc<Config>,
        interaction: Arc<InteractionState>,
    ) -> Self {
        let router = ActionRouter::new(registry.clone(), client.clone(), interaction.clone());
        Self {
            registry,
            projects,
            client,
            config,
            interaction,
            router,
            http: reqwest::Client::new(),
        }
    }

    // ------------------------------------------------------------------------
    // Inbound messages
    // ------------------------------------------------------------------------

    /// Handle one inbound user message.
    pub async fn on_message(
        &self,
        channel_id: &str,
        sender: &Sender,
        text: &str,
        attachments: &[InboundAttachment],
    ) {
        if !self.config.user_allowed(&sender.id) {
            debug!(sender_id = %sender.id, "message denied by allow-list");
            return;
        }
        let Some(session) = self.registry.get_by_channel(channel_id).await else {
            debug!(channel_id = %channel_id, "no session for channel");
            return;
        };

        self.preempt_if_generating(&session.id).await;

        let text = self.expand_skill(&session, text).await;
        let prompt = self.build_prompt(text, attachments).await;

        let _ = self.client.typing(channel_id).await;
        match self.registry.send_prompt(&session.id, prompt).await {
            Ok(rx) => self.drive_turn(&session.id, channel_id, rx).await,
            Err(SessionError::Busy(_)) => {
                self.notify(channel_id, "Still working on the previous message.")
                    .await;
            }
            Err(e) => {
                warn!(session_id = %session.id, error = %e, "failed to start turn");
                self.notify(channel_id, &format!("Could not start: {e}")).await;
            }
        }
    }

    /// Handle one inbound UI action.
    pub async fn on_action(&self, data: &ActionData) {
        let channel_id = data.message.channel_id.clone();
        match self.router.handle(data).await {
            ActionOutcome::Handled => {}
            ActionOutcome::SessionNotFound => {
                self.notify(&channel_id, "That session no longer exists.").await;
            }
            ActionOutcome::SubmitPrompt { session_id, prompt } => {
                self.submit(&session_id, prompt).await;
            }
            ActionOutcome::ContinueRequested { session_id } => {
                match self.registry.continue_session(&session_id).await {
                    Ok(rx) => self.drive_turn(&session_id, &channel_id, rx).await,
                    Err(e) => {
                        warn!(session_id = %session_id, error = %e, "continue failed");
                        self.notify(&channel_id, &format!("Could not continue: {e}"))
                            .await;
                    }
                }
            }
        }
    }

    /// The destination channel was deleted: the session ends with it.
    pub async fn on_channel_deleted(&self, channel_id: &str) {
        if let Some(id) = self.registry.unlink_channel(channel_id).await {
            debug!(session_id = %id, "session ended with deleted channel");
        }
    }

    // ------------------------------------------------------------------------
    // Turn driving
    // ------------------------------------------------------------------------

    async fn submit(&self, session_id: &str, prompt: String) {
        let Some(session) = self.registry.get(session_id).await else {
            return;
        };
        let Some(channel_id) = session.channel_id.clone() else {
            return;
        };
        self.preempt_if_generating(session_id).await;
        match self
            .registry
            .send_prompt(session_id, PromptInput::Text(prompt))
            .await
        {
            Ok(rx) => self.drive_turn(session_id, &channel_id, rx).await,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "failed to submit reply");
                self.notify(&channel_id, &format!("Could not submit: {e}")).await;
            }
        }
    }

    /// Pump one turn's events into a fresh streamer.
    async fn drive_turn(&self, session_id: &str, channel_id: &str, mut rx: EventRx) {
        let (verbose, mode) = match self.registry.get(session_id).await {
            Some(s) => (s.verbose, s.mode),
            None => (false, Default::default()),
        };
        let streamer = OutputStreamer::new(
            self.client.clone(),
            channel_id,
            session_id,
            StreamerConfig {
                rate_limit: Duration::from_millis(self.config.rate_limit_ms),
                verbose,
                mode,
            },
            self.interaction.clone(),
        );

        while let Some(item) = rx.recv().await {
            let outcome = match item {
                Ok(event) => streamer.handle_event(&event).await,
                Err(e) => streamer.on_stream_error(&e.to_string()).await,
            };
            match outcome {
                Ok(Some(StreamDirective::ResetSession)) => {
                    if let Err(e) = self.registry.reset_provider_session(session_id).await {
                        warn!(session_id = %session_id, error = %e, "failed to reset session");
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "render failed");
                }
            }
        }

        if let Err(e) = streamer.finalize().await {
            warn!(session_id = %session_id, error = %e, "finalize failed");
        }
    }

    /// Cancel a running turn and give it a bounded grace period to wind
    /// down, then proceed regardless.
    async fn preempt_if_generating(&self, session_id: &str) {
        let generating = self
            .registry
            .get(session_id)
            .await
            .is_some_and(|s| s.is_generating);
        if !generating {
            return;
        }

        debug!(session_id = %session_id, "pre-empting running turn");
        self.registry.abort_session(session_id).await;

        let deadline = Instant::now() + PREEMPT_GRACE;
        while Instant::now() < deadline {
            let still = self
                .registry
                .get(session_id)
                .await
                .is_some_and(|s| s.is_generating);
            if !still {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    // ------------------------------------------------------------------------
    // Prompt assembly
    // ------------------------------------------------------------------------

    /// Expand a `+skill input` invocation through the project store.
    async fn expand_skill(&self, session: &Session, text: &str) -> String {
        let Some((name, input)) = parse_skill_invocation(text) else {
            return text.to_string();
        };
        let Some(project) = self.projects.for_directory(&session.directory).await else {
            return text.to_string();
        };
        match self.projects.render_skill(&project.name, name, input).await {
            Some(rendered) => rendered,
            None => text.to_string(),
        }
    }

    /// Build typed prompt content, inlining image attachments.
    async fn build_prompt(&self, text: String, attachments: &[InboundAttachment]) -> PromptInput {
        let images: Vec<&InboundAttachment> =
            attachments.iter().filter(|a| a.is_image()).collect();
        if images.is_empty() {
            return PromptInput::Text(text);
        }

        let mut blocks = vec![ContentBlock::Text { text }];
        for attachment in images {
            match self.fetch_attachment(&attachment.url).await {
                Ok(bytes) => blocks.push(ContentBlock::ImageInline {
                    media_type: attachment
                        .content_type
                        .clone()
                        .unwrap_or_else(|| "image/png".to_string()),
                    data: base64::engine::general_purpose::STANDARD.encode(bytes),
                }),
                Err(e) => {
                    warn!(url = %attachment.url, error = %e, "failed to fetch attachment");
                }
            }
        }
        PromptInput::Blocks(blocks)
    }

    async fn fetch_attachment(&self, url: &str) -> Result<Vec<u8>, reqwest::Error> {
        let response = self.http.get(url).send().await?.error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }

    async fn notify(&self, channel_id: &str, text: &str) {
        use coderelay_chat_protocol::OutboundMessage;
        if let Err(e) = self
            .client
            .send(channel_id, OutboundMessage::text(text))
            .await
        {
            warn!(error = %e, "failed to send notice");
        }
    }
}

/// Parse a `+name input` skill invocation.
fn parse_skill_invocation(text: &str) -> Option<(&str, &str)> {
    let rest = text.strip_prefix(SKILL_SIGIL)?;
    if rest.is_empty() || rest.starts_with(char::is_whitespace) {
        return None;
    }
    match rest.split_once(char::is_whitespace) {
        Some((name, input)) => Some((name, input.trim())),
        None => Some((rest, "")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skill_invocation_parsing() {
        assert_eq!(
            parse_skill_invocation("+review src/auth.rs"),
            Some(("review", "src/auth.rs"))
        );
        assert_eq!(parse_skill_invocation("+deploy"), Some(("deploy", "")));
        assert_eq!(parse_skill_invocation("plain message"), None);
        assert_eq!(parse_skill_invocation("+ not a skill"), None);
        assert_eq!(parse_skill_invocation("+"), None);
    }
}
