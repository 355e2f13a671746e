//! Chat platform boundary types for coderelay.
//!
//! This crate defines the vocabulary the session core uses to talk to a chat
//! front end: rich outbound messages (text, structured fields, interactive
//! components), handles to delivered messages, and inbound user actions
//! (button clicks, menu selections).
//!
//! The core assumes nothing about the platform beyond the [`ChatClient`]
//! contract: create message → get message handle → edit handle → delete
//! handle, plus a typing indicator. Everything platform-specific (gateway
//! connections, slash commands, channel management) lives behind it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Platform message character limit.
///
/// Outbound text longer than this must be chunked; the output streamer uses
/// the same bound to decide when a live draft overflows into a finalized
/// message.
pub const MAX_MESSAGE_LENGTH: usize = 2000;

// ============================================================================
// Outbound Messages
// ============================================================================

/// A rich message the core asks the platform to deliver or edit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Main text body.
    pub text: String,
    /// Structured name/value fields rendered below the body.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<MessageField>,
    /// Interactive component rows attached to the message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub components: Vec<Component>,
}

impl OutboundMessage {
    /// Create a plain text message.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    /// Append a structured field.
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push(MessageField {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    /// Attach interactive component rows.
    #[must_use]
    pub fn with_components(mut self, components: Vec<Component>) -> Self {
        self.components = components;
        self
    }

    /// Return a copy of this message with all interactive controls removed.
    #[must_use]
    pub fn without_components(&self) -> Self {
        Self {
            text: self.text.clone(),
            fields: self.fields.clone(),
            components: Vec::new(),
        }
    }
}

/// A structured name/value field on an outbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageField {
    pub name: String,
    pub value: String,
}

/// One row of interactive controls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Component {
    /// A row of up to five buttons.
    Buttons { buttons: Vec<Button> },
    /// A single-choice selection menu.
    Select { menu: SelectMenu },
}

/// An interactive button.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Button {
    /// Opaque action identifier delivered back on click.
    pub id: String,
    /// Label displayed to the user.
    pub label: String,
    #[serde(default)]
    pub style: ButtonStyle,
    #[serde(default)]
    pub disabled: bool,
}

impl Button {
    /// Create an enabled primary-style button.
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            style: ButtonStyle::Primary,
            disabled: false,
        }
    }

    /// Set the button style.
    #[must_use]
    pub fn style(mut self, style: ButtonStyle) -> Self {
        self.style = style;
        self
    }

    /// Mark the button disabled.
    #[must_use]
    pub fn disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }
}

/// Visual style of a button.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ButtonStyle {
    #[default]
    Primary,
    Secondary,
    Success,
    Danger,
}

/// A single-choice selection menu.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectMenu {
    /// Opaque action identifier delivered back with the chosen value.
    pub id: String,
    pub placeholder: String,
    pub options: Vec<SelectOption>,
}

/// One entry in a selection menu.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectOption {
    /// Value delivered back when chosen.
    pub value: String,
    /// Label displayed to the user.
    pub label: String,
}

// ============================================================================
// Handles & Inbound Data
// ============================================================================

/// Handle to a delivered message, sufficient to edit or delete it later.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageRef {
    pub channel_id: String,
    pub message_id: String,
}

/// Who performed an inbound action or sent a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sender {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// An inbound interactive action: a button click or a menu selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionData {
    /// The message the component was attached to.
    pub message: MessageRef,
    pub sender: Sender,
    /// The component's opaque action identifier.
    pub action_id: String,
    /// Selected values, for menu selections. Empty for button clicks.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

/// A file attached to an inbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundAttachment {
    pub url: String,
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

impl InboundAttachment {
    /// Whether this attachment looks like an image the backends can consume.
    pub fn is_image(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(|ct| ct.starts_with("image/"))
    }
}

// ============================================================================
// Client Contract
// ============================================================================

/// Errors surfaced by a chat platform client.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("channel not found: {0}")]
    ChannelNotFound(String),

    #[error("message not found: {0}/{1}")]
    MessageNotFound(String, String),

    #[error("rate limited by platform")]
    RateLimited,

    #[error("platform error: {0}")]
    Platform(String),
}

/// The operations the core needs from a chat platform.
///
/// Implementations are expected to chunk text wider than
/// [`MAX_MESSAGE_LENGTH`] on `send`; `edit` receives content the core has
/// already bounded, so oversized edits may be rejected.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Deliver a message to a channel, returning a handle to it.
    async fn send(&self, channel_id: &str, message: OutboundMessage)
    -> Result<MessageRef, ChatError>;

    /// Replace the content of a previously delivered message.
    async fn edit(&self, message: &MessageRef, content: OutboundMessage) -> Result<(), ChatError>;

    /// Delete a previously delivered message.
    async fn delete(&self, message: &MessageRef) -> Result<(), ChatError>;

    /// Show a typing indicator in a channel. Best effort.
    async fn typing(&self, channel_id: &str) -> Result<(), ChatError>;
}

// ============================================================================
// Chunking
// ============================================================================

/// Split text into chunks that fit the platform message limit.
///
/// Prefers splitting at a newline inside the limit; falls back to the nearest
/// char boundary.
pub fn chunk_message(content: &str) -> Vec<&str> {
    if content.len() <= MAX_MESSAGE_LENGTH {
        return vec![content];
    }

    let mut chunks = Vec::new();
    let mut remaining = content;

    while !remaining.is_empty() {
        if remaining.len() <= MAX_MESSAGE_LENGTH {
            chunks.push(remaining);
            break;
        }

        let boundary = floor_char_boundary(remaining, MAX_MESSAGE_LENGTH);
        let split_at = remaining[..boundary].rfind('\n').unwrap_or(boundary);
        // A leading newline would produce an empty chunk; split at the boundary instead.
        let split_at = if split_at == 0 { boundary } else { split_at };

        let (chunk, rest) = remaining.split_at(split_at);
        chunks.push(chunk);
        remaining = rest.strip_prefix('\n').unwrap_or(rest);
    }

    chunks
}

/// Largest index `<= at` that lies on a char boundary.
fn floor_char_boundary(s: &str, at: usize) -> usize {
    let mut idx = at.min(s.len());
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}
