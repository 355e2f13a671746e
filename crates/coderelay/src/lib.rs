//! Provider-agnostic streaming session core.
//!
//! coderelay mediates between a chat front end and pluggable AI
//! coding-agent backends. The pieces:
//!
//! - [`provider`]: the unified [`provider::ProviderEvent`] vocabulary, the
//!   adapter contract, and the two backend adapters.
//! - [`session`]: the concurrency-safe session registry, single source of
//!   truth for generation state.
//! - [`stream`]: the output streamer turning event streams into
//!   rate-limited incremental message edits.
//! - [`interact`]: routing of button clicks and menu selections back onto
//!   session operations.
//! - [`chat`]: the inbound message boundary.
//! - [`project`], [`store`], [`config`], [`process`]: supporting state.
//!
//! The chat platform itself is behind the `coderelay-chat-protocol` crate's
//! `ChatClient` contract; the core never touches a platform SDK directly.

pub mod chat;
pub mod config;
pub mod interact;
pub mod process;
pub mod project;
pub mod provider;
pub mod session;
pub mod store;
pub mod stream;
