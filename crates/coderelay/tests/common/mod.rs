//! Common test utilities: a recording chat client, a scripted provider,
//! and a full-stack fixture.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::mpsc;

use coderelay::chat::ChatHandler;
use coderelay::config::Config;
use coderelay::interact::InteractionState;
use coderelay::project::ProjectStore;
use coderelay::provider::{
    EventRx, Feature, Provider, ProviderError, ProviderEvent, ProviderKind, ProviderOptions,
    ProviderRegistry, PromptInput,
};
use coderelay::session::{CreateSessionSpec, SessionRegistry};
use coderelay::store::{FileBlobStore, SnapshotWriter};
use coderelay_chat_protocol::{
    ChatClient, ChatError, MessageRef, OutboundMessage, Sender,
};

// ============================================================================
// Recording chat client
// ============================================================================

/// One recorded client operation.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientOp {
    Send { id: String, message: OutboundMessage },
    Edit { id: String, message: OutboundMessage },
    Delete { id: String },
}

/// Chat client that records every operation and tracks message contents.
#[derive(Default)]
pub struct RecordingClient {
    next_id: AtomicU64,
    pub ops: std::sync::Mutex<Vec<ClientOp>>,
    messages: std::sync::Mutex<std::collections::HashMap<String, OutboundMessage>>,
}

impl RecordingClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn ops(&self) -> Vec<ClientOp> {
        self.ops.lock().unwrap().clone()
    }

    /// Current (non-deleted) messages in send order.
    pub fn messages(&self) -> Vec<(String, OutboundMessage)> {
        let map = self.messages.lock().unwrap();
        let mut ids: Vec<String> = map.keys().cloned().collect();
        ids.sort();
        ids.into_iter()
            .map(|id| {
                let content = map[&id].clone();
                (id, content)
            })
            .collect()
    }

    /// Latest message whose content satisfies the predicate.
    pub fn find_message(
        &self,
        predicate: impl Fn(&OutboundMessage) -> bool,
    ) -> Option<(String, OutboundMessage)> {
        self.messages()
            .into_iter()
            .rev()
            .find(|(_, content)| predicate(content))
    }
}

#[async_trait]
impl ChatClient for RecordingClient {
    async fn send(
        &self,
        channel_id: &str,
        message: OutboundMessage,
    ) -> Result<MessageRef, ChatError> {
        let id = format!("m{:04}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.ops.lock().unwrap().push(ClientOp::Send {
            id: id.clone(),
            message: message.clone(),
        });
        self.messages.lock().unwrap().insert(id.clone(), message);
        Ok(MessageRef {
            channel_id: channel_id.to_string(),
            message_id: id,
        })
    }

    async fn edit(&self, message: &MessageRef, content: OutboundMessage) -> Result<(), ChatError> {
        self.ops.lock().unwrap().push(ClientOp::Edit {
            id: message.message_id.clone(),
            message: content.clone(),
        });
        self.messages
            .lock()
            .unwrap()
            .insert(message.message_id.clone(), content);
        Ok(())
    }

    async fn delete(&self, message: &MessageRef) -> Result<(), ChatError> {
        self.ops.lock().unwrap().push(ClientOp::Delete {
            id: message.message_id.clone(),
        });
        self.messages.lock().unwrap().remove(&message.message_id);
        Ok(())
    }

    async fn typing(&self, _channel_id: &str) -> Result<(), ChatError> {
        Ok(())
    }
}

// ============================================================================
// Scripted provider
// ============================================================================

/// Provider that replays a fixed event script for every turn and records
/// the prompts it was given. With `stall`, streams nothing until cancelled.
pub struct ScriptedProvider {
    script: Vec<ProviderEvent>,
    stall: bool,
    pub prompts: std::sync::Mutex<Vec<String>>,
}

impl ScriptedProvider {
    pub fn new(script: Vec<ProviderEvent>) -> Arc<Self> {
        Arc::new(Self {
            script,
            stall: false,
            prompts: std::sync::Mutex::new(Vec::new()),
        })
    }

    pub fn stalling() -> Arc<Self> {
        Arc::new(Self {
            script: Vec::new(),
            stall: true,
            prompts: std::sync::Mutex::new(Vec::new()),
        })
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Claude
    }

    fn supports(&self, feature: Feature) -> bool {
        matches!(feature, Feature::Continue | Feature::AnswerPrompt)
    }

    async fn send_prompt(
        &self,
        prompt: PromptInput,
        opts: ProviderOptions,
    ) -> Result<EventRx, ProviderError> {
        self.prompts.lock().unwrap().push(prompt.text_content());
        let (tx, rx) = mpsc::channel(32);
        let script = self.script.clone();
        let stall = self.stall;
        tokio::spawn(async move {
            if stall {
                opts.cancel.cancelled().await;
                return;
            }
            for event in script {
                if tx.send(Ok(event)).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }

    async fn continue_session(&self, opts: ProviderOptions) -> Result<EventRx, ProviderError> {
        self.send_prompt(PromptInput::Text("(continue)".to_string()), opts)
            .await
    }
}

// ============================================================================
// Fixture
// ============================================================================

/// A full stack over temp storage with a scripted provider.
pub struct Fixture {
    pub registry: SessionRegistry,
    pub projects: ProjectStore,
    pub handler: ChatHandler,
    pub client: Arc<RecordingClient>,
    pub store: Arc<FileBlobStore>,
    pub interaction: Arc<InteractionState>,
    pub workdir: std::path::PathBuf,
    _temp: TempDir,
}

impl Fixture {
    pub async fn new(provider: Arc<dyn Provider>) -> Self {
        let temp = TempDir::new().unwrap();
        let workdir = temp.path().join("work");
        std::fs::create_dir_all(&workdir).unwrap();

        let config = Arc::new(Config {
            allow_all_users: false,
            allowed_users: vec!["user-1".to_string()],
            allowed_roots: vec![temp.path().to_path_buf()],
            default_directory: None,
            rate_limit_ms: 50,
            retention_hours: 72,
            data_dir: temp.path().join("data"),
            providers: Default::default(),
        });

        let store = Arc::new(FileBlobStore::new(temp.path().join("data")));
        let writer = SnapshotWriter::spawn(store.clone());
        let providers = Arc::new(ProviderRegistry::new());
        providers.register(provider).await;
        let projects = ProjectStore::new(writer.clone());
        let registry =
            SessionRegistry::new(providers, projects.clone(), writer, config.clone());

        let client = RecordingClient::new();
        let interaction = InteractionState::new();
        let handler = ChatHandler::new(
            registry.clone(),
            projects.clone(),
            client.clone(),
            config,
            interaction.clone(),
        );

        Self {
            registry,
            projects,
            handler,
            client,
            store,
            interaction,
            workdir,
            _temp: temp,
        }
    }

    /// Create a session bound to `channel_id`.
    pub async fn session(&self, name: &str, channel_id: &str) -> String {
        let session = self
            .registry
            .create_session(CreateSessionSpec {
                name: name.to_string(),
                directory: self.workdir.clone(),
                channel_id: Some(channel_id.to_string()),
                project: None,
                provider: ProviderKind::Claude,
                resume_token: None,
                recover_existing: false,
            })
            .await
            .unwrap();
        session.id
    }
}

/// The allow-listed test user.
pub fn allowed_sender() -> Sender {
    Sender {
        id: "user-1".to_string(),
        display_name: Some("Dev".to_string()),
    }
}

/// A user not on the allow-list.
pub fn blocked_sender() -> Sender {
    Sender {
        id: "intruder".to_string(),
        display_name: None,
    }
}
