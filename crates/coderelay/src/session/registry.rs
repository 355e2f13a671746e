//! Session registry: the single source of truth for generation state.
//!
//! In-memory map of sessions keyed by id and by front-end channel. Every
//! prompt, continuation, mode change, and abort flows through here. State
//! changes that matter across restarts are persisted as one JSON snapshot
//! through the serialized write queue; write failures are logged, never
//! fatal.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::process::tmux;
use crate::project::ProjectStore;
use crate::provider::{
    EVENT_CHANNEL_CAPACITY, EventRx, Feature, PromptInput, ProviderEvent, ProviderKind,
    ProviderOptions, ProviderRegistry,
};
use crate::store::{BlobStore, SESSIONS_SNAPSHOT, SnapshotWriter};

use super::snapshot::sanitize;
use super::{Session, SessionError, SessionMode};

// ============================================================================
// Types
// ============================================================================

/// What `create_session` needs.
#[derive(Debug, Clone)]
pub struct CreateSessionSpec {
    /// Requested name; deduplicated into the final id.
    pub name: String,
    pub directory: std::path::PathBuf,
    /// Front-end destination. `None` while the caller has not yet created
    /// its durable channel.
    pub channel_id: Option<String>,
    /// Project name; defaults to the directory's basename.
    pub project: Option<String>,
    pub provider: ProviderKind,
    /// Backend resume token, when reattaching an existing conversation.
    pub resume_token: Option<String>,
    /// Treat a name collision as a hard error instead of suffixing. Used
    /// when adopting an orphaned backend session discovered out-of-band.
    pub recover_existing: bool,
}

struct Inner {
    sessions: HashMap<String, Session>,
    by_channel: HashMap<String, String>,
    cancels: HashMap<String, CancellationToken>,
}

/// Registry of live sessions. Cheap to clone.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RwLock<Inner>>,
    providers: Arc<ProviderRegistry>,
    projects: ProjectStore,
    writer: SnapshotWriter,
    config: Arc<Config>,
}

impl SessionRegistry {
    pub fn new(
        providers: Arc<ProviderRegistry>,
        projects: ProjectStore,
        writer: SnapshotWriter,
        config: Arc<Config>,
    ) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                sessions: HashMap::new(),
                by_channel: HashMap::new(),
                cancels: HashMap::new(),
            })),
            providers,
            projects,
            writer,
            config,
        }
    }

    // ------------------------------------------------------------------------
    // Load / Persist / Shutdown
    // ------------------------------------------------------------------------

    /// Load the session snapshot, dropping invalid entries and recreating
    /// missing terminal mirrors.
    pub async fn load(&self, store: &dyn BlobStore) {
        let loaded: Vec<Session> = match store.read(SESSIONS_SNAPSHOT).await {
            Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
                Ok(list) => list,
                Err(e) => {
                    warn!(error = %e, "session snapshot is corrupt, starting empty");
                    return;
                }
            },
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "failed to read session snapshot, starting empty");
                return;
            }
        };

        let result = sanitize(loaded);

        for session in &result.sessions {
            if self.provider_supports(session.provider, Feature::Tmux).await {
                let name = tmux::session_name(&session.id);
                if !tmux::has_session(&name).await {
                    debug!(session_id = %session.id, "recreating missing tmux mirror");
                    if let Err(e) = tmux::create_session(&name, &session.directory).await {
                        warn!(session_id = %session.id, error = %e, "failed to recreate tmux mirror");
                    }
                }
            }
        }

        let count = result.sessions.len();
        {
            let mut inner = self.inner.write().await;
            for session in result.sessions {
                if let Some(channel) = &session.channel_id {
                    inner.by_channel.insert(channel.clone(), session.id.clone());
                }
                inner.sessions.insert(session.id.clone(), session);
            }
        }

        info!(count, dropped = result.dropped, "loaded sessions");
        if result.dropped > 0 {
            self.persist().await;
        }
    }

    /// Queue a snapshot write of all addressable sessions.
    ///
    /// Sessions with a placeholder channel are excluded: they have no
    /// durable front-end address yet, and persisting them would create
    /// zombie entries on reload.
    pub async fn persist(&self) {
        let sessions: Vec<Session> = {
            let inner = self.inner.read().await;
            inner
                .sessions
                .values()
                .filter(|s| s.has_channel())
                .cloned()
                .collect()
        };
        match serde_json::to_vec_pretty(&sessions) {
            Ok(bytes) => self.writer.enqueue(SESSIONS_SNAPSHOT, bytes),
            Err(e) => warn!(error = %e, "failed to serialize session snapshot"),
        }
    }

    /// Final snapshot flush. Call once on process shutdown.
    pub async fn shutdown(&self) {
        self.persist().await;
        self.writer.flush().await;
        info!("session registry shutdown complete");
    }

    // ------------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------------

    pub async fn get(&self, id: &str) -> Option<Session> {
        self.inner.read().await.sessions.get(id).cloned()
    }

    pub async fn get_by_channel(&self, channel_id: &str) -> Option<Session> {
        let inner = self.inner.read().await;
        let id = inner.by_channel.get(channel_id)?;
        inner.sessions.get(id).cloned()
    }

    pub async fn all(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> =
            self.inner.read().await.sessions.values().cloned().collect();
        sessions.sort_by(|a, b| a.id.cmp(&b.id));
        sessions
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Create a session, deduplicating its id against live sessions (and
    /// tmux sessions for terminal-mirrored providers).
    pub async fn create_session(&self, spec: CreateSessionSpec) -> Result<Session, SessionError> {
        if !spec.directory.is_absolute() || !self.config.directory_allowed(&spec.directory) {
            return Err(SessionError::DirectoryNotAllowed(
                spec.directory.display().to_string(),
            ));
        }
        match tokio::fs::metadata(&spec.directory).await {
            Ok(meta) if meta.is_dir() => {}
            _ => {
                return Err(SessionError::InvalidDirectory(
                    spec.directory.display().to_string(),
                ));
            }
        }

        // Resolve (and lazily install) the provider before touching state.
        let provider = self.providers.ensure(spec.provider).await?;
        let tmux_capable = provider.supports(Feature::Tmux);

        let base = slugify(&spec.name);
        let id = loop {
            let taken: HashSet<String> = {
                let inner = self.inner.read().await;
                inner.sessions.keys().cloned().collect()
            };

            let candidate =
                dedup_name(&base, &taken, spec.recover_existing, |name| async move {
                    tmux_capable && tmux::has_session(&tmux::session_name(&name)).await
                })
                .await?;

            // The probe ran without the lock; re-check before committing.
            let inner = self.inner.read().await;
            if !inner.sessions.contains_key(&candidate) {
                break candidate;
            }
        };

        if tmux_capable {
            let name = tmux::session_name(&id);
            if !tmux::has_session(&name).await
                && let Err(e) = tmux::create_session(&name, &spec.directory).await
            {
                warn!(session_id = %id, error = %e, "failed to create tmux mirror");
            }
        }

        let mut session = Session::new(&id, &spec.directory, spec.provider);
        session.channel_id = spec.channel_id.clone();
        session.provider_session_id = spec.resume_token;
        match spec.provider {
            ProviderKind::Claude => {
                session.model = self.config.providers.claude.model.clone();
            }
            ProviderKind::Codex => {
                let defaults = &self.config.providers.codex;
                session.model = defaults.model.clone();
                session.sandbox_mode = defaults.sandbox_mode;
                session.approval_policy = defaults.approval_policy;
                session.network_access = defaults.network_access;
            }
        }

        {
            let mut inner = self.inner.write().await;
            if let Some(channel) = &session.channel_id {
                inner.by_channel.insert(channel.clone(), id.clone());
            }
            inner.sessions.insert(id.clone(), session.clone());
        }

        // The directory's project comes to life with its first session.
        let project_name = spec.project.clone().unwrap_or_else(|| {
            spec.directory
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| id.clone())
        });
        self.projects.ensure(&project_name, &spec.directory).await;

        info!(session_id = %id, provider = %spec.provider, directory = %spec.directory.display(), "session created");

        // Placeholder-channel sessions are not persisted until linked.
        if session.has_channel() {
            self.persist().await;
        }
        Ok(session)
    }

    /// Bind a session to its durable front-end channel.
    pub async fn link_channel(&self, id: &str, channel_id: &str) -> Result<(), SessionError> {
        {
            let mut inner = self.inner.write().await;
            if let Some(owner) = inner.by_channel.get(channel_id)
                && owner != id
            {
                return Err(SessionError::ChannelClaimed(channel_id.to_string()));
            }
            let session = inner
                .sessions
                .get_mut(id)
                .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
            let old = session.channel_id.replace(channel_id.to_string());
            if let Some(old) = old {
                inner.by_channel.remove(&old);
            }
            inner
                .by_channel
                .insert(channel_id.to_string(), id.to_string());
        }
        self.persist().await;
        Ok(())
    }

    /// The channel was deleted out-of-band: the session ends with it.
    ///
    /// Returns the removed session's id, if any.
    pub async fn unlink_channel(&self, channel_id: &str) -> Option<String> {
        let id = {
            let inner = self.inner.read().await;
            inner.by_channel.get(channel_id).cloned()
        }?;
        match self.end_session(&id).await {
            Ok(()) => Some(id),
            Err(_) => None,
        }
    }

    /// End a session: cancel any in-flight generation, drop it from the
    /// registry, and kill its terminal mirror.
    pub async fn end_session(&self, id: &str) -> Result<(), SessionError> {
        let session = {
            let mut inner = self.inner.write().await;
            if let Some(token) = inner.cancels.remove(id) {
                token.cancel();
            }
            let session = inner
                .sessions
                .remove(id)
                .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
            if let Some(channel) = &session.channel_id {
                inner.by_channel.remove(channel);
            }
            session
        };

        if self.provider_supports(session.provider, Feature::Tmux).await {
            tmux::kill_session(&tmux::session_name(id)).await;
        }

        info!(session_id = %id, "session ended");
        self.persist().await;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Setters
    // ------------------------------------------------------------------------

    pub async fn set_model(&self, id: &str, model: Option<String>) -> Result<(), SessionError> {
        self.update(id, |s| s.model = model).await
    }

    pub async fn set_verbose(&self, id: &str, verbose: bool) -> Result<(), SessionError> {
        self.update(id, |s| s.verbose = verbose).await
    }

    pub async fn set_mode(&self, id: &str, mode: SessionMode) -> Result<(), SessionError> {
        self.update(id, |s| s.mode = mode).await
    }

    pub async fn set_agent_persona(
        &self,
        id: &str,
        persona: Option<String>,
    ) -> Result<(), SessionError> {
        self.update(id, |s| s.agent_persona = persona).await
    }

    /// Drop the backend resume token so the next turn starts fresh.
    pub async fn reset_provider_session(&self, id: &str) -> Result<(), SessionError> {
        self.update(id, |s| s.provider_session_id = None).await
    }

    async fn update(
        &self,
        id: &str,
        f: impl FnOnce(&mut Session),
    ) -> Result<(), SessionError> {
        {
            let mut inner = self.inner.write().await;
            let session = inner
                .sessions
                .get_mut(id)
                .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
            f(session);
            session.touch();
        }
        self.persist().await;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Generation
    // ------------------------------------------------------------------------

    /// Run one turn with new user input.
    ///
    /// Rejects when a generation is already in flight. The returned stream
    /// re-emits every adapter event; `session_init` and `result` are
    /// intercepted for their side effects on the way through.
    pub async fn send_prompt(
        &self,
        id: &str,
        prompt: PromptInput,
    ) -> Result<EventRx, SessionError> {
        self.run_generation(id, Some(prompt)).await
    }

    /// Continue the previous turn without new user input.
    pub async fn continue_session(&self, id: &str) -> Result<EventRx, SessionError> {
        self.run_generation(id, None).await
    }

    async fn run_generation(
        &self,
        id: &str,
        prompt: Option<PromptInput>,
    ) -> Result<EventRx, SessionError> {
        // Check-and-set under one write guard with no awaits in between:
        // this is the single-flight invariant.
        let (session, cancel) = {
            let mut inner = self.inner.write().await;
            let session = inner
                .sessions
                .get_mut(id)
                .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
            if session.is_generating {
                return Err(SessionError::Busy(id.to_string()));
            }
            session.is_generating = true;
            if prompt.is_some() {
                session.message_count += 1;
            }
            session.touch();
            let snapshot = session.clone();
            let cancel = CancellationToken::new();
            inner.cancels.insert(id.to_string(), cancel.clone());
            (snapshot, cancel)
        };

        let provider = match self.providers.ensure(session.provider).await {
            Ok(p) => p,
            Err(e) => {
                self.finish_generation(id).await;
                return Err(e.into());
            }
        };
        if prompt.is_none() && !provider.supports(Feature::Continue) {
            self.finish_generation(id).await;
            return Err(SessionError::Unsupported("session continuation"));
        }

        let opts = self.build_options(&session, cancel.clone()).await;
        let result = match prompt {
            Some(prompt) => provider.send_prompt(prompt, opts).await,
            None => provider.continue_session(opts).await,
        };
        let mut adapter_rx = match result {
            Ok(rx) => rx,
            Err(e) => {
                self.finish_generation(id).await;
                return Err(e.into());
            }
        };

        let (out_tx, out_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let registry = self.clone();
        let session_id = id.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    // Cancellation force-clears bookkeeping even when the
                    // adapter stream never converges.
                    _ = cancel.cancelled() => break,
                    item = adapter_rx.recv() => match item {
                        Some(Ok(event)) => {
                            registry.intercept(&session_id, &event).await;
                            if out_tx.send(Ok(event)).await.is_err() {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            if out_tx.send(Err(e)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
            registry.finish_generation(&session_id).await;
            registry.persist().await;
        });

        Ok(out_rx)
    }

    /// Event interceptions: resume-token persistence and cost accounting.
    async fn intercept(&self, id: &str, event: &ProviderEvent) {
        match event {
            ProviderEvent::SessionInit { session_id } => {
                let token = if session_id.is_empty() {
                    None
                } else {
                    Some(session_id.clone())
                };
                {
                    let mut inner = self.inner.write().await;
                    if let Some(session) = inner.sessions.get_mut(id) {
                        session.provider_session_id = token;
                    }
                }
                // Persist immediately: if the process dies mid-turn the
                // session must still be resumable.
                self.persist().await;
            }
            ProviderEvent::TurnResult { cost_usd, .. } => {
                let mut inner = self.inner.write().await;
                if let Some(session) = inner.sessions.get_mut(id) {
                    if let Some(cost) = cost_usd {
                        session.total_cost += cost;
                    }
                    session.touch();
                }
            }
            _ => {}
        }
    }

    /// Clear the generating flag and cancellation handle unconditionally.
    async fn finish_generation(&self, id: &str) {
        let mut inner = self.inner.write().await;
        if let Some(session) = inner.sessions.get_mut(id) {
            session.is_generating = false;
        }
        inner.cancels.remove(id);
    }

    /// Signal cancellation and defensively clear generation state.
    ///
    /// Returns whether any action was taken.
    pub async fn abort_session(&self, id: &str) -> bool {
        let mut inner = self.inner.write().await;
        let mut acted = false;
        if let Some(token) = inner.cancels.remove(id) {
            token.cancel();
            acted = true;
        }
        if let Some(session) = inner.sessions.get_mut(id)
            && session.is_generating
        {
            session.is_generating = false;
            acted = true;
        }
        acted
    }

    async fn build_options(&self, session: &Session, cancel: CancellationToken) -> ProviderOptions {
        let project = self.projects.for_directory(&session.directory).await;

        let mut parts = Vec::new();
        if let Some(personality) = project.as_ref().and_then(|p| p.personality.clone()) {
            parts.push(personality);
        }
        if let Some(persona) = &session.agent_persona {
            parts.push(persona.clone());
        }
        if let Some(constraint) = session.mode.constraint() {
            parts.push(constraint.to_string());
        }

        ProviderOptions {
            directory: session.directory.clone(),
            resume: session.provider_session_id.clone(),
            model: session.model.clone(),
            sandbox_mode: session.sandbox_mode,
            approval_policy: session.approval_policy,
            network_access: session.network_access,
            system_prompt_parts: parts,
            tool_servers: project.map(|p| p.tool_server_list()).unwrap_or_default(),
            cancel,
        }
    }

    // ------------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------------

    /// Expire sessions idle beyond the configured retention window.
    ///
    /// Returns the number of sessions ended.
    pub async fn expire_inactive(&self) -> usize {
        let cutoff = chrono::Utc::now() - chrono::Duration::hours(self.config.retention_hours as i64);
        let expired: Vec<String> = {
            let inner = self.inner.read().await;
            inner
                .sessions
                .values()
                .filter(|s| !s.is_generating && s.last_activity < cutoff)
                .map(|s| s.id.clone())
                .collect()
        };

        let results = join_all(expired.iter().map(|id| self.end_session(id))).await;
        let count = results.iter().filter(|r| r.is_ok()).count();
        if count > 0 {
            info!(expired = count, "session expiry sweep complete");
        }
        count
    }

    /// Adopt orphaned terminal-mirror sessions discovered out-of-band.
    ///
    /// Lists multiplexer sessions carrying our prefix and creates registry
    /// entries for any without one. Returns the adopted session ids.
    pub async fn sync_orphans(&self) -> Vec<String> {
        let listed = match tmux::list_sessions().await {
            Ok(list) => list,
            Err(e) => {
                warn!(error = %e, "failed to list tmux sessions");
                return Vec::new();
            }
        };

        let mut adopted = Vec::new();
        for (name, path) in listed {
            let Some(id) = name.strip_prefix(tmux::SESSION_PREFIX) else {
                continue;
            };
            if self.get(id).await.is_some() {
                continue;
            }
            let spec = CreateSessionSpec {
                name: id.to_string(),
                directory: Path::new(&path).to_path_buf(),
                channel_id: None,
                project: None,
                provider: ProviderKind::Claude,
                resume_token: None,
                recover_existing: true,
            };
            match self.create_session(spec).await {
                Ok(session) => {
                    info!(session_id = %session.id, "adopted orphaned session");
                    adopted.push(session.id);
                }
                Err(e) => {
                    warn!(session = %id, error = %e, "failed to adopt orphaned session");
                }
            }
        }
        adopted
    }

    async fn provider_supports(&self, kind: ProviderKind, feature: Feature) -> bool {
        match self.providers.ensure(kind).await {
            Ok(provider) => provider.supports(feature),
            Err(_) => false,
        }
    }
}

// ============================================================================
// Naming
// ============================================================================

/// Lowercase slug: alphanumerics kept, everything else collapsed to `-`.
fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut last_dash = true;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    let slug = slug.trim_end_matches('-').to_string();
    if slug.is_empty() {
        "session".to_string()
    } else {
        slug
    }
}

/// Probe `base`, `base-2`, `base-3`, … until a free id is found.
///
/// With `recover_existing`, a registry collision on the base name is a hard
/// error instead.
async fn dedup_name<F, Fut>(
    base: &str,
    taken: &HashSet<String>,
    recover_existing: bool,
    extra_taken: F,
) -> Result<String, SessionError>
where
    F: Fn(String) -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    if recover_existing {
        if taken.contains(base) {
            return Err(SessionError::NameTaken(base.to_string()));
        }
        return Ok(base.to_string());
    }

    let mut suffix = 1usize;
    loop {
        let candidate = if suffix == 1 {
            base.to_string()
        } else {
            format!("{base}-{suffix}")
        };
        if !taken.contains(&candidate) && !extra_taken(candidate.clone()).await {
            return Ok(candidate);
        }
        suffix += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{Provider, ProviderError};
    use crate::store::FileBlobStore;
    use async_trait::async_trait;
    use tempfile::TempDir;

    // ------------------------------------------------------------------------
    // Fixtures
    // ------------------------------------------------------------------------

    /// Provider that plays back a fixed event script and ends the stream.
    struct ScriptedProvider {
        kind: ProviderKind,
        script: Vec<ProviderEvent>,
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        fn kind(&self) -> ProviderKind {
            self.kind
        }

        fn supports(&self, feature: Feature) -> bool {
            matches!(feature, Feature::Continue)
        }

        async fn send_prompt(
            &self,
            _prompt: PromptInput,
            _opts: ProviderOptions,
        ) -> Result<EventRx, ProviderError> {
            let (tx, rx) = mpsc::channel(16);
            let script = self.script.clone();
            tokio::spawn(async move {
                for event in script {
                    if tx.send(Ok(event)).await.is_err() {
                        return;
                    }
                }
            });
            Ok(rx)
        }

        async fn continue_session(&self, opts: ProviderOptions) -> Result<EventRx, ProviderError> {
            self.send_prompt(PromptInput::Text(String::new()), opts).await
        }
    }

    /// Provider that emits nothing until cancelled.
    struct StallingProvider;

    #[async_trait]
    impl Provider for StallingProvider {
        fn kind(&self) -> ProviderKind {
            ProviderKind::Claude
        }

        fn supports(&self, _feature: Feature) -> bool {
            false
        }

        async fn send_prompt(
            &self,
            _prompt: PromptInput,
            opts: ProviderOptions,
        ) -> Result<EventRx, ProviderError> {
            let (tx, rx) = mpsc::channel(16);
            tokio::spawn(async move {
                opts.cancel.cancelled().await;
                drop(tx);
            });
            Ok(rx)
        }

        async fn continue_session(&self, opts: ProviderOptions) -> Result<EventRx, ProviderError> {
            self.send_prompt(PromptInput::Text(String::new()), opts).await
        }
    }

    struct Fixture {
        registry: SessionRegistry,
        store: Arc<FileBlobStore>,
        workdir: std::path::PathBuf,
        _temp: TempDir,
    }

    async fn fixture(provider: Arc<dyn Provider>) -> Fixture {
        let temp = TempDir::new().unwrap();
        let workdir = temp.path().join("work");
        std::fs::create_dir_all(&workdir).unwrap();

        let config = Arc::new(Config {
            allow_all_users: true,
            allowed_users: vec![],
            allowed_roots: vec![temp.path().to_path_buf()],
            default_directory: None,
            rate_limit_ms: 500,
            retention_hours: 72,
            data_dir: temp.path().join("data"),
            providers: Default::default(),
        });

        let store = Arc::new(FileBlobStore::new(temp.path().join("data")));
        let writer = SnapshotWriter::spawn(store.clone());
        let providers = Arc::new(ProviderRegistry::new());
        providers.register(provider).await;
        let projects = ProjectStore::new(writer.clone());
        let registry = SessionRegistry::new(providers, projects, writer, config);

        Fixture {
            registry,
            store,
            workdir,
            _temp: temp,
        }
    }

    fn scripted(script: Vec<ProviderEvent>) -> Arc<dyn Provider> {
        Arc::new(ScriptedProvider {
            kind: ProviderKind::Claude,
            script,
        })
    }

    fn spec(fix: &Fixture, name: &str) -> CreateSessionSpec {
        CreateSessionSpec {
            name: name.to_string(),
            directory: fix.workdir.clone(),
            channel_id: None,
            project: None,
            provider: ProviderKind::Claude,
            resume_token: None,
            recover_existing: false,
        }
    }

    async fn drain(mut rx: EventRx) -> Vec<ProviderEvent> {
        let mut events = Vec::new();
        while let Some(item) = rx.recv().await {
            if let Ok(event) = item {
                events.push(event);
            }
        }
        events
    }

    // ------------------------------------------------------------------------
    // Tests
    // ------------------------------------------------------------------------

    #[test]
    fn slugify_names() {
        assert_eq!(slugify("Fix Auth Bug"), "fix-auth-bug");
        assert_eq!(slugify("api_v2!!"), "api-v2");
        assert_eq!(slugify("---"), "session");
        assert_eq!(slugify("simple"), "simple");
    }

    #[tokio::test]
    async fn name_collisions_produce_suffixed_ids_in_order() {
        let fix = fixture(scripted(vec![])).await;

        let a = fix.registry.create_session(spec(&fix, "deploy")).await.unwrap();
        let b = fix.registry.create_session(spec(&fix, "deploy")).await.unwrap();
        let c = fix.registry.create_session(spec(&fix, "deploy")).await.unwrap();

        assert_eq!(a.id, "deploy");
        assert_eq!(b.id, "deploy-2");
        assert_eq!(c.id, "deploy-3");
    }

    #[tokio::test]
    async fn recover_existing_collision_is_hard_error() {
        let fix = fixture(scripted(vec![])).await;
        fix.registry.create_session(spec(&fix, "adopt")).await.unwrap();

        let mut recover = spec(&fix, "adopt");
        recover.recover_existing = true;
        let err = fix.registry.create_session(recover).await.unwrap_err();
        assert!(matches!(err, SessionError::NameTaken(_)));
    }

    #[tokio::test]
    async fn directory_validation() {
        let fix = fixture(scripted(vec![])).await;

        let mut outside = spec(&fix, "bad");
        outside.directory = "/definitely/not/allowed".into();
        assert!(matches!(
            fix.registry.create_session(outside).await.unwrap_err(),
            SessionError::DirectoryNotAllowed(_)
        ));

        let mut missing = spec(&fix, "bad");
        missing.directory = fix.workdir.join("nope");
        assert!(matches!(
            fix.registry.create_session(missing).await.unwrap_err(),
            SessionError::InvalidDirectory(_)
        ));
    }

    #[tokio::test]
    async fn busy_session_rejects_second_prompt_without_state_change() {
        let fix = fixture(Arc::new(StallingProvider)).await;
        let session = fix.registry.create_session(spec(&fix, "busy")).await.unwrap();

        let _rx = fix
            .registry
            .send_prompt(&session.id, PromptInput::Text("go".to_string()))
            .await
            .unwrap();

        let before = fix.registry.get(&session.id).await.unwrap();
        assert!(before.is_generating);
        let count_before = before.message_count;

        let err = fix
            .registry
            .send_prompt(&session.id, PromptInput::Text("again".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Busy(_)));

        let after = fix.registry.get(&session.id).await.unwrap();
        assert!(after.is_generating);
        assert_eq!(after.message_count, count_before);

        assert!(fix.registry.abort_session(&session.id).await);
    }

    #[tokio::test]
    async fn abort_clears_generation_state() {
        let fix = fixture(Arc::new(StallingProvider)).await;
        let session = fix.registry.create_session(spec(&fix, "abort-me")).await.unwrap();

        let _rx = fix
            .registry
            .send_prompt(&session.id, PromptInput::Text("go".to_string()))
            .await
            .unwrap();
        assert!(fix.registry.get(&session.id).await.unwrap().is_generating);

        assert!(fix.registry.abort_session(&session.id).await);
        let after = fix.registry.get(&session.id).await.unwrap();
        assert!(!after.is_generating);

        // Second abort has nothing left to do.
        assert!(!fix.registry.abort_session(&session.id).await);
    }

    #[tokio::test]
    async fn events_are_reemitted_and_intercepted() {
        let script = vec![
            ProviderEvent::SessionInit {
                session_id: "native-7".to_string(),
            },
            ProviderEvent::TextDelta {
                text: "hi".to_string(),
            },
            ProviderEvent::TurnResult {
                success: true,
                cost_usd: Some(0.25),
                duration_ms: 10,
                turns: 1,
                errors: vec![],
            },
        ];
        let fix = fixture(scripted(script.clone())).await;
        let session = fix.registry.create_session(spec(&fix, "turn")).await.unwrap();

        let rx = fix
            .registry
            .send_prompt(&session.id, PromptInput::Text("go".to_string()))
            .await
            .unwrap();
        let events = drain(rx).await;
        assert_eq!(events, script);

        let after = fix.registry.get(&session.id).await.unwrap();
        assert_eq!(after.provider_session_id.as_deref(), Some("native-7"));
        assert!((after.total_cost - 0.25).abs() < f64::EPSILON);
        assert!(!after.is_generating);
        assert_eq!(after.message_count, 1);
    }

    #[tokio::test]
    async fn empty_session_init_resets_token() {
        let script = vec![ProviderEvent::SessionInit {
            session_id: String::new(),
        }];
        let fix = fixture(scripted(script)).await;

        let mut with_token = spec(&fix, "resetting");
        with_token.resume_token = Some("old-token".to_string());
        let session = fix.registry.create_session(with_token).await.unwrap();
        assert_eq!(
            fix.registry.get(&session.id).await.unwrap().provider_session_id.as_deref(),
            Some("old-token")
        );

        let rx = fix
            .registry
            .send_prompt(&session.id, PromptInput::Text("go".to_string()))
            .await
            .unwrap();
        drain(rx).await;

        assert!(
            fix.registry
                .get(&session.id)
                .await
                .unwrap()
                .provider_session_id
                .is_none()
        );
    }

    #[tokio::test]
    async fn cost_accumulates_across_turns() {
        let script = vec![ProviderEvent::TurnResult {
            success: true,
            cost_usd: Some(0.10),
            duration_ms: 5,
            turns: 1,
            errors: vec![],
        }];
        let fix = fixture(scripted(script)).await;
        let session = fix.registry.create_session(spec(&fix, "cost")).await.unwrap();

        for _ in 0..3 {
            let rx = fix
                .registry
                .send_prompt(&session.id, PromptInput::Text("go".to_string()))
                .await
                .unwrap();
            drain(rx).await;
        }

        let after = fix.registry.get(&session.id).await.unwrap();
        assert!((after.total_cost - 0.30).abs() < 1e-9);
        assert_eq!(after.message_count, 3);
    }

    #[tokio::test]
    async fn placeholder_sessions_are_not_persisted_until_linked() {
        let fix = fixture(scripted(vec![])).await;
        let session = fix.registry.create_session(spec(&fix, "ghost")).await.unwrap();

        fix.registry.persist().await;
        fix.registry.writer.flush().await;
        let bytes = fix.store.read(SESSIONS_SNAPSHOT).await.unwrap();
        if let Some(bytes) = bytes {
            let list: Vec<Session> = serde_json::from_slice(&bytes).unwrap();
            assert!(list.is_empty());
        }

        fix.registry.link_channel(&session.id, "chan-1").await.unwrap();
        fix.registry.writer.flush().await;
        let bytes = fix.store.read(SESSIONS_SNAPSHOT).await.unwrap().unwrap();
        let list: Vec<Session> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].channel_id.as_deref(), Some("chan-1"));
    }

    #[tokio::test]
    async fn link_channel_claimed_by_other_session_fails() {
        let fix = fixture(scripted(vec![])).await;
        let a = fix.registry.create_session(spec(&fix, "a")).await.unwrap();
        let b = fix.registry.create_session(spec(&fix, "b")).await.unwrap();

        fix.registry.link_channel(&a.id, "chan-1").await.unwrap();
        let err = fix.registry.link_channel(&b.id, "chan-1").await.unwrap_err();
        assert!(matches!(err, SessionError::ChannelClaimed(_)));
    }

    #[tokio::test]
    async fn unlink_channel_removes_session_entirely() {
        let fix = fixture(scripted(vec![])).await;
        let session = fix.registry.create_session(spec(&fix, "doomed")).await.unwrap();
        fix.registry.link_channel(&session.id, "chan-9").await.unwrap();

        let removed = fix.registry.unlink_channel("chan-9").await;
        assert_eq!(removed.as_deref(), Some(session.id.as_str()));
        assert!(fix.registry.get(&session.id).await.is_none());
        assert!(fix.registry.get_by_channel("chan-9").await.is_none());
    }

    #[tokio::test]
    async fn snapshot_roundtrip_preserves_session_fields() {
        let fix = fixture(scripted(vec![])).await;
        let session = fix.registry.create_session(spec(&fix, "durable")).await.unwrap();
        fix.registry.link_channel(&session.id, "chan-1").await.unwrap();
        fix.registry.set_mode(&session.id, SessionMode::Plan).await.unwrap();
        fix.registry.set_verbose(&session.id, true).await.unwrap();
        fix.registry.writer.flush().await;

        // Fresh registry over the same blob store.
        let providers = Arc::new(ProviderRegistry::new());
        providers.register(scripted(vec![])).await;
        let writer = SnapshotWriter::spawn(fix.store.clone());
        let projects = ProjectStore::new(writer.clone());
        let config = Arc::new(Config {
            allow_all_users: true,
            allowed_users: vec![],
            allowed_roots: vec![fix.workdir.clone()],
            default_directory: None,
            rate_limit_ms: 500,
            retention_hours: 72,
            data_dir: fix.workdir.clone(),
            providers: Default::default(),
        });
        let reloaded = SessionRegistry::new(providers, projects, writer, config);
        reloaded.load(fix.store.as_ref()).await;

        let restored = reloaded.get(&session.id).await.unwrap();
        assert_eq!(restored.directory, session.directory);
        assert_eq!(restored.provider, session.provider);
        assert_eq!(restored.mode, SessionMode::Plan);
        assert!(restored.verbose);
        assert_eq!(restored.total_cost, 0.0);
        assert_eq!(
            reloaded.get_by_channel("chan-1").await.unwrap().id,
            session.id
        );
    }

    #[tokio::test]
    async fn loading_duplicate_channels_keeps_first_and_resaves() {
        let fix = fixture(scripted(vec![])).await;

        // Hand-build a corrupt snapshot with two claimants of one channel.
        let mut first = Session::new("first", &fix.workdir, ProviderKind::Codex);
        first.channel_id = Some("chan-x".to_string());
        let mut second = Session::new("second", &fix.workdir, ProviderKind::Codex);
        second.channel_id = Some("chan-x".to_string());
        let bytes = serde_json::to_vec(&vec![first, second]).unwrap();
        fix.store.write(SESSIONS_SNAPSHOT, &bytes).await.unwrap();

        fix.registry.load(fix.store.as_ref()).await;
        let all = fix.registry.all().await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, "first");

        // The cleaned snapshot was re-saved.
        fix.registry.writer.flush().await;
        let bytes = fix.store.read(SESSIONS_SNAPSHOT).await.unwrap().unwrap();
        let list: Vec<Session> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(list.len(), 1);
    }

    #[tokio::test]
    async fn expire_inactive_ends_stale_sessions() {
        let fix = fixture(scripted(vec![])).await;
        let stale = fix.registry.create_session(spec(&fix, "stale")).await.unwrap();
        let fresh = fix.registry.create_session(spec(&fix, "fresh")).await.unwrap();

        {
            let mut inner = fix.registry.inner.write().await;
            let session = inner.sessions.get_mut(&stale.id).unwrap();
            session.last_activity = chrono::Utc::now() - chrono::Duration::hours(100);
        }

        let expired = fix.registry.expire_inactive().await;
        assert_eq!(expired, 1);
        assert!(fix.registry.get(&stale.id).await.is_none());
        assert!(fix.registry.get(&fresh.id).await.is_some());
    }

    #[tokio::test]
    async fn continue_requires_provider_support() {
        let fix = fixture(Arc::new(StallingProvider)).await;
        let session = fix.registry.create_session(spec(&fix, "nc")).await.unwrap();

        let err = fix.registry.continue_session(&session.id).await.unwrap_err();
        assert!(matches!(err, SessionError::Unsupported(_)));
        // The failed attempt left no generation state behind.
        assert!(!fix.registry.get(&session.id).await.unwrap().is_generating);
    }

    #[tokio::test]
    async fn operations_on_unknown_session_report_not_found() {
        let fix = fixture(scripted(vec![])).await;
        assert!(matches!(
            fix.registry
                .send_prompt("ghost", PromptInput::Text("x".to_string()))
                .await
                .unwrap_err(),
            SessionError::NotFound(_)
        ));
        assert!(matches!(
            fix.registry.set_verbose("ghost", true).await.unwrap_err(),
            SessionError::NotFound(_)
        ));
        assert!(!fix.registry.abort_session("ghost").await);
    }
}
