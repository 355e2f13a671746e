//! Provider registry: lazy resolution and caching of backend adapters.
//!
//! The terminal-integrated backend is always available. Optional backends
//! are probed for their installed CLI; when missing, one best-effort
//! automatic install is attempted before giving up with a descriptive error
//! naming the manual install path.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::claude::ClaudeProvider;
use super::codex::CodexProvider;
use super::{Provider, ProviderError, ProviderKind};

/// Manual install command surfaced when automatic install fails.
const CODEX_INSTALL_HINT: &str = "npm install -g @openai/codex";

/// Process-wide registry of adapter instances.
///
/// Repeated calls for an already-loaded provider return the cached instance.
pub struct ProviderRegistry {
    slots: Mutex<HashMap<ProviderKind, Arc<dyn Provider>>>,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve an adapter, installing the backend if needed. Idempotent.
    pub async fn ensure(&self, kind: ProviderKind) -> Result<Arc<dyn Provider>, ProviderError> {
        let mut slots = self.slots.lock().await;
        if let Some(provider) = slots.get(&kind) {
            return Ok(provider.clone());
        }

        let provider: Arc<dyn Provider> = match kind {
            ProviderKind::Claude => Arc::new(ClaudeProvider::default()),
            ProviderKind::Codex => {
                ensure_codex_installed().await?;
                Arc::new(CodexProvider::default())
            }
        };

        info!(provider = %kind, "provider loaded");
        slots.insert(kind, provider.clone());
        Ok(provider)
    }

    /// Register a pre-built adapter instance (tests and embedders).
    pub async fn register(&self, provider: Arc<dyn Provider>) {
        let kind = provider.kind();
        self.slots.lock().await.insert(kind, provider);
    }

    /// Kinds with a loaded adapter instance.
    pub async fn list(&self) -> Vec<ProviderKind> {
        let slots = self.slots.lock().await;
        ProviderKind::ALL
            .into_iter()
            .filter(|kind| slots.contains_key(kind))
            .collect()
    }
}

/// Probe for the codex CLI; attempt one automatic install when absent.
async fn ensure_codex_installed() -> Result<(), ProviderError> {
    if probe_binary("codex").await {
        return Ok(());
    }

    warn!("codex CLI not found, attempting automatic install");
    match Command::new("npm")
        .args(["install", "-g", "@openai/codex"])
        .output()
        .await
    {
        Ok(output) if output.status.success() => {
            debug!("automatic codex install succeeded");
        }
        Ok(output) => {
            warn!(
                status = %output.status,
                "automatic codex install failed"
            );
        }
        Err(e) => {
            warn!(error = %e, "npm not available for automatic install");
        }
    }

    if probe_binary("codex").await {
        return Ok(());
    }

    Err(ProviderError::Unavailable(format!(
        "codex CLI is not installed and automatic install failed; install it manually with `{CODEX_INSTALL_HINT}`"
    )))
}

/// Whether `binary --version` runs successfully.
async fn probe_binary(binary: &str) -> bool {
    match Command::new(binary).arg("--version").output().await {
        Ok(output) => output.status.success(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::Feature;

    #[tokio::test]
    async fn claude_is_always_available_and_cached() {
        let registry = ProviderRegistry::new();
        assert!(registry.list().await.is_empty());

        let first = registry.ensure(ProviderKind::Claude).await.unwrap();
        let second = registry.ensure(ProviderKind::Claude).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        assert_eq!(registry.list().await, vec![ProviderKind::Claude]);
        assert!(first.supports(Feature::Tmux));
    }

    #[tokio::test]
    async fn probe_reports_missing_binary() {
        assert!(!probe_binary("definitely-not-a-real-binary-name").await);
    }
}
