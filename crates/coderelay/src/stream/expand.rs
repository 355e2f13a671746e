//! Time-boxed store for oversized content.
//!
//! Rendered previews defer full payload disclosure behind an explicit
//! action: the full text is parked here under an opaque id and fetched when
//! the user clicks the expand control. Entries expire after ten minutes.

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use ulid::Ulid;

/// How long expandable content stays retrievable.
pub const EXPAND_TTL: Duration = Duration::from_secs(10 * 60);

struct Entry {
    content: String,
    inserted: Instant,
}

/// Opaque-id → full-text store with lazy expiry.
#[derive(Default)]
pub struct ExpandableStore {
    entries: DashMap<String, Entry>,
}

impl ExpandableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park content, returning its opaque id.
    pub fn insert(&self, content: String) -> String {
        self.sweep();
        let id = Ulid::new().to_string();
        self.entries.insert(
            id.clone(),
            Entry {
                content,
                inserted: Instant::now(),
            },
        );
        id
    }

    /// Fetch content by id. Expired or unknown ids return `None`.
    pub fn get(&self, id: &str) -> Option<String> {
        let entry = self.entries.get(id)?;
        if entry.inserted.elapsed() > EXPAND_TTL {
            drop(entry);
            self.entries.remove(id);
            return None;
        }
        Some(entry.content.clone())
    }

    fn sweep(&self) {
        self.entries
            .retain(|_, entry| entry.inserted.elapsed() <= EXPAND_TTL);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_and_get_roundtrip() {
        let store = ExpandableStore::new();
        let id = store.insert("full payload".to_string());
        assert_eq!(store.get(&id).as_deref(), Some("full payload"));
    }

    #[tokio::test]
    async fn unknown_id_is_none() {
        let store = ExpandableStore::new();
        assert!(store.get("nope").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let store = ExpandableStore::new();
        let id = store.insert("short-lived".to_string());

        tokio::time::advance(EXPAND_TTL + Duration::from_secs(1)).await;
        assert!(store.get(&id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn insert_sweeps_expired_entries() {
        let store = ExpandableStore::new();
        store.insert("old".to_string());
        tokio::time::advance(EXPAND_TTL + Duration::from_secs(1)).await;

        store.insert("new".to_string());
        assert_eq!(store.len(), 1);
    }
}
