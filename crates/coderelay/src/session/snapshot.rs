//! Session snapshot sanitization.
//!
//! The persisted snapshot is a plain JSON list of sessions. Loading defends
//! against corrupt or hand-edited snapshots: entries with a placeholder
//! channel or a channel already claimed by an earlier entry are dropped.

use tracing::warn;

use super::Session;

/// Result of sanitizing a loaded snapshot.
pub struct Sanitized {
    pub sessions: Vec<Session>,
    /// How many entries were dropped. Non-zero means the snapshot should be
    /// re-saved in cleaned form.
    pub dropped: usize,
}

/// Drop invalid entries, keeping the first claimant of each channel.
pub fn sanitize(loaded: Vec<Session>) -> Sanitized {
    let mut seen_channels = std::collections::HashSet::new();
    let mut seen_ids = std::collections::HashSet::new();
    let mut sessions = Vec::with_capacity(loaded.len());
    let mut dropped = 0;

    for session in loaded {
        let Some(channel) = session.channel_id.clone() else {
            warn!(session_id = %session.id, "dropping snapshot entry with placeholder channel");
            dropped += 1;
            continue;
        };
        if !seen_channels.insert(channel.clone()) {
            warn!(
                session_id = %session.id,
                channel_id = %channel,
                "dropping snapshot entry with duplicate channel claim"
            );
            dropped += 1;
            continue;
        }
        if !seen_ids.insert(session.id.clone()) {
            warn!(session_id = %session.id, "dropping snapshot entry with duplicate id");
            dropped += 1;
            continue;
        }
        sessions.push(session);
    }

    Sanitized { sessions, dropped }
}
