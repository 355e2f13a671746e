//! Terminal multiplexer integration.
//!
//! Sessions of tmux-capable providers get a mirror tmux session rooted at
//! the working directory, so the user can attach a real terminal to the
//! same conversation. All functions shell out via `tokio::process::Command`.

use std::path::Path;

use tokio::process::Command;
use tracing::{debug, warn};

/// Naming prefix for every tmux session this process owns.
pub const SESSION_PREFIX: &str = "coderelay-";

/// Full tmux session name for a session id.
pub fn session_name(session_id: &str) -> String {
    format!("{SESSION_PREFIX}{session_id}")
}

/// Check if tmux is available on the system.
pub async fn detect() -> bool {
    match Command::new("tmux").arg("-V").output().await {
        Ok(output) => output.status.success(),
        Err(_) => {
            debug!("tmux not found in PATH");
            false
        }
    }
}

/// Create a detached named session rooted at `directory`.
pub async fn create_session(name: &str, directory: &Path) -> std::io::Result<()> {
    let output = Command::new("tmux")
        .args(["new-session", "-d", "-s", name, "-c"])
        .arg(directory)
        .output()
        .await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(std::io::Error::other(format!(
            "tmux new-session failed: {}",
            stderr.trim()
        )));
    }
    Ok(())
}

/// Check if a named session exists.
pub async fn has_session(name: &str) -> bool {
    match Command::new("tmux")
        .args(["has-session", "-t", name])
        .output()
        .await
    {
        Ok(output) => output.status.success(),
        Err(_) => false,
    }
}

/// Kill a named session. Failures are logged, not propagated.
pub async fn kill_session(name: &str) {
    match Command::new("tmux")
        .args(["kill-session", "-t", name])
        .output()
        .await
    {
        Ok(output) if !output.status.success() => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(session = %name, error = %stderr.trim(), "tmux kill-session failed");
        }
        Err(e) => {
            warn!(session = %name, error = %e, "tmux kill-session failed");
        }
        _ => {}
    }
}

/// List sessions carrying our naming prefix, as (name, directory) pairs.
pub async fn list_sessions() -> std::io::Result<Vec<(String, String)>> {
    let output = Command::new("tmux")
        .args([
            "list-sessions",
            "-F",
            "#{session_name}\t#{session_path}",
        ])
        .output()
        .await?;

    // tmux exits non-zero when no server is running; that simply means no
    // sessions exist.
    if !output.status.success() {
        return Ok(Vec::new());
    }

    Ok(parse_session_list(&String::from_utf8_lossy(&output.stdout)))
}

/// Parse `list-sessions` output, keeping only prefixed entries.
fn parse_session_list(raw: &str) -> Vec<(String, String)> {
    raw.lines()
        .filter_map(|line| {
            let (name, path) = line.split_once('\t')?;
            if !name.starts_with(SESSION_PREFIX) {
                return None;
            }
            Some((name.to_string(), path.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_name_applies_prefix() {
        assert_eq!(session_name("fix-auth"), "coderelay-fix-auth");
    }

    #[test]
    fn parse_filters_by_prefix() {
        let raw = "coderelay-api\t/srv/work/api\nother-session\t/tmp\ncoderelay-web\t/srv/work/web\n";
        let sessions = parse_session_list(raw);
        assert_eq!(
            sessions,
            vec![
                ("coderelay-api".to_string(), "/srv/work/api".to_string()),
                ("coderelay-web".to_string(), "/srv/work/web".to_string()),
            ]
        );
    }

    #[test]
    fn parse_tolerates_malformed_lines() {
        let raw = "garbage-without-tab\ncoderelay-x\t/work\n";
        let sessions = parse_session_list(raw);
        assert_eq!(sessions, vec![("coderelay-x".to_string(), "/work".to_string())]);
    }

    #[test]
    fn parse_empty_output() {
        assert!(parse_session_list("").is_empty());
    }
}
