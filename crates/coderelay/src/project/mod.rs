//! Directory-scoped project configuration.
//!
//! A project bundles configuration shared by every session rooted in the
//! same directory: an optional personality (system-prompt overlay), named
//! skills (prompt templates with a single placeholder), and registered
//! auxiliary tool servers. Projects are created lazily on first use and
//! never auto-deleted.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::provider::ToolServer;

pub mod store;

pub use store::ProjectStore;

/// Placeholder substituted with the user's input when a skill is invoked.
pub const SKILL_PLACEHOLDER: &str = "{input}";

/// A named prompt template with a single `{input}` placeholder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Skill {
    pub template: String,
}

impl Skill {
    /// Substitute the placeholder with `input`.
    ///
    /// A template without the placeholder gets the input appended, so a
    /// skill can never silently drop what the user typed.
    pub fn render(&self, input: &str) -> String {
        if self.template.contains(SKILL_PLACEHOLDER) {
            self.template.replace(SKILL_PLACEHOLDER, input)
        } else if input.is_empty() {
            self.template.clone()
        } else {
            format!("{}\n\n{}", self.template, input)
        }
    }
}

/// Configuration shared by all sessions rooted in one directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub name: String,
    pub directory: PathBuf,
    /// System-prompt overlay applied to every session in this project.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub personality: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub skills: BTreeMap<String, Skill>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tool_servers: BTreeMap<String, ToolServer>,
    pub created_at: DateTime<Utc>,
}

impl Project {
    pub fn new(name: impl Into<String>, directory: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            directory: directory.into(),
            personality: None,
            skills: BTreeMap::new(),
            tool_servers: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    /// Whether `dir` is this project's directory.
    pub fn covers(&self, dir: &Path) -> bool {
        self.directory == dir
    }

    /// Registered tool servers in name order.
    pub fn tool_server_list(&self) -> Vec<ToolServer> {
        self.tool_servers.values().cloned().collect()
    }
}
