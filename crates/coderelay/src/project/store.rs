//! Project registry with snapshot persistence.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::provider::ToolServer;
use crate::store::{BlobStore, PROJECTS_SNAPSHOT, SnapshotWriter};

use super::{Project, Skill};

/// In-memory project map, persisted as one JSON snapshot.
#[derive(Clone)]
pub struct ProjectStore {
    projects: Arc<RwLock<BTreeMap<String, Project>>>,
    writer: SnapshotWriter,
}

impl ProjectStore {
    pub fn new(writer: SnapshotWriter) -> Self {
        Self {
            projects: Arc::new(RwLock::new(BTreeMap::new())),
            writer,
        }
    }

    /// Load the project snapshot, tolerating a missing or corrupt blob.
    pub async fn load(writer: SnapshotWriter, store: &dyn BlobStore) -> Self {
        let projects = match store.read(PROJECTS_SNAPSHOT).await {
            Ok(Some(bytes)) => match serde_json::from_slice::<Vec<Project>>(&bytes) {
                Ok(list) => {
                    info!(count = list.len(), "loaded projects");
                    list.into_iter().map(|p| (p.name.clone(), p)).collect()
                }
                Err(e) => {
                    warn!(error = %e, "project snapshot is corrupt, starting empty");
                    BTreeMap::new()
                }
            },
            Ok(None) => BTreeMap::new(),
            Err(e) => {
                warn!(error = %e, "failed to read project snapshot, starting empty");
                BTreeMap::new()
            }
        };

        Self {
            projects: Arc::new(RwLock::new(projects)),
            writer,
        }
    }

    /// Get a project by name.
    pub async fn get(&self, name: &str) -> Option<Project> {
        self.projects.read().await.get(name).cloned()
    }

    /// Find the project covering a directory.
    pub async fn for_directory(&self, dir: &Path) -> Option<Project> {
        self.projects
            .read()
            .await
            .values()
            .find(|p| p.covers(dir))
            .cloned()
    }

    /// Get the project for a directory, creating it lazily.
    ///
    /// A name already claimed by a different directory gets a numeric
    /// suffix.
    pub async fn ensure(&self, name: &str, directory: &Path) -> Project {
        let mut projects = self.projects.write().await;
        if let Some(existing) = projects.values().find(|p| p.covers(directory)) {
            return existing.clone();
        }

        let mut unique = name.to_string();
        let mut suffix = 1;
        while projects.contains_key(&unique) {
            suffix += 1;
            unique = format!("{name}-{suffix}");
        }

        let project = Project::new(unique, directory);
        projects.insert(project.name.clone(), project.clone());
        drop(projects);
        self.persist().await;
        project
    }

    /// All projects in name order.
    pub async fn all(&self) -> Vec<Project> {
        self.projects.read().await.values().cloned().collect()
    }

    // ------------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------------

    pub async fn set_personality(&self, name: &str, personality: Option<String>) -> bool {
        let updated = {
            let mut projects = self.projects.write().await;
            match projects.get_mut(name) {
                Some(project) => {
                    project.personality = personality;
                    true
                }
                None => false,
            }
        };
        if updated {
            self.persist().await;
        }
        updated
    }

    pub async fn set_skill(&self, name: &str, skill_name: &str, template: String) -> bool {
        let updated = {
            let mut projects = self.projects.write().await;
            match projects.get_mut(name) {
                Some(project) => {
                    project
                        .skills
                        .insert(skill_name.to_string(), Skill { template });
                    true
                }
                None => false,
            }
        };
        if updated {
            self.persist().await;
        }
        updated
    }

    pub async fn remove_skill(&self, name: &str, skill_name: &str) -> bool {
        let updated = {
            let mut projects = self.projects.write().await;
            projects
                .get_mut(name)
                .is_some_and(|project| project.skills.remove(skill_name).is_some())
        };
        if updated {
            self.persist().await;
        }
        updated
    }

    pub async fn set_tool_server(&self, name: &str, server: ToolServer) -> bool {
        let updated = {
            let mut projects = self.projects.write().await;
            match projects.get_mut(name) {
                Some(project) => {
                    project.tool_servers.insert(server.name.clone(), server);
                    true
                }
                None => false,
            }
        };
        if updated {
            self.persist().await;
        }
        updated
    }

    /// Render a skill against user input.
    pub async fn render_skill(&self, name: &str, skill_name: &str, input: &str) -> Option<String> {
        let projects = self.projects.read().await;
        let skill = projects.get(name)?.skills.get(skill_name)?;
        Some(skill.render(input))
    }

    async fn persist(&self) {
        let list: Vec<Project> = self.projects.read().await.values().cloned().collect();
        match serde_json::to_vec_pretty(&list) {
            Ok(bytes) => self.writer.enqueue(PROJECTS_SNAPSHOT, bytes),
            Err(e) => warn!(error = %e, "failed to serialize project snapshot"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FileBlobStore;
    use tempfile::TempDir;

    async fn fixture(dir: &TempDir) -> (ProjectStore, Arc<FileBlobStore>) {
        let blob = Arc::new(FileBlobStore::new(dir.path().join("data")));
        let writer = SnapshotWriter::spawn(blob.clone());
        (ProjectStore::new(writer), blob)
    }

    #[tokio::test]
    async fn ensure_is_lazy_and_idempotent() {
        let dir = TempDir::new().unwrap();
        let (store, _) = fixture(&dir).await;

        let first = store.ensure("api", Path::new("/srv/work/api")).await;
        let second = store.ensure("api-again", Path::new("/srv/work/api")).await;
        // Same directory resolves to the existing project, whatever name was
        // offered the second time.
        assert_eq!(second.name, first.name);
        assert_eq!(store.all().await.len(), 1);
    }

    #[tokio::test]
    async fn skills_roundtrip_through_snapshot() {
        let dir = TempDir::new().unwrap();
        let (store, blob) = fixture(&dir).await;

        store.ensure("api", Path::new("/srv/work/api")).await;
        assert!(
            store
                .set_skill("api", "review", "Review {input} carefully.".to_string())
                .await
        );
        assert_eq!(
            store.render_skill("api", "review", "the diff").await.unwrap(),
            "Review the diff carefully."
        );
        store.writer.flush().await;

        // Reload from disk into a fresh store.
        let writer = SnapshotWriter::spawn(blob.clone());
        let reloaded = ProjectStore::load(writer, blob.as_ref()).await;
        let project = reloaded.get("api").await.unwrap();
        assert!(project.skills.contains_key("review"));
    }

    #[tokio::test]
    async fn mutations_on_unknown_project_return_false() {
        let dir = TempDir::new().unwrap();
        let (store, _) = fixture(&dir).await;

        assert!(!store.set_personality("ghost", Some("x".to_string())).await);
        assert!(!store.remove_skill("ghost", "review").await);
        assert!(store.render_skill("ghost", "review", "x").await.is_none());
    }

    #[tokio::test]
    async fn for_directory_finds_covering_project() {
        let dir = TempDir::new().unwrap();
        let (store, _) = fixture(&dir).await;

        store.ensure("api", Path::new("/srv/work/api")).await;
        assert!(
            store
                .for_directory(Path::new("/srv/work/api"))
                .await
                .is_some()
        );
        assert!(
            store
                .for_directory(Path::new("/srv/work/other"))
                .await
                .is_none()
        );
    }
}
