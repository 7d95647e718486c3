use crate::error::{OrchestratorError, Result};
use crate::store::WorkspaceStore;
use crate::workspace::{NewWorkspace, Workspace};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

/// In-process workspace repository with the same versioning rules as the
/// SQLite store. Used by tests and single-node development setups.
#[derive(Clone, Default)]
pub struct MemoryWorkspaceStore {
    inner: Arc<RwLock<BTreeMap<String, Workspace>>>,
}

impl MemoryWorkspaceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a record as-is, bypassing lifecycle rules.
    pub fn put(&self, workspace: Workspace) {
        self.inner.write().insert(workspace.id.clone(), workspace);
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    fn check_version(current: &Workspace, expected_version: i64) -> Result<()> {
        if current.version != expected_version {
            return Err(OrchestratorError::VersionConflict {
                id: current.id.clone(),
                expected: expected_version,
                actual: current.version,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl WorkspaceStore for MemoryWorkspaceStore {
    async fn list_workspaces(&self) -> Result<Vec<Workspace>> {
        let mut all: Vec<Workspace> = self.inner.read().values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(all)
    }

    async fn get_workspace(&self, id: &str) -> Result<Workspace> {
        self.inner
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound(id.to_string()))
    }

    async fn insert_workspace(&self, req: NewWorkspace) -> Result<Workspace> {
        let workspace = req.into_workspace(Uuid::new_v4().to_string(), Utc::now())?;
        let mut guard = self.inner.write();
        if guard.values().any(|w| w.slug == workspace.slug) {
            return Err(OrchestratorError::InvalidInput(format!(
                "slug already in use: {}",
                workspace.slug
            )));
        }
        guard.insert(workspace.id.clone(), workspace.clone());
        Ok(workspace)
    }

    async fn update_workspace(
        &self,
        id: &str,
        expected_version: i64,
        workspace: &Workspace,
    ) -> Result<Workspace> {
        let mut guard = self.inner.write();
        let current = guard
            .get(id)
            .ok_or_else(|| OrchestratorError::NotFound(id.to_string()))?;
        Self::check_version(current, expected_version)?;

        let mut stored = workspace.clone();
        stored.id = current.id.clone();
        stored.tenant_id = current.tenant_id.clone();
        stored.name = current.name.clone();
        stored.slug = current.slug.clone();
        stored.created_at = current.created_at;
        stored.last_active_at = current.last_active_at;
        stored.updated_at = Utc::now();
        stored.version = current.version + 1;

        let shared = guard.values().filter(|w| w.id != id).any(|other| {
            stored
                .handles
                .iter()
                .any(|(kind, handle)| other.handles.get(kind) == Some(handle))
        });
        if shared {
            return Err(OrchestratorError::InvalidInput(format!(
                "resource handle already owned by another workspace: {}",
                id
            )));
        }

        guard.insert(id.to_string(), stored.clone());
        Ok(stored)
    }

    async fn delete_workspace(&self, id: &str, expected_version: i64) -> Result<()> {
        let mut guard = self.inner.write();
        let current = guard
            .get(id)
            .ok_or_else(|| OrchestratorError::NotFound(id.to_string()))?;
        Self::check_version(current, expected_version)?;
        guard.remove(id);
        Ok(())
    }

    async fn record_activity(&self, id: &str, at: DateTime<Utc>) -> Result<Workspace> {
        let mut guard = self.inner.write();
        let current = guard
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::NotFound(id.to_string()))?;
        if at > current.last_active_at {
            current.last_active_at = at;
            current.updated_at = Utc::now();
            current.version += 1;
        }
        Ok(current.clone())
    }
}
