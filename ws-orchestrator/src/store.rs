//! Workspace repository contract.
//!
//! The store is the single source of truth for workspace records. Every
//! mutation is guarded by the record's `version`: writers pass the version
//! they read, and the write only lands if nobody else got there first.

use crate::error::Result;
use crate::workspace::{NewWorkspace, Workspace};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[async_trait]
pub trait WorkspaceStore: Send + Sync {
    async fn list_workspaces(&self) -> Result<Vec<Workspace>>;

    async fn get_workspace(&self, id: &str) -> Result<Workspace>;

    /// Creates a workspace in `Provisioning` at version 1.
    async fn insert_workspace(&self, req: NewWorkspace) -> Result<Workspace>;

    /// Persists the mutable fields of `workspace` if the stored version is
    /// still `expected_version`, returning the stored record.
    ///
    /// Fails with `VersionConflict` when the record moved on, or `NotFound`
    /// when it no longer exists.
    async fn update_workspace(
        &self,
        id: &str,
        expected_version: i64,
        workspace: &Workspace,
    ) -> Result<Workspace>;

    /// Removes the record, with the same version check as updates.
    async fn delete_workspace(&self, id: &str, expected_version: i64) -> Result<()>;

    /// Raises `last_active_at` to `at`. Older signals are ignored.
    async fn record_activity(&self, id: &str, at: DateTime<Utc>) -> Result<Workspace>;
}
