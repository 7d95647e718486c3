use crate::error::{OrchestratorError, Result};
use crate::store::WorkspaceStore;
use crate::workspace::{
    LifecycleRequest, NewWorkspace, ResourceHandles, Workspace, WorkspaceState,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct WorkspaceFilters {
    pub tenant_id: Option<String>,
    pub state: Option<WorkspaceState>,
}

/// SQLite-backed workspace repository.
#[derive(Clone)]
pub struct SqliteWorkspaceStore {
    pool: SqlitePool,
}

impl SqliteWorkspaceStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Get a reference to the database pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// List workspaces with optional filters
    pub async fn list_filtered(&self, filters: WorkspaceFilters) -> Result<Vec<Workspace>> {
        let mut query = "SELECT * FROM workspaces WHERE 1=1".to_string();

        if filters.tenant_id.is_some() {
            query.push_str(" AND tenant_id = ?");
        }
        if filters.state.is_some() {
            query.push_str(" AND state = ?");
        }

        query.push_str(" ORDER BY created_at ASC, id ASC");

        let mut q = sqlx::query_as::<_, WorkspaceRow>(&query);

        if let Some(tenant_id) = &filters.tenant_id {
            q = q.bind(tenant_id);
        }
        if let Some(state) = &filters.state {
            q = q.bind(state);
        }

        let rows = q.fetch_all(&self.pool).await?;

        Ok(rows.into_iter().map(|row| row.into()).collect())
    }

    /// Explains a guarded write that touched no rows.
    async fn miss(&self, id: &str, expected_version: i64) -> OrchestratorError {
        let current: std::result::Result<Option<(i64,)>, sqlx::Error> =
            sqlx::query_as("SELECT version FROM workspaces WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await;

        match current {
            Ok(Some((actual,))) => OrchestratorError::VersionConflict {
                id: id.to_string(),
                expected: expected_version,
                actual,
            },
            Ok(None) => OrchestratorError::NotFound(id.to_string()),
            Err(e) => OrchestratorError::Database(e),
        }
    }
}

#[async_trait]
impl WorkspaceStore for SqliteWorkspaceStore {
    async fn list_workspaces(&self) -> Result<Vec<Workspace>> {
        self.list_filtered(WorkspaceFilters::default()).await
    }

    async fn get_workspace(&self, id: &str) -> Result<Workspace> {
        let row = sqlx::query_as::<_, WorkspaceRow>("SELECT * FROM workspaces WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(id.to_string()))?;

        Ok(row.into())
    }

    async fn insert_workspace(&self, req: NewWorkspace) -> Result<Workspace> {
        let id = Uuid::new_v4().to_string();
        let workspace = req.into_workspace(id, Utc::now())?;
        let now = workspace.created_at.timestamp();

        sqlx::query(
            r#"
            INSERT INTO workspaces (id, tenant_id, name, slug, state, resource_class, provisioning_blocked, last_active_at, created_at, updated_at, version)
            VALUES (?, ?, ?, ?, ?, ?, 0, ?, ?, ?, 1)
            "#,
        )
        .bind(&workspace.id)
        .bind(&workspace.tenant_id)
        .bind(&workspace.name)
        .bind(&workspace.slug)
        .bind(workspace.state)
        .bind(&workspace.resource_class)
        .bind(now)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            let duplicate = e
                .as_database_error()
                .is_some_and(|db| db.is_unique_violation());
            if duplicate {
                OrchestratorError::InvalidInput(format!("slug already in use: {}", workspace.slug))
            } else {
                OrchestratorError::Database(e)
            }
        })?;

        debug!(workspace_id = %workspace.id, slug = %workspace.slug, "inserted workspace");

        self.get_workspace(&workspace.id).await
    }

    async fn update_workspace(
        &self,
        id: &str,
        expected_version: i64,
        workspace: &Workspace,
    ) -> Result<Workspace> {
        let now = Utc::now().timestamp();

        let result = sqlx::query(
            "UPDATE workspaces
             SET state = ?, resource_class = ?, database_handle = ?, search_handle = ?,
                 routing_backend = ?, pending_request = ?, provisioning_blocked = ?,
                 failed_from = ?, error_message = ?, updated_at = ?, version = version + 1
             WHERE id = ? AND version = ?",
        )
        .bind(workspace.state)
        .bind(&workspace.resource_class)
        .bind(&workspace.handles.database)
        .bind(&workspace.handles.search)
        .bind(&workspace.handles.routing_backend)
        .bind(workspace.pending_request)
        .bind(workspace.provisioning_blocked)
        .bind(workspace.failed_from)
        .bind(&workspace.error_message)
        .bind(now)
        .bind(id)
        .bind(expected_version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.miss(id, expected_version).await);
        }

        self.get_workspace(id).await
    }

    async fn delete_workspace(&self, id: &str, expected_version: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM workspaces WHERE id = ? AND version = ?")
            .bind(id)
            .bind(expected_version)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(self.miss(id, expected_version).await);
        }

        Ok(())
    }

    async fn record_activity(&self, id: &str, at: DateTime<Utc>) -> Result<Workspace> {
        let now = Utc::now().timestamp();

        sqlx::query(
            "UPDATE workspaces
             SET last_active_at = ?, updated_at = ?, version = version + 1
             WHERE id = ? AND last_active_at < ?",
        )
        .bind(at.timestamp())
        .bind(now)
        .bind(id)
        .bind(at.timestamp())
        .execute(&self.pool)
        .await?;

        self.get_workspace(id).await
    }
}

// Internal row type for sqlx
#[derive(sqlx::FromRow)]
struct WorkspaceRow {
    id: String,
    tenant_id: String,
    name: String,
    slug: String,
    state: WorkspaceState,
    resource_class: String,
    database_handle: Option<String>,
    search_handle: Option<String>,
    routing_backend: Option<String>,
    pending_request: Option<LifecycleRequest>,
    provisioning_blocked: bool,
    failed_from: Option<WorkspaceState>,
    error_message: Option<String>,
    last_active_at: i64,
    created_at: i64,
    updated_at: i64,
    version: i64,
}

fn timestamp(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

impl From<WorkspaceRow> for Workspace {
    fn from(row: WorkspaceRow) -> Self {
        Self {
            id: row.id,
            tenant_id: row.tenant_id,
            name: row.name,
            slug: row.slug,
            state: row.state,
            resource_class: row.resource_class,
            handles: ResourceHandles {
                database: row.database_handle,
                search: row.search_handle,
                routing_backend: row.routing_backend,
            },
            pending_request: row.pending_request,
            provisioning_blocked: row.provisioning_blocked,
            failed_from: row.failed_from,
            error_message: row.error_message,
            last_active_at: timestamp(row.last_active_at),
            created_at: timestamp(row.created_at),
            updated_at: timestamp(row.updated_at),
            version: row.version,
        }
    }
}
