use crate::store::WorkspaceStore;
use crate::workspace::{NewWorkspace, Workspace, WorkspaceState};
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

/// Helper to create an in-memory test database with migrations applied.
///
/// The pool holds a single connection: every new connection to
/// `sqlite::memory:` would otherwise open a fresh, empty database.
pub async fn create_test_db() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    pool
}

/// Builds a workspace record in `state` without touching any store.
///
/// Handles are filled in the way a converged workspace in that state would
/// hold them.
pub fn workspace_in_state(id: &str, class: &str, state: WorkspaceState) -> Workspace {
    workspace_created_at(id, class, state, Utc::now())
}

pub fn workspace_created_at(
    id: &str,
    class: &str,
    state: WorkspaceState,
    created_at: DateTime<Utc>,
) -> Workspace {
    let mut workspace = NewWorkspace::new("tenant-test", id, class)
        .into_workspace(id.to_string(), created_at)
        .expect("Failed to build workspace");
    workspace.state = state;

    let (database, search, routing) = match state {
        WorkspaceState::Provisioning => (false, false, false),
        WorkspaceState::Active | WorkspaceState::Suspending => (true, true, true),
        WorkspaceState::Suspended | WorkspaceState::Resuming => (true, true, false),
        WorkspaceState::Deleting | WorkspaceState::Failed => (true, true, false),
    };
    if database {
        workspace.handles.database = Some(format!("db-{}", id));
    }
    if search {
        workspace.handles.search = Some(format!("search-{}", id));
    }
    if routing {
        workspace.handles.routing_backend = Some(format!("route-{}", id));
    }
    workspace
}

/// Inserts a fresh `Provisioning` workspace through the store.
pub async fn fixture_workspace(
    store: &dyn WorkspaceStore,
    name: &str,
    class: &str,
) -> Workspace {
    store
        .insert_workspace(NewWorkspace::new("tenant-test", name, class))
        .await
        .expect("Failed to create fixture workspace")
}
