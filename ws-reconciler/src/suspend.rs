use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::info;
use ws_orchestrator::{LifecycleRequest, Result, Workspace, WorkspaceState, WorkspaceStore};

/// True when an Active workspace has been idle longer than `idle_threshold`.
///
/// A zero or negative threshold disables the policy.
pub fn should_request_suspend(
    now: DateTime<Utc>,
    last_active_at: DateTime<Utc>,
    idle_threshold: Duration,
    state: WorkspaceState,
) -> bool {
    if idle_threshold <= Duration::zero() {
        return false;
    }
    state == WorkspaceState::Active && now - last_active_at > idle_threshold
}

/// Files a suspend request for idle workspaces.
///
/// The policy never suspends anything itself; convergence picks the request
/// up on the next pass.
pub struct AutoSuspendPolicy {
    store: Arc<dyn WorkspaceStore>,
    idle_threshold: Duration,
}

impl AutoSuspendPolicy {
    pub fn new(store: Arc<dyn WorkspaceStore>, idle_threshold: Duration) -> Self {
        Self {
            store,
            idle_threshold,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.idle_threshold > Duration::zero()
    }

    /// Returns the record after the policy ran, which is `workspace` itself
    /// when nothing was written.
    pub async fn apply(&self, workspace: Workspace, now: DateTime<Utc>) -> Result<Workspace> {
        if workspace.pending_request.is_some()
            || !should_request_suspend(
                now,
                workspace.last_active_at,
                self.idle_threshold,
                workspace.state,
            )
        {
            return Ok(workspace);
        }

        let mut next = workspace.clone();
        next.pending_request = Some(LifecycleRequest::Suspend);
        let updated = self
            .store
            .update_workspace(&workspace.id, workspace.version, &next)
            .await?;

        info!(
            workspace_id = %workspace.id,
            idle_minutes = (now - workspace.last_active_at).num_minutes(),
            "idle workspace flagged for suspension"
        );
        Ok(updated)
    }
}
