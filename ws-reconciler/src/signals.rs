//! Operator and activity signals.
//!
//! These are the only writers of `pending_request` besides auto-suspend, and
//! the only writer of `last_active_at`. Requests are checked against the
//! authorization service through a read-through cache.

use crate::error::{ReconcilerError, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use ws_adapters::{AuthorizationClient, Cache};
use ws_orchestrator::{
    LifecycleRequest, OrchestratorError, Workspace, WorkspaceState, WorkspaceStore,
};

const ALLOWED: &str = "allow";
const DENIED: &str = "deny";

pub struct OperatorSignals {
    store: Arc<dyn WorkspaceStore>,
    authz: Arc<dyn AuthorizationClient>,
    cache: Arc<dyn Cache>,
    cache_ttl: Duration,
    conflict_retries: u32,
}

impl OperatorSignals {
    pub fn new(
        store: Arc<dyn WorkspaceStore>,
        authz: Arc<dyn AuthorizationClient>,
        cache: Arc<dyn Cache>,
        cache_ttl: Duration,
        conflict_retries: u32,
    ) -> Self {
        Self {
            store,
            authz,
            cache,
            cache_ttl,
            conflict_retries,
        }
    }

    /// Files a suspend, resume or delete request on behalf of `actor`.
    ///
    /// A pending delete is never replaced by a suspend or resume; the
    /// record is returned unchanged in that case. Filing a resume also
    /// counts as activity.
    pub async fn request(
        &self,
        actor: &str,
        workspace_id: &str,
        request: LifecycleRequest,
    ) -> Result<Workspace> {
        let action = request.as_str();
        if !self.is_authorized(actor, workspace_id, action).await? {
            return Err(ReconcilerError::Unauthorized {
                actor: actor.to_string(),
                workspace_id: workspace_id.to_string(),
                action: action.to_string(),
            });
        }

        let mut conflicts = 0;
        loop {
            let current = self.store.get_workspace(workspace_id).await?;
            if current.state == WorkspaceState::Deleting {
                return Err(OrchestratorError::InvalidInput(format!(
                    "workspace {} is being deleted",
                    workspace_id
                ))
                .into());
            }
            if current.pending_request == Some(request) {
                return Ok(current);
            }
            if current.pending_request == Some(LifecycleRequest::Delete) {
                debug!(workspace_id, request = %request, "delete already pending");
                return Ok(current);
            }

            let mut next = current.clone();
            next.pending_request = Some(request);
            match self
                .store
                .update_workspace(workspace_id, current.version, &next)
                .await
            {
                Ok(updated) => {
                    info!(workspace_id, actor, request = %request, "lifecycle request filed");
                    if request == LifecycleRequest::Resume {
                        // Otherwise auto-suspend re-flags the workspace as
                        // soon as it is Active again.
                        return Ok(self.store.record_activity(workspace_id, Utc::now()).await?);
                    }
                    return Ok(updated);
                }
                Err(e) if e.is_version_conflict() && conflicts < self.conflict_retries => {
                    conflicts += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Records user activity; `last_active_at` never moves backwards.
    pub async fn record_activity(&self, workspace_id: &str, at: DateTime<Utc>) -> Result<Workspace> {
        Ok(self.store.record_activity(workspace_id, at).await?)
    }

    async fn is_authorized(&self, actor: &str, workspace_id: &str, action: &str) -> Result<bool> {
        let key = format!("authz:{}:{}:{}", actor, workspace_id, action);
        match self.cache.get(&key).await.as_deref() {
            Some(ALLOWED) => return Ok(true),
            Some(DENIED) => return Ok(false),
            _ => {}
        }

        let allowed = self
            .authz
            .authorize(actor, workspace_id, action)
            .await
            .map_err(|source| ReconcilerError::Adapter {
                step: "authorize",
                source,
            })?;

        let value = if allowed { ALLOWED } else { DENIED };
        self.cache.set(&key, value, self.cache_ttl).await;
        Ok(allowed)
    }
}
