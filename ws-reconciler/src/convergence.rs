//! Convergence Engine: moves one workspace one step closer to its target.
//!
//! [`plan`] is a pure function of the record. [`ConvergenceEngine::converge`]
//! performs at most one external call for the planned action and persists
//! the result with the record's version, so a concurrent writer can never be
//! overwritten. Resource creation is keyed by workspace ID on the adapter
//! side, which makes a step safe to repeat after a lost write.

use crate::error::{ReconcilerError, Result};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use ws_adapters::{
    AdapterError, AdapterResult, ClusterClient, IdentityClient, ResourceRequest, SearchClient,
};
use ws_orchestrator::{
    LifecycleRequest, ResourceKind, Workspace, WorkspaceState, WorkspaceStore,
};

use WorkspaceState::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Noop,
    /// Waiting for capacity before the routing backend may be created
    Blocked,
    /// Drop a request that no longer applies to the current state
    ClearRequest,
    Transition(WorkspaceState),
    Create(ResourceKind),
    Release(ResourceKind),
    /// Delete the record; every handle is gone
    Remove,
}

impl Action {
    /// Name used in logs for the external call this action makes.
    pub fn step_name(&self) -> &'static str {
        match self {
            Action::Noop => "noop",
            Action::Blocked => "blocked",
            Action::ClearRequest => "clear_request",
            Action::Transition(_) => "transition",
            Action::Create(ResourceKind::Database) => "create_credentials",
            Action::Create(ResourceKind::Search) => "create_search_endpoint",
            Action::Create(ResourceKind::Routing) => "create_routing_backend",
            Action::Release(ResourceKind::Database) => "delete_credentials",
            Action::Release(ResourceKind::Search) => "delete_search_endpoint",
            Action::Release(ResourceKind::Routing) => "delete_routing_backend",
            Action::Remove => "remove",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Transition(state) => write!(f, "transition to {}", state),
            other => f.write_str(other.step_name()),
        }
    }
}

/// Decides the next step for `workspace`.
pub fn plan(workspace: &Workspace) -> Action {
    let handles = &workspace.handles;
    let request = workspace.pending_request;

    if workspace.state == Deleting {
        return match handles.next_to_release() {
            Some(kind) => Action::Release(kind),
            None => Action::Remove,
        };
    }
    if request == Some(LifecycleRequest::Delete) {
        return Action::Transition(Deleting);
    }

    let action = match workspace.effective_state() {
        Provisioning => match handles.next_missing() {
            Some(ResourceKind::Routing) if workspace.provisioning_blocked => Action::Blocked,
            Some(kind) => Action::Create(kind),
            None => Action::Transition(Active),
        },
        Active => match (request, handles.next_missing()) {
            (Some(LifecycleRequest::Suspend), _) => Action::Transition(Suspending),
            (_, Some(kind)) => Action::Create(kind),
            (Some(LifecycleRequest::Resume), None) => Action::ClearRequest,
            _ => Action::Noop,
        },
        Suspending => match handles.routing_backend {
            Some(_) => Action::Release(ResourceKind::Routing),
            None => Action::Transition(Suspended),
        },
        Suspended => match request {
            Some(LifecycleRequest::Resume) => Action::Transition(Resuming),
            Some(LifecycleRequest::Suspend) => Action::ClearRequest,
            _ if handles.routing_backend.is_some() => Action::Release(ResourceKind::Routing),
            _ => Action::Noop,
        },
        Resuming => match handles.next_missing() {
            Some(kind) => Action::Create(kind),
            None => Action::Transition(Active),
        },
        // effective_state never yields these
        Deleting | Failed => Action::Noop,
    };

    match (workspace.state, action) {
        (Failed, Action::Noop) => Action::Transition(workspace.effective_state()),
        (_, action) => action,
    }
}

/// Whether entering `target` consumes the pending `request`.
fn consumes(request: Option<LifecycleRequest>, target: WorkspaceState) -> bool {
    matches!(
        (request, target),
        (Some(_), Deleting)
            | (Some(LifecycleRequest::Suspend), Suspending)
            | (Some(LifecycleRequest::Resume), Resuming)
    )
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Nothing was written
    Unchanged(Workspace),
    /// The step succeeded and the new record was stored
    Persisted(Workspace),
    /// The step failed permanently; the stored record carries the error
    Failed(Workspace),
    /// The record was deleted after its last handle was released
    Removed,
    /// The record disappeared underneath us
    Vanished,
}

impl Outcome {
    pub fn workspace(&self) -> Option<&Workspace> {
        match self {
            Outcome::Unchanged(w) | Outcome::Persisted(w) | Outcome::Failed(w) => Some(w),
            Outcome::Removed | Outcome::Vanished => None,
        }
    }

    pub fn into_workspace(self) -> Option<Workspace> {
        match self {
            Outcome::Unchanged(w) | Outcome::Persisted(w) | Outcome::Failed(w) => Some(w),
            Outcome::Removed | Outcome::Vanished => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepResult {
    pub action: Action,
    pub outcome: Outcome,
}

#[derive(Debug, Clone)]
pub struct ConvergenceOptions {
    /// Extra attempts for a transient adapter failure within one cycle
    pub step_retries: u32,
    pub retry_backoff: Duration,
    /// Reload-and-replan attempts after a version conflict
    pub conflict_retries: u32,
}

impl Default for ConvergenceOptions {
    fn default() -> Self {
        Self {
            step_retries: 2,
            retry_backoff: Duration::from_millis(250),
            conflict_retries: 3,
        }
    }
}

pub struct ConvergenceEngine {
    store: Arc<dyn WorkspaceStore>,
    cluster: Arc<dyn ClusterClient>,
    identity: Arc<dyn IdentityClient>,
    search: Arc<dyn SearchClient>,
    options: ConvergenceOptions,
}

impl ConvergenceEngine {
    pub fn new(
        store: Arc<dyn WorkspaceStore>,
        cluster: Arc<dyn ClusterClient>,
        identity: Arc<dyn IdentityClient>,
        search: Arc<dyn SearchClient>,
        options: ConvergenceOptions,
    ) -> Self {
        Self {
            store,
            cluster,
            identity,
            search,
            options,
        }
    }

    /// Runs one convergence step for `workspace`.
    ///
    /// Transient adapter failures that outlive the retries come back as
    /// [`ReconcilerError::Adapter`] with nothing persisted.
    pub async fn converge(&self, workspace: Workspace) -> Result<StepResult> {
        let mut current = workspace;
        let mut conflicts = 0;

        loop {
            let action = plan(&current);
            match self.execute(&current, action).await {
                Ok(outcome) => return Ok(StepResult { action, outcome }),
                Err(e) if e.is_not_found() => {
                    debug!(workspace_id = %current.id, "workspace removed during step");
                    return Ok(StepResult {
                        action,
                        outcome: Outcome::Vanished,
                    });
                }
                Err(e) if e.is_version_conflict() && conflicts < self.options.conflict_retries => {
                    conflicts += 1;
                    debug!(
                        workspace_id = %current.id,
                        step = action.step_name(),
                        attempt = conflicts,
                        "version conflict, reloading"
                    );
                    current = match self.store.get_workspace(&current.id).await {
                        Ok(reloaded) => reloaded,
                        Err(e) if e.is_not_found() => {
                            return Ok(StepResult {
                                action,
                                outcome: Outcome::Vanished,
                            })
                        }
                        Err(e) => return Err(e.into()),
                    };
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn execute(&self, workspace: &Workspace, action: Action) -> Result<Outcome> {
        match action {
            Action::Noop => Ok(Outcome::Unchanged(workspace.clone())),
            Action::Blocked => {
                debug!(workspace_id = %workspace.id, "waiting for capacity");
                Ok(Outcome::Unchanged(workspace.clone()))
            }
            Action::ClearRequest => {
                let mut next = workspace.clone();
                next.pending_request = None;
                self.persist(workspace, next).await
            }
            Action::Transition(target) => {
                let mut next = workspace.clone();
                if consumes(next.pending_request, target) {
                    next.pending_request = None;
                }
                next.transition_to(target)?;
                info!(
                    workspace_id = %workspace.id,
                    from = %workspace.state,
                    to = %target,
                    "workspace transition"
                );
                self.persist(workspace, next).await
            }
            Action::Create(kind) => match self.create(workspace, kind).await {
                Ok(handle) => {
                    let mut next = workspace.clone();
                    self.leave_failed(&mut next)?;
                    next.handles.set(kind, Some(handle));
                    if next.handles.is_complete() && matches!(next.state, Provisioning | Resuming)
                    {
                        next.transition_to(Active)?;
                        info!(workspace_id = %workspace.id, from = %workspace.state, "workspace active");
                    }
                    self.persist(workspace, next).await
                }
                Err(e) => self.step_failed(workspace, action, e).await,
            },
            Action::Release(kind) => match self.release(workspace, kind).await {
                Ok(()) => {
                    let mut next = workspace.clone();
                    self.leave_failed(&mut next)?;
                    next.handles.set(kind, None);
                    if next.state == Suspending && kind == ResourceKind::Routing {
                        next.transition_to(Suspended)?;
                        info!(workspace_id = %workspace.id, "workspace suspended");
                    }
                    self.persist(workspace, next).await
                }
                Err(e) => self.step_failed(workspace, action, e).await,
            },
            Action::Remove => {
                self.store
                    .delete_workspace(&workspace.id, workspace.version)
                    .await?;
                info!(workspace_id = %workspace.id, "workspace removed");
                Ok(Outcome::Removed)
            }
        }
    }

    async fn persist(&self, previous: &Workspace, next: Workspace) -> Result<Outcome> {
        let stored = self
            .store
            .update_workspace(&previous.id, previous.version, &next)
            .await?;
        Ok(Outcome::Persisted(stored))
    }

    /// A successful step on a failed workspace resumes its lifecycle.
    fn leave_failed(&self, workspace: &mut Workspace) -> Result<()> {
        if workspace.state == Failed {
            let resumed = workspace.effective_state();
            workspace.transition_to(resumed)?;
            info!(workspace_id = %workspace.id, state = %resumed, "workspace recovered");
        }
        Ok(())
    }

    async fn step_failed(
        &self,
        workspace: &Workspace,
        action: Action,
        error: AdapterError,
    ) -> Result<Outcome> {
        let step = action.step_name();
        if error.is_transient() {
            warn!(workspace_id = %workspace.id, step, error = %error, "step failed, will retry next cycle");
            return Err(ReconcilerError::Adapter {
                step,
                source: error,
            });
        }

        let message = format!("{}: {}", step, error);
        let mut next = workspace.clone();
        if workspace.state == Deleting {
            // Deleting is absorbing; keep the error and retry the release
            warn!(workspace_id = %workspace.id, step, error = %error, "release rejected");
            next.error_message = Some(message);
        } else {
            warn!(workspace_id = %workspace.id, step, error = %error, "step rejected, marking workspace failed");
            next.fail(message)?;
        }

        let stored = self
            .store
            .update_workspace(&workspace.id, workspace.version, &next)
            .await?;
        Ok(Outcome::Failed(stored))
    }

    fn resource_request(workspace: &Workspace) -> ResourceRequest {
        ResourceRequest {
            workspace_id: workspace.id.clone(),
            tenant_id: workspace.tenant_id.clone(),
            slug: workspace.slug.clone(),
            resource_class: workspace.resource_class.clone(),
        }
    }

    async fn create_once(&self, kind: ResourceKind, req: &ResourceRequest) -> AdapterResult<String> {
        match kind {
            ResourceKind::Database => self.identity.create_credentials(req).await,
            ResourceKind::Search => self.search.create_search_endpoint(req).await,
            ResourceKind::Routing => self.cluster.create_routing_backend(req).await,
        }
    }

    async fn release_once(
        &self,
        kind: ResourceKind,
        workspace_id: &str,
        handle: &str,
    ) -> AdapterResult<()> {
        match kind {
            ResourceKind::Database => self.identity.delete_credentials(workspace_id, handle).await,
            ResourceKind::Search => self.search.delete_search_endpoint(workspace_id, handle).await,
            ResourceKind::Routing => {
                self.cluster
                    .delete_routing_backend(workspace_id, handle)
                    .await
            }
        }
    }

    /// Creates the resource, treating an existing one as success.
    async fn create(&self, workspace: &Workspace, kind: ResourceKind) -> AdapterResult<String> {
        let req = Self::resource_request(workspace);
        let step = Action::Create(kind).step_name();
        let mut attempt = 0;

        loop {
            match self.create_once(kind, &req).await {
                Ok(handle) => return Ok(handle),
                Err(AdapterError::AlreadyExists { handle }) => {
                    debug!(workspace_id = %workspace.id, step, handle = %handle, "resource already exists");
                    return Ok(handle);
                }
                Err(e) if e.is_transient() && attempt < self.options.step_retries => {
                    attempt += 1;
                    self.backoff(&workspace.id, step, attempt, &e).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Releases the resource, treating a missing one as success.
    async fn release(&self, workspace: &Workspace, kind: ResourceKind) -> AdapterResult<()> {
        let Some(handle) = workspace.handles.get(kind) else {
            return Ok(());
        };
        let step = Action::Release(kind).step_name();
        let mut attempt = 0;

        loop {
            match self.release_once(kind, &workspace.id, handle).await {
                Ok(()) => return Ok(()),
                Err(AdapterError::NotFound(_)) => {
                    debug!(workspace_id = %workspace.id, step, handle = %handle, "resource already gone");
                    return Ok(());
                }
                Err(e) if e.is_transient() && attempt < self.options.step_retries => {
                    attempt += 1;
                    self.backoff(&workspace.id, step, attempt, &e).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn backoff(&self, workspace_id: &str, step: &str, attempt: u32, error: &AdapterError) {
        let delay = self.options.retry_backoff * attempt;
        debug!(
            workspace_id = %workspace_id,
            step,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "retrying transient failure"
        );
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ws_orchestrator::test_utils::workspace_in_state;

    fn with_request(state: WorkspaceState, request: LifecycleRequest) -> Workspace {
        let mut workspace = workspace_in_state("ws-1", "small", state);
        workspace.pending_request = Some(request);
        workspace
    }

    #[test]
    fn provisioning_creates_in_order() {
        let mut workspace = workspace_in_state("ws-1", "small", Provisioning);
        assert_eq!(plan(&workspace), Action::Create(ResourceKind::Database));

        workspace.handles.database = Some("db".into());
        assert_eq!(plan(&workspace), Action::Create(ResourceKind::Search));

        workspace.handles.search = Some("search".into());
        assert_eq!(plan(&workspace), Action::Create(ResourceKind::Routing));

        workspace.provisioning_blocked = true;
        assert_eq!(plan(&workspace), Action::Blocked);
    }

    #[test]
    fn blocked_provisioning_still_creates_durable_resources() {
        let mut workspace = workspace_in_state("ws-1", "small", Provisioning);
        workspace.provisioning_blocked = true;
        assert_eq!(plan(&workspace), Action::Create(ResourceKind::Database));
    }

    #[test]
    fn converged_active_is_noop() {
        let workspace = workspace_in_state("ws-1", "small", Active);
        assert_eq!(plan(&workspace), Action::Noop);
    }

    #[test]
    fn active_requests() {
        assert_eq!(
            plan(&with_request(Active, LifecycleRequest::Suspend)),
            Action::Transition(Suspending)
        );
        assert_eq!(
            plan(&with_request(Active, LifecycleRequest::Resume)),
            Action::ClearRequest
        );

        let mut drifted = workspace_in_state("ws-1", "small", Active);
        drifted.handles.search = None;
        assert_eq!(plan(&drifted), Action::Create(ResourceKind::Search));
    }

    #[test]
    fn delete_wins_over_everything_but_deleting() {
        for state in [Provisioning, Active, Suspending, Suspended, Resuming, Failed] {
            assert_eq!(
                plan(&with_request(state, LifecycleRequest::Delete)),
                Action::Transition(Deleting),
                "{state}"
            );
        }
    }

    #[test]
    fn suspend_and_resume_paths() {
        assert_eq!(
            plan(&workspace_in_state("ws-1", "small", Suspending)),
            Action::Release(ResourceKind::Routing)
        );

        let mut released = workspace_in_state("ws-1", "small", Suspending);
        released.handles.routing_backend = None;
        assert_eq!(plan(&released), Action::Transition(Suspended));

        assert_eq!(plan(&workspace_in_state("ws-1", "small", Suspended)), Action::Noop);
        assert_eq!(
            plan(&with_request(Suspended, LifecycleRequest::Resume)),
            Action::Transition(Resuming)
        );
        assert_eq!(
            plan(&with_request(Suspended, LifecycleRequest::Suspend)),
            Action::ClearRequest
        );
        assert_eq!(
            plan(&workspace_in_state("ws-1", "small", Resuming)),
            Action::Create(ResourceKind::Routing)
        );
    }

    #[test]
    fn deleting_releases_in_reverse_order() {
        let mut workspace = workspace_in_state("ws-1", "small", Deleting);
        workspace.handles.routing_backend = Some("route".into());
        assert_eq!(plan(&workspace), Action::Release(ResourceKind::Routing));

        workspace.handles.routing_backend = None;
        assert_eq!(plan(&workspace), Action::Release(ResourceKind::Search));

        workspace.handles.search = None;
        assert_eq!(plan(&workspace), Action::Release(ResourceKind::Database));

        workspace.handles.database = None;
        assert_eq!(plan(&workspace), Action::Remove);
    }

    #[test]
    fn failed_plans_as_the_state_it_failed_from() {
        let mut workspace = workspace_in_state("ws-1", "small", Failed);
        workspace.failed_from = Some(Suspending);
        workspace.handles.routing_backend = Some("route".into());
        assert_eq!(plan(&workspace), Action::Release(ResourceKind::Routing));

        let mut unknown = workspace_in_state("ws-1", "small", Failed);
        unknown.handles = Default::default();
        assert_eq!(plan(&unknown), Action::Create(ResourceKind::Database));

        let mut settled = workspace_in_state("ws-1", "small", Failed);
        settled.failed_from = Some(Suspended);
        assert_eq!(plan(&settled), Action::Transition(Suspended));
    }

    #[test]
    fn request_consumption() {
        assert!(consumes(Some(LifecycleRequest::Delete), Deleting));
        assert!(consumes(Some(LifecycleRequest::Suspend), Suspending));
        assert!(consumes(Some(LifecycleRequest::Resume), Resuming));
        assert!(!consumes(Some(LifecycleRequest::Suspend), Active));
        assert!(!consumes(None, Deleting));
    }
}
