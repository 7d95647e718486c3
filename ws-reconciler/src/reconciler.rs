//! The reconciliation loop.
//!
//! One cycle lists every workspace, runs convergence and auto-suspend for
//! each of them, and then, once all of them are done, republishes routing
//! and re-evaluates capacity over the records the pass produced. Failures
//! are contained at the workspace boundary: an error or panic in one
//! workspace is logged and the pass moves on.

use crate::capacity::CapacityManager;
use crate::config::Config;
use crate::convergence::{ConvergenceEngine, ConvergenceOptions, Outcome};
use crate::error::{ReconcilerError, Result};
use crate::routing::RoutingSync;
use crate::supervisor::panic_message;
use crate::suspend::AutoSuspendPolicy;
use chrono::{DateTime, Utc};
use futures::{stream, FutureExt, StreamExt};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use ws_adapters::{ClusterClient, IdentityClient, SearchClient};
use ws_orchestrator::{Workspace, WorkspaceStore};

/// External services the loop drives.
#[derive(Clone)]
pub struct Adapters {
    pub cluster: Arc<dyn ClusterClient>,
    pub identity: Arc<dyn IdentityClient>,
    pub search: Arc<dyn SearchClient>,
}

/// Summary of one cycle.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    /// The listing failed and nothing else ran
    pub skipped: bool,
    pub workspaces: usize,
    /// Steps that changed a record
    pub converged: usize,
    /// Steps that failed, transiently or permanently
    pub failed: usize,
    pub panicked: usize,
    pub removed: usize,
    /// Number of routes published, `None` when the publish failed
    pub routes_published: Option<usize>,
    pub blocked: usize,
}

enum WorkspaceResult {
    Converged(Workspace),
    Unchanged(Workspace),
    Failed(Workspace),
    Panicked(Workspace),
    Removed,
}

pub struct Reconciler {
    store: Arc<dyn WorkspaceStore>,
    engine: ConvergenceEngine,
    suspend: AutoSuspendPolicy,
    routing: RoutingSync,
    capacity: CapacityManager,
    interval: Duration,
    concurrency: usize,
}

impl Reconciler {
    pub fn new(config: &Config, store: Arc<dyn WorkspaceStore>, adapters: Adapters) -> Result<Self> {
        let domain_suffix = config.domain_suffix()?;
        if config.workspace_concurrency == 0 {
            return Err(ReconcilerError::Config(
                "workspace concurrency must be at least 1".to_string(),
            ));
        }

        let engine = ConvergenceEngine::new(
            store.clone(),
            adapters.cluster.clone(),
            adapters.identity,
            adapters.search,
            ConvergenceOptions {
                step_retries: config.step_retries,
                retry_backoff: config.step_retry_backoff(),
                conflict_retries: config.conflict_retries,
            },
        );

        Ok(Self {
            engine,
            suspend: AutoSuspendPolicy::new(store.clone(), config.idle_threshold()),
            routing: RoutingSync::new(adapters.cluster, domain_suffix),
            capacity: CapacityManager::new(store.clone(), config.capacity_policy()),
            store,
            interval: config.interval(),
            concurrency: config.workspace_concurrency,
        })
    }

    /// Runs cycles until `shutdown` is cancelled.
    ///
    /// The next cycle starts one interval after the previous one finished,
    /// so cycles never overlap. Cancellation does not interrupt a cycle in
    /// progress.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            interval_secs = self.interval.as_secs(),
            concurrency = self.concurrency,
            auto_suspend = self.suspend.is_enabled(),
            "reconciler running"
        );

        while !shutdown.is_cancelled() {
            let report = self.run_cycle().await;
            if !report.skipped {
                info!(
                    workspaces = report.workspaces,
                    converged = report.converged,
                    failed = report.failed,
                    panicked = report.panicked,
                    removed = report.removed,
                    blocked = report.blocked,
                    routes = report.routes_published,
                    "reconciliation cycle complete"
                );
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        info!("reconciler stopped");
    }

    pub async fn run_cycle(&self) -> CycleReport {
        self.run_cycle_at(Utc::now()).await
    }

    /// Runs one cycle with `now` as the clock for idle checks.
    pub async fn run_cycle_at(&self, now: DateTime<Utc>) -> CycleReport {
        let workspaces = match self.store.list_workspaces().await {
            Ok(workspaces) => workspaces,
            Err(e) => {
                error!(error = %e, "failed to list workspaces, skipping cycle");
                return CycleReport {
                    skipped: true,
                    ..Default::default()
                };
            }
        };

        let mut report = CycleReport {
            workspaces: workspaces.len(),
            ..Default::default()
        };

        let results: Vec<WorkspaceResult> = stream::iter(workspaces)
            .map(|workspace| self.reconcile_workspace(workspace, now))
            .buffered(self.concurrency)
            .collect()
            .await;

        let mut live = Vec::with_capacity(results.len());
        for result in results {
            match result {
                WorkspaceResult::Converged(w) => {
                    report.converged += 1;
                    live.push(w);
                }
                WorkspaceResult::Unchanged(w) => live.push(w),
                WorkspaceResult::Failed(w) => {
                    report.failed += 1;
                    live.push(w);
                }
                WorkspaceResult::Panicked(w) => {
                    report.panicked += 1;
                    live.push(w);
                }
                WorkspaceResult::Removed => report.removed += 1,
            }
        }

        report.routes_published = self.routing.sync(&live).await.ok();
        report.blocked = self.capacity.enforce(&live).await.blocked;
        report
    }

    async fn reconcile_workspace(&self, workspace: Workspace, now: DateTime<Utc>) -> WorkspaceResult {
        let span = info_span!("workspace", workspace_id = %workspace.id, state = %workspace.state);
        let fallback = workspace.clone();

        let result = AssertUnwindSafe(self.reconcile_one(workspace, now).instrument(span))
            .catch_unwind()
            .await;

        match result {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                warn!(workspace_id = %fallback.id, error = %e, "workspace not reconciled");
                WorkspaceResult::Failed(fallback)
            }
            Err(panic) => {
                error!(
                    workspace_id = %fallback.id,
                    panic = %panic_message(panic.as_ref()),
                    "workspace step panicked, retrying next cycle"
                );
                WorkspaceResult::Panicked(fallback)
            }
        }
    }

    /// Convergence, then auto-suspend. Auto-suspend also runs when the
    /// convergence step failed, against the stored record.
    async fn reconcile_one(&self, workspace: Workspace, now: DateTime<Utc>) -> Result<WorkspaceResult> {
        let id = workspace.id.clone();
        let (current, changed, failed) = match self.engine.converge(workspace).await {
            Ok(step) => {
                debug!(action = %step.action, "convergence step done");
                match step.outcome {
                    Outcome::Unchanged(w) => (w, false, false),
                    Outcome::Persisted(w) => (w, true, false),
                    Outcome::Failed(w) => (w, true, true),
                    Outcome::Removed | Outcome::Vanished => return Ok(WorkspaceResult::Removed),
                }
            }
            Err(e) => {
                warn!(workspace_id = %id, error = %e, "workspace not converged");
                match self.store.get_workspace(&id).await {
                    Ok(stored) => (stored, false, true),
                    Err(e) if e.is_not_found() => return Ok(WorkspaceResult::Removed),
                    Err(e) => return Err(e.into()),
                }
            }
        };

        let current = match self.suspend.apply(current.clone(), now).await {
            Ok(updated) => updated,
            Err(e) => {
                debug!(error = %e, "auto-suspend not applied this cycle");
                current
            }
        };

        Ok(match (changed, failed) {
            (_, true) => WorkspaceResult::Failed(current),
            (true, false) => WorkspaceResult::Converged(current),
            (false, false) => WorkspaceResult::Unchanged(current),
        })
    }
}
