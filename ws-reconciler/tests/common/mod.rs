//! Common test utilities and helpers for ws-reconciler tests
//!
//! Every test drives the real reconciler against an in-memory store and the
//! `FakeCloud` adapters, so the observable effects are the stored records
//! and the calls the fake recorded.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use ws_adapters::fake::FakeCloud;
use ws_orchestrator::test_utils::workspace_in_state;
use ws_orchestrator::{
    MemoryWorkspaceStore, NewWorkspace, OrchestratorError, Result, Workspace, WorkspaceState,
    WorkspaceStore,
};
use ws_reconciler::{Adapters, Config, Reconciler};

pub const DOMAIN: &str = "ws.example.com";

/// Config with fast retries and the default quotas
pub fn test_config() -> Config {
    Config {
        domain_suffix: Some(DOMAIN.to_string()),
        reconciler_interval_secs: 1,
        step_retries: 1,
        step_retry_backoff_ms: 1,
        class_quotas: BTreeMap::from([("small".to_string(), 10)]),
        ..Config::default()
    }
}

pub fn adapters(cloud: &FakeCloud) -> Adapters {
    Adapters {
        cluster: Arc::new(cloud.clone()),
        identity: Arc::new(cloud.clone()),
        search: Arc::new(cloud.clone()),
    }
}

pub struct Harness {
    pub store: Arc<ScriptedStore>,
    pub cloud: FakeCloud,
    pub reconciler: Arc<Reconciler>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: Config) -> Self {
        let store = Arc::new(ScriptedStore::new());
        let cloud = FakeCloud::new();
        let reconciler = Reconciler::new(&config, store.clone(), adapters(&cloud))
            .expect("Failed to build reconciler");
        Self {
            store,
            cloud,
            reconciler: Arc::new(reconciler),
        }
    }

    /// Stores a converged workspace in `state` and registers its handles
    /// with the fake cloud.
    pub fn seed(&self, id: &str, class: &str, state: WorkspaceState) -> Workspace {
        let workspace = workspace_in_state(id, class, state);
        self.seed_workspace(workspace)
    }

    pub fn seed_workspace(&self, workspace: Workspace) -> Workspace {
        for (_, handle) in workspace.handles.iter() {
            self.cloud.seed_handle(&workspace.id, handle);
        }
        self.store.inner.put(workspace.clone());
        workspace
    }

    pub async fn insert(&self, name: &str, class: &str) -> Workspace {
        self.store
            .insert_workspace(NewWorkspace::new("tenant-test", name, class))
            .await
            .expect("Failed to insert workspace")
    }

    pub async fn get(&self, id: &str) -> Workspace {
        self.store
            .get_workspace(id)
            .await
            .expect("Failed to load workspace")
    }

    pub async fn cycles(&self, n: usize) {
        for _ in 0..n {
            self.reconciler.run_cycle().await;
        }
    }
}

/// Memory store with scriptable misbehavior.
pub struct ScriptedStore {
    pub inner: MemoryWorkspaceStore,
    fail_list: AtomicBool,
    /// Applied to the stored record right before the next update of that ID,
    /// as if another writer got there first.
    interfere: Mutex<BTreeMap<String, Box<dyn FnOnce(&mut Workspace) + Send>>>,
}

impl ScriptedStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryWorkspaceStore::new(),
            fail_list: AtomicBool::new(false),
            interfere: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn fail_list(&self, fail: bool) {
        self.fail_list.store(fail, Ordering::SeqCst);
    }

    pub fn interfere_before_update<F>(&self, id: &str, change: F)
    where
        F: FnOnce(&mut Workspace) + Send + 'static,
    {
        self.interfere
            .lock()
            .insert(id.to_string(), Box::new(change));
    }
}

#[async_trait]
impl WorkspaceStore for ScriptedStore {
    async fn list_workspaces(&self) -> Result<Vec<Workspace>> {
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(OrchestratorError::InvalidInput(
                "database is locked".to_string(),
            ));
        }
        self.inner.list_workspaces().await
    }

    async fn get_workspace(&self, id: &str) -> Result<Workspace> {
        self.inner.get_workspace(id).await
    }

    async fn insert_workspace(&self, new: NewWorkspace) -> Result<Workspace> {
        self.inner.insert_workspace(new).await
    }

    async fn update_workspace(
        &self,
        id: &str,
        expected_version: i64,
        workspace: &Workspace,
    ) -> Result<Workspace> {
        let change = self.interfere.lock().remove(id);
        if let Some(change) = change {
            let mut current = self.inner.get_workspace(id).await?;
            change(&mut current);
            self.inner
                .update_workspace(id, current.version, &current)
                .await?;
        }
        self.inner
            .update_workspace(id, expected_version, workspace)
            .await
    }

    async fn delete_workspace(&self, id: &str, expected_version: i64) -> Result<()> {
        self.inner.delete_workspace(id, expected_version).await
    }

    async fn record_activity(&self, id: &str, at: DateTime<Utc>) -> Result<Workspace> {
        self.inner.record_activity(id, at).await
    }
}
