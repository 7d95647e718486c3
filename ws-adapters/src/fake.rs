//! In-memory fake of every external service, for tests.
//!
//! One `FakeCloud` implements all adapter traits so a test can inspect
//! every call made during a cycle in order. Failures and panics are
//! injected per [`Operation`].

use crate::error::AdapterError;
use crate::traits::{
    AdapterResult, AuthorizationClient, Cache, ClusterClient, IdentityClient, SearchClient,
};
use crate::types::{ResourceRequest, RoutingTable};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Operation {
    CreateCredentials,
    DeleteCredentials,
    CreateSearchEndpoint,
    DeleteSearchEndpoint,
    CreateRoutingBackend,
    DeleteRoutingBackend,
    PublishRoutingTable,
    Authorize,
}

impl Operation {
    pub fn is_create(self) -> bool {
        matches!(
            self,
            Operation::CreateCredentials
                | Operation::CreateSearchEndpoint
                | Operation::CreateRoutingBackend
        )
    }

    pub fn is_delete(self) -> bool {
        matches!(
            self,
            Operation::DeleteCredentials
                | Operation::DeleteSearchEndpoint
                | Operation::DeleteRoutingBackend
        )
    }
}

/// Recorded adapter call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterCall {
    pub operation: Operation,
    /// Empty for table publishes
    pub workspace_id: String,
}

#[derive(Default)]
struct FakeCloudState {
    calls: Vec<AdapterCall>,
    /// Live handle -> owning workspace
    live: BTreeMap<String, String>,
    published: Vec<RoutingTable>,
    fail_next: HashMap<Operation, VecDeque<AdapterError>>,
    fail_always: HashMap<Operation, AdapterError>,
    lose_response: HashSet<Operation>,
    panic_next: HashMap<Operation, Option<String>>,
    denied: HashSet<String>,
}

#[derive(Clone, Default)]
pub struct FakeCloud {
    inner: Arc<Mutex<FakeCloudState>>,
}

impl FakeCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next call of `operation` with `error`. Queued errors are
    /// consumed in order.
    pub fn fail_next(&self, operation: Operation, error: AdapterError) {
        self.inner
            .lock()
            .fail_next
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    /// Fail every call of `operation` until [`FakeCloud::clear_failures`].
    pub fn fail_always(&self, operation: Operation, error: AdapterError) {
        self.inner.lock().fail_always.insert(operation, error);
    }

    pub fn clear_failures(&self) {
        let mut state = self.inner.lock();
        state.fail_next.clear();
        state.fail_always.clear();
        state.lose_response.clear();
        state.panic_next.clear();
    }

    /// The next create of `operation` succeeds remotely but the caller sees
    /// a transient error.
    pub fn lose_next_response(&self, operation: Operation) {
        self.inner.lock().lose_response.insert(operation);
    }

    /// Panic on the next call of `operation`. With `workspace_id` set, only
    /// a call for that workspace panics.
    pub fn panic_next(&self, operation: Operation, workspace_id: Option<&str>) {
        self.inner
            .lock()
            .panic_next
            .insert(operation, workspace_id.map(str::to_string));
    }

    pub fn deny(&self, actor: &str) {
        self.inner.lock().denied.insert(actor.to_string());
    }

    pub fn calls(&self) -> Vec<AdapterCall> {
        self.inner.lock().calls.clone()
    }

    pub fn calls_for(&self, workspace_id: &str) -> Vec<Operation> {
        self.inner
            .lock()
            .calls
            .iter()
            .filter(|c| c.workspace_id == workspace_id)
            .map(|c| c.operation)
            .collect()
    }

    /// Calls other than table publishes and authorization checks
    pub fn resource_calls(&self) -> Vec<AdapterCall> {
        self.inner
            .lock()
            .calls
            .iter()
            .filter(|c| c.operation.is_create() || c.operation.is_delete())
            .cloned()
            .collect()
    }

    pub fn count(&self, operation: Operation) -> usize {
        self.inner
            .lock()
            .calls
            .iter()
            .filter(|c| c.operation == operation)
            .count()
    }

    pub fn clear_calls(&self) {
        self.inner.lock().calls.clear();
    }

    /// The most recent successfully published table
    pub fn published_table(&self) -> Option<RoutingTable> {
        self.inner.lock().published.last().cloned()
    }

    pub fn publish_count(&self) -> usize {
        self.inner.lock().published.len()
    }

    pub fn live_handles(&self) -> BTreeSet<String> {
        self.inner.lock().live.keys().cloned().collect()
    }

    pub fn live_handles_for(&self, workspace_id: &str) -> BTreeSet<String> {
        self.inner
            .lock()
            .live
            .iter()
            .filter(|(_, owner)| owner.as_str() == workspace_id)
            .map(|(handle, _)| handle.clone())
            .collect()
    }

    /// Pretend a resource exists, e.g. one created by an earlier process.
    pub fn seed_handle(&self, workspace_id: &str, handle: &str) {
        self.inner
            .lock()
            .live
            .insert(handle.to_string(), workspace_id.to_string());
    }

    /// Records the call and applies injected failures.
    fn enter(&self, operation: Operation, workspace_id: &str) -> AdapterResult<()> {
        let mut state = self.inner.lock();
        state.calls.push(AdapterCall {
            operation,
            workspace_id: workspace_id.to_string(),
        });

        let panics = match state.panic_next.get(&operation) {
            Some(None) => true,
            Some(Some(target)) => target == workspace_id,
            None => false,
        };
        if panics {
            state.panic_next.remove(&operation);
            drop(state);
            panic!("injected panic in {:?} for {}", operation, workspace_id);
        }

        if let Some(queue) = state.fail_next.get_mut(&operation) {
            if let Some(error) = queue.pop_front() {
                return Err(error);
            }
        }
        if let Some(error) = state.fail_always.get(&operation) {
            return Err(error.clone());
        }
        Ok(())
    }

    fn create(&self, operation: Operation, handle: String, workspace_id: &str) -> AdapterResult<String> {
        self.enter(operation, workspace_id)?;

        let mut state = self.inner.lock();
        if state.live.contains_key(&handle) {
            return Err(AdapterError::AlreadyExists { handle });
        }
        state.live.insert(handle.clone(), workspace_id.to_string());
        if state.lose_response.remove(&operation) {
            return Err(AdapterError::Transient(format!(
                "connection reset after creating {}",
                handle
            )));
        }
        Ok(handle)
    }

    fn delete(&self, operation: Operation, workspace_id: &str, handle: &str) -> AdapterResult<()> {
        self.enter(operation, workspace_id)?;

        let mut state = self.inner.lock();
        match state.live.remove(handle) {
            Some(_) => Ok(()),
            None => Err(AdapterError::NotFound(handle.to_string())),
        }
    }
}

pub fn credentials_handle(workspace_id: &str) -> String {
    format!("db-{}", workspace_id)
}

pub fn search_handle(workspace_id: &str) -> String {
    format!("search-{}", workspace_id)
}

pub fn routing_handle(workspace_id: &str) -> String {
    format!("route-{}", workspace_id)
}

#[async_trait]
impl ClusterClient for FakeCloud {
    async fn create_routing_backend(&self, req: &ResourceRequest) -> AdapterResult<String> {
        self.create(
            Operation::CreateRoutingBackend,
            routing_handle(&req.workspace_id),
            &req.workspace_id,
        )
    }

    async fn delete_routing_backend(
        &self,
        workspace_id: &str,
        backend: &str,
    ) -> AdapterResult<()> {
        self.delete(Operation::DeleteRoutingBackend, workspace_id, backend)
    }

    async fn publish_routing_table(&self, table: &RoutingTable) -> AdapterResult<()> {
        self.enter(Operation::PublishRoutingTable, "")?;
        self.inner.lock().published.push(table.clone());
        Ok(())
    }
}

#[async_trait]
impl IdentityClient for FakeCloud {
    async fn create_credentials(&self, req: &ResourceRequest) -> AdapterResult<String> {
        self.create(
            Operation::CreateCredentials,
            credentials_handle(&req.workspace_id),
            &req.workspace_id,
        )
    }

    async fn delete_credentials(&self, workspace_id: &str, handle: &str) -> AdapterResult<()> {
        self.delete(Operation::DeleteCredentials, workspace_id, handle)
    }
}

#[async_trait]
impl SearchClient for FakeCloud {
    async fn create_search_endpoint(&self, req: &ResourceRequest) -> AdapterResult<String> {
        self.create(
            Operation::CreateSearchEndpoint,
            search_handle(&req.workspace_id),
            &req.workspace_id,
        )
    }

    async fn delete_search_endpoint(&self, workspace_id: &str, handle: &str) -> AdapterResult<()> {
        self.delete(Operation::DeleteSearchEndpoint, workspace_id, handle)
    }
}

#[async_trait]
impl AuthorizationClient for FakeCloud {
    async fn authorize(
        &self,
        actor: &str,
        workspace_id: &str,
        _action: &str,
    ) -> AdapterResult<bool> {
        self.enter(Operation::Authorize, workspace_id)?;
        Ok(!self.inner.lock().denied.contains(actor))
    }
}

/// Map-backed cache that ignores TTLs
#[derive(Clone, Default)]
pub struct FakeCache {
    entries: Arc<Mutex<HashMap<String, String>>>,
}

impl FakeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.entries.lock().keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl Cache for FakeCache {
    async fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    async fn set(&self, key: &str, value: &str, _ttl: Duration) {
        self.entries
            .lock()
            .insert(key.to_string(), value.to_string());
    }
}

#[cfg(test)]
#[path = "fake_tests.rs"]
mod tests;
