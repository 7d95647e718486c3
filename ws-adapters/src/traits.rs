//! Capability contracts consumed by the reconciler.
//!
//! Every create call must be idempotent for a given workspace ID: repeating
//! it either succeeds with the same handle or fails with
//! [`AdapterError::AlreadyExists`] carrying that handle. Deletes of missing
//! resources fail with [`AdapterError::NotFound`].

use crate::error::AdapterError;
use crate::types::{ResourceRequest, RoutingTable};
use async_trait::async_trait;
use std::time::Duration;

pub type AdapterResult<T> = Result<T, AdapterError>;

/// Cluster orchestration: per-workspace routing backends and the shared
/// routing table.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Create the routing backend, returning its handle
    async fn create_routing_backend(&self, req: &ResourceRequest) -> AdapterResult<String>;

    async fn delete_routing_backend(&self, workspace_id: &str, backend: &str)
        -> AdapterResult<()>;

    /// Replace the published routing table in one write
    async fn publish_routing_table(&self, table: &RoutingTable) -> AdapterResult<()>;
}

/// Identity and key management: per-workspace credentials and encryption keys.
#[async_trait]
pub trait IdentityClient: Send + Sync {
    async fn create_credentials(&self, req: &ResourceRequest) -> AdapterResult<String>;

    async fn delete_credentials(&self, workspace_id: &str, handle: &str) -> AdapterResult<()>;
}

/// Managed search: per-workspace search endpoint.
#[async_trait]
pub trait SearchClient: Send + Sync {
    async fn create_search_endpoint(&self, req: &ResourceRequest) -> AdapterResult<String>;

    async fn delete_search_endpoint(&self, workspace_id: &str, handle: &str) -> AdapterResult<()>;
}

/// Authorization service, consulted for operator-triggered requests.
#[async_trait]
pub trait AuthorizationClient: Send + Sync {
    async fn authorize(&self, actor: &str, workspace_id: &str, action: &str)
        -> AdapterResult<bool>;
}

/// Best-effort key/value cache. Misses and backend failures look the same.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;

    async fn set(&self, key: &str, value: &str, ttl: Duration);
}
