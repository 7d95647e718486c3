//! External service adapters for the workspace control plane.
//!
//! The reconciler only sees the traits in [`traits`]; concrete clients talk
//! to Kubernetes, the identity and search services over HTTP, and Redis.

pub mod cache;
pub mod error;
pub mod http;
pub mod kubernetes;
pub mod traits;
pub mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod fake;

pub use cache::TieredCache;
pub use error::AdapterError;
pub use http::{HttpAuthorizationClient, HttpIdentityClient, HttpSearchClient};
pub use kubernetes::KubeClusterClient;
pub use traits::{
    AdapterResult, AuthorizationClient, Cache, ClusterClient, IdentityClient, SearchClient,
};
pub use types::{ResourceRequest, RoutingTable};
