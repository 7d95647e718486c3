//! Workspace model and repository
//!
//! This crate owns the workspace record, its lifecycle state machine and the
//! repository the reconciler reads and writes. It is consumed by the
//! reconciler service but can also back an API process or operator tooling.

pub mod db;
pub mod error;
pub mod memory;
pub mod sqlite;
pub mod store;
pub mod workspace;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use error::{OrchestratorError, Result};
pub use memory::MemoryWorkspaceStore;
pub use sqlite::{SqliteWorkspaceStore, WorkspaceFilters};
pub use store::WorkspaceStore;
pub use workspace::{
    LifecycleRequest, NewWorkspace, ResourceHandles, ResourceKind, Workspace, WorkspaceState,
    MAX_SLUG_LEN,
};
