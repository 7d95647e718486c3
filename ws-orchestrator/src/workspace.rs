use crate::error::{OrchestratorError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workspace {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub slug: String,
    pub state: WorkspaceState,
    pub resource_class: String,
    pub handles: ResourceHandles,
    pub pending_request: Option<LifecycleRequest>,
    pub provisioning_blocked: bool,
    pub failed_from: Option<WorkspaceState>,
    pub error_message: Option<String>,

    #[serde(serialize_with = "serialize_datetime")]
    pub last_active_at: DateTime<Utc>,

    #[serde(serialize_with = "serialize_datetime")]
    pub created_at: DateTime<Utc>,

    #[serde(serialize_with = "serialize_datetime")]
    pub updated_at: DateTime<Utc>,

    pub version: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceState {
    Provisioning,
    Active,
    Suspending,
    Suspended,
    Resuming,
    Deleting,
    Failed,
}

use WorkspaceState::*;

impl WorkspaceState {
    pub const ALL: [WorkspaceState; 7] = [
        Provisioning,
        Active,
        Suspending,
        Suspended,
        Resuming,
        Deleting,
        Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provisioning => "provisioning",
            Active => "active",
            Suspending => "suspending",
            Suspended => "suspended",
            Resuming => "resuming",
            Deleting => "deleting",
            Failed => "failed",
        }
    }

    /// `Deleting` is the only absorbing state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Deleting)
    }

    /// States reachable in one persisted step, excluding staying put.
    pub fn valid_transitions(&self) -> &'static [WorkspaceState] {
        match self {
            Provisioning => &[Active, Deleting, Failed],
            Active => &[Suspending, Deleting, Failed],
            Suspending => &[Suspended, Deleting, Failed],
            Suspended => &[Resuming, Deleting, Failed],
            Resuming => &[Active, Deleting, Failed],
            Failed => &[Provisioning, Active, Suspending, Suspended, Resuming, Deleting],
            Deleting => &[],
        }
    }

    pub fn can_transition_to(&self, next: WorkspaceState) -> bool {
        *self == next || self.valid_transitions().contains(&next)
    }

    /// States whose workspaces count against capacity quotas.
    pub fn consumes_capacity(&self) -> bool {
        matches!(self, Active | Suspending | Resuming)
    }
}

impl fmt::Display for WorkspaceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkspaceState {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        WorkspaceState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| OrchestratorError::InvalidInput(format!("unknown state: {}", s)))
    }
}

/// Request signal set by operators or the auto-suspend policy and consumed
/// by convergence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum LifecycleRequest {
    Suspend,
    Resume,
    Delete,
}

impl LifecycleRequest {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleRequest::Suspend => "suspend",
            LifecycleRequest::Resume => "resume",
            LifecycleRequest::Delete => "delete",
        }
    }
}

impl fmt::Display for LifecycleRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecycleRequest {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "suspend" => Ok(LifecycleRequest::Suspend),
            "resume" => Ok(LifecycleRequest::Resume),
            "delete" => Ok(LifecycleRequest::Delete),
            other => Err(OrchestratorError::InvalidInput(format!(
                "unknown request: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Database,
    Search,
    Routing,
}

impl ResourceKind {
    /// Creation order. Release walks it backwards.
    pub const CREATION_ORDER: [ResourceKind; 3] =
        [ResourceKind::Database, ResourceKind::Search, ResourceKind::Routing];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Database => "database",
            ResourceKind::Search => "search",
            ResourceKind::Routing => "routing",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// References to externally provisioned objects owned by one workspace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceHandles {
    pub database: Option<String>,
    pub search: Option<String>,
    pub routing_backend: Option<String>,
}

impl ResourceHandles {
    pub fn get(&self, kind: ResourceKind) -> Option<&str> {
        match kind {
            ResourceKind::Database => self.database.as_deref(),
            ResourceKind::Search => self.search.as_deref(),
            ResourceKind::Routing => self.routing_backend.as_deref(),
        }
    }

    pub fn set(&mut self, kind: ResourceKind, handle: Option<String>) {
        match kind {
            ResourceKind::Database => self.database = handle,
            ResourceKind::Search => self.search = handle,
            ResourceKind::Routing => self.routing_backend = handle,
        }
    }

    pub fn next_missing(&self) -> Option<ResourceKind> {
        ResourceKind::CREATION_ORDER
            .into_iter()
            .find(|kind| self.get(*kind).is_none())
    }

    pub fn next_to_release(&self) -> Option<ResourceKind> {
        ResourceKind::CREATION_ORDER
            .into_iter()
            .rev()
            .find(|kind| self.get(*kind).is_some())
    }

    pub fn is_complete(&self) -> bool {
        self.next_missing().is_none()
    }

    pub fn is_empty(&self) -> bool {
        self.next_to_release().is_none()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ResourceKind, &str)> {
        ResourceKind::CREATION_ORDER
            .into_iter()
            .filter_map(move |kind| self.get(kind).map(|handle| (kind, handle)))
    }
}

impl Workspace {
    /// Public hostname the routing table maps to this workspace.
    pub fn hostname(&self, domain_suffix: &str) -> String {
        format!("{}.{}", self.slug, domain_suffix.trim_start_matches('.'))
    }

    /// Moves to `next`, rejecting edges outside the lifecycle graph.
    ///
    /// Leaving `Failed` clears the failure bookkeeping.
    pub fn transition_to(&mut self, next: WorkspaceState) -> Result<()> {
        if next == Failed {
            return Err(OrchestratorError::InvalidInput(
                "use Workspace::fail to enter the failed state".to_string(),
            ));
        }
        if !self.state.can_transition_to(next) {
            return Err(OrchestratorError::InvalidTransition {
                id: self.id.clone(),
                from: self.state,
                to: next,
            });
        }
        if self.state == Failed && next != Failed {
            self.failed_from = None;
            self.error_message = None;
        }
        self.state = next;
        Ok(())
    }

    /// Marks the workspace failed, remembering the state it failed out of.
    pub fn fail(&mut self, message: impl Into<String>) -> Result<()> {
        if self.state.is_terminal() {
            return Err(OrchestratorError::InvalidTransition {
                id: self.id.clone(),
                from: self.state,
                to: Failed,
            });
        }
        if self.state != Failed {
            self.failed_from = Some(self.state);
        }
        self.state = Failed;
        self.error_message = Some(message.into());
        Ok(())
    }

    /// State convergence works towards; for failed workspaces this is the
    /// state they failed out of.
    pub fn effective_state(&self) -> WorkspaceState {
        match self.state {
            Failed => self.failed_from.unwrap_or(Provisioning),
            state => state,
        }
    }

    /// Whether the routing handle agrees with the lifecycle state.
    pub fn handles_consistent(&self) -> bool {
        match self.state {
            Provisioning | Suspended => self.handles.routing_backend.is_none(),
            Active => self.handles.routing_backend.is_some(),
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewWorkspace {
    pub tenant_id: String,
    pub name: String,
    pub slug: Option<String>,
    pub resource_class: String,
}

impl NewWorkspace {
    pub fn new(tenant_id: &str, name: &str, resource_class: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            name: name.to_string(),
            slug: None,
            resource_class: resource_class.to_string(),
        }
    }

    /// Builds the initial `Provisioning` record.
    pub fn into_workspace(self, id: String, now: DateTime<Utc>) -> Result<Workspace> {
        if self.tenant_id.trim().is_empty() {
            return Err(OrchestratorError::InvalidInput(
                "tenant_id must not be empty".to_string(),
            ));
        }
        if self.resource_class.trim().is_empty() {
            return Err(OrchestratorError::InvalidInput(
                "resource_class must not be empty".to_string(),
            ));
        }
        let slug = match self.slug {
            Some(slug) => slug,
            None => slugify(&self.name),
        };
        validate_slug(&slug)?;

        Ok(Workspace {
            id,
            tenant_id: self.tenant_id,
            name: self.name,
            slug,
            state: Provisioning,
            resource_class: self.resource_class,
            handles: ResourceHandles::default(),
            pending_request: None,
            provisioning_blocked: false,
            failed_from: None,
            error_message: None,
            last_active_at: now,
            created_at: now,
            updated_at: now,
            version: 1,
        })
    }
}

/// Longest slug accepted. The routing Service is named `ws-{slug}` and
/// must still fit a 63-character DNS label.
pub const MAX_SLUG_LEN: usize = 60;

/// Lowercases `name` and collapses anything outside `[a-z0-9]` into single
/// dashes, truncated to [`MAX_SLUG_LEN`].
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }
    slug.truncate(MAX_SLUG_LEN);
    slug.trim_end_matches('-').to_string()
}

pub fn validate_slug(slug: &str) -> Result<()> {
    let valid = !slug.is_empty()
        && slug.len() <= MAX_SLUG_LEN
        && !slug.starts_with('-')
        && !slug.ends_with('-')
        && slug
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');

    if valid {
        Ok(())
    } else {
        Err(OrchestratorError::InvalidInput(format!(
            "slug is not a DNS label: {:?}",
            slug
        )))
    }
}

// Serialize DateTime as RFC 3339 / ISO 8601 string
fn serialize_datetime<S>(dt: &DateTime<Utc>, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&dt.to_rfc3339())
}
