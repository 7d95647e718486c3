//! Reservation policy: decides which provisioning workspaces may go live.
//!
//! Workspaces that are live (Active, Suspending, Resuming) consume units of
//! their class and tenant. Provisioning workspaces are admitted oldest
//! first while they fit; the rest carry `provisioning_blocked` until a
//! later cycle finds room. Nothing already live is ever suspended or
//! deleted because a quota shrank.

use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};
use ws_orchestrator::{Workspace, WorkspaceState, WorkspaceStore};

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CapacityPolicy {
    /// Units allowed per resource class. Classes not listed are unlimited.
    pub class_limits: BTreeMap<String, u32>,
    /// Units allowed per tenant across all classes
    pub tenant_limit: Option<u32>,
    /// Units one workspace of a class consumes (default 1)
    pub class_units: BTreeMap<String, u32>,
}

#[derive(Debug, Default)]
struct Usage {
    by_class: HashMap<String, u64>,
    by_tenant: HashMap<String, u64>,
}

impl Usage {
    fn add(&mut self, workspace: &Workspace, units: u64) {
        *self
            .by_class
            .entry(workspace.resource_class.clone())
            .or_default() += units;
        *self
            .by_tenant
            .entry(workspace.tenant_id.clone())
            .or_default() += units;
    }

    fn class(&self, class: &str) -> u64 {
        self.by_class.get(class).copied().unwrap_or(0)
    }

    fn tenant(&self, tenant: &str) -> u64 {
        self.by_tenant.get(tenant).copied().unwrap_or(0)
    }
}

impl CapacityPolicy {
    pub fn units(&self, class: &str) -> u32 {
        self.class_units.get(class).copied().unwrap_or(1)
    }

    /// Whether the workspace occupies capacity right now.
    pub fn consumes(workspace: &Workspace) -> bool {
        workspace.effective_state().consumes_capacity()
    }

    fn waiting(workspace: &Workspace) -> bool {
        workspace.effective_state() == WorkspaceState::Provisioning
    }

    /// Computes the desired `provisioning_blocked` flag for every workspace.
    pub fn evaluate(&self, workspaces: &[Workspace]) -> BTreeMap<String, bool> {
        let mut usage = Usage::default();
        for workspace in workspaces.iter().filter(|w| Self::consumes(w)) {
            usage.add(workspace, u64::from(self.units(&workspace.resource_class)));
        }

        let mut queue: Vec<&Workspace> = workspaces.iter().filter(|w| Self::waiting(w)).collect();
        queue.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        let mut desired: BTreeMap<String, bool> = workspaces
            .iter()
            .map(|w| (w.id.clone(), false))
            .collect();

        for workspace in queue {
            let units = u64::from(self.units(&workspace.resource_class));
            let class_fits = self
                .class_limits
                .get(&workspace.resource_class)
                .map_or(true, |limit| {
                    usage.class(&workspace.resource_class) + units <= u64::from(*limit)
                });
            let tenant_fits = self.tenant_limit.map_or(true, |limit| {
                usage.tenant(&workspace.tenant_id) + units <= u64::from(limit)
            });

            if class_fits && tenant_fits {
                usage.add(workspace, units);
            } else {
                desired.insert(workspace.id.clone(), true);
            }
        }

        desired
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CapacityReport {
    /// Workspaces left blocked after this pass
    pub blocked: usize,
    /// Flags written
    pub updated: usize,
    /// Writes lost to a concurrent update; retried next cycle
    pub conflicts: usize,
}

pub struct CapacityManager {
    store: Arc<dyn WorkspaceStore>,
    policy: CapacityPolicy,
}

impl CapacityManager {
    pub fn new(store: Arc<dyn WorkspaceStore>, policy: CapacityPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &CapacityPolicy {
        &self.policy
    }

    /// Brings every `provisioning_blocked` flag in line with the policy,
    /// writing only the flags that change.
    pub async fn enforce(&self, workspaces: &[Workspace]) -> CapacityReport {
        let desired = self.policy.evaluate(workspaces);
        let mut report = CapacityReport {
            blocked: desired.values().filter(|blocked| **blocked).count(),
            ..Default::default()
        };

        for workspace in workspaces {
            let blocked = desired.get(&workspace.id).copied().unwrap_or(false);
            if workspace.provisioning_blocked == blocked {
                continue;
            }

            let mut next = workspace.clone();
            next.provisioning_blocked = blocked;
            match self
                .store
                .update_workspace(&workspace.id, workspace.version, &next)
                .await
            {
                Ok(_) => {
                    report.updated += 1;
                    if blocked {
                        info!(
                            workspace_id = %workspace.id,
                            resource_class = %workspace.resource_class,
                            tenant_id = %workspace.tenant_id,
                            "provisioning blocked by capacity"
                        );
                    } else {
                        info!(workspace_id = %workspace.id, "provisioning admitted");
                    }
                }
                Err(e) if e.is_version_conflict() || e.is_not_found() => {
                    report.conflicts += 1;
                    debug!(workspace_id = %workspace.id, error = %e, "capacity flag not written");
                }
                Err(e) => {
                    report.conflicts += 1;
                    warn!(workspace_id = %workspace.id, error = %e, "failed to write capacity flag");
                }
            }
        }

        report
    }
}
