//! Routing Sync: republishes the hostname table once per cycle.

use std::sync::Arc;
use tracing::{debug, error};
use ws_adapters::{AdapterError, ClusterClient, RoutingTable};
use ws_orchestrator::{Workspace, WorkspaceState};

/// Routes for every Active workspace holding a routing backend.
pub fn build_routing_table(workspaces: &[Workspace], domain_suffix: &str) -> RoutingTable {
    let mut table = RoutingTable::new();
    for workspace in workspaces
        .iter()
        .filter(|w| w.state == WorkspaceState::Active)
    {
        if let Some(backend) = &workspace.handles.routing_backend {
            table.insert(workspace.hostname(domain_suffix), backend.as_str());
        }
    }
    table
}

pub struct RoutingSync {
    cluster: Arc<dyn ClusterClient>,
    domain_suffix: String,
}

impl RoutingSync {
    pub fn new(cluster: Arc<dyn ClusterClient>, domain_suffix: &str) -> Self {
        Self {
            cluster,
            domain_suffix: domain_suffix.to_string(),
        }
    }

    /// Publishes the table built from `workspaces`, returning the number of
    /// routes. On failure the previously published table stays live.
    pub async fn sync(&self, workspaces: &[Workspace]) -> Result<usize, AdapterError> {
        let table = build_routing_table(workspaces, &self.domain_suffix);
        match self.cluster.publish_routing_table(&table).await {
            Ok(()) => {
                debug!(routes = table.len(), "routing table published");
                Ok(table.len())
            }
            Err(e) => {
                error!(error = %e, routes = table.len(), "routing publish failed, keeping previous table");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ws_orchestrator::test_utils::workspace_in_state;

    #[test]
    fn only_active_workspaces_are_routed() {
        let mut workspaces: Vec<Workspace> = WorkspaceState::ALL
            .iter()
            .map(|state| workspace_in_state(state.as_str(), "small", *state))
            .collect();
        // drifted Active record without a backend
        let mut drifted = workspace_in_state("drifted", "small", WorkspaceState::Active);
        drifted.handles.routing_backend = None;
        workspaces.push(drifted);

        let table = build_routing_table(&workspaces, "ws.example.com");
        assert_eq!(table.len(), 1);
        assert_eq!(table.get("active.ws.example.com"), Some("route-active"));
    }

    #[test]
    fn hostnames_use_slug() {
        let mut workspace = workspace_in_state("ws-1", "small", WorkspaceState::Active);
        workspace.slug = "data-science".to_string();
        let table = build_routing_table(&[workspace], ".ws.example.com");
        assert_eq!(table.get("data-science.ws.example.com"), Some("route-ws-1"));
    }
}
