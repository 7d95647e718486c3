use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What an adapter needs to know about the workspace it provisions for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub workspace_id: String,
    pub tenant_id: String,
    pub slug: String,
    pub resource_class: String,
}

/// Hostname to backend mapping published for the ingress layer.
///
/// Ordered so the same workspace set always serializes to the same document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingTable {
    pub routes: BTreeMap<String, String>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, hostname: impl Into<String>, backend: impl Into<String>) {
        self.routes.insert(hostname.into(), backend.into());
    }

    pub fn get(&self, hostname: &str) -> Option<&str> {
        self.routes.get(hostname).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
