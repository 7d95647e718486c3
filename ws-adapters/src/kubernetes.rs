//! Kubernetes-backed cluster client.
//!
//! Each workspace gets one `Service` named `ws-<slug>` in the workspace
//! namespace; its cluster DNS address is the routing backend handle. The
//! routing table is a single `ConfigMap` written with server-side apply, so
//! a publish either replaces the whole document or changes nothing.

use crate::error::AdapterError;
use crate::traits::{AdapterResult, ClusterClient};
use crate::types::{ResourceRequest, RoutingTable};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams, PostParams},
    Client,
};
use std::collections::BTreeMap;
use tracing::{debug, info};

const FIELD_MANAGER: &str = "ws-reconciler";
const ROUTES_KEY: &str = "routes.json";
const WORKSPACE_LABEL: &str = "workspaces.control-plane/id";
const TENANT_LABEL: &str = "workspaces.control-plane/tenant";

#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
    namespace: String,
    routes_configmap: String,
    backend_port: i32,
}

impl KubeClusterClient {
    pub fn new(client: Client, namespace: &str, routes_configmap: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            routes_configmap: routes_configmap.to_string(),
            backend_port: 8080,
        }
    }

    /// Connect using in-cluster config or the local kubeconfig.
    pub async fn try_default(namespace: &str, routes_configmap: &str) -> AdapterResult<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| AdapterError::Config(format!("kubernetes client: {}", e)))?;
        Ok(Self::new(client, namespace, routes_configmap))
    }

    fn service_name(slug: &str) -> String {
        format!("ws-{}", slug)
    }

    fn backend_address(&self, service: &str) -> String {
        format!("{}.{}.svc.cluster.local:80", service, self.namespace)
    }

    fn service_from_backend(backend: &str) -> &str {
        backend.split('.').next().unwrap_or(backend)
    }

    fn routing_service(&self, req: &ResourceRequest) -> Service {
        let name = Self::service_name(&req.slug);
        let mut labels = BTreeMap::new();
        labels.insert(WORKSPACE_LABEL.to_string(), req.workspace_id.clone());
        labels.insert(TENANT_LABEL.to_string(), req.tenant_id.clone());
        labels.insert(
            "app.kubernetes.io/managed-by".to_string(),
            FIELD_MANAGER.to_string(),
        );

        let mut selector = BTreeMap::new();
        selector.insert(WORKSPACE_LABEL.to_string(), req.workspace_id.clone());

        Service {
            metadata: ObjectMeta {
                name: Some(name),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                selector: Some(selector),
                ports: Some(vec![ServicePort {
                    name: Some("http".to_string()),
                    port: 80,
                    target_port: Some(IntOrString::Int(self.backend_port)),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// Maps a kube error onto the adapter taxonomy.
fn classify(err: kube::Error) -> AdapterError {
    match err {
        kube::Error::Api(resp) => AdapterError::from_status(resp.code, resp.message),
        other => AdapterError::Transient(other.to_string()),
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn create_routing_backend(&self, req: &ResourceRequest) -> AdapterResult<String> {
        let services: Api<Service> = Api::namespaced(self.client.clone(), &self.namespace);
        let service = self.routing_service(req);
        let name = Self::service_name(&req.slug);
        let address = self.backend_address(&name);

        match services.create(&PostParams::default(), &service).await {
            Ok(_) => {
                info!(workspace_id = %req.workspace_id, service = %name, "created routing backend");
                Ok(address)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                Err(AdapterError::AlreadyExists { handle: address })
            }
            Err(e) => Err(classify(e)),
        }
    }

    async fn delete_routing_backend(
        &self,
        workspace_id: &str,
        backend: &str,
    ) -> AdapterResult<()> {
        let services: Api<Service> = Api::namespaced(self.client.clone(), &self.namespace);
        let name = Self::service_from_backend(backend);

        services
            .delete(name, &DeleteParams::default())
            .await
            .map_err(classify)?;

        info!(workspace_id = %workspace_id, service = %name, "deleted routing backend");
        Ok(())
    }

    async fn publish_routing_table(&self, table: &RoutingTable) -> AdapterResult<()> {
        let configmaps: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.namespace);
        let document = table
            .to_json()
            .map_err(|e| AdapterError::Rejected(format!("encode routing table: {}", e)))?;

        let mut data = BTreeMap::new();
        data.insert(ROUTES_KEY.to_string(), document);

        let configmap = ConfigMap {
            metadata: ObjectMeta {
                name: Some(self.routes_configmap.clone()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        };

        configmaps
            .patch(
                &self.routes_configmap,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&configmap),
            )
            .await
            .map_err(classify)?;

        debug!(
            configmap = %self.routes_configmap,
            routes = table.len(),
            "published routing table"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_handle_maps_back_to_service() {
        assert_eq!(
            KubeClusterClient::service_from_backend("ws-alpha.workspaces.svc.cluster.local:80"),
            "ws-alpha"
        );
        assert_eq!(KubeClusterClient::service_from_backend("ws-alpha"), "ws-alpha");
    }

    #[test]
    fn service_name_of_longest_slug_is_a_dns_label() {
        let name = KubeClusterClient::service_name(&"a".repeat(60));
        assert_eq!(name.len(), 63);
    }
}
