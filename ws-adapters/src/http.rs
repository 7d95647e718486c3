//! HTTP clients for the identity, search and authorization services.
//!
//! All three speak the same small JSON protocol:
//!
//! - `PUT {base}/v1/workspaces/{id}/{collection}` creates the resource and
//!   answers `{"handle": "..."}`; a 409 carries the existing handle in the
//!   same body.
//! - `DELETE {base}/v1/workspaces/{id}/{collection}/{handle}` releases it.
//! - `POST {base}/v1/authorize` answers `{"allowed": bool}`.

use crate::error::AdapterError;
use crate::traits::{AdapterResult, AuthorizationClient, IdentityClient, SearchClient};
use crate::types::ResourceRequest;
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct HandleResponse {
    handle: String,
}

#[derive(Debug, Serialize)]
struct AuthorizeRequest<'a> {
    actor: &'a str,
    workspace_id: &'a str,
    action: &'a str,
}

#[derive(Debug, Deserialize)]
struct AuthorizeResponse {
    allowed: bool,
}

/// Shared plumbing for one resource collection on one service.
#[derive(Debug, Clone)]
struct ResourceEndpoint {
    client: Client,
    base: Url,
    collection: &'static str,
}

impl ResourceEndpoint {
    fn new(base_url: &str, collection: &'static str) -> AdapterResult<Self> {
        let base = parse_base(base_url)?;
        let client = build_client()?;
        Ok(Self {
            client,
            base,
            collection,
        })
    }

    /// Appends each segment percent-encoded, so a handle containing `/`,
    /// `?` or `#` stays one path segment.
    fn resource_url(&self, segments: &[&str]) -> AdapterResult<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| AdapterError::Config(format!("base URL {} cannot hold a path", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn collection_url(&self, workspace_id: &str) -> AdapterResult<Url> {
        self.resource_url(&["v1", "workspaces", workspace_id, self.collection])
    }

    fn item_url(&self, workspace_id: &str, handle: &str) -> AdapterResult<Url> {
        self.resource_url(&["v1", "workspaces", workspace_id, self.collection, handle])
    }

    async fn create(&self, req: &ResourceRequest) -> AdapterResult<String> {
        let url = self.collection_url(&req.workspace_id)?;
        let response = self
            .client
            .put(url)
            .json(req)
            .send()
            .await
            .map_err(transport_error)?;

        match response.status() {
            status if status.is_success() => {
                let body: HandleResponse = response.json().await.map_err(transport_error)?;
                info!(
                    workspace_id = %req.workspace_id,
                    collection = self.collection,
                    handle = %body.handle,
                    "created resource"
                );
                Ok(body.handle)
            }
            StatusCode::CONFLICT => {
                let body: HandleResponse = response.json().await.map_err(|e| {
                    AdapterError::Rejected(format!("conflict without handle: {}", e))
                })?;
                Err(AdapterError::AlreadyExists {
                    handle: body.handle,
                })
            }
            _ => Err(status_error(response).await),
        }
    }

    async fn delete(&self, workspace_id: &str, handle: &str) -> AdapterResult<()> {
        let url = self.item_url(workspace_id, handle)?;
        let response = self
            .client
            .delete(url)
            .send()
            .await
            .map_err(transport_error)?;

        if response.status().is_success() {
            info!(
                workspace_id = %workspace_id,
                collection = self.collection,
                handle = %handle,
                "released resource"
            );
            return Ok(());
        }
        Err(status_error(response).await)
    }
}

fn parse_base(base_url: &str) -> AdapterResult<Url> {
    let mut base = Url::parse(base_url)
        .map_err(|e| AdapterError::Config(format!("invalid base URL {:?}: {}", base_url, e)))?;
    if !matches!(base.scheme(), "http" | "https") {
        return Err(AdapterError::Config(format!(
            "unsupported scheme in {:?}",
            base_url
        )));
    }
    // Url::join drops the last path segment unless it ends with a slash
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    Ok(base)
}

fn build_client() -> AdapterResult<Client> {
    Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|e| AdapterError::Config(format!("http client: {}", e)))
}

fn transport_error(err: reqwest::Error) -> AdapterError {
    AdapterError::Transient(err.to_string())
}

async fn status_error(response: Response) -> AdapterError {
    let status = response.status().as_u16();
    let detail = response.text().await.unwrap_or_default();
    debug!(status, detail = %detail, "service returned error status");
    AdapterError::from_status(status, detail)
}

/// Identity/key-management service over HTTP.
#[derive(Debug, Clone)]
pub struct HttpIdentityClient {
    endpoint: ResourceEndpoint,
}

impl HttpIdentityClient {
    pub fn new(base_url: &str) -> AdapterResult<Self> {
        Ok(Self {
            endpoint: ResourceEndpoint::new(base_url, "credentials")?,
        })
    }
}

#[async_trait]
impl IdentityClient for HttpIdentityClient {
    async fn create_credentials(&self, req: &ResourceRequest) -> AdapterResult<String> {
        self.endpoint.create(req).await
    }

    async fn delete_credentials(&self, workspace_id: &str, handle: &str) -> AdapterResult<()> {
        self.endpoint.delete(workspace_id, handle).await
    }
}

/// Managed search service over HTTP.
#[derive(Debug, Clone)]
pub struct HttpSearchClient {
    endpoint: ResourceEndpoint,
}

impl HttpSearchClient {
    pub fn new(base_url: &str) -> AdapterResult<Self> {
        Ok(Self {
            endpoint: ResourceEndpoint::new(base_url, "search-endpoints")?,
        })
    }
}

#[async_trait]
impl SearchClient for HttpSearchClient {
    async fn create_search_endpoint(&self, req: &ResourceRequest) -> AdapterResult<String> {
        self.endpoint.create(req).await
    }

    async fn delete_search_endpoint(&self, workspace_id: &str, handle: &str) -> AdapterResult<()> {
        self.endpoint.delete(workspace_id, handle).await
    }
}

#[derive(Debug, Clone)]
pub struct HttpAuthorizationClient {
    client: Client,
    authorize_url: Url,
}

impl HttpAuthorizationClient {
    pub fn new(base_url: &str) -> AdapterResult<Self> {
        let authorize_url = parse_base(base_url)?
            .join("v1/authorize")
            .map_err(|e| AdapterError::Config(e.to_string()))?;
        Ok(Self {
            client: build_client()?,
            authorize_url,
        })
    }
}

#[async_trait]
impl AuthorizationClient for HttpAuthorizationClient {
    async fn authorize(
        &self,
        actor: &str,
        workspace_id: &str,
        action: &str,
    ) -> AdapterResult<bool> {
        let response = self
            .client
            .post(self.authorize_url.clone())
            .json(&AuthorizeRequest {
                actor,
                workspace_id,
                action,
            })
            .send()
            .await
            .map_err(transport_error)?;

        match response.status() {
            status if status.is_success() => {
                let body: AuthorizeResponse = response.json().await.map_err(transport_error)?;
                Ok(body.allowed)
            }
            StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => Ok(false),
            _ => Err(status_error(response).await),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_keeps_its_path_prefix() {
        let endpoint = ResourceEndpoint::new("https://identity.internal/api", "credentials").unwrap();
        let url = endpoint.collection_url("ws-1").unwrap();
        assert_eq!(
            url.as_str(),
            "https://identity.internal/api/v1/workspaces/ws-1/credentials"
        );

        let item = endpoint.item_url("ws-1", "cred-9").unwrap();
        assert_eq!(
            item.as_str(),
            "https://identity.internal/api/v1/workspaces/ws-1/credentials/cred-9"
        );
    }

    #[test]
    fn handle_is_a_single_encoded_segment() {
        let endpoint = ResourceEndpoint::new("https://identity.internal/api", "credentials").unwrap();
        let item = endpoint
            .item_url("ws-1", "arn:aws:iam::1:role/ws?x#y")
            .unwrap();
        assert_eq!(
            item.path(),
            "/api/v1/workspaces/ws-1/credentials/arn:aws:iam::1:role%2Fws%3Fx%23y"
        );
        assert_eq!(item.query(), None);
        assert_eq!(item.fragment(), None);
    }

    #[test]
    fn invalid_base_url_is_a_config_error() {
        assert!(matches!(
            HttpSearchClient::new("not a url"),
            Err(AdapterError::Config(_))
        ));
        assert!(matches!(
            HttpIdentityClient::new("ftp://identity.internal"),
            Err(AdapterError::Config(_))
        ));
    }

    #[test]
    fn authorize_url_is_under_base() {
        let client = HttpAuthorizationClient::new("http://auth.internal:8080").unwrap();
        assert_eq!(
            client.authorize_url.as_str(),
            "http://auth.internal:8080/v1/authorize"
        );
    }
}
