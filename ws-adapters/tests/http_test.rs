//! HTTP adapter tests against a mock service

use serde_json::json;
use std::net::TcpListener;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};
use ws_adapters::{
    AdapterError, AuthorizationClient, HttpAuthorizationClient, HttpIdentityClient,
    HttpSearchClient, IdentityClient, ResourceRequest, SearchClient,
};

fn request() -> ResourceRequest {
    ResourceRequest {
        workspace_id: "ws-1".to_string(),
        tenant_id: "tenant-a".to_string(),
        slug: "alpha".to_string(),
        resource_class: "small".to_string(),
    }
}

#[tokio::test]
async fn test_create_credentials_returns_handle() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/v1/workspaces/ws-1/credentials"))
        .and(body_partial_json(json!({ "tenant_id": "tenant-a" })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "handle": "cred-1" })))
        .expect(1)
        .mount(&server)
        .await;

    let client = HttpIdentityClient::new(&server.uri()).unwrap();
    let handle = client.create_credentials(&request()).await.unwrap();
    assert_eq!(handle, "cred-1");
}

#[tokio::test]
async fn test_conflict_carries_existing_handle() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/v1/workspaces/ws-1/search-endpoints"))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({ "handle": "es-1" })))
        .mount(&server)
        .await;

    let client = HttpSearchClient::new(&server.uri()).unwrap();
    let err = client.create_search_endpoint(&request()).await.unwrap_err();
    assert_eq!(
        err,
        AdapterError::AlreadyExists {
            handle: "es-1".to_string()
        }
    );
}

#[tokio::test]
async fn test_status_codes_map_to_error_kinds() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/v1/workspaces/ws-1/credentials/gone"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/v1/workspaces/ws-1/credentials/busy"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/v1/workspaces/ws-1/credentials/locked"))
        .respond_with(ResponseTemplate::new(422).set_body_string("key scheduled for deletion"))
        .mount(&server)
        .await;

    let client = HttpIdentityClient::new(&server.uri()).unwrap();

    let gone = client.delete_credentials("ws-1", "gone").await.unwrap_err();
    assert!(matches!(gone, AdapterError::NotFound(_)));

    let busy = client.delete_credentials("ws-1", "busy").await.unwrap_err();
    assert!(busy.is_transient());

    let locked = client.delete_credentials("ws-1", "locked").await.unwrap_err();
    assert!(matches!(locked, AdapterError::Rejected(msg) if msg.contains("422")));
}

#[tokio::test]
async fn test_release_sends_handle_as_one_segment() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path(
            "/v1/workspaces/ws-1/credentials/arn:aws:iam::1:role%2Fws%3Fx%23y",
        ))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let client = HttpIdentityClient::new(&server.uri()).unwrap();
    client
        .delete_credentials("ws-1", "arn:aws:iam::1:role/ws?x#y")
        .await
        .unwrap();
}

#[tokio::test]
async fn test_unreachable_service_is_transient() {
    // Nothing listens on a port freed by a dropped listener
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let client = HttpSearchClient::new(&format!("http://127.0.0.1:{port}")).unwrap();
    let err = client.create_search_endpoint(&request()).await.unwrap_err();
    assert!(err.is_transient(), "{err}");
}

#[tokio::test]
async fn test_authorize() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/authorize"))
        .and(body_partial_json(json!({ "actor": "alice", "action": "suspend" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "allowed": true })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/authorize"))
        .and(body_partial_json(json!({ "actor": "mallory" })))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let client = HttpAuthorizationClient::new(&server.uri()).unwrap();
    assert!(client.authorize("alice", "ws-1", "suspend").await.unwrap());
    assert!(!client.authorize("mallory", "ws-1", "suspend").await.unwrap());
}
