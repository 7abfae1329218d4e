//! Router-level tests against an in-memory database and a recording exit node

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use fossorial_common::{Database, ExitNodeId, Protocol, Result, Target};
use fossorial_web::exit_node::{ExitNodeClient, PeerConfig};
use fossorial_web::{router, AppState, ServerConfig};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

const PK1: &str = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=";
const EXIT_KEY: &str = "BBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBA=";

#[derive(Debug, Clone, PartialEq)]
enum Recorded {
    AddPeer(ExitNodeId, PeerConfig),
    RemovePeer(ExitNodeId, String),
    Targets(&'static str, String, Vec<String>, Protocol),
}

#[derive(Default)]
struct RecordingExitNode {
    calls: Mutex<Vec<Recorded>>,
}

impl RecordingExitNode {
    fn last(&self) -> Option<Recorded> {
        self.calls.lock().last().cloned()
    }
}

#[async_trait]
impl ExitNodeClient for RecordingExitNode {
    async fn add_peer(&self, exit_node_id: ExitNodeId, peer: &PeerConfig) -> Result<()> {
        self.calls.lock().push(Recorded::AddPeer(exit_node_id, peer.clone()));
        Ok(())
    }

    async fn remove_peer(&self, exit_node_id: ExitNodeId, public_key: &str) -> Result<()> {
        self.calls
            .lock()
            .push(Recorded::RemovePeer(exit_node_id, public_key.to_string()));
        Ok(())
    }

    async fn add_targets(&self, newt_id: &str, targets: &[Target], protocol: Protocol) -> Result<()> {
        let ips = targets.iter().map(|t| t.ip.clone()).collect();
        self.calls
            .lock()
            .push(Recorded::Targets("add", newt_id.to_string(), ips, protocol));
        Ok(())
    }

    async fn remove_targets(
        &self,
        newt_id: &str,
        targets: &[Target],
        protocol: Protocol,
    ) -> Result<()> {
        let ips = targets.iter().map(|t| t.ip.clone()).collect();
        self.calls
            .lock()
            .push(Recorded::Targets("remove", newt_id.to_string(), ips, protocol));
        Ok(())
    }
}

struct TestApp {
    router: Router,
    exit_node: Arc<RecordingExitNode>,
}

impl TestApp {
    fn new() -> Self {
        let exit_node = Arc::new(RecordingExitNode::default());
        let config = ServerConfig {
            operators: vec!["owner".to_string()],
            ..ServerConfig::default()
        };
        let state = AppState::new(
            Database::open_memory().unwrap(),
            &config,
            exit_node.clone(),
        );
        Self {
            router: router(Arc::new(state)),
            exit_node,
        }
    }

    async fn call(
        &self,
        method: Method,
        uri: &str,
        user: Option<(&str, &str)>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some((user_id, email)) = user {
            builder = builder.header("x-user-id", user_id).header("x-user-email", email);
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    /// Org `acme` owned by `owner`, plus one exit node
    async fn seeded() -> (Self, i64) {
        let app = Self::new();
        let (status, _) = app
            .call(
                Method::PUT,
                "/api/v1/org",
                OWNER,
                Some(json!({ "orgId": "acme", "name": "Acme" })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, body) = app
            .call(
                Method::PUT,
                "/api/v1/exit-node",
                OWNER,
                Some(json!({
                    "name": "edge-1",
                    "address": "100.89.0.1/24",
                    "endpoint": "edge.example.com",
                    "publicKey": EXIT_KEY,
                    "listenPort": 51820,
                    "reachableAt": "http://10.0.0.254:3003"
                })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        let exit_node_id = body["data"]["exitNodeId"].as_i64().unwrap();
        (app, exit_node_id)
    }
}

const OWNER: Option<(&str, &str)> = Some(("owner", "owner@acme.com"));

#[tokio::test]
async fn health_needs_no_identity() {
    let app = TestApp::new();
    let (status, body) = app.call(Method::GET, "/api/v1/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["status"], 200);
}

#[tokio::test]
async fn missing_identity_is_unauthorized() {
    let app = TestApp::new();
    let (status, body) = app
        .call(Method::GET, "/api/v1/org/acme/sites", None, None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], true);
}

#[tokio::test]
async fn wireguard_site_allow_list_follows_targets() {
    let (app, exit_node_id) = TestApp::seeded().await;

    let (status, body) = app
        .call(
            Method::PUT,
            "/api/v1/org/acme/site",
            OWNER,
            Some(json!({
                "name": "office",
                "exitNodeId": exit_node_id,
                "type": "wireguard",
                "subnet": "100.90.128.0/24",
                "pubKey": PK1
            })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["type"], "wireguard");
    assert_eq!(body["data"]["peerSync"], "applied");
    let site_id = body["data"]["siteId"].as_i64().unwrap();

    let mut resources = Vec::new();
    for name in ["r1", "r2"] {
        let (status, body) = app
            .call(
                Method::PUT,
                &format!("/api/v1/site/{}/resource", site_id),
                OWNER,
                Some(json!({ "name": name, "protocol": "tcp", "proxyPort": 8443 })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        resources.push(body["data"]["resourceId"].as_i64().unwrap());
    }

    let mut targets = Vec::new();
    for (resource_id, ip) in [
        (resources[0], "10.0.0.1"),
        (resources[0], "10.0.0.2"),
        (resources[1], "10.0.0.3"),
    ] {
        let (status, body) = app
            .call(
                Method::PUT,
                &format!("/api/v1/resource/{}/target", resource_id),
                OWNER,
                Some(json!({ "ip": ip, "port": 443 })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        targets.push(body["data"]["targetId"].as_i64().unwrap());
    }

    let (status, _) = app
        .call(
            Method::DELETE,
            &format!("/api/v1/target/{}", targets[1]),
            OWNER,
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    assert_eq!(
        app.exit_node.last(),
        Some(Recorded::AddPeer(
            exit_node_id,
            PeerConfig {
                public_key: PK1.to_string(),
                allowed_ips: vec!["10.0.0.1/32".to_string(), "10.0.0.3/32".to_string()],
            }
        ))
    );

    let (status, body) = app
        .call(
            Method::GET,
            &format!("/api/v1/site/{}/allowed-ips", site_id),
            OWNER,
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], json!(["10.0.0.1/32", "10.0.0.3/32"]));

    let (status, body) = app
        .call(
            Method::GET,
            &format!("/api/v1/resource/{}/targets", resources[0]),
            OWNER,
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["targets"].as_array().unwrap().len(), 1);
    assert_eq!(body["data"]["pagination"]["total"], 1);
}

#[tokio::test]
async fn newt_site_target_deletion_notifies_agent() {
    let (app, exit_node_id) = TestApp::seeded().await;

    let (status, body) = app
        .call(
            Method::PUT,
            "/api/v1/org/acme/site",
            OWNER,
            Some(json!({
                "name": "branch",
                "exitNodeId": exit_node_id,
                "type": "newt",
                "subnet": "100.90.129.0/24",
                "newtId": "N1",
                "secret": "agent-secret"
            })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["peerSync"], "skipped");
    let site_id = body["data"]["siteId"].as_i64().unwrap();

    let (_, body) = app
        .call(
            Method::PUT,
            &format!("/api/v1/site/{}/resource", site_id),
            OWNER,
            Some(json!({ "name": "ssh", "protocol": "tcp", "proxyPort": 2222 })),
        )
        .await;
    let resource_id = body["data"]["resourceId"].as_i64().unwrap();

    let (_, body) = app
        .call(
            Method::PUT,
            &format!("/api/v1/resource/{}/target", resource_id),
            OWNER,
            Some(json!({ "ip": "192.168.1.20", "port": 22 })),
        )
        .await;
    let target_id = body["data"]["targetId"].as_i64().unwrap();

    let (status, _) = app
        .call(
            Method::DELETE,
            &format!("/api/v1/target/{}", target_id),
            OWNER,
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let calls = app.exit_node.calls.lock().clone();
    assert_eq!(
        calls.last(),
        Some(&Recorded::Targets(
            "remove",
            "N1".to_string(),
            vec!["192.168.1.20".to_string()],
            Protocol::Tcp
        ))
    );
    assert!(!calls.iter().any(|c| matches!(c, Recorded::AddPeer(..))));
}

#[tokio::test]
async fn wireguard_site_without_key_rejected() {
    let (app, exit_node_id) = TestApp::seeded().await;
    let (status, body) = app
        .call(
            Method::PUT,
            "/api/v1/org/acme/site",
            OWNER,
            Some(json!({
                "name": "office",
                "exitNodeId": exit_node_id,
                "type": "wireguard",
                "subnet": "100.90.128.0/24"
            })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "validation");

    let (_, body) = app
        .call(Method::GET, "/api/v1/org/acme/sites", OWNER, None)
        .await;
    assert_eq!(body["data"]["sites"], json!([]));
    assert_eq!(
        body["data"]["pagination"],
        json!({ "total": 0, "limit": 1000, "offset": 0 })
    );
    assert!(app.exit_node.last().is_none());
}

#[tokio::test]
async fn outsiders_are_forbidden() {
    let (app, _) = TestApp::seeded().await;
    let (status, body) = app
        .call(
            Method::GET,
            "/api/v1/org/acme/sites",
            Some(("mallory", "mallory@evil.com")),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["kind"], "permission_denied");
}

#[tokio::test]
async fn unknown_target_is_not_found() {
    let (app, _) = TestApp::seeded().await;
    let (status, body) = app
        .call(Method::DELETE, "/api/v1/target/4242", OWNER, None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], "not_found");
}

#[tokio::test]
async fn invite_flow_with_rate_limit() {
    let (app, _) = TestApp::seeded().await;

    // The org's admin role is the first role created
    let admin_role = 1;

    let mut link = String::new();
    for _ in 0..3 {
        let (status, body) = app
            .call(
                Method::POST,
                "/api/v1/org/acme/create-invite",
                OWNER,
                Some(json!({ "email": "a@x.com", "roleId": admin_role, "validHours": 24 })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        link = body["data"]["inviteLink"].as_str().unwrap().to_string();
    }

    let (status, body) = app
        .call(
            Method::POST,
            "/api/v1/org/acme/create-invite",
            OWNER,
            Some(json!({ "email": "a@x.com", "roleId": admin_role, "validHours": 24 })),
        )
        .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["kind"], "rate_limited");

    // Only the latest invite survives
    let token = link.split("token=").nth(1).unwrap();
    let (invite_id, secret) = token.split_once('-').unwrap();
    let invitee = Some(("alice", "a@x.com"));
    let (status, body) = app
        .call(
            Method::POST,
            "/api/v1/invite/accept",
            invitee,
            Some(json!({ "inviteId": invite_id, "token": secret })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["orgId"], "acme");

    let (status, _) = app
        .call(Method::GET, "/api/v1/org/acme/sites", invitee, None)
        .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn exit_node_registration_requires_operator() {
    let (app, _) = TestApp::seeded().await;
    let (status, body) = app
        .call(
            Method::PUT,
            "/api/v1/exit-node",
            Some(("rando", "r@evil.com")),
            Some(json!({
                "name": "metadata",
                "address": "100.89.1.1/24",
                "endpoint": "evil.example.com",
                "publicKey": EXIT_KEY,
                "listenPort": 51820,
                "reachableAt": "http://169.254.169.254"
            })),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["kind"], "permission_denied");

    // The refused node cannot be used for a site
    let (status, _) = app
        .call(
            Method::PUT,
            "/api/v1/org/acme/site",
            OWNER,
            Some(json!({
                "name": "office",
                "exitNodeId": 2,
                "type": "wireguard",
                "subnet": "100.90.128.0/24",
                "pubKey": PK1
            })),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn malformed_path_and_query_use_envelope() {
    let (app, _) = TestApp::seeded().await;

    let (status, body) = app.call(Method::GET, "/api/v1/site/abc", OWNER, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert_eq!(body["status"], 400);
    assert_eq!(body["kind"], "validation");

    let (status, body) = app
        .call(Method::GET, "/api/v1/org/acme/sites?limit=lots", OWNER, None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "validation");

    let (status, body) = app
        .call(Method::GET, "/api/v1/org/acme/sites?offset=-1", OWNER, None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "validation");
}

#[tokio::test]
async fn resource_rules_are_paginated() {
    let (app, exit_node_id) = TestApp::seeded().await;
    let (_, body) = app
        .call(
            Method::PUT,
            "/api/v1/org/acme/site",
            OWNER,
            Some(json!({
                "name": "office",
                "exitNodeId": exit_node_id,
                "type": "wireguard",
                "subnet": "100.90.128.0/24",
                "pubKey": PK1
            })),
        )
        .await;
    let site_id = body["data"]["siteId"].as_i64().unwrap();
    let (_, body) = app
        .call(
            Method::PUT,
            &format!("/api/v1/site/{}/resource", site_id),
            OWNER,
            Some(json!({ "name": "dash", "protocol": "tcp", "http": true })),
        )
        .await;
    let resource_id = body["data"]["resourceId"].as_i64().unwrap();

    for (action, matcher, value) in [
        ("ACCEPT", "PATH", "/health"),
        ("DROP", "CIDR", "0.0.0.0/0"),
        ("ACCEPT", "IP", "203.0.113.7"),
    ] {
        let (status, _) = app
            .call(
                Method::PUT,
                &format!("/api/v1/resource/{}/rule", resource_id),
                OWNER,
                Some(json!({ "action": action, "match": matcher, "value": value })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
    }

    let (status, body) = app
        .call(
            Method::GET,
            &format!("/api/v1/resource/{}/rules?limit=2&offset=1", resource_id),
            OWNER,
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let rules = body["data"]["rules"].as_array().unwrap();
    assert_eq!(rules.len(), 2);
    assert_eq!(rules[0]["match"], "CIDR");
    assert_eq!(rules[1]["value"], "203.0.113.7");
    assert_eq!(rules[1]["resourceName"], "dash");
    assert_eq!(
        body["data"]["pagination"],
        json!({ "total": 3, "limit": 2, "offset": 1 })
    );

    let (status, _) = app
        .call(
            Method::GET,
            "/api/v1/resource/9999/rules",
            OWNER,
            None,
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
