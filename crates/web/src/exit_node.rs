//! Exit node and newt control plane client
//!
//! The exit node owns the WireGuard peer table; we only tell it which peers
//! exist and which destination IPs each may reach. Newt agents are notified
//! through the newt relay with add/remove target messages.

use crate::config::{ExitNodeConfig, NewtConfig};
use crate::registry::Registry;
use async_trait::async_trait;
use fossorial_common::crypto::peer_idempotency_key;
use fossorial_common::{Error, ExitNodeId, Protocol, Result, Target};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

// ============================================================================
// Types
// ============================================================================

/// Peer entry pushed to an exit node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerConfig {
    pub public_key: String,
    pub allowed_ips: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetAction {
    Add,
    Remove,
}

impl std::fmt::Display for TargetAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Add => write!(f, "add"),
            Self::Remove => write!(f, "remove"),
        }
    }
}

/// Message delivered to a newt agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewtMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    pub data: NewtTargetsData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewtTargetsData {
    pub targets: Vec<String>,
}

impl NewtMessage {
    pub fn targets(action: TargetAction, protocol: Protocol, targets: &[Target]) -> Self {
        Self {
            message_type: format!("newt/{}/{}", protocol, action),
            data: NewtTargetsData {
                targets: targets.iter().map(format_newt_target).collect(),
            },
        }
    }
}

/// `internal_port:ip:port`, or `ip:port` when the target has no internal port
pub fn format_newt_target(target: &Target) -> String {
    match target.internal_port {
        Some(internal) => format!("{}:{}:{}", internal, target.ip, target.port),
        None => format!("{}:{}", target.ip, target.port),
    }
}

// ============================================================================
// Client trait
// ============================================================================

/// Exit node control plane
#[async_trait]
pub trait ExitNodeClient: Send + Sync {
    /// Upsert a peer with its complete allow-list
    async fn add_peer(&self, exit_node_id: ExitNodeId, peer: &PeerConfig) -> Result<()>;

    /// Remove a peer from an exit node
    async fn remove_peer(&self, exit_node_id: ExitNodeId, public_key: &str) -> Result<()>;

    /// Tell a newt agent to start proxying targets
    async fn add_targets(&self, newt_id: &str, targets: &[Target], protocol: Protocol) -> Result<()>;

    /// Tell a newt agent to stop proxying targets
    async fn remove_targets(&self, newt_id: &str, targets: &[Target], protocol: Protocol)
        -> Result<()>;
}

// ============================================================================
// HTTP implementation
// ============================================================================

/// Ceiling for the delay between inline attempts
pub const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(30);

/// Bounded retry with exponential backoff
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
}

impl RetryPolicy {
    /// Double `current`, saturating at `MAX_RETRY_BACKOFF`
    pub fn next_backoff(current: Duration) -> Duration {
        current
            .checked_mul(2)
            .map_or(MAX_RETRY_BACKOFF, |d| d.min(MAX_RETRY_BACKOFF))
    }
}

impl From<&ExitNodeConfig> for RetryPolicy {
    fn from(config: &ExitNodeConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: config.initial_backoff(),
        }
    }
}

/// HTTP client for exit nodes and the newt relay
pub struct HttpExitNodeClient {
    http: reqwest::Client,
    registry: Registry,
    newt_relay_url: String,
    retry: RetryPolicy,
    timeout: Duration,
}

impl HttpExitNodeClient {
    pub fn new(registry: Registry, exit_node: &ExitNodeConfig, newt: &NewtConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(exit_node.request_timeout())
            .build()
            .map_err(|e| Error::InvalidConfig(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            registry,
            newt_relay_url: newt.relay_url.trim_end_matches('/').to_string(),
            retry: RetryPolicy::from(exit_node),
            timeout: exit_node.request_timeout(),
        })
    }

    fn exit_node_url(&self, exit_node_id: ExitNodeId) -> Result<String> {
        let node = self
            .registry
            .get_exit_node(exit_node_id)?
            .ok_or_else(|| Error::not_found("Exit node", exit_node_id))?;
        Ok(node.reachable_at.trim_end_matches('/').to_string())
    }

    async fn send_with_retry<F>(&self, target: &str, build: F) -> Result<()>
    where
        F: Fn() -> reqwest::RequestBuilder + Send + Sync,
    {
        let mut backoff = self.retry.initial_backoff.min(MAX_RETRY_BACKOFF);
        let mut attempt = 1;

        loop {
            let err = match build().send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!("{} accepted request on attempt {}", target, attempt);
                    return Ok(());
                }
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    let message = format!("HTTP {}: {}", status, body);
                    if status.is_client_error() && status != reqwest::StatusCode::TOO_MANY_REQUESTS {
                        return Err(Error::rejected(target, message));
                    }
                    Error::upstream(target, message)
                }
                Err(e) if e.is_timeout() => Error::Timeout {
                    seconds: self.timeout.as_secs(),
                },
                Err(e) => Error::upstream(target, e),
            };

            if attempt >= self.retry.max_attempts {
                return Err(err);
            }
            warn!(
                "Attempt {}/{} to {} failed: {}; retrying in {:?}",
                attempt, self.retry.max_attempts, target, err, backoff
            );
            tokio::time::sleep(backoff).await;
            backoff = RetryPolicy::next_backoff(backoff);
            attempt += 1;
        }
    }

    async fn send_newt(&self, newt_id: &str, message: &NewtMessage) -> Result<()> {
        let url = format!("{}/newt/{}/messages", self.newt_relay_url, newt_id);
        let target = format!("newt {}", newt_id);
        self.send_with_retry(&target, || self.http.post(&url).json(message))
            .await
    }
}

#[async_trait]
impl ExitNodeClient for HttpExitNodeClient {
    async fn add_peer(&self, exit_node_id: ExitNodeId, peer: &PeerConfig) -> Result<()> {
        let url = format!("{}/peer", self.exit_node_url(exit_node_id)?);
        let key = peer_idempotency_key(&peer.public_key, &peer.allowed_ips);
        let target = format!("exit node {}", exit_node_id);
        self.send_with_retry(&target, || {
            self.http
                .post(&url)
                .header("Idempotency-Key", key.as_str())
                .json(peer)
        })
        .await
    }

    async fn remove_peer(&self, exit_node_id: ExitNodeId, public_key: &str) -> Result<()> {
        let url = format!("{}/peer", self.exit_node_url(exit_node_id)?);
        let target = format!("exit node {}", exit_node_id);
        self.send_with_retry(&target, || {
            self.http.delete(&url).query(&[("public_key", public_key)])
        })
        .await
    }

    async fn add_targets(&self, newt_id: &str, targets: &[Target], protocol: Protocol) -> Result<()> {
        self.send_newt(newt_id, &NewtMessage::targets(TargetAction::Add, protocol, targets))
            .await
    }

    async fn remove_targets(
        &self,
        newt_id: &str,
        targets: &[Target],
        protocol: Protocol,
    ) -> Result<()> {
        self.send_newt(newt_id, &NewtMessage::targets(TargetAction::Remove, protocol, targets))
            .await
    }
}

// ============================================================================
// Recording fake for tests
// ============================================================================
