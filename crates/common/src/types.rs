//! Core types for Fossorial

use serde::{Deserialize, Serialize};

pub type SiteId = i64;
pub type ResourceId = i64;
pub type TargetId = i64;
pub type RoleId = i64;
pub type ExitNodeId = i64;
pub type RuleId = i64;

/// How a site connects to its exit node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SiteType {
    /// Static WireGuard peer registered on the exit node
    Wireguard,
    /// Agent-based tunnel paired through a newt credential
    Newt,
}

impl std::fmt::Display for SiteType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Wireguard => write!(f, "wireguard"),
            Self::Newt => write!(f, "newt"),
        }
    }
}

impl std::str::FromStr for SiteType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "wireguard" => Ok(Self::Wireguard),
            "newt" => Ok(Self::Newt),
            _ => Err(format!("unknown site type: {}", s)),
        }
    }
}

/// Transport protocol of a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Default for Protocol {
    fn default() -> Self {
        Self::Tcp
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
        }
    }
}

impl std::str::FromStr for Protocol {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            _ => Err(format!("unknown protocol: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Org {
    pub org_id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    pub role_id: RoleId,
    pub org_id: String,
    pub name: String,
    pub is_admin: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub user_id: String,
    pub email: String,
}

/// Exit node terminating site tunnels
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitNode {
    pub exit_node_id: ExitNodeId,
    pub name: String,
    /// Tunnel address of the exit node, e.g. `100.89.0.1/24`
    pub address: String,
    /// Public endpoint peers dial
    pub endpoint: String,
    pub public_key: String,
    pub listen_port: u16,
    /// Base URL of the exit node control plane
    pub reachable_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Site {
    pub site_id: SiteId,
    pub org_id: String,
    pub exit_node_id: ExitNodeId,
    pub name: String,
    pub nice_id: String,
    #[serde(rename = "type")]
    pub site_type: SiteType,
    /// Only set for wireguard sites
    pub pub_key: Option<String>,
    pub subnet: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub resource_id: ResourceId,
    pub site_id: SiteId,
    pub org_id: String,
    pub name: String,
    pub protocol: Protocol,
    pub http: bool,
    pub subdomain: Option<String>,
    pub proxy_port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    pub target_id: TargetId,
    pub resource_id: ResourceId,
    pub ip: String,
    pub port: u16,
    pub method: Option<String>,
    pub internal_port: Option<u16>,
    pub enabled: bool,
}

impl Target {
    /// Allow-list entry for this target on an exit node
    pub fn allowed_ip(&self) -> String {
        format!("{}/32", self.ip)
    }
}

/// What the proxy does with a request matching a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RuleAction {
    Accept,
    Drop,
}

impl std::fmt::Display for RuleAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Accept => write!(f, "ACCEPT"),
            Self::Drop => write!(f, "DROP"),
        }
    }
}

impl std::str::FromStr for RuleAction {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACCEPT" => Ok(Self::Accept),
            "DROP" => Ok(Self::Drop),
            _ => Err(format!("unknown rule action: {}", s)),
        }
    }
}

/// What a rule's value is compared against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RuleMatch {
    Cidr,
    Ip,
    Path,
}

impl std::fmt::Display for RuleMatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cidr => write!(f, "CIDR"),
            Self::Ip => write!(f, "IP"),
            Self::Path => write!(f, "PATH"),
        }
    }
}

impl std::str::FromStr for RuleMatch {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CIDR" => Ok(Self::Cidr),
            "IP" => Ok(Self::Ip),
            "PATH" => Ok(Self::Path),
            _ => Err(format!("unknown rule match: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRule {
    pub rule_id: RuleId,
    pub resource_id: ResourceId,
    pub action: RuleAction,
    #[serde(rename = "match")]
    pub match_type: RuleMatch,
    pub value: String,
    pub resource_name: String,
}

/// Credential pairing a newt agent with its site
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Newt {
    pub newt_id: String,
    pub site_id: SiteId,
    #[serde(skip_serializing)]
    pub secret_hash: String,
    pub date_created: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInvite {
    pub invite_id: String,
    pub org_id: String,
    pub email: String,
    pub role_id: RoleId,
    #[serde(skip_serializing)]
    pub token_hash: String,
    /// Unix millis
    pub expires_at: i64,
}
