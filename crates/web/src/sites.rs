//! Site, resource and target operations
//!
//! Every mutation validates its input before touching the database, commits,
//! then hands the change to the peer reconciler. A failed exit node call never
//! undoes the committed mutation; the outcome is reported alongside the row.

use crate::access::{Caller, OrgAccess};
use crate::names::unique_site_nice_id;
use crate::reconciler::{PeerReconciler, ReconcileOutcome};
use crate::registry::{
    NewNewt, NewResource, NewResourceRule, NewSite, NewTarget, Page, Paged, Registry,
};
use crate::secrets::hash_secret;
use fossorial_common::crypto::validate_wireguard_key;
use fossorial_common::{
    Error, ExitNodeId, Protocol, Resource, ResourceId, ResourceRule, Result, RuleAction,
    RuleMatch, Site, SiteId, SiteType, Target, TargetId,
};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::info;

const MAX_NAME_LEN: usize = 255;

// ============================================================================
// Requests / responses
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSiteRequest {
    pub name: String,
    pub exit_node_id: ExitNodeId,
    #[serde(rename = "type")]
    pub site_type: SiteType,
    pub subnet: String,
    #[serde(default)]
    pub pub_key: Option<String>,
    #[serde(default)]
    pub newt_id: Option<String>,
    #[serde(default)]
    pub secret: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateResourceRequest {
    pub name: String,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub http: bool,
    #[serde(default)]
    pub subdomain: Option<String>,
    #[serde(default)]
    pub proxy_port: Option<u16>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTargetRequest {
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub internal_port: Option<u16>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateResourceRuleRequest {
    pub action: RuleAction,
    #[serde(rename = "match")]
    pub match_type: RuleMatch,
    pub value: String,
}

/// Paging echo returned with every listing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Pagination {
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

impl Pagination {
    fn new(total: i64, page: Page) -> Self {
        Self {
            total,
            limit: page.limit,
            offset: page.offset,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SiteList {
    pub sites: Vec<Site>,
    pub pagination: Pagination,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetList {
    pub targets: Vec<Target>,
    pub pagination: Pagination,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceRuleList {
    pub rules: Vec<ResourceRule>,
    pub pagination: Pagination,
}

/// A row together with what happened on the exit node side
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reconciled<T> {
    #[serde(flatten)]
    pub item: T,
    pub peer_sync: ReconcileOutcome,
}

// ============================================================================
// Service
// ============================================================================

#[derive(Clone)]
pub struct SiteService {
    registry: Registry,
    reconciler: Arc<PeerReconciler>,
}

impl SiteService {
    pub fn new(registry: Registry, reconciler: Arc<PeerReconciler>) -> Self {
        Self {
            registry,
            reconciler,
        }
    }

    /// Create a site in `org_id` on behalf of `caller`
    pub async fn create_site(
        &self,
        caller: &Caller,
        access: OrgAccess,
        org_id: &str,
        req: CreateSiteRequest,
    ) -> Result<Reconciled<Site>> {
        validate_name(&req.name)?;
        req.subnet
            .parse::<IpNetwork>()
            .map_err(|e| Error::validation(format!("invalid subnet {}: {}", req.subnet, e)))?;

        let newt = match req.site_type {
            SiteType::Wireguard => {
                let pub_key = req.pub_key.as_deref().ok_or_else(|| {
                    Error::validation("pubKey is required for wireguard sites")
                })?;
                validate_wireguard_key(pub_key)?;
                None
            }
            SiteType::Newt => {
                if req.pub_key.is_some() {
                    return Err(Error::validation("pubKey is only valid for wireguard sites"));
                }
                let (Some(newt_id), Some(secret)) = (req.newt_id.as_deref(), req.secret.as_deref())
                else {
                    return Err(Error::validation(
                        "newtId and secret are required for newt sites",
                    ));
                };
                if newt_id.is_empty() || secret.is_empty() {
                    return Err(Error::validation("newtId and secret must not be empty"));
                }
                Some((newt_id.to_string(), secret.to_string()))
            }
        };

        self.registry
            .get_org(org_id)?
            .ok_or_else(|| Error::not_found("Organization", org_id))?;
        self.registry
            .get_exit_node(req.exit_node_id)?
            .ok_or_else(|| Error::not_found("Exit node", req.exit_node_id))?;
        let admin_role = self
            .registry
            .get_admin_role(org_id)?
            .ok_or_else(|| Error::not_found("Admin role for organization", org_id))?;

        let newt = match newt {
            Some((newt_id, secret)) => Some(NewNewt {
                newt_id,
                secret_hash: hash_secret(secret).await?,
            }),
            None => None,
        };

        let nice_id = unique_site_nice_id(&self.registry, org_id)?;
        let member = (!access.is_admin).then_some(caller.user_id.as_str());
        let site = self.registry.insert_site(
            &NewSite {
                org_id: org_id.to_string(),
                exit_node_id: req.exit_node_id,
                name: req.name,
                nice_id,
                site_type: req.site_type,
                pub_key: req.pub_key,
                subnet: req.subnet,
            },
            admin_role.role_id,
            member,
            newt.as_ref(),
        )?;
        info!(
            "Created {} site {} ({}) in org {}",
            site.site_type, site.site_id, site.nice_id, org_id
        );

        let peer_sync = self.reconciler.site_created(&site).await?;
        Ok(Reconciled {
            item: site,
            peer_sync,
        })
    }

    pub fn get_site(&self, site_id: SiteId) -> Result<Site> {
        self.registry
            .get_site(site_id)?
            .ok_or_else(|| Error::not_found("Site", site_id))
    }

    pub fn list_sites(&self, org_id: &str, page: Page) -> Result<SiteList> {
        let page = page.validate()?;
        self.registry
            .get_org(org_id)?
            .ok_or_else(|| Error::not_found("Organization", org_id))?;
        let Paged { rows, total } = self.registry.list_sites(org_id, page)?;
        Ok(SiteList {
            sites: rows,
            pagination: Pagination::new(total, page),
        })
    }

    /// Delete a site with its resources, targets and credential
    pub async fn delete_site(&self, site_id: SiteId) -> Result<Reconciled<Site>> {
        let site = self
            .registry
            .delete_site(site_id)?
            .ok_or_else(|| Error::not_found("Site", site_id))?;
        info!("Deleted site {} ({})", site.site_id, site.nice_id);

        let peer_sync = self.reconciler.site_deleted(&site).await?;
        Ok(Reconciled {
            item: site,
            peer_sync,
        })
    }

    pub fn allowed_ips(&self, site_id: SiteId) -> Result<Vec<String>> {
        self.get_site(site_id)?;
        self.reconciler.allowed_ips(site_id)
    }

    pub async fn resync_site(&self, site_id: SiteId) -> Result<ReconcileOutcome> {
        self.reconciler.resync_site(site_id).await
    }

    pub fn create_resource(&self, site_id: SiteId, req: CreateResourceRequest) -> Result<Resource> {
        validate_name(&req.name)?;
        if req.proxy_port == Some(0) {
            return Err(Error::validation("proxyPort must be between 1 and 65535"));
        }
        let site = self.get_site(site_id)?;
        let resource = self.registry.create_resource(
            &site.org_id,
            &NewResource {
                site_id,
                name: req.name,
                protocol: req.protocol,
                http: req.http,
                subdomain: req.subdomain,
                proxy_port: req.proxy_port,
            },
        )?;
        info!(
            "Created resource {} on site {}",
            resource.resource_id, site_id
        );
        Ok(resource)
    }

    pub fn get_resource(&self, resource_id: ResourceId) -> Result<Resource> {
        self.registry
            .get_resource(resource_id)?
            .ok_or_else(|| Error::not_found("Resource", resource_id))
    }

    pub async fn create_target(
        &self,
        resource_id: ResourceId,
        req: CreateTargetRequest,
    ) -> Result<Reconciled<Target>> {
        req.ip
            .parse::<IpAddr>()
            .map_err(|_| Error::validation(format!("invalid target IP {}", req.ip)))?;
        if req.port == 0 || req.internal_port == Some(0) {
            return Err(Error::validation("ports must be between 1 and 65535"));
        }

        let resource = self.get_resource(resource_id)?;
        let site = self.get_site(resource.site_id)?;
        let target = self.registry.create_target(&NewTarget {
            resource_id,
            ip: req.ip,
            port: req.port,
            method: req.method,
            internal_port: req.internal_port,
            enabled: req.enabled,
        })?;
        info!("Created target {} on resource {}", target.target_id, resource_id);

        let peer_sync = self
            .reconciler
            .target_added(&site, &resource, &target)
            .await?;
        Ok(Reconciled {
            item: target,
            peer_sync,
        })
    }

    pub fn list_targets(&self, resource_id: ResourceId, page: Page) -> Result<TargetList> {
        let page = page.validate()?;
        self.get_resource(resource_id)?;
        let Paged { rows, total } = self.registry.list_targets(resource_id, page)?;
        Ok(TargetList {
            targets: rows,
            pagination: Pagination::new(total, page),
        })
    }

    pub fn create_resource_rule(
        &self,
        resource_id: ResourceId,
        req: CreateResourceRuleRequest,
    ) -> Result<ResourceRule> {
        validate_rule_value(req.match_type, &req.value)?;
        self.get_resource(resource_id)?;
        let rule = self.registry.create_resource_rule(&NewResourceRule {
            resource_id,
            action: req.action,
            match_type: req.match_type,
            value: req.value,
        })?;
        info!(
            "Created {} rule {} on resource {}",
            rule.action, rule.rule_id, resource_id
        );
        Ok(rule)
    }

    pub fn list_resource_rules(&self, resource_id: ResourceId, page: Page) -> Result<ResourceRuleList> {
        let page = page.validate()?;
        self.get_resource(resource_id)?;
        let Paged { rows, total } = self.registry.list_resource_rules(resource_id, page)?;
        Ok(ResourceRuleList {
            rules: rows,
            pagination: Pagination::new(total, page),
        })
    }

    pub fn get_target(&self, target_id: TargetId) -> Result<Target> {
        self.registry
            .get_target(target_id)?
            .ok_or_else(|| Error::not_found("Target", target_id))
    }

    /// Delete a target and reconcile its site.
    ///
    /// The row is deleted first; a missing resource or site afterwards is
    /// reported as not found and the deletion stands.
    pub async fn delete_target(&self, target_id: TargetId) -> Result<Reconciled<Target>> {
        let target = self
            .registry
            .delete_target(target_id)?
            .ok_or_else(|| Error::not_found("Target", target_id))?;
        let resource = self
            .registry
            .get_resource(target.resource_id)?
            .ok_or_else(|| Error::not_found("Resource", target.resource_id))?;
        let site = self
            .registry
            .get_site(resource.site_id)?
            .ok_or_else(|| Error::not_found("Site", resource.site_id))?;
        info!("Deleted target {} from resource {}", target_id, resource.resource_id);

        let peer_sync = self
            .reconciler
            .target_removed(&site, &resource, &target)
            .await?;
        Ok(Reconciled {
            item: target,
            peer_sync,
        })
    }
}

fn validate_name(name: &str) -> Result<()> {
    let len = name.chars().count();
    if len == 0 || len > MAX_NAME_LEN {
        return Err(Error::validation(format!(
            "name must be between 1 and {} characters",
            MAX_NAME_LEN
        )));
    }
    Ok(())
}

fn validate_rule_value(match_type: RuleMatch, value: &str) -> Result<()> {
    let valid = match match_type {
        RuleMatch::Cidr => value.parse::<IpNetwork>().is_ok(),
        RuleMatch::Ip => value.parse::<IpAddr>().is_ok(),
        RuleMatch::Path => value.starts_with('/') && !value.chars().any(char::is_whitespace),
    };
    if valid {
        Ok(())
    } else {
        Err(Error::validation(format!(
            "invalid {} rule value: {}",
            match_type, value
        )))
    }
}
