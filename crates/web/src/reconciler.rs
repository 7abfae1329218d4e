//! Peer reconciliation
//!
//! Keeps exit nodes and newt agents in line with the target registry. Each
//! site type has a strategy: wireguard sites get their complete allow-list
//! re-pushed on every change, newt sites get add/remove deltas.
//!
//! Database mutations are committed before reconciliation runs and are never
//! rolled back. Calls that still fail after the client's own retries are
//! parked in the outbox and replayed by the outbox worker.

use crate::exit_node::{ExitNodeClient, PeerConfig, TargetAction};
use crate::outbox::Outbox;
use crate::registry::Registry;
use fossorial_common::{
    Error, ExitNodeId, Protocol, Resource, Result, Site, SiteId, SiteType, Target,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

// ============================================================================
// Types
// ============================================================================

/// A single call against the exit node control plane
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PeerCall {
    AddPeer {
        exit_node_id: ExitNodeId,
        peer: PeerConfig,
    },
    RemovePeer {
        exit_node_id: ExitNodeId,
        public_key: String,
    },
    NewtTargets {
        newt_id: String,
        action: TargetAction,
        protocol: Protocol,
        targets: Vec<Target>,
    },
}

impl PeerCall {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AddPeer { .. } => "add_peer",
            Self::RemovePeer { .. } => "remove_peer",
            Self::NewtTargets { .. } => "newt_targets",
        }
    }
}

/// What happened to the exit node side of a mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconcileOutcome {
    /// The exit node accepted the change
    Applied,
    /// The call failed and was queued for retry
    Deferred,
    /// Nothing to push for this site
    Skipped,
}

// ============================================================================
// Strategies
// ============================================================================

/// Per-site-type reaction to registry changes
pub trait SitePeerStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn on_site_created(&self, site: &Site) -> Result<Option<PeerCall>>;

    fn on_target_added(
        &self,
        site: &Site,
        resource: &Resource,
        target: &Target,
    ) -> Result<Option<PeerCall>>;

    fn on_target_removed(
        &self,
        site: &Site,
        resource: &Resource,
        target: &Target,
    ) -> Result<Option<PeerCall>>;

    fn on_site_deleted(&self, site: &Site) -> Result<Option<PeerCall>>;
}

/// Wireguard sites: push the complete allow-list every time
pub struct FullStatePush {
    registry: Registry,
}

impl FullStatePush {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }

    /// Current peer entry for a site, recomputed from the registry
    pub fn peer_for(&self, site: &Site) -> Result<Option<PeerCall>> {
        let Some(public_key) = site.pub_key.clone() else {
            return Ok(None);
        };
        let allowed_ips = self.registry.site_allowed_ips(site.site_id)?;
        Ok(Some(PeerCall::AddPeer {
            exit_node_id: site.exit_node_id,
            peer: PeerConfig {
                public_key,
                allowed_ips,
            },
        }))
    }
}

impl SitePeerStrategy for FullStatePush {
    fn name(&self) -> &'static str {
        "full_state_push"
    }

    fn on_site_created(&self, site: &Site) -> Result<Option<PeerCall>> {
        Ok(site.pub_key.clone().map(|public_key| PeerCall::AddPeer {
            exit_node_id: site.exit_node_id,
            peer: PeerConfig {
                public_key,
                allowed_ips: Vec::new(),
            },
        }))
    }

    fn on_target_added(&self, site: &Site, _: &Resource, _: &Target) -> Result<Option<PeerCall>> {
        self.peer_for(site)
    }

    fn on_target_removed(&self, site: &Site, _: &Resource, _: &Target) -> Result<Option<PeerCall>> {
        self.peer_for(site)
    }

    fn on_site_deleted(&self, site: &Site) -> Result<Option<PeerCall>> {
        Ok(site.pub_key.clone().map(|public_key| PeerCall::RemovePeer {
            exit_node_id: site.exit_node_id,
            public_key,
        }))
    }
}

/// Newt sites: notify the agent of individual target changes
pub struct DeltaNotify {
    registry: Registry,
}

impl DeltaNotify {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }

    fn notify(
        &self,
        site: &Site,
        resource: &Resource,
        target: &Target,
        action: TargetAction,
    ) -> Result<Option<PeerCall>> {
        let newt = self
            .registry
            .get_newt_by_site(site.site_id)?
            .ok_or_else(|| Error::not_found("Newt for site", site.site_id))?;
        Ok(Some(PeerCall::NewtTargets {
            newt_id: newt.newt_id,
            action,
            protocol: resource.protocol,
            targets: vec![target.clone()],
        }))
    }
}

impl SitePeerStrategy for DeltaNotify {
    fn name(&self) -> &'static str {
        "delta_notify"
    }

    fn on_site_created(&self, _: &Site) -> Result<Option<PeerCall>> {
        Ok(None)
    }

    fn on_target_added(
        &self,
        site: &Site,
        resource: &Resource,
        target: &Target,
    ) -> Result<Option<PeerCall>> {
        self.notify(site, resource, target, TargetAction::Add)
    }

    fn on_target_removed(
        &self,
        site: &Site,
        resource: &Resource,
        target: &Target,
    ) -> Result<Option<PeerCall>> {
        self.notify(site, resource, target, TargetAction::Remove)
    }

    fn on_site_deleted(&self, _: &Site) -> Result<Option<PeerCall>> {
        Ok(None)
    }
}

// ============================================================================
// Reconciler
// ============================================================================

/// Reconciler that pushes site changes to the exit node control plane
pub struct PeerReconciler {
    registry: Registry,
    client: Arc<dyn ExitNodeClient>,
    outbox: Outbox,
    full: FullStatePush,
    delta: DeltaNotify,
}

impl PeerReconciler {
    pub fn new(registry: Registry, client: Arc<dyn ExitNodeClient>, outbox: Outbox) -> Self {
        Self {
            full: FullStatePush::new(registry.clone()),
            delta: DeltaNotify::new(registry.clone()),
            registry,
            client,
            outbox,
        }
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn strategy_for(&self, site: &Site) -> &dyn SitePeerStrategy {
        match site.site_type {
            SiteType::Wireguard => &self.full,
            SiteType::Newt => &self.delta,
        }
    }

    pub async fn site_created(&self, site: &Site) -> Result<ReconcileOutcome> {
        let call = self.strategy_for(site).on_site_created(site)?;
        self.dispatch(site.site_id, call).await
    }

    pub async fn target_added(
        &self,
        site: &Site,
        resource: &Resource,
        target: &Target,
    ) -> Result<ReconcileOutcome> {
        let call = self.strategy_for(site).on_target_added(site, resource, target)?;
        self.dispatch(site.site_id, call).await
    }

    pub async fn target_removed(
        &self,
        site: &Site,
        resource: &Resource,
        target: &Target,
    ) -> Result<ReconcileOutcome> {
        let call = self
            .strategy_for(site)
            .on_target_removed(site, resource, target)?;
        self.dispatch(site.site_id, call).await
    }

    pub async fn site_deleted(&self, site: &Site) -> Result<ReconcileOutcome> {
        // Pending pushes for a deleted site would resurrect its peer
        self.outbox.clear_site(site.site_id)?;
        let call = self.strategy_for(site).on_site_deleted(site)?;
        self.dispatch(site.site_id, call).await
    }

    /// Re-push the full allow-list of a wireguard site
    pub async fn resync_site(&self, site_id: SiteId) -> Result<ReconcileOutcome> {
        let site = self
            .registry
            .get_site(site_id)?
            .ok_or_else(|| Error::not_found("Site", site_id))?;
        if site.site_type != SiteType::Wireguard {
            return Ok(ReconcileOutcome::Skipped);
        }
        let call = self.full.peer_for(&site)?;
        self.dispatch(site_id, call).await
    }

    /// Current allow-list of a site as it would be pushed
    pub fn allowed_ips(&self, site_id: SiteId) -> Result<Vec<String>> {
        self.registry.site_allowed_ips(site_id)
    }

    /// Replay a parked call without re-queuing it.
    ///
    /// Full pushes are recomputed so a replay never sends a stale allow-list.
    pub async fn replay(&self, site_id: SiteId, call: &PeerCall) -> Result<()> {
        match call {
            PeerCall::AddPeer { .. } => {
                let site = self
                    .registry
                    .get_site(site_id)?
                    .ok_or_else(|| Error::not_found("Site", site_id))?;
                match self.full.peer_for(&site)? {
                    Some(fresh) => self.send(&fresh).await,
                    None => Ok(()),
                }
            }
            _ => self.send(call).await,
        }
    }

    async fn dispatch(&self, site_id: SiteId, call: Option<PeerCall>) -> Result<ReconcileOutcome> {
        let Some(call) = call else {
            debug!("Nothing to reconcile for site {}", site_id);
            return Ok(ReconcileOutcome::Skipped);
        };

        // Newt deltas must reach the agent in the order they were made
        if matches!(call, PeerCall::NewtTargets { .. }) && self.outbox.has_pending_deltas(site_id)? {
            info!(
                "Site {} has undelivered target updates, queueing {} behind them",
                site_id,
                call.kind()
            );
            self.outbox
                .enqueue(site_id, &call, "waiting for earlier target updates")?;
            return Ok(ReconcileOutcome::Deferred);
        }

        match self.send(&call).await {
            Ok(()) => {
                if let PeerCall::AddPeer { .. } = call {
                    self.outbox.clear_full_push(site_id)?;
                }
                info!("Reconciled site {} ({})", site_id, call.kind());
                Ok(ReconcileOutcome::Applied)
            }
            Err(e) if e.is_transient() => {
                warn!(
                    "Reconciling site {} ({}) failed, queued for retry: {}",
                    site_id,
                    call.kind(),
                    e
                );
                self.outbox.enqueue(site_id, &call, &e.to_string()).map_err(|oe| {
                    Error::upstream(
                        format!("site {}", site_id),
                        format!("{}; queueing retry also failed: {}", e, oe),
                    )
                })?;
                Ok(ReconcileOutcome::Deferred)
            }
            Err(e) => Err(e),
        }
    }

    async fn send(&self, call: &PeerCall) -> Result<()> {
        match call {
            PeerCall::AddPeer { exit_node_id, peer } => {
                self.client.add_peer(*exit_node_id, peer).await
            }
            PeerCall::RemovePeer {
                exit_node_id,
                public_key,
            } => self.client.remove_peer(*exit_node_id, public_key).await,
            PeerCall::NewtTargets {
                newt_id,
                action: TargetAction::Add,
                protocol,
                targets,
            } => self.client.add_targets(newt_id, targets, *protocol).await,
            PeerCall::NewtTargets {
                newt_id,
                action: TargetAction::Remove,
                protocol,
                targets,
            } => self.client.remove_targets(newt_id, targets, *protocol).await,
        }
    }
}
