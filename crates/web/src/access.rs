//! Org-scoped access checks
//!
//! Admin roles may perform every action. Other roles are granted actions
//! individually through `role_actions`. Exit nodes are shared by every org,
//! so registering one is reserved for configured operators.

use crate::registry::Registry;
use fossorial_common::{Error, Result, RoleId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Actions checked against the caller's org role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Action {
    CreateSite,
    DeleteSite,
    GetSite,
    ListSites,
    ResyncSite,
    CreateResource,
    CreateResourceRule,
    ListResourceRules,
    CreateTarget,
    DeleteTarget,
    ListTargets,
    InviteUser,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateSite => "createSite",
            Self::DeleteSite => "deleteSite",
            Self::GetSite => "getSite",
            Self::ListSites => "listSites",
            Self::ResyncSite => "resyncSite",
            Self::CreateResource => "createResource",
            Self::CreateResourceRule => "createResourceRule",
            Self::ListResourceRules => "listResourceRules",
            Self::CreateTarget => "createTarget",
            Self::DeleteTarget => "deleteTarget",
            Self::ListTargets => "listTargets",
            Self::InviteUser => "inviteUser",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authenticated caller, as forwarded by the auth proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub user_id: String,
    pub email: String,
}

/// Caller's standing within one org
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrgAccess {
    pub role_id: RoleId,
    pub is_admin: bool,
}

/// Access checker
#[derive(Clone)]
pub struct AccessControl {
    registry: Registry,
    operators: Arc<HashSet<String>>,
}

impl AccessControl {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            operators: Arc::default(),
        }
    }

    pub fn with_operators<I>(mut self, operators: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        self.operators = Arc::new(operators.into_iter().collect());
        self
    }

    /// Check that the caller may manage infrastructure shared by all orgs
    pub fn check_operator(&self, caller: &Caller) -> Result<()> {
        if self.operators.contains(&caller.user_id) {
            return Ok(());
        }
        warn!("Denied operator action to user {}", caller.user_id);
        Err(Error::PermissionDenied(
            "Only operators may register exit nodes".to_string(),
        ))
    }

    /// Resolve the caller's role in an org, failing when they have none
    pub fn org_access(&self, caller: &Caller, org_id: &str) -> Result<OrgAccess> {
        let role_id = self
            .registry
            .get_user_org_role(&caller.user_id, org_id)?
            .ok_or_else(|| Error::PermissionDenied("User does not have a role".to_string()))?;
        let role = self
            .registry
            .get_role(role_id)?
            .ok_or_else(|| Error::not_found("Role", role_id))?;
        Ok(OrgAccess {
            role_id,
            is_admin: role.is_admin,
        })
    }

    /// Check that the caller may perform `action` in `org_id`
    pub fn check(&self, caller: &Caller, org_id: &str, action: Action) -> Result<OrgAccess> {
        let access = self.org_access(caller, org_id)?;
        if access.is_admin || self.registry.role_allows(access.role_id, action.as_str())? {
            return Ok(access);
        }
        debug!("Denied {} to user {} in org {}", action, caller.user_id, org_id);
        Err(Error::PermissionDenied(
            "User does not have permission to perform this action".to_string(),
        ))
    }
}
