//! Org invitations
//!
//! Invite links carry `{invite_id}-{token}`. Only an Argon2id hash of the
//! token is stored; the plaintext exists solely in the link handed back to
//! the inviter.

use crate::access::{AccessControl, Action, Caller};
use crate::rate_limit::InviteRateLimiter;
use crate::registry::Registry;
use crate::secrets::{hash_secret, verify_secret};
use fossorial_common::crypto::random_alphanumeric;
use fossorial_common::{Error, Result, RoleId, UserInvite};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

const INVITE_ID_LEN: usize = 10;
const INVITE_TOKEN_LEN: usize = 32;
const MAX_VALID_HOURS: u32 = 168;
const MINUTE_MS: i64 = 60_000;
const HOUR_MS: i64 = 60 * MINUTE_MS;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InviteUserRequest {
    pub email: String,
    pub role_id: RoleId,
    pub valid_hours: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InviteCreated {
    pub invite_link: String,
    pub expires_at: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptInviteRequest {
    pub invite_id: String,
    pub token: String,
}

impl AcceptInviteRequest {
    /// Parse the `token` query value of an invite link
    pub fn from_link_token(value: &str) -> Result<Self> {
        let (invite_id, token) = value
            .split_once('-')
            .filter(|(id, token)| !id.is_empty() && !token.is_empty())
            .ok_or_else(|| Error::validation("Invalid invite token"))?;
        Ok(Self {
            invite_id: invite_id.to_string(),
            token: token.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InviteAccepted {
    pub org_id: String,
    pub role_id: RoleId,
}

pub struct InviteService {
    registry: Registry,
    access: AccessControl,
    limiter: InviteRateLimiter,
    base_url: String,
}

impl InviteService {
    pub fn new(
        registry: Registry,
        access: AccessControl,
        limiter: InviteRateLimiter,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            access,
            limiter,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub async fn invite_user(
        &self,
        caller: &Caller,
        org_id: &str,
        req: InviteUserRequest,
    ) -> Result<InviteCreated> {
        self.invite_user_at(caller, org_id, req, chrono::Utc::now().timestamp_millis())
            .await
    }

    pub async fn invite_user_at(
        &self,
        caller: &Caller,
        org_id: &str,
        req: InviteUserRequest,
        now: i64,
    ) -> Result<InviteCreated> {
        validate_email(&req.email)?;
        if req.valid_hours == 0 || req.valid_hours > MAX_VALID_HOURS {
            return Err(Error::validation(format!(
                "validHours must be greater than 0 and at most {}",
                MAX_VALID_HOURS
            )));
        }

        self.access.check(caller, org_id, Action::InviteUser)?;

        if !self.limiter.check_and_record_at(&req.email, now)? {
            return Err(Error::RateLimited(format!(
                "User has already been invited {} times in the last {}",
                self.limiter.max_per_window(),
                describe_window(self.limiter.window_ms())
            )));
        }

        self.registry
            .get_org(org_id)?
            .ok_or_else(|| Error::not_found("Organization", org_id))?;
        match self.registry.get_role(req.role_id)? {
            Some(role) if role.org_id == org_id => {}
            _ => return Err(Error::not_found("Role", req.role_id)),
        }
        if self.registry.is_member_by_email(&req.email, org_id)? {
            return Err(Error::validation(
                "User is already a member of this organization",
            ));
        }

        let invite_id = random_alphanumeric(INVITE_ID_LEN);
        let token = random_alphanumeric(INVITE_TOKEN_LEN);
        let expires_at = now + i64::from(req.valid_hours) * HOUR_MS;

        self.registry.replace_invite(&UserInvite {
            invite_id: invite_id.clone(),
            org_id: org_id.to_string(),
            email: req.email.clone(),
            role_id: req.role_id,
            token_hash: hash_secret(token.clone()).await?,
            expires_at,
        })?;

        let invite_link = format!("{}/invite?token={}-{}", self.base_url, invite_id, token);
        info!("Invited {} to org {} (invite {})", req.email, org_id, invite_id);
        debug!("Invite link for {}: {}", req.email, invite_link);

        Ok(InviteCreated {
            invite_link,
            expires_at,
        })
    }

    pub async fn accept_invite(
        &self,
        caller: &Caller,
        req: AcceptInviteRequest,
    ) -> Result<InviteAccepted> {
        self.accept_invite_at(caller, req, chrono::Utc::now().timestamp_millis())
            .await
    }

    pub async fn accept_invite_at(
        &self,
        caller: &Caller,
        req: AcceptInviteRequest,
        now: i64,
    ) -> Result<InviteAccepted> {
        let invite = self
            .registry
            .get_invite(&req.invite_id)?
            .ok_or_else(|| Error::not_found("Invite", &req.invite_id))?;

        if invite.expires_at <= now {
            return Err(Error::validation("Invite has expired"));
        }
        if !verify_secret(req.token, invite.token_hash.clone()).await? {
            return Err(Error::validation("Invalid invite token"));
        }
        if !invite.email.eq_ignore_ascii_case(&caller.email) {
            return Err(Error::PermissionDenied(
                "Invite is not intended for this user".to_string(),
            ));
        }

        self.registry.upsert_user(&caller.user_id, &caller.email)?;
        self.registry
            .add_user_to_org(&caller.user_id, &invite.org_id, invite.role_id)?;
        self.registry.delete_invite(&invite.invite_id)?;
        info!(
            "User {} joined org {} via invite {}",
            caller.user_id, invite.org_id, invite.invite_id
        );

        Ok(InviteAccepted {
            org_id: invite.org_id,
            role_id: invite.role_id,
        })
    }
}

/// `"hour"`, `"30 minutes"`, `"2 hours"`, ...
fn describe_window(window_ms: i64) -> String {
    let (count, unit) = if window_ms % HOUR_MS == 0 {
        (window_ms / HOUR_MS, "hour")
    } else if window_ms % MINUTE_MS == 0 {
        (window_ms / MINUTE_MS, "minute")
    } else {
        (window_ms / 1000, "second")
    };
    if count == 1 {
        unit.to_string()
    } else {
        format!("{} {}s", count, unit)
    }
}

fn validate_email(email: &str) -> Result<()> {
    let valid = email
        .split_once('@')
        .map(|(local, domain)| {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !domain.contains('@')
        })
        .unwrap_or(false);
    if valid && !email.chars().any(char::is_whitespace) {
        Ok(())
    } else {
        Err(Error::validation(format!("invalid email address: {}", email)))
    }
}
