//! REST API
//!
//! Every response uses the `{data, success, error, message, status}`
//! envelope, including extractor rejections. The caller is identified by the
//! `x-user-id` and `x-user-email` headers set by the authenticating proxy.

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        Path, Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

use crate::access::{AccessControl, Action, Caller};
use crate::config::ServerConfig;
use crate::exit_node::ExitNodeClient;
use crate::invites::{AcceptInviteRequest, InviteService, InviteUserRequest};
use crate::outbox::Outbox;
use crate::rate_limit::{
    InMemoryRateWindowStore, InviteRateLimiter, RateWindowStore, SqliteRateWindowStore,
};
use crate::reconciler::PeerReconciler;
use crate::registry::{NewExitNode, Page, Registry};
use crate::sites::{
    CreateResourceRequest, CreateResourceRuleRequest, CreateSiteRequest, CreateTargetRequest,
    SiteService,
};
use fossorial_common::{Database, Error, ErrorKind, ResourceId, SiteId, TargetId};

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_EMAIL_HEADER: &str = "x-user-email";

// ============================================================================
// State
// ============================================================================

/// Shared API state
pub struct AppState {
    pub registry: Registry,
    pub access: AccessControl,
    pub reconciler: Arc<PeerReconciler>,
    pub sites: SiteService,
    pub invites: InviteService,
}

impl AppState {
    pub fn new(db: Database, config: &ServerConfig, client: Arc<dyn ExitNodeClient>) -> Self {
        let registry = Registry::new(db.clone());
        let access =
            AccessControl::new(registry.clone()).with_operators(config.operators.iter().cloned());
        let outbox = Outbox::new(db.clone(), config.outbox.clone());
        let reconciler = Arc::new(PeerReconciler::new(registry.clone(), client, outbox));

        let store: Arc<dyn RateWindowStore> = if config.invites.persist_rate_windows {
            Arc::new(SqliteRateWindowStore::new(db))
        } else {
            Arc::new(InMemoryRateWindowStore::default())
        };
        let limiter = InviteRateLimiter::new(
            store,
            config.invites.max_per_window,
            config.invites.window_ms,
        );

        Self {
            sites: SiteService::new(registry.clone(), reconciler.clone()),
            invites: InviteService::new(
                registry.clone(),
                access.clone(),
                limiter,
                config.base_url.clone(),
            ),
            registry,
            access,
            reconciler,
        }
    }
}

// ============================================================================
// Envelope and errors
// ============================================================================

/// Response envelope
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub data: Option<T>,
    pub success: bool,
    pub error: bool,
    pub message: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

fn ok<T: Serialize>(status: StatusCode, message: &str, data: T) -> Response {
    (
        status,
        Json(ApiResponse {
            data: Some(data),
            success: true,
            error: false,
            message: message.to_string(),
            status: status.as_u16(),
            kind: None,
        }),
    )
        .into_response()
}

/// Error response carrying the machine-readable kind
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: String,
    message: String,
}

impl ApiError {
    fn unauthorized() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            kind: "unauthorized".to_string(),
            message: "Missing caller identity".to_string(),
        }
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        let kind = e.kind();
        let status = match kind {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
            ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::Upstream => StatusCode::BAD_GATEWAY,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = if kind == ErrorKind::Internal {
            error!("Request failed: {}", e);
            "An error occurred".to_string()
        } else {
            e.to_string()
        };
        Self {
            status,
            kind: kind.to_string(),
            message,
        }
    }
}

impl ApiError {
    fn rejected(message: String) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: ErrorKind::Validation.to_string(),
            message,
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::rejected(rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self::rejected(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::rejected(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ApiResponse::<()> {
                data: None,
                success: false,
                error: true,
                message: self.message,
                status: self.status.as_u16(),
                kind: Some(self.kind),
            }),
        )
            .into_response()
    }
}

type ApiResult = std::result::Result<Response, ApiError>;
type PathParam<T> = std::result::Result<Path<T>, PathRejection>;
type PageParam = std::result::Result<Query<Page>, QueryRejection>;

fn caller(headers: &HeaderMap) -> std::result::Result<Caller, ApiError> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };
    match (header(USER_ID_HEADER), header(USER_EMAIL_HEADER)) {
        (Some(user_id), Some(email)) => Ok(Caller { user_id, email }),
        _ => Err(ApiError::unauthorized()),
    }
}

// ============================================================================
// Router
// ============================================================================

/// Create the API router, mounted under `/api/v1`
pub fn router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/health", get(health_handler))
        .route("/org", put(create_org_handler))
        .route("/exit-node", put(create_exit_node_handler))
        .route("/org/:org_id/site", put(create_site_handler))
        .route("/org/:org_id/sites", get(list_sites_handler))
        .route("/org/:org_id/create-invite", post(create_invite_handler))
        .route("/invite/accept", post(accept_invite_handler))
        .route("/site/:site_id", get(get_site_handler).delete(delete_site_handler))
        .route("/site/:site_id/allowed-ips", get(allowed_ips_handler))
        .route("/site/:site_id/resync", post(resync_site_handler))
        .route("/site/:site_id/resource", put(create_resource_handler))
        .route("/resource/:resource_id/target", put(create_target_handler))
        .route("/resource/:resource_id/targets", get(list_targets_handler))
        .route("/resource/:resource_id/rule", put(create_resource_rule_handler))
        .route("/resource/:resource_id/rules", get(list_resource_rules_handler))
        .route("/target/:target_id", axum::routing::delete(delete_target_handler))
        .with_state(state);

    Router::new().nest("/api/v1", api)
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler() -> Response {
    ok(
        StatusCode::OK,
        "Healthy",
        serde_json::json!({ "version": fossorial_common::VERSION }),
    )
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateOrgRequest {
    org_id: String,
    name: String,
}

async fn create_org_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: std::result::Result<Json<CreateOrgRequest>, JsonRejection>,
) -> ApiResult {
    let caller = caller(&headers)?;
    let Json(req) = payload?;
    if req.org_id.is_empty()
        || !req
            .org_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(Error::validation("orgId must be non-empty and URL safe").into());
    }
    if req.name.is_empty() {
        return Err(Error::validation("name must not be empty").into());
    }

    let (org, admin) = state.registry.create_org(&req.org_id, &req.name)?;
    state.registry.upsert_user(&caller.user_id, &caller.email)?;
    state
        .registry
        .add_user_to_org(&caller.user_id, &org.org_id, admin.role_id)?;
    info!("Created org {} owned by {}", org.org_id, caller.user_id);

    Ok(ok(StatusCode::CREATED, "Organization created successfully", org))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateExitNodeRequest {
    name: String,
    address: String,
    endpoint: String,
    public_key: String,
    listen_port: u16,
    reachable_at: String,
}

async fn create_exit_node_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: std::result::Result<Json<CreateExitNodeRequest>, JsonRejection>,
) -> ApiResult {
    let caller = caller(&headers)?;
    state.access.check_operator(&caller)?;
    let Json(req) = payload?;
    fossorial_common::crypto::validate_wireguard_key(&req.public_key)?;
    reqwest::Url::parse(&req.reachable_at)
        .map_err(|e| Error::validation(format!("invalid reachableAt: {}", e)))?;

    let node = state.registry.create_exit_node(&NewExitNode {
        name: req.name,
        address: req.address,
        endpoint: req.endpoint,
        public_key: req.public_key,
        listen_port: req.listen_port,
        reachable_at: req.reachable_at,
    })?;
    info!(
        "Registered exit node {} ({}) for {}",
        node.exit_node_id, node.name, caller.user_id
    );

    Ok(ok(StatusCode::CREATED, "Exit node created successfully", node))
}

async fn create_site_handler(
    State(state): State<Arc<AppState>>,
    path: PathParam<String>,
    headers: HeaderMap,
    payload: std::result::Result<Json<CreateSiteRequest>, JsonRejection>,
) -> ApiResult {
    let caller = caller(&headers)?;
    let Path(org_id) = path?;
    let Json(req) = payload?;
    let access = state.access.check(&caller, &org_id, Action::CreateSite)?;
    let created = state.sites.create_site(&caller, access, &org_id, req).await?;
    Ok(ok(StatusCode::CREATED, "Site created successfully", created))
}

async fn list_sites_handler(
    State(state): State<Arc<AppState>>,
    path: PathParam<String>,
    page: PageParam,
    headers: HeaderMap,
) -> ApiResult {
    let caller = caller(&headers)?;
    let Path(org_id) = path?;
    let Query(page) = page?;
    state.access.check(&caller, &org_id, Action::ListSites)?;
    let sites = state.sites.list_sites(&org_id, page)?;
    Ok(ok(StatusCode::OK, "Sites retrieved successfully", sites))
}

async fn get_site_handler(
    State(state): State<Arc<AppState>>,
    path: PathParam<SiteId>,
    headers: HeaderMap,
) -> ApiResult {
    let caller = caller(&headers)?;
    let Path(site_id) = path?;
    let site = state.sites.get_site(site_id)?;
    state.access.check(&caller, &site.org_id, Action::GetSite)?;
    Ok(ok(StatusCode::OK, "Site retrieved successfully", site))
}

async fn delete_site_handler(
    State(state): State<Arc<AppState>>,
    path: PathParam<SiteId>,
    headers: HeaderMap,
) -> ApiResult {
    let caller = caller(&headers)?;
    let Path(site_id) = path?;
    let site = state.sites.get_site(site_id)?;
    state.access.check(&caller, &site.org_id, Action::DeleteSite)?;
    let deleted = state.sites.delete_site(site_id).await?;
    Ok(ok(StatusCode::OK, "Site deleted successfully", deleted))
}

async fn allowed_ips_handler(
    State(state): State<Arc<AppState>>,
    path: PathParam<SiteId>,
    headers: HeaderMap,
) -> ApiResult {
    let caller = caller(&headers)?;
    let Path(site_id) = path?;
    let site = state.sites.get_site(site_id)?;
    state.access.check(&caller, &site.org_id, Action::GetSite)?;
    let allowed_ips = state.sites.allowed_ips(site_id)?;
    Ok(ok(StatusCode::OK, "Allowed IPs retrieved successfully", allowed_ips))
}

async fn resync_site_handler(
    State(state): State<Arc<AppState>>,
    path: PathParam<SiteId>,
    headers: HeaderMap,
) -> ApiResult {
    let caller = caller(&headers)?;
    let Path(site_id) = path?;
    let site = state.sites.get_site(site_id)?;
    state.access.check(&caller, &site.org_id, Action::ResyncSite)?;
    let outcome = state.sites.resync_site(site_id).await?;
    Ok(ok(
        StatusCode::OK,
        "Site resynced",
        serde_json::json!({ "peerSync": outcome }),
    ))
}

async fn create_resource_handler(
    State(state): State<Arc<AppState>>,
    path: PathParam<SiteId>,
    headers: HeaderMap,
    payload: std::result::Result<Json<CreateResourceRequest>, JsonRejection>,
) -> ApiResult {
    let caller = caller(&headers)?;
    let Path(site_id) = path?;
    let Json(req) = payload?;
    let site = state.sites.get_site(site_id)?;
    state.access.check(&caller, &site.org_id, Action::CreateResource)?;
    let resource = state.sites.create_resource(site_id, req)?;
    Ok(ok(StatusCode::CREATED, "Resource created successfully", resource))
}

async fn create_target_handler(
    State(state): State<Arc<AppState>>,
    path: PathParam<ResourceId>,
    headers: HeaderMap,
    payload: std::result::Result<Json<CreateTargetRequest>, JsonRejection>,
) -> ApiResult {
    let caller = caller(&headers)?;
    let Path(resource_id) = path?;
    let Json(req) = payload?;
    let resource = state.sites.get_resource(resource_id)?;
    state.access.check(&caller, &resource.org_id, Action::CreateTarget)?;
    let created = state.sites.create_target(resource_id, req).await?;
    Ok(ok(StatusCode::CREATED, "Target created successfully", created))
}

async fn list_targets_handler(
    State(state): State<Arc<AppState>>,
    path: PathParam<ResourceId>,
    page: PageParam,
    headers: HeaderMap,
) -> ApiResult {
    let caller = caller(&headers)?;
    let Path(resource_id) = path?;
    let Query(page) = page?;
    let resource = state.sites.get_resource(resource_id)?;
    state.access.check(&caller, &resource.org_id, Action::ListTargets)?;
    let targets = state.sites.list_targets(resource_id, page)?;
    Ok(ok(StatusCode::OK, "Targets retrieved successfully", targets))
}

async fn create_resource_rule_handler(
    State(state): State<Arc<AppState>>,
    path: PathParam<ResourceId>,
    headers: HeaderMap,
    payload: std::result::Result<Json<CreateResourceRuleRequest>, JsonRejection>,
) -> ApiResult {
    let caller = caller(&headers)?;
    let Path(resource_id) = path?;
    let Json(req) = payload?;
    let resource = state.sites.get_resource(resource_id)?;
    state
        .access
        .check(&caller, &resource.org_id, Action::CreateResourceRule)?;
    let rule = state.sites.create_resource_rule(resource_id, req)?;
    Ok(ok(StatusCode::CREATED, "Resource rule created successfully", rule))
}

async fn list_resource_rules_handler(
    State(state): State<Arc<AppState>>,
    path: PathParam<ResourceId>,
    page: PageParam,
    headers: HeaderMap,
) -> ApiResult {
    let caller = caller(&headers)?;
    let Path(resource_id) = path?;
    let Query(page) = page?;
    let resource = state.sites.get_resource(resource_id)?;
    state
        .access
        .check(&caller, &resource.org_id, Action::ListResourceRules)?;
    let rules = state.sites.list_resource_rules(resource_id, page)?;
    Ok(ok(StatusCode::OK, "Resource rules retrieved successfully", rules))
}

async fn delete_target_handler(
    State(state): State<Arc<AppState>>,
    path: PathParam<TargetId>,
    headers: HeaderMap,
) -> ApiResult {
    let caller = caller(&headers)?;
    let Path(target_id) = path?;
    let target = state.sites.get_target(target_id)?;
    let resource = state.sites.get_resource(target.resource_id)?;
    state.access.check(&caller, &resource.org_id, Action::DeleteTarget)?;
    let deleted = state.sites.delete_target(target_id).await?;
    Ok(ok(StatusCode::OK, "Target deleted successfully", deleted))
}

async fn create_invite_handler(
    State(state): State<Arc<AppState>>,
    path: PathParam<String>,
    headers: HeaderMap,
    payload: std::result::Result<Json<InviteUserRequest>, JsonRejection>,
) -> ApiResult {
    let caller = caller(&headers)?;
    let Path(org_id) = path?;
    let Json(req) = payload?;
    let created = state.invites.invite_user(&caller, &org_id, req).await?;
    Ok(ok(StatusCode::OK, "User invited successfully", created))
}

async fn accept_invite_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: std::result::Result<Json<AcceptInviteRequest>, JsonRejection>,
) -> ApiResult {
    let caller = caller(&headers)?;
    let Json(req) = payload?;
    let accepted = state.invites.accept_invite(&caller, req).await?;
    Ok(ok(StatusCode::OK, "Invite accepted", accepted))
}
