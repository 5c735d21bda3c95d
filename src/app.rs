//! Application wiring: state, handlers, and router construction.
//!
//! Kept separate from `main.rs` so integration tests can build the same
//! `Router` the binary serves, via `build_state` + `create_router`,
//! without spawning a process.

use axum::{
    extract::{DefaultBodyLimit, Path, Request, State},
    http::{HeaderMap, HeaderValue},
    middleware::{self, Next},
    response::{Html, IntoResponse, Json},
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::auth_gate::{self, Identity};
use crate::config::Config;
use crate::coordinator::{Coordinator, SharedCoordinator};
use crate::error::{AppError, AppResult};
use crate::identity::IdentityStore;
use crate::types::{ComputeResponse, Modulation, RequestSpec};
use validator::Validate;

/// Application state shared across all request handlers. Cloned cheaply —
/// every field is an `Arc` or a plain value copied from configuration.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub coordinator: SharedCoordinator,
    pub identity_store: Arc<IdentityStore>,
    pub cancel_tokens: Arc<dashmap::DashMap<String, CancellationToken>>,
}

pub fn build_state(config: Config) -> AppState {
    let identity_store = Arc::new(IdentityStore::new(config.session.clone()));
    let coordinator = Arc::new(Coordinator::new(config.clone()));
    let cancel_tokens = Arc::new(dashmap::DashMap::new());
    spawn_usage_sweeper(coordinator.clone());
    AppState { config, coordinator, identity_store, cancel_tokens }
}

/// Periodically prunes expired usage events across every identity. Runs for
/// the lifetime of the process; there is no shutdown signal for it because
/// it holds no resource that needs releasing.
fn spawn_usage_sweeper(coordinator: SharedCoordinator) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(3600));
        loop {
            interval.tick().await;
            coordinator.usage().sweep_expired();
        }
    });
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    breaker_state: &'static str,
    timestamp: String,
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        breaker_state: state.coordinator.breaker_state(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

async fn api_docs() -> Json<Value> {
    Json(json!({
        "name": "epc-service",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": [
            {"method": "GET", "path": "/health"},
            {"method": "POST", "path": "/api/v1/compute/standard"},
            {"method": "POST", "path": "/api/v1/compute/custom"},
            {"method": "POST", "path": "/api/v1/session/cancel"},
            {"method": "POST", "path": "/api/v1/auth/session"},
            {"method": "GET", "path": "/api/v1/auth/session/status"},
            {"method": "GET", "path": "/api/v1/admin/keys"},
            {"method": "POST", "path": "/api/v1/admin/keys"},
            {"method": "DELETE", "path": "/api/v1/admin/keys/{id}"},
        ],
    }))
}

/// Landing page. Embeds a one-shot CSRF token in a `<meta>` tag so a
/// browser client can bootstrap a session without a separate round trip.
async fn index(State(state): State<AppState>) -> Html<String> {
    let csrf_token = state.identity_store.issue_csrf_token();
    Html(format!(
        "<!doctype html><html><head><meta name=\"csrf-token\" content=\"{csrf_token}\"></head>\
         <body><h1>epc-service</h1><p>See <a href=\"/api/v1\">/api/v1</a> for the endpoint list.</p></body></html>"
    ))
}

#[derive(Debug, Deserialize)]
struct CreateSessionRequest {
    csrf_token: String,
}

async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<impl IntoResponse, AppError> {
    let session = state
        .identity_store
        .create_session(&request.csrf_token)
        .ok_or_else(|| AppError::InvalidParameter("invalid or expired csrf token".to_string()))?;

    let cookie = format!("epc_session={}; HttpOnly; SameSite=Lax; Path=/", session.token);
    let mut headers = HeaderMap::new();
    headers.insert(
        axum::http::header::SET_COOKIE,
        HeaderValue::from_str(&cookie).map_err(|e| AppError::Internal(e.into()))?,
    );
    Ok((headers, Json(json!({"status": "ok"}))))
}

async fn session_status(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Json<Value>> {
    let identity = auth_gate::authenticate_identified(&headers, &state.identity_store).await?;
    let owner = match identity {
        Identity::ApiKey { owner, .. } => owner,
        Identity::Session { .. } => "session".to_string(),
        Identity::Anonymous => "anonymous".to_string(),
    };
    Ok(Json(json!({"status": "active", "owner": owner})))
}

const SESSION_ID_HEADER: &str = "x-session-id";

fn identity_key_id(identity: &Identity) -> String {
    match identity {
        Identity::ApiKey { id, .. } => id.clone(),
        Identity::Session { token } => format!("session:{token}"),
        Identity::Anonymous => "anonymous".to_string(),
    }
}

/// The identity to bill usage against: the presenting API key, or nothing
/// at all for session-authenticated browser use.
fn billing_key_id(identity: &Identity) -> String {
    match identity {
        Identity::ApiKey { id, .. } => id.clone(),
        Identity::Session { .. } | Identity::Anonymous => String::new(),
    }
}

/// The key under which an in-flight sweep's cancellation token is scoped.
/// A client-provided `X-Session-Id` lets one identity run several
/// independently-cancellable concurrent sweeps; absent that header,
/// cancellation falls back to scoping by identity alone.
fn cancel_scope_key(headers: &HeaderMap, identity: &Identity) -> String {
    let base = identity_key_id(identity);
    match headers
        .get(SESSION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
    {
        Some(session_id) => format!("{base}:{session_id}"),
        None => base,
    }
}

async fn compute_standard(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(spec): Json<RequestSpec>,
) -> AppResult<Json<ComputeResponse>> {
    spec.validate().map_err(|e| AppError::InvalidParameter(e.to_string()))?;
    let identity = auth_gate::authenticate_identified(&headers, &state.identity_store).await?;
    let scope_key = cancel_scope_key(&headers, &identity);
    let cancel = state
        .cancel_tokens
        .entry(scope_key)
        .or_insert_with(CancellationToken::new)
        .clone();

    let response = state
        .coordinator
        .execute(&spec, &billing_key_id(&identity), "/api/v1/compute/standard", cancel)
        .await?;
    Ok(Json(response))
}

async fn compute_custom(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(spec): Json<RequestSpec>,
) -> AppResult<Json<ComputeResponse>> {
    spec.validate().map_err(|e| AppError::InvalidParameter(e.to_string()))?;
    if !matches!(spec.modulation, Modulation::Custom { .. }) {
        return Err(AppError::InvalidParameter(
            "/api/v1/compute/custom requires a custom constellation modulation".to_string(),
        ));
    }
    let identity = auth_gate::authenticate_identified(&headers, &state.identity_store).await?;
    let scope_key = cancel_scope_key(&headers, &identity);
    let cancel = state
        .cancel_tokens
        .entry(scope_key)
        .or_insert_with(CancellationToken::new)
        .clone();

    let response = state
        .coordinator
        .execute(&spec, &billing_key_id(&identity), "/api/v1/compute/custom", cancel)
        .await?;
    Ok(Json(response))
}

async fn cancel_session(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Json<Value>> {
    let identity = auth_gate::authenticate_identified(&headers, &state.identity_store).await?;
    let scope_key = cancel_scope_key(&headers, &identity);
    if let Some(token) = state.cancel_tokens.get(&scope_key) {
        token.cancel();
    }
    state.cancel_tokens.remove(&scope_key);
    Ok(Json(json!({"status": "cancelled"})))
}

#[derive(Debug, Deserialize)]
struct CreateKeyRequest {
    owner: String,
    #[serde(default)]
    is_admin: bool,
}

async fn list_keys(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Json<Value>> {
    auth_gate::authenticate_admin(
        &headers,
        &state.identity_store,
        &state.config.admin.username,
        &state.config.admin.password,
    )
    .await?;
    let keys: Vec<_> = state
        .identity_store
        .list_keys()
        .into_iter()
        .map(|k| json!({"id": k.id, "owner": k.owner, "isAdmin": k.is_admin}))
        .collect();
    Ok(Json(json!({"keys": keys})))
}

async fn create_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateKeyRequest>,
) -> AppResult<Json<Value>> {
    auth_gate::authenticate_admin(
        &headers,
        &state.identity_store,
        &state.config.admin.username,
        &state.config.admin.password,
    )
    .await?;
    let (id, raw_key) = state
        .identity_store
        .create_key(&request.owner, request.is_admin)
        .map_err(|_| AppError::Internal(anyhow::anyhow!("key creation failed")))?;
    Ok(Json(json!({"id": id, "key": raw_key})))
}

async fn revoke_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> AppResult<Json<Value>> {
    auth_gate::authenticate_admin(
        &headers,
        &state.identity_store,
        &state.config.admin.username,
        &state.config.admin.password,
    )
    .await?;
    state
        .identity_store
        .revoke_key(&id)
        .map_err(|_| AppError::InvalidParameter("unknown key id".to_string()))?;
    Ok(Json(json!({"status": "revoked"})))
}

/// `TimeoutLayer` is the only middleware in this stack that can produce an
/// error, so any error reaching here is a whole-request timeout.
async fn handle_timeout_error(_err: tower::BoxError) -> AppError {
    AppError::OverCapacity { retry_after_seconds: 5, circuit_state: "timeout" }
}

/// Tags each request with its admission classification (public / admin /
/// identified) at debug level, ahead of the handler's own auth check.
async fn log_admission_class(request: Request, next: Next) -> axum::response::Response {
    let path = request.uri().path();
    let class = if auth_gate::is_public(path) {
        "public"
    } else if auth_gate::is_admin_path(path) {
        "admin"
    } else {
        "identified"
    };
    tracing::debug!(path, class, "admission classification");
    next.run(request).await
}

pub fn create_router(state: AppState) -> Router {
    let cors = if state.config.allowed_origins.is_empty() {
        CorsLayer::permissive()
    } else {
        let origins: Vec<HeaderValue> = state
            .config
            .allowed_origins
            .iter()
            .filter_map(|o| HeaderValue::from_str(o).ok())
            .collect();
        CorsLayer::new().allow_origin(origins)
    };

    let json_limit = state.config.json_limit;
    let request_timeout = Duration::from_secs(state.config.request_timeout_secs);

    Router::new()
        .route("/", get(index))
        .route("/api/v1", get(api_docs))
        .route("/health", get(health_check))
        .route("/api/v1/auth/session", post(create_session))
        .route("/api/v1/auth/session/status", get(session_status))
        .route("/api/v1/compute/standard", post(compute_standard))
        .route("/api/v1/compute/custom", post(compute_custom))
        .route("/api/v1/session/cancel", post(cancel_session))
        .route("/api/v1/admin/keys", get(list_keys).post(create_key))
        .route("/api/v1/admin/keys/{id}", delete(revoke_key))
        .layer(
            ServiceBuilder::new()
                .layer(axum::error_handling::HandleErrorLayer::new(handle_timeout_error))
                .layer(TimeoutLayer::new(request_timeout))
                .layer(TraceLayer::new_for_http())
                .layer(middleware::from_fn(log_admission_class))
                .layer(cors)
                .layer(DefaultBodyLimit::max(json_limit)),
        )
        .with_state(state)
}
