//! Registry REST API handlers.
//!
//! The boundary adapter: raw bodies are authenticated before they are
//! parsed (HTTP signatures cover the exact bytes), malformed input maps
//! to the stable error taxonomy, and store failures surface as opaque
//! `internal` errors with a server-side correlation id.

use axum::{
    extract::{OriginalUri, State},
    http::{HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
    Json,
};
use axum::body::Bytes;
use std::sync::Arc;

use mrs::types::{
    ErrorCode, ErrorResponse, RegistrationRequest, RegistrationResponse, ReleaseRequest,
    ReleaseResponse, SearchRequest, SearchResponse,
};

use crate::auth::{AuthContext, AuthError, Authenticator};
use crate::config::Settings;
use crate::federation::{referrals, FederationMetrics};
use crate::ids;
use crate::peer_store::Peers;
use crate::rate_limit::RateLimiter;
use crate::registry::{RegistryError, RegistryService};
use crate::store::{SqliteStore, StoreError};

pub struct AppState {
    pub settings: Settings,
    pub store: Arc<SqliteStore>,
    pub registry: RegistryService,
    pub auth: Authenticator,
    pub peers: Arc<Peers>,
    pub metrics: Arc<FederationMetrics>,
    pub auth_limiter: RateLimiter,
}

// ==================== Error Handling ====================

pub struct ApiError(pub StatusCode, pub Json<ErrorResponse>);

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        ApiError(status_for(code), Json(ErrorResponse::new(code, message)))
    }

    pub fn with_detail(code: ErrorCode, message: impl Into<String>, detail: serde_json::Value) -> Self {
        ApiError(
            status_for(code),
            Json(ErrorResponse::new(code, message).with_detail(detail)),
        )
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Forbidden, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    pub fn rate_limited() -> Self {
        Self::new(ErrorCode::RateLimited, "too many attempts, slow down")
    }

    fn internal(source: impl std::fmt::Display) -> Self {
        let correlation = ids::correlation_id();
        tracing::error!("internal error [{}]: {}", correlation, source);
        Self::new(
            ErrorCode::Internal,
            format!("internal error (ref {})", correlation),
        )
    }
}

pub fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::InvalidGeometry
        | ErrorCode::InvalidUri
        | ErrorCode::MissingField
        | ErrorCode::TypeMismatch => StatusCode::BAD_REQUEST,
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Forbidden | ErrorCode::NotAuthoritative => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Conflict => StatusCode::CONFLICT,
        ErrorCode::CursorExpired => StatusCode::GONE,
        ErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        ErrorCode::PeerUnreachable | ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::Store(inner) => ApiError::internal(inner),
            other => match other.detail() {
                Some(detail) => ApiError::with_detail(other.code(), other.to_string(), detail),
                None => ApiError::new(other.code(), other.to_string()),
            },
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::Store(inner) => ApiError::internal(inner),
            other => ApiError::new(other.code(), other.to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::CursorExpired => ApiError::new(
                ErrorCode::CursorExpired,
                "cursor predates the retention window; take a fresh snapshot",
            ),
            other => ApiError::internal(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, self.1).into_response()
    }
}

/// Decode a JSON request body against the error taxonomy.
pub fn parse_json<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| {
        let message = e.to_string();
        let code = if message.contains("missing field") {
            ErrorCode::MissingField
        } else {
            ErrorCode::TypeMismatch
        };
        ApiError::new(code, message)
    })
}

/// The exact request target (path plus query) covered by signatures.
pub fn request_target(uri: &Uri) -> String {
    uri.path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string())
}

/// Authenticate a user request. Peer server identities cannot own or
/// mutate registrations.
pub async fn authenticate_user_request(
    auth: &Authenticator,
    method: &str,
    uri: &Uri,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<AuthContext, ApiError> {
    let ctx = auth
        .authenticate(method, &request_target(uri), headers, body)
        .await?;
    if ctx.is_server_identity() {
        return Err(ApiError::forbidden(
            "server identities cannot perform this operation",
        ));
    }
    Ok(ctx)
}

// ==================== Info & Health ====================

pub async fn root(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "name": "mrs-server",
        "version": env!("CARGO_PKG_VERSION"),
        "server": state.settings.server_url,
    }))
}

pub async fn health() -> StatusCode {
    StatusCode::OK
}

// ==================== Registry Handlers ====================

/// Register a space (or update one the caller owns).
pub async fn register(
    State(state): State<Arc<AppState>>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<RegistrationResponse>), ApiError> {
    let ctx = authenticate_user_request(&state.auth, "POST", &uri, &headers, &body).await?;
    let request: RegistrationRequest = parse_json(&body)?;

    let registration = state.registry.register(request, &ctx.identity).await?;
    Ok((
        StatusCode::CREATED,
        Json(RegistrationResponse::new(registration)),
    ))
}

/// Release (delete) a registration the caller owns.
pub async fn release(
    State(state): State<Arc<AppState>>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ReleaseResponse>, ApiError> {
    let ctx = authenticate_user_request(&state.auth, "POST", &uri, &headers, &body).await?;
    let request: ReleaseRequest = parse_json(&body)?;

    state.registry.release(&request.id, &ctx.identity).await?;
    Ok(Json(ReleaseResponse::new(request.id)))
}

/// Search for registrations around a location. Public.
pub async fn search(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<SearchResponse>, ApiError> {
    let request: SearchRequest = parse_json(&body)?;

    let results = state
        .registry
        .search(&request.location, request.range)
        .await?;

    let peers = state.peers.snapshot().await;
    let referrals = referrals::generate_referrals(
        &peers,
        &state.settings.server_url,
        &request.location,
        request.range,
    );

    Ok(Json(SearchResponse::new(results, referrals)))
}
