//! Account endpoints: registration, login, introspection.

use axum::body::Bytes;
use axum::{
    extract::{OriginalUri, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use std::sync::Arc;

use mrs::types::{
    ErrorCode, Registration, TokenResponse, UserInfo, UserLoginRequest, UserRegisterRequest,
};
use mrs::validation::{self, SERVER_IDENTITY_USER};

use crate::auth::{bearer, keys};
use crate::handlers::{authenticate_user_request, parse_json, ApiError, AppState};
use crate::store::StoreError;

const MIN_PASSWORD_LEN: usize = 8;
const MAX_PASSWORD_LEN: usize = 128;

/// Create a local account. Returns a bearer token; the identity becomes
/// `username@server_domain` and gets an Ed25519 keypair published under
/// `/.well-known/mrs/keys/{username}`.
pub async fn register_user(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<(StatusCode, Json<TokenResponse>), ApiError> {
    let request: UserRegisterRequest = parse_json(&body)?;

    if !state.auth_limiter.check(&request.username) {
        return Err(ApiError::rate_limited());
    }

    validation::validate_username(&request.username)
        .map_err(|e| ApiError::new(ErrorCode::TypeMismatch, e.to_string()))?;
    if request.username == SERVER_IDENTITY_USER {
        return Err(ApiError::forbidden("that username is reserved"));
    }
    if request.password.len() < MIN_PASSWORD_LEN || request.password.len() > MAX_PASSWORD_LEN {
        return Err(ApiError::new(
            ErrorCode::TypeMismatch,
            format!(
                "password must be {}-{} characters",
                MIN_PASSWORD_LEN, MAX_PASSWORD_LEN
            ),
        ));
    }

    let identity = format!("{}@{}", request.username, state.settings.server_domain);
    let hash = bearer::hash_password(&request.password)?;
    match state.store.create_local_user(&identity, &hash).await {
        Ok(()) => {}
        Err(StoreError::Conflict(_)) => {
            return Err(ApiError::new(
                ErrorCode::Conflict,
                format!("user {} already exists", identity),
            ))
        }
        Err(e) => return Err(e.into()),
    }

    keys::provision_user_key(&state.store, &identity).await?;

    let token = bearer::create_token(
        &state.store,
        &identity,
        state.settings.token_expiry_hours,
    )
    .await?;
    Ok((StatusCode::CREATED, Json(token)))
}

/// Exchange credentials for a bearer token.
pub async fn login_user(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<TokenResponse>, ApiError> {
    let request: UserLoginRequest = parse_json(&body)?;

    if !state.auth_limiter.check(&request.username) {
        return Err(ApiError::rate_limited());
    }

    let identity = bearer::authenticate_user(
        &state.store,
        &request.username,
        &request.password,
        &state.settings.server_domain,
    )
    .await?;

    let token = bearer::create_token(
        &state.store,
        &identity,
        state.settings.token_expiry_hours,
    )
    .await?;
    Ok(Json(token))
}

/// The authenticated caller's identity record.
pub async fn me(
    State(state): State<Arc<AppState>>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
) -> Result<Json<UserInfo>, ApiError> {
    let ctx = authenticate_user_request(&state.auth, "GET", &uri, &headers, b"").await?;
    let user = state
        .store
        .get_user(&ctx.identity)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("user {}", ctx.identity)))?;
    Ok(Json(user.info()))
}

#[derive(serde::Serialize)]
pub struct OwnedRegistrations {
    registrations: Vec<Registration>,
}

/// Registrations owned by the caller.
pub async fn my_registrations(
    State(state): State<Arc<AppState>>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
) -> Result<Json<OwnedRegistrations>, ApiError> {
    let ctx = authenticate_user_request(&state.auth, "GET", &uri, &headers, b"").await?;
    let registrations = state.registry.registrations_by_owner(&ctx.identity).await?;
    Ok(Json(OwnedRegistrations { registrations }))
}
