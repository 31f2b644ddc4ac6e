//! Peer administration.

use axum::body::Bytes;
use axum::{
    extract::{OriginalUri, State},
    http::HeaderMap,
    Json,
};
use std::sync::Arc;

use mrs::types::{AddPeerRequest, ErrorCode, Peer};

use crate::handlers::{authenticate_user_request, parse_json, ApiError, AppState};

/// Add (or promote) a configured peer. Local accounts only.
pub async fn add_peer(
    State(state): State<Arc<AppState>>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Peer>, ApiError> {
    let ctx = authenticate_user_request(&state.auth, "POST", &uri, &headers, &body).await?;
    if !ctx.is_local {
        return Err(ApiError::forbidden(
            "peer administration requires a local account",
        ));
    }

    let request: AddPeerRequest = parse_json(&body)?;
    let server_url = request.server_url.trim_end_matches('/').to_string();

    let parsed = url::Url::parse(&server_url)
        .map_err(|e| ApiError::new(ErrorCode::TypeMismatch, format!("bad server_url: {}", e)))?;
    if parsed.scheme() != "https" && parsed.scheme() != "http" {
        return Err(ApiError::new(
            ErrorCode::TypeMismatch,
            "server_url must be http(s)",
        ));
    }
    if parsed.host_str().map(str::is_empty).unwrap_or(true) {
        return Err(ApiError::new(
            ErrorCode::TypeMismatch,
            "server_url must include a host",
        ));
    }
    if server_url == state.settings.server_url {
        return Err(ApiError::new(
            ErrorCode::TypeMismatch,
            "refusing to peer with ourselves",
        ));
    }

    state
        .peers
        .upsert(Peer {
            server_url: server_url.clone(),
            hint: request.hint,
            last_seen: None,
            is_configured: true,
            authoritative_regions: None,
            sync_cursor: None,
        })
        .await?;

    let peer = state
        .store
        .get_peer(&server_url)
        .await?
        .ok_or_else(|| ApiError::not_found("peer vanished during insert"))?;
    Ok(Json(peer))
}
