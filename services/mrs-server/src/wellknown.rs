//! Well-known discovery surface.

use axum::{
    extract::{Path, State},
    Json,
};
use std::sync::Arc;

use mrs::types::{KeyResponse, PeerInfo, ServerCapabilities, WellKnownMrs};
use mrs::validation::SERVER_IDENTITY_USER;

use crate::handlers::{ApiError, AppState};

pub const MRS_VERSION: &str = "0.5.0";

/// Server metadata for discovery and federation. The `server` field
/// mirrors the configured public URL so a misrouted reverse proxy is
/// immediately visible to callers.
pub async fn server_info(State(state): State<Arc<AppState>>) -> Json<WellKnownMrs> {
    let peers = state.peers.snapshot().await;
    let known_peers = peers
        .iter()
        .map(|p| PeerInfo {
            server: p.server_url.clone(),
            hint: p.hint.clone(),
        })
        .collect();

    Json(WellKnownMrs {
        mrs_version: MRS_VERSION.to_string(),
        server: state.settings.server_url.clone(),
        operator: state.settings.admin_email.clone(),
        authoritative_regions: state.settings.authoritative_regions.clone(),
        known_peers,
        capabilities: ServerCapabilities {
            geometry_types: vec!["sphere".to_string(), "polygon".to_string()],
            max_radius: state.settings.max_radius,
        },
    })
}

/// Published keys for an identity managed by this server.
///
/// Accepts a bare username (resolved against this server's domain), a
/// full `user@domain` identity, or the reserved `_server`.
pub async fn identity_key(
    State(state): State<Arc<AppState>>,
    Path(identity): Path<String>,
) -> Result<Json<KeyResponse>, ApiError> {
    let domain = &state.settings.server_domain;

    let (owner, full_identity) = if identity == SERVER_IDENTITY_USER {
        (
            SERVER_IDENTITY_USER.to_string(),
            format!("{}@{}", SERVER_IDENTITY_USER, domain),
        )
    } else if let Some((user, claimed_domain)) = identity.split_once('@') {
        if claimed_domain != domain {
            return Err(ApiError::not_found(format!(
                "identity {} is not managed by this server",
                identity
            )));
        }
        (format!("{}@{}", user, domain), identity.clone())
    } else {
        let full = format!("{}@{}", identity, domain);
        (full.clone(), full)
    };

    let keys = state.store.list_keys(&owner).await?;
    if keys.is_empty() {
        return Err(ApiError::not_found(format!("no keys for {}", identity)));
    }

    Ok(Json(KeyResponse {
        id: full_identity,
        keys: keys.iter().map(|k| k.published()).collect(),
    }))
}
