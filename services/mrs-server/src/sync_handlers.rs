//! Sync endpoints served to federation peers.
//!
//! Both endpoints require peer authentication: an HTTP signature from a
//! server identity (`_server@peer-domain`), or a local bearer token for
//! operators. They are never anonymous.

use axum::{
    extract::{OriginalUri, Query, State},
    http::{HeaderMap, Uri},
    Json,
};
use serde::Deserialize;
use std::sync::Arc;

use mrs::types::{SyncChangesResponse, SyncSnapshotResponse};

use crate::handlers::{request_target, ApiError, AppState};

const DEFAULT_SNAPSHOT_LIMIT: usize = 200;
const MAX_SNAPSHOT_LIMIT: usize = 1000;
const DEFAULT_CHANGES_LIMIT: usize = 500;
const MAX_CHANGES_LIMIT: usize = 5000;

#[derive(Debug, Deserialize)]
pub struct SnapshotQuery {
    pub cursor: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct ChangesQuery {
    pub since: String,
    pub limit: Option<usize>,
}

async fn require_peer(
    state: &AppState,
    uri: &Uri,
    headers: &HeaderMap,
) -> Result<(), ApiError> {
    let ctx = state
        .auth
        .authenticate("GET", &request_target(uri), headers, b"")
        .await?;

    let permitted = if ctx.via_signature {
        ctx.is_server_identity()
    } else {
        ctx.is_local
    };
    if !permitted {
        return Err(ApiError::forbidden("sync endpoints are peer-only"));
    }
    Ok(())
}

/// Paginated full snapshot, deterministically ordered by canonical
/// identity. Each page carries the change-log head so the puller knows
/// where its delta stream starts.
pub async fn snapshot(
    State(state): State<Arc<AppState>>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    Query(query): Query<SnapshotQuery>,
) -> Result<Json<SyncSnapshotResponse>, ApiError> {
    require_peer(&state, &uri, &headers).await?;

    let limit = query
        .limit
        .unwrap_or(DEFAULT_SNAPSHOT_LIMIT)
        .clamp(1, MAX_SNAPSHOT_LIMIT);
    let after = match &query.cursor {
        Some(raw) => Some(decode_snapshot_cursor(raw)?),
        None => None,
    };

    let (registrations, next, head) = state.store.snapshot_page(after, limit).await?;
    Ok(Json(SyncSnapshotResponse {
        status: "ok".to_string(),
        registrations,
        next_cursor: next.map(|key| encode_snapshot_cursor(&key)),
        as_of_cursor: head.to_string(),
    }))
}

/// Ordered event stream since an opaque cursor.
pub async fn changes(
    State(state): State<Arc<AppState>>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    Query(query): Query<ChangesQuery>,
) -> Result<Json<SyncChangesResponse>, ApiError> {
    require_peer(&state, &uri, &headers).await?;

    let since: i64 = query.since.parse().map_err(|_| {
        ApiError::new(
            mrs::types::ErrorCode::TypeMismatch,
            "since must be a cursor previously returned by this server",
        )
    })?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_CHANGES_LIMIT)
        .clamp(1, MAX_CHANGES_LIMIT);

    let (events, last_seq) = state.store.changes_since(since, limit).await?;
    Ok(Json(SyncChangesResponse {
        status: "ok".to_string(),
        events,
        next_cursor: last_seq.to_string(),
    }))
}

fn encode_snapshot_cursor(key: &(String, String)) -> String {
    serde_json::to_string(key).unwrap_or_default()
}

fn decode_snapshot_cursor(raw: &str) -> Result<(String, String), ApiError> {
    serde_json::from_str(raw).map_err(|_| {
        ApiError::new(
            mrs::types::ErrorCode::TypeMismatch,
            "cursor must be a cursor previously returned by this server",
        )
    })
}
