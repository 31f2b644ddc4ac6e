//! Snapshot and delta sync against federation peers.
//!
//! Pull-based: each configured peer is polled on an interval, one pull
//! at a time per peer. A peer with no cursor gets a full snapshot, then
//! switches to the delta stream. Ingest applies events in strict
//! version order per canonical record, refuses events claiming this
//! server's own origin, and counts payload conflicts.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::time::interval;
use tracing::{debug, info, warn};

use mrs::types::{
    ChangeEvent, ChangeKind, ErrorCode, ErrorResponse, Peer, Registration, SyncChangesResponse,
    SyncSnapshotResponse,
};

use crate::auth::signature;
use crate::peer_store::Peers;
use crate::store::{SqliteStore, StoreError};

use super::FederationMetrics;

const SNAPSHOT_PAGE_SIZE: usize = 200;
const CHANGES_PAGE_SIZE: usize = 500;
const PULL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Peer error ({1:?}): {0}")]
    Peer(String, ErrorCode),

    #[error("Cursor expired on peer")]
    CursorExpired,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Applies snapshot pages and delta events to the local store.
pub struct SyncIngest {
    store: Arc<SqliteStore>,
    server_url: String,
    metrics: Arc<FederationMetrics>,
}

impl SyncIngest {
    pub fn new(
        store: Arc<SqliteStore>,
        server_url: String,
        metrics: Arc<FederationMetrics>,
    ) -> Self {
        Self {
            store,
            server_url,
            metrics,
        }
    }

    /// Store one snapshot page as replicas. Locally-originated records
    /// and anything a tombstone shadows are left untouched.
    pub async fn apply_snapshot_page(
        &self,
        peer_url: &str,
        registrations: Vec<Registration>,
    ) -> Result<(), StoreError> {
        for registration in registrations {
            if registration.origin_server == self.server_url {
                continue;
            }
            if self.is_shadowed(&registration).await? {
                continue;
            }
            let existing = self
                .store
                .get_by_canonical(&registration.origin_server, &registration.origin_id)
                .await?;
            if let Some(local) = &existing {
                if registration.version <= local.version {
                    continue;
                }
            }
            let kind = if existing.is_some() {
                ChangeKind::Updated
            } else {
                ChangeKind::Created
            };
            self.store
                .put_registration(as_replica(registration, peer_url), kind)
                .await?;
        }
        Ok(())
    }

    /// Apply one delta event.
    pub async fn apply_event(&self, peer_url: &str, event: ChangeEvent) -> Result<(), StoreError> {
        match event.kind {
            ChangeKind::Created | ChangeKind::Updated => {
                let Some(registration) = event.record else {
                    warn!("Dropping {:?} event without a record from {}", event.kind, peer_url);
                    return Ok(());
                };
                self.apply_record(peer_url, event.kind, registration).await
            }
            ChangeKind::Deleted => {
                let Some(tombstone) = event.tombstone else {
                    warn!("Dropping deleted event without a tombstone from {}", peer_url);
                    return Ok(());
                };
                if tombstone.origin_server == self.server_url {
                    let total = self.metrics.record_sovereignty_violation();
                    warn!(
                        "sovereignty_violation: {} sent a tombstone for our record {} (total {})",
                        peer_url, tombstone.origin_id, total
                    );
                    return Ok(());
                }
                self.store.apply_tombstone(tombstone).await
            }
        }
    }

    async fn apply_record(
        &self,
        peer_url: &str,
        kind: ChangeKind,
        registration: Registration,
    ) -> Result<(), StoreError> {
        let local = self
            .store
            .get_by_canonical(&registration.origin_server, &registration.origin_id)
            .await?;

        if let Some(local) = &local {
            if registration.version < local.version {
                return Ok(());
            }
            if registration.version == local.version {
                if !same_payload(local, &registration) {
                    let total = self.metrics.record_conflict();
                    warn!(
                        "conflict_detected: {} sent a divergent copy of {}/{} v{} (total {})",
                        peer_url,
                        registration.origin_server,
                        registration.origin_id,
                        registration.version,
                        total
                    );
                }
                return Ok(());
            }
        }

        // A peer pushing a newer version of one of our own records is
        // claiming to own it.
        if registration.origin_server == self.server_url {
            let total = self.metrics.record_sovereignty_violation();
            warn!(
                "sovereignty_violation: {} sent v{} of our record {} (total {})",
                peer_url, registration.version, registration.origin_id, total
            );
            return Ok(());
        }

        if self.is_shadowed(&registration).await? {
            return Ok(());
        }

        self.store
            .put_registration(as_replica(registration, peer_url), kind)
            .await
    }

    async fn is_shadowed(&self, registration: &Registration) -> Result<bool, StoreError> {
        Ok(self
            .store
            .get_tombstone(&registration.origin_server, &registration.origin_id)
            .await?
            .map(|t| t.version >= registration.version)
            .unwrap_or(false))
    }
}

fn as_replica(mut registration: Registration, peer_url: &str) -> Registration {
    registration.replicated_from = Some(peer_url.to_string());
    registration.last_synced_at = Some(Utc::now());
    registration
}

/// True when two copies of the same canonical version carry the same
/// payload. Replica bookkeeping fields are excluded.
fn same_payload(a: &Registration, b: &Registration) -> bool {
    a.space == b.space
        && a.service_point == b.service_point
        && a.foad == b.foad
        && a.owner == b.owner
}

/// Pulls snapshots and deltas from peers over HTTP, authenticating as
/// this server's identity.
pub struct SyncPuller {
    ingest: SyncIngest,
    peers: Arc<Peers>,
    http: reqwest::Client,
    signing_key: ed25519_dalek::SigningKey,
    identity: String,
    keyid: String,
}

impl SyncPuller {
    pub fn new(
        ingest: SyncIngest,
        peers: Arc<Peers>,
        http: reqwest::Client,
        signing_key: ed25519_dalek::SigningKey,
        server_url: &str,
        server_domain: &str,
    ) -> Self {
        Self {
            ingest,
            peers,
            http,
            signing_key,
            identity: format!("_server@{}", server_domain),
            keyid: format!("{}/.well-known/mrs/keys/_server", server_url),
        }
    }

    /// One sync round against one peer.
    pub async fn pull_peer(&self, peer: &Peer) -> Result<(), SyncError> {
        match &peer.sync_cursor {
            None => self.pull_snapshot(peer).await,
            Some(cursor) => match self.pull_changes(peer, cursor).await {
                Err(SyncError::CursorExpired) => {
                    // Fell off the retention window: restart from a
                    // fresh snapshot next round.
                    info!(
                        "Cursor expired on {}; scheduling fresh snapshot",
                        peer.server_url
                    );
                    self.peers.set_cursor(&peer.server_url, None).await?;
                    Ok(())
                }
                other => other,
            },
        }
    }

    async fn pull_snapshot(&self, peer: &Peer) -> Result<(), SyncError> {
        info!("Starting snapshot sync from {}", peer.server_url);
        let mut cursor: Option<String> = None;
        let mut delta_start: Option<String> = None;
        let mut total = 0usize;

        loop {
            let mut url = format!(
                "{}/sync/snapshot?limit={}",
                peer.server_url.trim_end_matches('/'),
                SNAPSHOT_PAGE_SIZE
            );
            if let Some(c) = &cursor {
                url.push_str(&format!("&cursor={}", urlencode(c)));
            }
            let page: SyncSnapshotResponse = self.get_json(&url).await?;

            // The first page's change-log head becomes the delta start;
            // overlap replays are idempotent.
            if delta_start.is_none() {
                delta_start = Some(page.as_of_cursor.clone());
            }
            total += page.registrations.len();
            self.ingest
                .apply_snapshot_page(&peer.server_url, page.registrations)
                .await?;

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        info!(
            "Snapshot sync from {} stored {} records",
            peer.server_url, total
        );
        self.peers
            .set_cursor(&peer.server_url, delta_start)
            .await?;
        Ok(())
    }

    async fn pull_changes(&self, peer: &Peer, cursor: &str) -> Result<(), SyncError> {
        let url = format!(
            "{}/sync/changes?since={}&limit={}",
            peer.server_url.trim_end_matches('/'),
            urlencode(cursor),
            CHANGES_PAGE_SIZE
        );
        let response: SyncChangesResponse = self.get_json(&url).await?;

        let count = response.events.len();
        for event in response.events {
            self.ingest.apply_event(&peer.server_url, event).await?;
        }
        if count > 0 {
            debug!("Applied {} events from {}", count, peer.server_url);
        }
        self.peers
            .set_cursor(&peer.server_url, Some(response.next_cursor))
            .await?;
        Ok(())
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, SyncError> {
        let parsed = url::Url::parse(url).map_err(|e| {
            SyncError::Peer(format!("bad peer URL {}: {}", url, e), ErrorCode::Internal)
        })?;
        let path = match parsed.query() {
            Some(q) => format!("{}?{}", parsed.path(), q),
            None => parsed.path().to_string(),
        };

        let mut request = self.http.get(url).timeout(PULL_TIMEOUT);
        for (name, value) in signature::sign_request(
            &self.signing_key,
            &self.identity,
            &self.keyid,
            "GET",
            &path,
            None,
        ) {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let err: ErrorResponse = response.json().await.unwrap_or_else(|_| {
                ErrorResponse::new(ErrorCode::Internal, format!("peer returned {}", status))
            });
            if err.error == ErrorCode::CursorExpired {
                return Err(SyncError::CursorExpired);
            }
            return Err(SyncError::Peer(err.message, err.error));
        }
        Ok(response.json().await?)
    }
}

fn urlencode(raw: &str) -> String {
    url::form_urlencoded::byte_serialize(raw.as_bytes()).collect()
}

/// Poll every configured peer forever. Per-peer failures are logged and
/// do not stall the loop.
pub async fn run_sync_loop(puller: Arc<SyncPuller>, peers: Arc<Peers>, period: Duration) {
    tracing::info!("Starting peer sync loop (interval: {:?})", period);
    let mut ticker = interval(period);

    loop {
        ticker.tick().await;
        let snapshot = peers.snapshot().await;
        for peer in snapshot.iter().filter(|p| p.is_configured) {
            if let Err(e) = puller.pull_peer(peer).await {
                warn!("Sync pull from {} failed: {}", peer.server_url, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mrs::types::{Geometry, Location, Tombstone};

    fn ingest() -> (Arc<SqliteStore>, Arc<FederationMetrics>, SyncIngest) {
        let store = Arc::new(SqliteStore::open_memory().unwrap());
        let metrics = Arc::new(FederationMetrics::default());
        let ingest = SyncIngest::new(
            Arc::clone(&store),
            "https://b.example".to_string(),
            Arc::clone(&metrics),
        );
        (store, metrics, ingest)
    }

    fn record(id: &str, origin: &str, version: u64) -> Registration {
        let now = Utc::now();
        Registration {
            id: id.to_string(),
            space: Geometry::Sphere {
                center: Location::new(0.0, 0.0, 0.0),
                radius: 50.0,
            },
            service_point: Some("https://ex.example/soh".to_string()),
            foad: false,
            owner: "alice@a.example".to_string(),
            origin_server: origin.to_string(),
            origin_id: id.to_string(),
            version,
            created: now,
            updated: now,
            replicated_from: None,
            last_synced_at: None,
        }
    }

    fn created_event(reg: Registration, cursor: &str) -> ChangeEvent {
        ChangeEvent {
            kind: ChangeKind::Created,
            record: Some(reg),
            tombstone: None,
            cursor: cursor.to_string(),
        }
    }

    #[tokio::test]
    async fn test_snapshot_page_stores_replicas() {
        let (store, _metrics, ingest) = ingest();
        ingest
            .apply_snapshot_page(
                "https://a.example",
                vec![record("reg_snap00000001", "https://a.example", 2)],
            )
            .await
            .unwrap();

        let replica = store
            .get_by_canonical("https://a.example", "reg_snap00000001")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(replica.version, 2);
        assert_eq!(replica.replicated_from.as_deref(), Some("https://a.example"));
        assert!(replica.last_synced_at.is_some());
    }

    #[tokio::test]
    async fn test_snapshot_never_overwrites_local_origin() {
        let (store, _metrics, ingest) = ingest();
        let ours = record("reg_ours00000001", "https://b.example", 1);
        store
            .put_registration(ours.clone(), ChangeKind::Created)
            .await
            .unwrap();

        let mut foreign_copy = record("reg_ours00000001", "https://b.example", 9);
        foreign_copy.owner = "mallory@a.example".to_string();
        ingest
            .apply_snapshot_page("https://a.example", vec![foreign_copy])
            .await
            .unwrap();

        let kept = store
            .get_registration("reg_ours00000001")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(kept.version, 1);
        assert_eq!(kept.owner, "alice@a.example");
    }

    #[tokio::test]
    async fn test_events_apply_in_version_order() {
        let (store, _metrics, ingest) = ingest();
        let peer = "https://a.example";

        ingest
            .apply_event(peer, created_event(record("reg_evt000000001", peer, 1), "1"))
            .await
            .unwrap();
        let mut v2 = record("reg_evt000000001", peer, 2);
        v2.service_point = Some("https://ex.example/v2".to_string());
        ingest
            .apply_event(
                peer,
                ChangeEvent {
                    kind: ChangeKind::Updated,
                    record: Some(v2),
                    tombstone: None,
                    cursor: "2".to_string(),
                },
            )
            .await
            .unwrap();

        // A stale v1 arriving afterwards is ignored.
        ingest
            .apply_event(peer, created_event(record("reg_evt000000001", peer, 1), "3"))
            .await
            .unwrap();

        let replica = store
            .get_by_canonical(peer, "reg_evt000000001")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(replica.version, 2);
        assert_eq!(
            replica.service_point.as_deref(),
            Some("https://ex.example/v2")
        );
    }

    #[tokio::test]
    async fn test_replay_is_idempotent() {
        let (store, metrics, ingest) = ingest();
        let peer = "https://a.example";
        let events = vec![
            created_event(record("reg_rep000000001", peer, 1), "1"),
            ChangeEvent {
                kind: ChangeKind::Updated,
                record: Some(record("reg_rep000000001", peer, 2)),
                tombstone: None,
                cursor: "2".to_string(),
            },
            ChangeEvent {
                kind: ChangeKind::Deleted,
                record: None,
                tombstone: Some(Tombstone {
                    origin_server: peer.to_string(),
                    origin_id: "reg_rep000000001".to_string(),
                    version: 2,
                    deleted_at: Utc::now(),
                }),
                cursor: "3".to_string(),
            },
        ];

        for round in 0..2 {
            for event in &events {
                ingest.apply_event(peer, event.clone()).await.unwrap();
            }
            assert!(
                store
                    .get_by_canonical(peer, "reg_rep000000001")
                    .await
                    .unwrap()
                    .is_none(),
                "round {}",
                round
            );
        }
        // Replaying the same stream is not a conflict.
        assert_eq!(metrics.conflicts_detected(), 0);

        let tomb = store
            .get_tombstone(peer, "reg_rep000000001")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tomb.version, 2);
    }

    #[tokio::test]
    async fn test_tombstone_dominates_replayed_record() {
        let (store, _metrics, ingest) = ingest();
        let peer = "https://a.example";

        ingest
            .apply_event(
                peer,
                ChangeEvent {
                    kind: ChangeKind::Deleted,
                    record: None,
                    tombstone: Some(Tombstone {
                        origin_server: peer.to_string(),
                        origin_id: "reg_dom000000001".to_string(),
                        version: 3,
                        deleted_at: Utc::now(),
                    }),
                    cursor: "1".to_string(),
                },
            )
            .await
            .unwrap();

        // Records at or below the tombstone version never materialize.
        for version in [1, 3] {
            ingest
                .apply_event(
                    peer,
                    created_event(record("reg_dom000000001", peer, version), "2"),
                )
                .await
                .unwrap();
            assert!(store
                .get_by_canonical(peer, "reg_dom000000001")
                .await
                .unwrap()
                .is_none());
        }

        // A genuinely newer version survives.
        ingest
            .apply_event(
                peer,
                created_event(record("reg_dom000000001", peer, 4), "3"),
            )
            .await
            .unwrap();
        assert!(store
            .get_by_canonical(peer, "reg_dom000000001")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_sovereignty_violation_refused_and_counted() {
        let (store, metrics, ingest) = ingest();
        let ours = record("reg_sov000000001", "https://b.example", 1);
        store
            .put_registration(ours, ChangeKind::Created)
            .await
            .unwrap();

        // Peer claims a newer version of our record.
        ingest
            .apply_event(
                "https://a.example",
                created_event(record("reg_sov000000001", "https://b.example", 5), "1"),
            )
            .await
            .unwrap();

        let kept = store
            .get_registration("reg_sov000000001")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(kept.version, 1);
        assert_eq!(metrics.sovereignty_violations(), 1);

        // Same for tombstones against our origin.
        ingest
            .apply_event(
                "https://a.example",
                ChangeEvent {
                    kind: ChangeKind::Deleted,
                    record: None,
                    tombstone: Some(Tombstone {
                        origin_server: "https://b.example".to_string(),
                        origin_id: "reg_sov000000001".to_string(),
                        version: 5,
                        deleted_at: Utc::now(),
                    }),
                    cursor: "2".to_string(),
                },
            )
            .await
            .unwrap();
        assert!(store
            .get_registration("reg_sov000000001")
            .await
            .unwrap()
            .is_some());
        assert_eq!(metrics.sovereignty_violations(), 2);
    }

    #[tokio::test]
    async fn test_divergent_same_version_counts_conflict() {
        let (store, metrics, ingest) = ingest();
        let peer = "https://a.example";
        ingest
            .apply_event(peer, created_event(record("reg_cfl000000001", peer, 2), "1"))
            .await
            .unwrap();

        let mut divergent = record("reg_cfl000000001", peer, 2);
        divergent.service_point = Some("https://evil.example/svc".to_string());
        ingest
            .apply_event("https://c.example", created_event(divergent, "2"))
            .await
            .unwrap();

        assert_eq!(metrics.conflicts_detected(), 1);
        // The local copy is ground truth.
        let kept = store
            .get_by_canonical(peer, "reg_cfl000000001")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            kept.service_point.as_deref(),
            Some("https://ex.example/soh")
        );
    }
}
