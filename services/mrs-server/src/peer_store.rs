//! Federation peer table.
//!
//! Peers persist in SQLite; `Peers` keeps an in-memory snapshot for the
//! hot read path (referral generation runs on every search). Writes go
//! through the store and then refresh the snapshot, so readers never
//! block on a write.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use tokio::sync::RwLock;

use mrs::types::{Geometry, Peer};

use crate::store::{parse_ts, ts, SqliteStore, StoreError};

impl SqliteStore {
    /// Insert or merge a peer. Configured status is sticky, and absent
    /// fields never clobber known ones.
    pub async fn upsert_peer(&self, peer: Peer) -> Result<(), StoreError> {
        self.call(move |conn| {
            let regions_json = match &peer.authoritative_regions {
                Some(regions) => Some(serde_json::to_string(regions)?),
                None => None,
            };
            conn.execute(
                "INSERT INTO peers (server_url, hint, last_seen, is_configured,
                                    authoritative_regions, sync_cursor)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(server_url) DO UPDATE SET
                     hint = COALESCE(excluded.hint, hint),
                     last_seen = COALESCE(excluded.last_seen, last_seen),
                     is_configured = MAX(is_configured, excluded.is_configured),
                     authoritative_regions =
                         COALESCE(excluded.authoritative_regions, authoritative_regions),
                     sync_cursor = COALESCE(excluded.sync_cursor, sync_cursor)",
                params![
                    peer.server_url,
                    peer.hint,
                    peer.last_seen.as_ref().map(ts),
                    peer.is_configured as i64,
                    regions_json,
                    peer.sync_cursor,
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_peer(&self, server_url: &str) -> Result<Option<Peer>, StoreError> {
        let server_url = server_url.to_string();
        self.call(move |conn| {
            let row = conn
                .query_row(
                    "SELECT * FROM peers WHERE server_url = ?1",
                    params![server_url],
                    row_to_peer,
                )
                .optional()?;
            row.transpose()
        })
        .await
    }

    /// All peers, configured first, most recently seen first.
    pub async fn list_peers(&self) -> Result<Vec<Peer>, StoreError> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM peers
                 ORDER BY is_configured DESC, last_seen DESC, server_url ASC",
            )?;
            let rows = stmt
                .query_map([], row_to_peer)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().collect()
        })
        .await
    }

    pub async fn set_peer_cursor(
        &self,
        server_url: &str,
        cursor: Option<String>,
    ) -> Result<(), StoreError> {
        let server_url = server_url.to_string();
        self.call(move |conn| {
            conn.execute(
                "UPDATE peers SET sync_cursor = ?2 WHERE server_url = ?1",
                params![server_url, cursor],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn update_peer_metadata(
        &self,
        server_url: &str,
        hint: Option<String>,
        regions: Option<Vec<Geometry>>,
        last_seen: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let server_url = server_url.to_string();
        self.call(move |conn| {
            let regions_json = match &regions {
                Some(r) => Some(serde_json::to_string(r)?),
                None => None,
            };
            conn.execute(
                "UPDATE peers SET
                     hint = COALESCE(?2, hint),
                     authoritative_regions = COALESCE(?3, authoritative_regions),
                     last_seen = ?4
                 WHERE server_url = ?1",
                params![server_url, hint, regions_json, ts(&last_seen)],
            )?;
            Ok(())
        })
        .await
    }
}

fn row_to_peer(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<Peer, StoreError>> {
    let last_seen: Option<String> = row.get("last_seen")?;
    let regions: Option<String> = row.get("authoritative_regions")?;

    Ok(build_peer(
        row.get("server_url")?,
        row.get("hint")?,
        last_seen,
        row.get::<_, i64>("is_configured")? != 0,
        regions,
        row.get("sync_cursor")?,
    ))
}

fn build_peer(
    server_url: String,
    hint: Option<String>,
    last_seen: Option<String>,
    is_configured: bool,
    regions: Option<String>,
    sync_cursor: Option<String>,
) -> Result<Peer, StoreError> {
    Ok(Peer {
        server_url,
        hint,
        last_seen: match last_seen {
            Some(raw) => Some(parse_ts(&raw)?),
            None => None,
        },
        is_configured,
        authoritative_regions: match regions {
            Some(raw) => Some(serde_json::from_str(&raw)?),
            None => None,
        },
        sync_cursor,
    })
}

/// Shared peer table with a lock-free-read snapshot.
pub struct Peers {
    store: Arc<SqliteStore>,
    snapshot: RwLock<Arc<Vec<Peer>>>,
}

impl Peers {
    pub async fn load(store: Arc<SqliteStore>) -> Result<Self, StoreError> {
        let initial = store.list_peers().await?;
        Ok(Self {
            store,
            snapshot: RwLock::new(Arc::new(initial)),
        })
    }

    pub async fn snapshot(&self) -> Arc<Vec<Peer>> {
        Arc::clone(&*self.snapshot.read().await)
    }

    pub async fn upsert(&self, peer: Peer) -> Result<(), StoreError> {
        self.store.upsert_peer(peer).await?;
        self.reload().await
    }

    pub async fn set_cursor(
        &self,
        server_url: &str,
        cursor: Option<String>,
    ) -> Result<(), StoreError> {
        self.store.set_peer_cursor(server_url, cursor).await?;
        self.reload().await
    }

    pub async fn update_metadata(
        &self,
        server_url: &str,
        hint: Option<String>,
        regions: Option<Vec<Geometry>>,
        last_seen: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.store
            .update_peer_metadata(server_url, hint, regions, last_seen)
            .await?;
        self.reload().await
    }

    async fn reload(&self) -> Result<(), StoreError> {
        let fresh = self.store.list_peers().await?;
        *self.snapshot.write().await = Arc::new(fresh);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mrs::types::Location;

    fn peer(url: &str, configured: bool) -> Peer {
        Peer {
            server_url: url.to_string(),
            hint: None,
            last_seen: None,
            is_configured: configured,
            authoritative_regions: None,
            sync_cursor: None,
        }
    }

    #[tokio::test]
    async fn test_upsert_merges_without_clobbering() {
        let store = SqliteStore::open_memory().unwrap();
        let mut p = peer("https://b.example", true);
        p.hint = Some("sydney region".to_string());
        store.upsert_peer(p).await.unwrap();

        // Re-learning the same peer without a hint keeps the hint and
        // the configured bit.
        store
            .upsert_peer(peer("https://b.example", false))
            .await
            .unwrap();

        let merged = store.get_peer("https://b.example").await.unwrap().unwrap();
        assert!(merged.is_configured);
        assert_eq!(merged.hint.as_deref(), Some("sydney region"));
    }

    #[tokio::test]
    async fn test_cursor_roundtrip() {
        let store = SqliteStore::open_memory().unwrap();
        store
            .upsert_peer(peer("https://b.example", true))
            .await
            .unwrap();
        store
            .set_peer_cursor("https://b.example", Some("42".to_string()))
            .await
            .unwrap();
        let p = store.get_peer("https://b.example").await.unwrap().unwrap();
        assert_eq!(p.sync_cursor.as_deref(), Some("42"));

        store
            .set_peer_cursor("https://b.example", None)
            .await
            .unwrap();
        let p = store.get_peer("https://b.example").await.unwrap().unwrap();
        assert!(p.sync_cursor.is_none());
    }

    #[tokio::test]
    async fn test_metadata_update_and_snapshot() {
        let store = Arc::new(SqliteStore::open_memory().unwrap());
        let peers = Peers::load(Arc::clone(&store)).await.unwrap();
        peers.upsert(peer("https://b.example", true)).await.unwrap();

        let region = Geometry::Sphere {
            center: Location::new(-33.8, 151.2, 0.0),
            radius: 100_000.0,
        };
        peers
            .update_metadata(
                "https://b.example",
                Some("sydney".to_string()),
                Some(vec![region]),
                Utc::now(),
            )
            .await
            .unwrap();

        let snapshot = peers.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot[0].authoritative_regions.is_some());
        assert!(snapshot[0].last_seen.is_some());
    }
}
