//! SQLite-backed registry store.
//!
//! Single bundled-SQLite connection behind a mutex; every operation runs
//! on the blocking pool. Registration writes and their change-log
//! entries commit in one transaction, so `/sync/changes` can never skip
//! or reorder a committed write.
//!
//! Bounding boxes are persisted per registration as index columns. A box
//! that wraps the antimeridian is stored with `min_lon > max_lon` and
//! `bbox_wraps = 1`; coarse queries split the query rectangle and match
//! either half.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

use mrs::geo::compute_bounding_box;
use mrs::types::{BoundingBox, ChangeEvent, ChangeKind, Geometry, Registration, Tombstone};

const SCHEMA: &str = "
-- Registrations: spatial claims, local and replicated
CREATE TABLE IF NOT EXISTS registrations (
    id TEXT PRIMARY KEY,
    owner TEXT NOT NULL,
    space TEXT NOT NULL,
    service_point TEXT,
    foad INTEGER NOT NULL DEFAULT 0,
    origin_server TEXT NOT NULL,
    origin_id TEXT NOT NULL,
    version INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    replicated_from TEXT,
    last_synced_at TEXT,
    bbox_min_lat REAL NOT NULL,
    bbox_max_lat REAL NOT NULL,
    bbox_min_lon REAL NOT NULL,
    bbox_max_lon REAL NOT NULL,
    bbox_wraps INTEGER NOT NULL DEFAULT 0,
    UNIQUE(origin_server, origin_id)
);

CREATE INDEX IF NOT EXISTS idx_registrations_bbox ON registrations(
    bbox_min_lat, bbox_max_lat, bbox_min_lon, bbox_max_lon
);
CREATE INDEX IF NOT EXISTS idx_registrations_owner ON registrations(owner);

-- Tombstones: propagated deletes, retained for the replay window
CREATE TABLE IF NOT EXISTS tombstones (
    origin_server TEXT NOT NULL,
    origin_id TEXT NOT NULL,
    version INTEGER NOT NULL,
    deleted_at TEXT NOT NULL,
    PRIMARY KEY (origin_server, origin_id)
);

CREATE INDEX IF NOT EXISTS idx_tombstones_deleted_at ON tombstones(deleted_at);

-- Monotonic change log backing /sync/changes cursors
CREATE TABLE IF NOT EXISTS change_log (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    origin_server TEXT NOT NULL,
    origin_id TEXT NOT NULL,
    version INTEGER NOT NULL,
    payload TEXT NOT NULL,
    recorded_at TEXT NOT NULL
);

-- Users: local and federated identities
CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    password_hash TEXT,
    created_at TEXT NOT NULL,
    is_local INTEGER NOT NULL DEFAULT 0
);

-- Keys for identities; owner '_server' is the server's own key
CREATE TABLE IF NOT EXISTS keys (
    id TEXT PRIMARY KEY,
    owner TEXT NOT NULL,
    key_id TEXT NOT NULL,
    algorithm TEXT NOT NULL DEFAULT 'Ed25519',
    public_key TEXT NOT NULL,
    private_key TEXT,
    created_at TEXT NOT NULL,
    expires_at TEXT,
    deprecated INTEGER NOT NULL DEFAULT 0,
    UNIQUE(owner, key_id)
);

CREATE INDEX IF NOT EXISTS idx_keys_owner ON keys(owner);

-- Bearer tokens
CREATE TABLE IF NOT EXISTS tokens (
    token TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    expires_at TEXT,
    FOREIGN KEY (user_id) REFERENCES users(id)
);

CREATE INDEX IF NOT EXISTS idx_tokens_user ON tokens(user_id);

-- Known federation peers
CREATE TABLE IF NOT EXISTS peers (
    server_url TEXT PRIMARY KEY,
    hint TEXT,
    last_seen TEXT,
    is_configured INTEGER NOT NULL DEFAULT 0,
    authoritative_regions TEXT,
    sync_cursor TEXT
);

CREATE TABLE IF NOT EXISTS server_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

const META_PRUNED_THROUGH: &str = "changelog_pruned_through";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    Conflict(String),

    #[error("Cursor expired")]
    CursorExpired,

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Bad timestamp in store: {0}")]
    Timestamp(String),

    #[error("Store mutex poisoned")]
    Poisoned,

    #[error("Store task failed: {0}")]
    Join(String),
}

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (and create if needed) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Open an in-memory database. Used by tests.
    pub fn open_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` on the connection, on the blocking pool.
    pub(crate) async fn call<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| StoreError::Poisoned)?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    // ==================== Registrations ====================

    /// Persist a registration and append the matching change-log event
    /// in one transaction. The bounding box is recomputed here so it can
    /// never drift from the geometry.
    pub async fn put_registration(
        &self,
        registration: Registration,
        kind: ChangeKind,
    ) -> Result<(), StoreError> {
        let bbox = compute_bounding_box(&registration.space);
        self.call(move |conn| {
            let tx = conn.transaction()?;
            upsert_registration(&tx, &registration, &bbox)?;
            append_change(
                &tx,
                kind,
                &registration.origin_server,
                &registration.origin_id,
                registration.version,
                &serde_json::to_string(&registration)?,
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn get_registration(&self, id: &str) -> Result<Option<Registration>, StoreError> {
        let id = id.to_string();
        self.call(move |conn| {
            conn.query_row(
                "SELECT * FROM registrations WHERE id = ?1",
                params![id],
                row_to_registration,
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }

    pub async fn get_by_canonical(
        &self,
        origin_server: &str,
        origin_id: &str,
    ) -> Result<Option<Registration>, StoreError> {
        let origin_server = origin_server.to_string();
        let origin_id = origin_id.to_string();
        self.call(move |conn| {
            conn.query_row(
                "SELECT * FROM registrations WHERE origin_server = ?1 AND origin_id = ?2",
                params![origin_server, origin_id],
                row_to_registration,
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }

    pub async fn registrations_by_owner(
        &self,
        owner: &str,
    ) -> Result<Vec<Registration>, StoreError> {
        let owner = owner.to_string();
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM registrations WHERE owner = ?1 ORDER BY created_at DESC",
            )?;
            let regs = stmt
                .query_map(params![owner], row_to_registration)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(regs)
        })
        .await
    }

    /// Delete a local registration, record its tombstone, and append the
    /// deleted event, atomically.
    pub async fn release_registration(
        &self,
        id: &str,
        tombstone: Tombstone,
    ) -> Result<(), StoreError> {
        let id = id.to_string();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            upsert_tombstone(&tx, &tombstone)?;
            tx.execute("DELETE FROM registrations WHERE id = ?1", params![id])?;
            append_change(
                &tx,
                ChangeKind::Deleted,
                &tombstone.origin_server,
                &tombstone.origin_id,
                tombstone.version,
                &serde_json::to_string(&tombstone)?,
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Apply a tombstone learned from a peer: record it, drop any copy
    /// it shadows, and append the deleted event.
    pub async fn apply_tombstone(&self, tombstone: Tombstone) -> Result<(), StoreError> {
        self.call(move |conn| {
            let tx = conn.transaction()?;
            upsert_tombstone(&tx, &tombstone)?;
            tx.execute(
                "DELETE FROM registrations
                 WHERE origin_server = ?1 AND origin_id = ?2 AND version <= ?3",
                params![
                    tombstone.origin_server,
                    tombstone.origin_id,
                    tombstone.version as i64
                ],
            )?;
            append_change(
                &tx,
                ChangeKind::Deleted,
                &tombstone.origin_server,
                &tombstone.origin_id,
                tombstone.version,
                &serde_json::to_string(&tombstone)?,
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn get_tombstone(
        &self,
        origin_server: &str,
        origin_id: &str,
    ) -> Result<Option<Tombstone>, StoreError> {
        let origin_server = origin_server.to_string();
        let origin_id = origin_id.to_string();
        self.call(move |conn| {
            conn.query_row(
                "SELECT origin_server, origin_id, version, deleted_at
                 FROM tombstones WHERE origin_server = ?1 AND origin_id = ?2",
                params![origin_server, origin_id],
                row_to_tombstone,
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }

    pub async fn list_tombstones(&self) -> Result<Vec<Tombstone>, StoreError> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT origin_server, origin_id, version, deleted_at
                 FROM tombstones ORDER BY deleted_at ASC",
            )?;
            let tombs = stmt
                .query_map([], row_to_tombstone)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(tombs)
        })
        .await
    }

    /// Coarse spatial lookup: all registrations whose persisted bounding
    /// box overlaps the query box. Wrapping query boxes are split into
    /// two rectangles; wrapping row boxes are matched on either half.
    pub async fn query_bbox(&self, query: BoundingBox) -> Result<Vec<Registration>, StoreError> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM registrations
                 WHERE bbox_max_lat >= ?1 AND bbox_min_lat <= ?2
                   AND (
                       (bbox_wraps = 0 AND bbox_min_lon <= ?4 AND bbox_max_lon >= ?3)
                    OR (bbox_wraps = 1 AND (bbox_min_lon <= ?4 OR bbox_max_lon >= ?3))
                   )",
            )?;

            let mut seen = std::collections::HashSet::new();
            let mut out = Vec::new();
            for rect in query.split() {
                let regs = stmt
                    .query_map(
                        params![rect.min_lat, rect.max_lat, rect.min_lon, rect.max_lon],
                        row_to_registration,
                    )?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                for reg in regs {
                    if seen.insert(reg.id.clone()) {
                        out.push(reg);
                    }
                }
            }
            Ok(out)
        })
        .await
    }

    // ==================== Snapshot & change log ====================

    /// One snapshot page, ordered by `(origin_server, origin_id)`.
    /// Returns the page, the continuation key, and the change-log head
    /// at generation time.
    #[allow(clippy::type_complexity)]
    pub async fn snapshot_page(
        &self,
        after: Option<(String, String)>,
        limit: usize,
    ) -> Result<(Vec<Registration>, Option<(String, String)>, i64), StoreError> {
        self.call(move |conn| {
            let head = change_log_head(conn)?;
            let mut regs = match &after {
                Some((server, id)) => {
                    let mut stmt = conn.prepare(
                        "SELECT * FROM registrations
                         WHERE (origin_server, origin_id) > (?1, ?2)
                         ORDER BY origin_server ASC, origin_id ASC
                         LIMIT ?3",
                    )?;
                    let rows = stmt
                        .query_map(params![server, id, (limit + 1) as i64], row_to_registration)?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    rows
                }
                None => {
                    let mut stmt = conn.prepare(
                        "SELECT * FROM registrations
                         ORDER BY origin_server ASC, origin_id ASC
                         LIMIT ?1",
                    )?;
                    let rows = stmt
                        .query_map(params![(limit + 1) as i64], row_to_registration)?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    rows
                }
            };

            let has_more = regs.len() > limit;
            regs.truncate(limit);
            let next = if has_more {
                regs.last()
                    .map(|r| (r.origin_server.clone(), r.origin_id.clone()))
            } else {
                None
            };
            Ok((regs, next, head))
        })
        .await
    }

    /// Events after `since_seq`, in log order. Fails `CursorExpired`
    /// when the requested range has been garbage-collected.
    pub async fn changes_since(
        &self,
        since_seq: i64,
        limit: usize,
    ) -> Result<(Vec<ChangeEvent>, i64), StoreError> {
        self.call(move |conn| {
            let pruned = pruned_through(conn)?;
            if since_seq < pruned {
                return Err(StoreError::CursorExpired);
            }

            let mut stmt = conn.prepare(
                "SELECT seq, kind, payload FROM change_log
                 WHERE seq > ?1 ORDER BY seq ASC LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![since_seq, limit as i64], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut events = Vec::with_capacity(rows.len());
            let mut last_seq = since_seq;
            for (seq, kind_str, payload) in rows {
                let kind = parse_change_kind(&kind_str)?;
                let event = match kind {
                    ChangeKind::Deleted => ChangeEvent {
                        kind,
                        record: None,
                        tombstone: Some(serde_json::from_str(&payload)?),
                        cursor: seq.to_string(),
                    },
                    _ => ChangeEvent {
                        kind,
                        record: Some(serde_json::from_str(&payload)?),
                        tombstone: None,
                        cursor: seq.to_string(),
                    },
                };
                events.push(event);
                last_seq = seq;
            }
            Ok((events, last_seq))
        })
        .await
    }

    pub async fn change_log_head_seq(&self) -> Result<i64, StoreError> {
        self.call(|conn| change_log_head(conn)).await
    }

    /// Drop tombstones and change-log entries older than `cutoff` and
    /// advance the pruned watermark.
    pub async fn gc_expired(&self, cutoff: DateTime<Utc>) -> Result<(usize, usize), StoreError> {
        let cutoff_str = ts(&cutoff);
        self.call(move |conn| {
            let tx = conn.transaction()?;
            let tombs = tx.execute(
                "DELETE FROM tombstones WHERE deleted_at < ?1",
                params![cutoff_str],
            )?;

            let max_old: Option<i64> = tx
                .query_row(
                    "SELECT MAX(seq) FROM change_log WHERE recorded_at < ?1",
                    params![cutoff_str],
                    |row| row.get(0),
                )
                .optional()?
                .flatten();

            let mut pruned = 0;
            if let Some(max_seq) = max_old {
                pruned = tx.execute("DELETE FROM change_log WHERE seq <= ?1", params![max_seq])?;
                tx.execute(
                    "INSERT INTO server_meta (key, value) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    params![META_PRUNED_THROUGH, max_seq.to_string()],
                )?;
            }
            tx.commit()?;
            Ok((tombs, pruned))
        })
        .await
    }
}

// ==================== Row helpers ====================

// Fixed-width fractional seconds keep stored timestamps lossless and
// lexicographically ordered for the SQL range comparisons.
pub(crate) fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Timestamp(format!("{}: {}", raw, e)))
}

fn parse_change_kind(raw: &str) -> Result<ChangeKind, StoreError> {
    match raw {
        "created" => Ok(ChangeKind::Created),
        "updated" => Ok(ChangeKind::Updated),
        "deleted" => Ok(ChangeKind::Deleted),
        other => Err(StoreError::Timestamp(format!(
            "unknown change kind: {}",
            other
        ))),
    }
}

fn change_kind_str(kind: ChangeKind) -> &'static str {
    match kind {
        ChangeKind::Created => "created",
        ChangeKind::Updated => "updated",
        ChangeKind::Deleted => "deleted",
    }
}

fn upsert_registration(
    conn: &Connection,
    reg: &Registration,
    bbox: &BoundingBox,
) -> Result<(), StoreError> {
    let space_json = serde_json::to_string(&reg.space)?;
    conn.execute(
        "INSERT OR REPLACE INTO registrations (
            id, owner, space, service_point, foad,
            origin_server, origin_id, version,
            created_at, updated_at, replicated_from, last_synced_at,
            bbox_min_lat, bbox_max_lat, bbox_min_lon, bbox_max_lon, bbox_wraps
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
        params![
            reg.id,
            reg.owner,
            space_json,
            reg.service_point,
            reg.foad as i64,
            reg.origin_server,
            reg.origin_id,
            reg.version as i64,
            ts(&reg.created),
            ts(&reg.updated),
            reg.replicated_from,
            reg.last_synced_at.as_ref().map(ts),
            bbox.min_lat,
            bbox.max_lat,
            bbox.min_lon,
            bbox.max_lon,
            bbox.wraps() as i64,
        ],
    )?;
    Ok(())
}

fn upsert_tombstone(conn: &Connection, tombstone: &Tombstone) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO tombstones (origin_server, origin_id, version, deleted_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(origin_server, origin_id) DO UPDATE SET
             deleted_at = CASE WHEN excluded.version > version
                               THEN excluded.deleted_at ELSE deleted_at END,
             version = MAX(version, excluded.version)",
        params![
            tombstone.origin_server,
            tombstone.origin_id,
            tombstone.version as i64,
            ts(&tombstone.deleted_at),
        ],
    )?;
    Ok(())
}

fn append_change(
    conn: &Connection,
    kind: ChangeKind,
    origin_server: &str,
    origin_id: &str,
    version: u64,
    payload: &str,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO change_log (kind, origin_server, origin_id, version, payload, recorded_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            change_kind_str(kind),
            origin_server,
            origin_id,
            version as i64,
            payload,
            ts(&Utc::now()),
        ],
    )?;
    Ok(())
}

fn change_log_head(conn: &Connection) -> Result<i64, StoreError> {
    let head: Option<i64> = conn.query_row("SELECT MAX(seq) FROM change_log", [], |row| row.get(0))?;
    Ok(head.unwrap_or(0))
}

fn pruned_through(conn: &Connection) -> Result<i64, StoreError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM server_meta WHERE key = ?1",
            params![META_PRUNED_THROUGH],
            |row| row.get(0),
        )
        .optional()?;
    Ok(raw.and_then(|v| v.parse().ok()).unwrap_or(0))
}

fn row_to_registration(row: &rusqlite::Row<'_>) -> rusqlite::Result<Registration> {
    let space_json: String = row.get("space")?;
    let space: Geometry = serde_json::from_str(&space_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(e),
        )
    })?;

    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;
    let last_synced_at: Option<String> = row.get("last_synced_at")?;

    Ok(Registration {
        id: row.get("id")?,
        space,
        service_point: row.get("service_point")?,
        foad: row.get::<_, i64>("foad")? != 0,
        owner: row.get("owner")?,
        origin_server: row.get("origin_server")?,
        origin_id: row.get("origin_id")?,
        version: row.get::<_, i64>("version")? as u64,
        created: parse_ts_sql(&created_at)?,
        updated: parse_ts_sql(&updated_at)?,
        replicated_from: row.get("replicated_from")?,
        last_synced_at: match last_synced_at {
            Some(raw) => Some(parse_ts_sql(&raw)?),
            None => None,
        },
    })
}

fn row_to_tombstone(row: &rusqlite::Row<'_>) -> rusqlite::Result<Tombstone> {
    let deleted_at: String = row.get("deleted_at")?;
    Ok(Tombstone {
        origin_server: row.get("origin_server")?,
        origin_id: row.get("origin_id")?,
        version: row.get::<_, i64>("version")? as u64,
        deleted_at: parse_ts_sql(&deleted_at)?,
    })
}

fn parse_ts_sql(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mrs::types::Location;

    fn test_registration(id: &str, lat: f64, lon: f64, radius: f64) -> Registration {
        let now = Utc::now();
        Registration {
            id: id.to_string(),
            space: Geometry::Sphere {
                center: Location::new(lat, lon, 0.0),
                radius,
            },
            service_point: Some("https://ex.example/svc".to_string()),
            foad: false,
            owner: "alice@a.example".to_string(),
            origin_server: "https://a.example".to_string(),
            origin_id: id.to_string(),
            version: 1,
            created: now,
            updated: now,
            replicated_from: None,
            last_synced_at: None,
        }
    }

    #[tokio::test]
    async fn test_put_and_get_registration() {
        let store = SqliteStore::open_memory().unwrap();
        let reg = test_registration("reg_aaa000000001", -33.8568, 151.2153, 50.0);
        store
            .put_registration(reg.clone(), ChangeKind::Created)
            .await
            .unwrap();

        let fetched = store.get_registration("reg_aaa000000001").await.unwrap();
        assert_eq!(fetched, Some(reg.clone()));

        let canonical = store
            .get_by_canonical("https://a.example", "reg_aaa000000001")
            .await
            .unwrap();
        assert_eq!(canonical, Some(reg));
    }

    #[tokio::test]
    async fn test_put_appends_change_log_in_order() {
        let store = SqliteStore::open_memory().unwrap();
        let mut reg = test_registration("reg_bbb000000001", 0.0, 0.0, 10.0);
        store
            .put_registration(reg.clone(), ChangeKind::Created)
            .await
            .unwrap();
        reg.version = 2;
        store
            .put_registration(reg, ChangeKind::Updated)
            .await
            .unwrap();

        let (events, last) = store.changes_since(0, 100).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, ChangeKind::Created);
        assert_eq!(events[1].kind, ChangeKind::Updated);
        assert_eq!(events[1].record.as_ref().unwrap().version, 2);
        assert_eq!(last, 2);
    }

    #[tokio::test]
    async fn test_query_bbox_hits_and_misses() {
        let store = SqliteStore::open_memory().unwrap();
        store
            .put_registration(
                test_registration("reg_syd000000001", -33.8568, 151.2153, 50.0),
                ChangeKind::Created,
            )
            .await
            .unwrap();
        store
            .put_registration(
                test_registration("reg_lon000000001", 51.5074, -0.1278, 50.0),
                ChangeKind::Created,
            )
            .await
            .unwrap();

        let query = mrs::geo::bounding_box_for_search(
            &Location::new(-33.8570, 151.2155, 0.0),
            100.0,
        );
        let hits = store.query_bbox(query).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "reg_syd000000001");
    }

    #[tokio::test]
    async fn test_query_bbox_across_antimeridian() {
        let store = SqliteStore::open_memory().unwrap();
        store
            .put_registration(
                test_registration("reg_fij000000001", 0.0, 179.99, 10_000.0),
                ChangeKind::Created,
            )
            .await
            .unwrap();

        // Query from the other side of the line.
        let query =
            mrs::geo::bounding_box_for_search(&Location::new(0.0, -179.99, 0.0), 1000.0);
        let hits = store.query_bbox(query).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "reg_fij000000001");
    }

    #[tokio::test]
    async fn test_release_emits_tombstone_and_event() {
        let store = SqliteStore::open_memory().unwrap();
        let reg = test_registration("reg_ccc000000001", 0.0, 0.0, 10.0);
        store
            .put_registration(reg.clone(), ChangeKind::Created)
            .await
            .unwrap();

        let tombstone = Tombstone {
            origin_server: reg.origin_server.clone(),
            origin_id: reg.origin_id.clone(),
            version: reg.version,
            deleted_at: Utc::now(),
        };
        store
            .release_registration(&reg.id, tombstone.clone())
            .await
            .unwrap();

        assert!(store.get_registration(&reg.id).await.unwrap().is_none());
        let stored = store
            .get_tombstone(&reg.origin_server, &reg.origin_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.version, 1);

        let (events, _) = store.changes_since(0, 100).await.unwrap();
        assert_eq!(events.last().unwrap().kind, ChangeKind::Deleted);
    }

    #[tokio::test]
    async fn test_apply_tombstone_shadows_older_replica() {
        let store = SqliteStore::open_memory().unwrap();
        let reg = test_registration("reg_ddd000000001", 0.0, 0.0, 10.0);
        store
            .put_registration(reg.clone(), ChangeKind::Created)
            .await
            .unwrap();

        // Tombstone at the same version shadows the copy.
        store
            .apply_tombstone(Tombstone {
                origin_server: reg.origin_server.clone(),
                origin_id: reg.origin_id.clone(),
                version: 1,
                deleted_at: Utc::now(),
            })
            .await
            .unwrap();
        assert!(store.get_registration(&reg.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_apply_tombstone_keeps_newer_replica() {
        let store = SqliteStore::open_memory().unwrap();
        let mut reg = test_registration("reg_eee000000001", 0.0, 0.0, 10.0);
        reg.version = 3;
        store
            .put_registration(reg.clone(), ChangeKind::Created)
            .await
            .unwrap();

        store
            .apply_tombstone(Tombstone {
                origin_server: reg.origin_server.clone(),
                origin_id: reg.origin_id.clone(),
                version: 2,
                deleted_at: Utc::now(),
            })
            .await
            .unwrap();
        assert!(store.get_registration(&reg.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_tombstone_version_never_regresses() {
        let store = SqliteStore::open_memory().unwrap();
        let t = |version| Tombstone {
            origin_server: "https://a.example".to_string(),
            origin_id: "reg_fff000000001".to_string(),
            version,
            deleted_at: Utc::now(),
        };
        store.apply_tombstone(t(5)).await.unwrap();
        store.apply_tombstone(t(3)).await.unwrap();

        let stored = store
            .get_tombstone("https://a.example", "reg_fff000000001")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.version, 5);
    }

    #[tokio::test]
    async fn test_snapshot_pagination_is_deterministic() {
        let store = SqliteStore::open_memory().unwrap();
        for i in 0..5 {
            store
                .put_registration(
                    test_registration(&format!("reg_page0000000{}", i), 0.0, 0.0, 10.0),
                    ChangeKind::Created,
                )
                .await
                .unwrap();
        }

        let (page1, next, head) = store.snapshot_page(None, 3).await.unwrap();
        assert_eq!(page1.len(), 3);
        assert!(next.is_some());
        assert_eq!(head, 5);

        let (page2, next2, _) = store.snapshot_page(next, 3).await.unwrap();
        assert_eq!(page2.len(), 2);
        assert!(next2.is_none());

        // Ordered by (origin_server, origin_id), no overlap.
        let mut all: Vec<String> = page1.iter().chain(page2.iter()).map(|r| r.id.clone()).collect();
        let sorted = {
            let mut s = all.clone();
            s.sort();
            s
        };
        assert_eq!(all, sorted);
        all.dedup();
        assert_eq!(all.len(), 5);
    }

    #[tokio::test]
    async fn test_gc_prunes_and_expires_cursors() {
        let store = SqliteStore::open_memory().unwrap();
        let reg = test_registration("reg_ggg000000001", 0.0, 0.0, 10.0);
        store
            .put_registration(reg, ChangeKind::Created)
            .await
            .unwrap();

        // Everything is older than a future cutoff.
        let cutoff = Utc::now() + chrono::Duration::hours(1);
        let (_, pruned) = store.gc_expired(cutoff).await.unwrap();
        assert_eq!(pruned, 1);

        let err = store.changes_since(0, 100).await.unwrap_err();
        assert!(matches!(err, StoreError::CursorExpired));
    }
}
