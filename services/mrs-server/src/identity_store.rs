//! Users, keys, and bearer tokens.
//!
//! Key uniqueness is `(owner, key_id)`, enforced by the schema. Non-local
//! users are shell rows created the first time a signature from their
//! identity verifies, pinning the identity.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use mrs::types::{KeyAlgorithm, PublishedKey, UserInfo};

use crate::store::{parse_ts, ts, SqliteStore, StoreError};

#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: String,
    pub password_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub is_local: bool,
}

impl UserRecord {
    pub fn info(&self) -> UserInfo {
        UserInfo {
            id: self.id.clone(),
            created_at: self.created_at,
            is_local: self.is_local,
        }
    }
}

#[derive(Debug, Clone)]
pub struct KeyRecord {
    pub id: String,
    pub owner: String,
    pub key_id: String,
    pub algorithm: KeyAlgorithm,
    pub public_key: Vec<u8>,
    pub private_key: Option<Vec<u8>>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub deprecated: bool,
}

impl KeyRecord {
    pub fn published(&self) -> PublishedKey {
        PublishedKey {
            key_id: self.key_id.clone(),
            algorithm: self.algorithm,
            public_key: BASE64.encode(&self.public_key),
            created: self.created_at,
            expires: self.expires_at,
            deprecated: self.deprecated,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TokenRecord {
    pub user: UserRecord,
    pub expires_at: Option<DateTime<Utc>>,
}

impl SqliteStore {
    // ==================== Users ====================

    pub async fn create_local_user(
        &self,
        identity: &str,
        password_hash: &str,
    ) -> Result<(), StoreError> {
        let identity = identity.to_string();
        let password_hash = password_hash.to_string();
        self.call(move |conn| {
            let exists: Option<String> = conn
                .query_row(
                    "SELECT id FROM users WHERE id = ?1",
                    params![identity],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_some() {
                return Err(StoreError::Conflict(identity));
            }
            conn.execute(
                "INSERT INTO users (id, password_hash, created_at, is_local)
                 VALUES (?1, ?2, ?3, 1)",
                params![identity, password_hash, ts(&Utc::now())],
            )?;
            Ok(())
        })
        .await
    }

    /// Pin a federated identity on first sight.
    pub async fn ensure_remote_user(&self, identity: &str) -> Result<UserRecord, StoreError> {
        let identity = identity.to_string();
        self.call(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO users (id, password_hash, created_at, is_local)
                 VALUES (?1, NULL, ?2, 0)",
                params![identity, ts(&Utc::now())],
            )?;
            get_user_sync(conn, &identity)?.ok_or(StoreError::NotFound(identity))
        })
        .await
    }

    pub async fn get_user(&self, identity: &str) -> Result<Option<UserRecord>, StoreError> {
        let identity = identity.to_string();
        self.call(move |conn| get_user_sync(conn, &identity)).await
    }

    // ==================== Keys ====================

    pub async fn insert_key(&self, key: KeyRecord) -> Result<(), StoreError> {
        self.call(move |conn| {
            let result = conn.execute(
                "INSERT INTO keys (id, owner, key_id, algorithm, public_key, private_key,
                                   created_at, expires_at, deprecated)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    key.id,
                    key.owner,
                    key.key_id,
                    key.algorithm.as_str(),
                    BASE64.encode(&key.public_key),
                    key.private_key.as_ref().map(|k| BASE64.encode(k)),
                    ts(&key.created_at),
                    key.expires_at.as_ref().map(ts),
                    key.deprecated as i64,
                ],
            );
            match result {
                Ok(_) => Ok(()),
                Err(rusqlite::Error::SqliteFailure(e, msg))
                    if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    Err(StoreError::Conflict(
                        msg.unwrap_or_else(|| format!("{}/{}", key.owner, key.key_id)),
                    ))
                }
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    /// All keys for an identity, newest first.
    pub async fn list_keys(&self, owner: &str) -> Result<Vec<KeyRecord>, StoreError> {
        let owner = owner.to_string();
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM keys WHERE owner = ?1 ORDER BY created_at DESC",
            )?;
            let rows = stmt
                .query_map(params![owner], row_to_key)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().collect()
        })
        .await
    }

    /// The newest non-deprecated key with private material, if any.
    pub async fn get_signing_key(&self, owner: &str) -> Result<Option<KeyRecord>, StoreError> {
        let keys = self.list_keys(owner).await?;
        Ok(keys
            .into_iter()
            .find(|k| !k.deprecated && k.private_key.is_some()))
    }

    pub async fn deprecate_key(&self, owner: &str, key_id: &str) -> Result<bool, StoreError> {
        let owner = owner.to_string();
        let key_id = key_id.to_string();
        self.call(move |conn| {
            let n = conn.execute(
                "UPDATE keys SET deprecated = 1 WHERE owner = ?1 AND key_id = ?2",
                params![owner, key_id],
            )?;
            Ok(n > 0)
        })
        .await
    }

    // ==================== Tokens ====================

    pub async fn insert_token(
        &self,
        token: &str,
        user_id: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let token = token.to_string();
        let user_id = user_id.to_string();
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO tokens (token, user_id, created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![token, user_id, ts(&Utc::now()), expires_at.as_ref().map(ts)],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_token(&self, token: &str) -> Result<Option<TokenRecord>, StoreError> {
        let token = token.to_string();
        self.call(move |conn| {
            let row = conn
                .query_row(
                    "SELECT t.expires_at, u.id, u.password_hash, u.created_at, u.is_local
                     FROM tokens t JOIN users u ON t.user_id = u.id
                     WHERE t.token = ?1",
                    params![token],
                    |row| {
                        Ok((
                            row.get::<_, Option<String>>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, Option<String>>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, i64>(4)?,
                        ))
                    },
                )
                .optional()?;

            match row {
                None => Ok(None),
                Some((expires_at, id, password_hash, created_at, is_local)) => {
                    Ok(Some(TokenRecord {
                        user: UserRecord {
                            id,
                            password_hash,
                            created_at: parse_ts(&created_at)?,
                            is_local: is_local != 0,
                        },
                        expires_at: match expires_at {
                            Some(raw) => Some(parse_ts(&raw)?),
                            None => None,
                        },
                    }))
                }
            }
        })
        .await
    }

    pub async fn delete_expired_tokens(&self) -> Result<usize, StoreError> {
        self.call(move |conn| {
            let n = conn.execute(
                "DELETE FROM tokens WHERE expires_at IS NOT NULL AND expires_at < ?1",
                params![ts(&Utc::now())],
            )?;
            Ok(n)
        })
        .await
    }
}

fn get_user_sync(conn: &Connection, identity: &str) -> Result<Option<UserRecord>, StoreError> {
    let row = conn
        .query_row(
            "SELECT id, password_hash, created_at, is_local FROM users WHERE id = ?1",
            params![identity],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            },
        )
        .optional()?;

    match row {
        None => Ok(None),
        Some((id, password_hash, created_at, is_local)) => Ok(Some(UserRecord {
            id,
            password_hash,
            created_at: parse_ts(&created_at)?,
            is_local: is_local != 0,
        })),
    }
}

fn row_to_key(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<KeyRecord, StoreError>> {
    let algorithm: String = row.get("algorithm")?;
    let public_key: String = row.get("public_key")?;
    let private_key: Option<String> = row.get("private_key")?;
    let created_at: String = row.get("created_at")?;
    let expires_at: Option<String> = row.get("expires_at")?;

    Ok(build_key_record(
        row.get("id")?,
        row.get("owner")?,
        row.get("key_id")?,
        algorithm,
        public_key,
        private_key,
        created_at,
        expires_at,
        row.get::<_, i64>("deprecated")? != 0,
    ))
}

#[allow(clippy::too_many_arguments)]
fn build_key_record(
    id: String,
    owner: String,
    key_id: String,
    algorithm: String,
    public_key: String,
    private_key: Option<String>,
    created_at: String,
    expires_at: Option<String>,
    deprecated: bool,
) -> Result<KeyRecord, StoreError> {
    let algorithm: KeyAlgorithm = algorithm
        .parse()
        .map_err(|e: String| StoreError::Timestamp(e))?;
    Ok(KeyRecord {
        id,
        owner,
        key_id,
        algorithm,
        public_key: BASE64
            .decode(public_key)
            .map_err(|e| StoreError::Timestamp(format!("bad key encoding: {}", e)))?,
        private_key: match private_key {
            Some(raw) => Some(
                BASE64
                    .decode(raw)
                    .map_err(|e| StoreError::Timestamp(format!("bad key encoding: {}", e)))?,
            ),
            None => None,
        },
        created_at: parse_ts(&created_at)?,
        expires_at: match expires_at {
            Some(raw) => Some(parse_ts(&raw)?),
            None => None,
        },
        deprecated,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids;

    #[tokio::test]
    async fn test_create_and_get_local_user() {
        let store = SqliteStore::open_memory().unwrap();
        store
            .create_local_user("alice@a.example", "hash")
            .await
            .unwrap();

        let user = store.get_user("alice@a.example").await.unwrap().unwrap();
        assert!(user.is_local);
        assert_eq!(user.password_hash.as_deref(), Some("hash"));

        // Duplicate registration conflicts.
        let err = store
            .create_local_user("alice@a.example", "hash2")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_ensure_remote_user_is_idempotent() {
        let store = SqliteStore::open_memory().unwrap();
        let first = store.ensure_remote_user("mark@x.example").await.unwrap();
        let second = store.ensure_remote_user("mark@x.example").await.unwrap();
        assert!(!first.is_local);
        assert_eq!(first.created_at, second.created_at);
    }

    #[tokio::test]
    async fn test_key_uniqueness_on_owner_and_key_id() {
        let store = SqliteStore::open_memory().unwrap();
        let key = KeyRecord {
            id: ids::key_record_id(),
            owner: "alice@a.example".to_string(),
            key_id: "main".to_string(),
            algorithm: KeyAlgorithm::Ed25519,
            public_key: vec![1; 32],
            private_key: None,
            created_at: Utc::now(),
            expires_at: None,
            deprecated: false,
        };
        store.insert_key(key.clone()).await.unwrap();

        let mut dup = key.clone();
        dup.id = ids::key_record_id();
        let err = store.insert_key(dup).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        // Same key_id for another owner is fine.
        let mut other = key;
        other.id = ids::key_record_id();
        other.owner = "bob@a.example".to_string();
        store.insert_key(other).await.unwrap();
    }

    #[tokio::test]
    async fn test_signing_key_skips_deprecated() {
        let store = SqliteStore::open_memory().unwrap();
        let mut old = KeyRecord {
            id: ids::key_record_id(),
            owner: "_server".to_string(),
            key_id: "server-2026-01".to_string(),
            algorithm: KeyAlgorithm::Ed25519,
            public_key: vec![1; 32],
            private_key: Some(vec![2; 32]),
            created_at: Utc::now() - chrono::Duration::days(30),
            expires_at: None,
            deprecated: true,
        };
        store.insert_key(old.clone()).await.unwrap();

        old.id = ids::key_record_id();
        old.key_id = "server-2026-02".to_string();
        old.deprecated = false;
        old.created_at = Utc::now();
        store.insert_key(old).await.unwrap();

        let signing = store.get_signing_key("_server").await.unwrap().unwrap();
        assert_eq!(signing.key_id, "server-2026-02");
    }

    #[tokio::test]
    async fn test_token_roundtrip_and_cleanup() {
        let store = SqliteStore::open_memory().unwrap();
        store
            .create_local_user("alice@a.example", "hash")
            .await
            .unwrap();

        let expired_at = Utc::now() - chrono::Duration::hours(1);
        store
            .insert_token("tok_live", "alice@a.example", None)
            .await
            .unwrap();
        store
            .insert_token("tok_dead", "alice@a.example", Some(expired_at))
            .await
            .unwrap();

        let live = store.get_token("tok_live").await.unwrap().unwrap();
        assert_eq!(live.user.id, "alice@a.example");
        assert!(store.get_token("tok_missing").await.unwrap().is_none());

        let removed = store.delete_expired_tokens().await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.get_token("tok_dead").await.unwrap().is_none());
    }
}
