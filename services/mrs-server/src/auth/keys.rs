//! Local keypair provisioning.
//!
//! The server's own signing key lives under the reserved owner
//! `_server`; local users get an Ed25519 keypair at account creation.
//! Public halves are served at `/.well-known/mrs/keys/{identity}`.

use std::sync::Arc;

use chrono::Utc;
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;

use mrs::types::KeyAlgorithm;
use mrs::validation::SERVER_IDENTITY_USER;

use crate::identity_store::KeyRecord;
use crate::ids;
use crate::store::SqliteStore;

use super::AuthError;

pub fn generate_ed25519() -> (Vec<u8>, Vec<u8>) {
    let signing = SigningKey::generate(&mut OsRng);
    (
        signing.to_bytes().to_vec(),
        signing.verifying_key().to_bytes().to_vec(),
    )
}

/// Load a stored Ed25519 signing key.
pub fn signing_key_from_record(record: &KeyRecord) -> Result<SigningKey, AuthError> {
    let private = record
        .private_key
        .as_ref()
        .ok_or_else(|| AuthError::KeyUnavailable(format!("{} has no private key", record.owner)))?;
    let bytes: [u8; 32] = private
        .as_slice()
        .try_into()
        .map_err(|_| AuthError::KeyUnavailable("bad Ed25519 private key length".to_string()))?;
    Ok(SigningKey::from_bytes(&bytes))
}

/// Ensure the server has a signing key, generating one on first boot.
/// The key_id is dated so rotation stays legible.
pub async fn ensure_server_key(store: &Arc<SqliteStore>) -> Result<KeyRecord, AuthError> {
    if let Some(existing) = store.get_signing_key(SERVER_IDENTITY_USER).await? {
        return Ok(existing);
    }

    let (private, public) = generate_ed25519();
    let record = KeyRecord {
        id: ids::key_record_id(),
        owner: SERVER_IDENTITY_USER.to_string(),
        key_id: format!("server-{}", Utc::now().format("%Y-%m")),
        algorithm: KeyAlgorithm::Ed25519,
        public_key: public,
        private_key: Some(private),
        created_at: Utc::now(),
        expires_at: None,
        deprecated: false,
    };
    store.insert_key(record.clone()).await?;
    Ok(record)
}

/// Generate and persist a keypair for a newly created local user.
pub async fn provision_user_key(
    store: &Arc<SqliteStore>,
    identity: &str,
) -> Result<KeyRecord, AuthError> {
    let (private, public) = generate_ed25519();
    let record = KeyRecord {
        id: ids::key_record_id(),
        owner: identity.to_string(),
        key_id: "primary".to_string(),
        algorithm: KeyAlgorithm::Ed25519,
        public_key: public,
        private_key: Some(private),
        created_at: Utc::now(),
        expires_at: None,
        deprecated: false,
    };
    store.insert_key(record.clone()).await?;
    Ok(record)
}
