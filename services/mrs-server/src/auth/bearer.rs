//! Bearer token authentication and local-user credentials.

use std::sync::Arc;

use chrono::{Duration, Utc};

use mrs::types::TokenResponse;

use crate::identity_store::UserRecord;
use crate::ids;
use crate::store::SqliteStore;

use super::AuthError;

pub fn hash_password(password: &str) -> Result<String, AuthError> {
    bcrypt::hash(password, bcrypt::DEFAULT_COST).map_err(|e| AuthError::Hashing(e.to_string()))
}

pub fn verify_password(password: &str, password_hash: &str) -> bool {
    bcrypt::verify(password, password_hash).unwrap_or(false)
}

/// Check a local user's password and return the identity.
pub async fn authenticate_user(
    store: &Arc<SqliteStore>,
    username: &str,
    password: &str,
    domain: &str,
) -> Result<String, AuthError> {
    let identity = format!("{}@{}", username, domain);
    let user = store
        .get_user(&identity)
        .await?
        .filter(|u| u.is_local)
        .ok_or(AuthError::InvalidCredentials)?;

    let hash = user.password_hash.ok_or(AuthError::InvalidCredentials)?;
    if !verify_password(password, &hash) {
        return Err(AuthError::InvalidCredentials);
    }
    Ok(identity)
}

/// Mint a bearer token for a user.
pub async fn create_token(
    store: &Arc<SqliteStore>,
    user_id: &str,
    expiry_hours: i64,
) -> Result<TokenResponse, AuthError> {
    let token = ids::bearer_token();
    let expires_at = Some(Utc::now() + Duration::hours(expiry_hours));
    store.insert_token(&token, user_id, expires_at).await?;
    Ok(TokenResponse { token, expires_at })
}

/// Validate a bearer token and return the bound user.
pub async fn validate_token(
    store: &Arc<SqliteStore>,
    token: &str,
) -> Result<UserRecord, AuthError> {
    let record = store
        .get_token(token)
        .await?
        .ok_or(AuthError::InvalidToken)?;

    if let Some(expires_at) = record.expires_at {
        if expires_at < Utc::now() {
            return Err(AuthError::TokenExpired);
        }
    }
    Ok(record.user)
}
