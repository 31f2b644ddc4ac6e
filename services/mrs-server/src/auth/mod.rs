//! Request authentication.
//!
//! Every protected operation presents either a bearer token or an HTTP
//! message signature (RFC 9421). Both paths resolve to an identity
//! string `user@domain` plus an `is_local` flag. The signature path
//! binds the claimed identity to its domain: the host of `keyid` must
//! equal the identity's domain, and the key is fetched from that host.

pub mod bearer;
pub mod key_cache;
pub mod keys;
pub mod signature;

use std::sync::Arc;

use axum::http::HeaderMap;
use thiserror::Error;

use mrs::types::ErrorCode;
use mrs::validation::{self, ValidationError};

use crate::store::{SqliteStore, StoreError};
use self::key_cache::KeyCache;
use self::signature::SignatureInput;

/// Clock skew allowance for signature `created`, seconds.
const MAX_SIGNATURE_AGE_SECS: i64 = 300;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Missing authentication credentials")]
    MissingCredentials,

    #[error("Invalid token")]
    InvalidToken,

    #[error("Token expired")]
    TokenExpired,

    #[error("Invalid username or password")]
    InvalidCredentials,

    #[error("Malformed signature: {0}")]
    MalformedSignature(String),

    #[error("Signature created timestamp outside allowed window")]
    StaleSignature,

    #[error("Key URL host does not match identity domain")]
    DomainMismatch,

    #[error("Content digest mismatch")]
    DigestMismatch,

    #[error("Signature verification failed")]
    VerificationFailed,

    #[error("No usable key: {0}")]
    KeyUnavailable(String),

    #[error("Key fetch failed: {0}")]
    KeyFetch(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Password hashing failed: {0}")]
    Hashing(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AuthError {
    pub fn code(&self) -> ErrorCode {
        match self {
            AuthError::Forbidden(_) => ErrorCode::Forbidden,
            AuthError::Store(_) | AuthError::Hashing(_) => ErrorCode::Internal,
            _ => ErrorCode::Unauthorized,
        }
    }
}

/// The authenticated caller.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub identity: String,
    pub is_local: bool,
    pub via_signature: bool,
}

impl AuthContext {
    /// True when the caller authenticated as a peer server identity
    /// (`_server@domain`), which is only meaningful on sync endpoints.
    pub fn is_server_identity(&self) -> bool {
        validation::is_server_identity(&self.identity)
    }
}

pub struct Authenticator {
    store: Arc<SqliteStore>,
    key_cache: Arc<KeyCache>,
    server_domain: String,
}

impl Authenticator {
    pub fn new(store: Arc<SqliteStore>, key_cache: Arc<KeyCache>, server_domain: String) -> Self {
        Self {
            store,
            key_cache,
            server_domain,
        }
    }

    /// Authenticate a request from its raw parts. The body is needed in
    /// exact bytes for `Content-Digest` verification.
    pub async fn authenticate(
        &self,
        method: &str,
        path: &str,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<AuthContext, AuthError> {
        if let Some(value) = headers.get(axum::http::header::AUTHORIZATION) {
            let raw = value
                .to_str()
                .map_err(|_| AuthError::InvalidToken)?
                .trim();
            let token = raw
                .strip_prefix("Bearer ")
                .ok_or(AuthError::InvalidToken)?;
            let user = bearer::validate_token(&self.store, token).await?;
            return Ok(AuthContext {
                identity: user.id,
                is_local: user.is_local,
                via_signature: false,
            });
        }

        if headers.contains_key("signature-input") {
            return self.authenticate_signature(method, path, headers, body).await;
        }

        Err(AuthError::MissingCredentials)
    }

    async fn authenticate_signature(
        &self,
        method: &str,
        path: &str,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<AuthContext, AuthError> {
        let input_raw = header_str(headers, "signature-input")?;
        let signature_raw = header_str(headers, "signature")?;
        let identity = header_str(headers, "mrs-identity")?;

        let input = signature::parse_signature_input(&input_raw)?;
        check_created(&input)?;
        check_covered_components(&input, !body.is_empty())?;

        let (_user, domain) = validation::parse_identity(&identity)?;

        // Identity binding: the key must live on the claimed domain.
        let keyid_url = url::Url::parse(&input.keyid)
            .map_err(|e| AuthError::MalformedSignature(format!("bad keyid: {}", e)))?;
        let key_host = keyid_url
            .host_str()
            .ok_or(AuthError::DomainMismatch)?
            .to_ascii_lowercase();
        if key_host != domain.to_ascii_lowercase() {
            return Err(AuthError::DomainMismatch);
        }

        if !body.is_empty() {
            let digest_header = header_str(headers, "content-digest")?;
            signature::verify_content_digest(&digest_header, body)?;
        }

        let sig_bytes = signature::parse_signature_header(&signature_raw, &input.label)?;
        let base = signature::build_signature_base(&input, method, path, headers)?;

        let fragment = keyid_url.fragment().map(str::to_string);
        let mut fetch_url = keyid_url.clone();
        fetch_url.set_fragment(None);
        let fetch_url = fetch_url.to_string();

        // Verification failure invalidates the cache and triggers one
        // refetch before failing, so key rotation does not strand
        // signers behind a stale cache entry.
        let mut refetched = false;
        loop {
            let keys = self.key_cache.get(&fetch_url).await?;
            let key = key_cache::select_key(&keys, fragment.as_deref())
                .ok_or_else(|| AuthError::KeyUnavailable(fetch_url.clone()))?;

            if let Some(alg) = &input.alg {
                if signature::algorithm_from_rfc9421(alg) != Some(key.algorithm) {
                    return Err(AuthError::VerificationFailed);
                }
            }

            match signature::verify_with_published_key(&key, base.as_bytes(), &sig_bytes) {
                Ok(()) => break,
                Err(_) if !refetched => {
                    self.key_cache.invalidate(&fetch_url).await;
                    refetched = true;
                }
                Err(e) => return Err(e),
            }
        }

        let is_local = domain.eq_ignore_ascii_case(&self.server_domain);
        if !is_local && !validation::is_server_identity(&identity) {
            self.store.ensure_remote_user(&identity).await?;
        }

        Ok(AuthContext {
            identity,
            is_local,
            via_signature: true,
        })
    }
}

fn header_str(headers: &HeaderMap, name: &str) -> Result<String, AuthError> {
    headers
        .get(name)
        .ok_or_else(|| AuthError::MalformedSignature(format!("missing {} header", name)))?
        .to_str()
        .map(|s| s.trim().to_string())
        .map_err(|_| AuthError::MalformedSignature(format!("non-ascii {} header", name)))
}

fn check_created(input: &SignatureInput) -> Result<(), AuthError> {
    let now = chrono::Utc::now().timestamp();
    if input.created > now + MAX_SIGNATURE_AGE_SECS
        || input.created < now - MAX_SIGNATURE_AGE_SECS
    {
        return Err(AuthError::StaleSignature);
    }
    Ok(())
}

fn check_covered_components(input: &SignatureInput, has_body: bool) -> Result<(), AuthError> {
    let mut required = vec!["@method", "@path", "mrs-identity"];
    if has_body {
        required.push("content-digest");
    }
    for component in required {
        if !input.components.iter().any(|c| c == component) {
            return Err(AuthError::MalformedSignature(format!(
                "signature must cover {}",
                component
            )));
        }
    }
    Ok(())
}
