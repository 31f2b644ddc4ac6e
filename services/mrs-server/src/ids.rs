//! Random identifier and token generation.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;

/// URL-safe random string from `n` random bytes.
pub fn random_urlsafe(n: usize) -> String {
    let mut bytes = vec![0u8; n];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// `reg_` + 16 URL-safe chars.
pub fn registration_id() -> String {
    format!("reg_{}", random_urlsafe(12))
}

/// `key_` + 12 URL-safe chars.
pub fn key_record_id() -> String {
    format!("key_{}", random_urlsafe(9))
}

/// Opaque bearer token.
pub fn bearer_token() -> String {
    random_urlsafe(32)
}

/// Short correlation id for internal-error logs.
pub fn correlation_id() -> String {
    random_urlsafe(6)
}
