//! HTTP message signatures (RFC 9421 profile).
//!
//! Covered components are `@method`, `@path`, `content-digest` (when a
//! body is present), and `mrs-identity`; additional plain header
//! components are accepted. Supported algorithms: `ed25519` and
//! `ecdsa-p256-sha256`.
//!
//! The signature base is reconstructed line by line:
//!
//! ```text
//! "@method": POST
//! "@path": /register
//! "content-digest": sha-256=:...:
//! "mrs-identity": alice@a.example
//! "@signature-params": ("@method" "@path" ...);created=...;keyid="..."
//! ```

use axum::http::HeaderMap;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::Verifier;
use sha2::{Digest, Sha256};

use mrs::types::{KeyAlgorithm, PublishedKey};

use super::AuthError;

/// Parsed `Signature-Input` header.
#[derive(Debug, Clone)]
pub struct SignatureInput {
    pub label: String,
    pub components: Vec<String>,
    pub keyid: String,
    pub created: i64,
    pub alg: Option<String>,
    /// The raw serialized inner list and parameters, reused verbatim as
    /// the `@signature-params` base line.
    pub serialized: String,
}

/// Parse a `Signature-Input` header value.
pub fn parse_signature_input(value: &str) -> Result<SignatureInput, AuthError> {
    let (label, rest) = value
        .split_once('=')
        .ok_or_else(|| malformed("Signature-Input has no label"))?;
    let label = label.trim().to_string();
    let rest = rest.trim();

    if !rest.starts_with('(') {
        return Err(malformed("Signature-Input must start with a component list"));
    }
    let close = rest
        .find(')')
        .ok_or_else(|| malformed("unterminated component list"))?;
    let inner = &rest[1..close];

    let mut components = Vec::new();
    for item in inner.split_whitespace() {
        let name = item
            .strip_prefix('"')
            .and_then(|s| s.strip_suffix('"'))
            .ok_or_else(|| malformed("component names must be quoted"))?;
        components.push(name.to_string());
    }

    let mut keyid = None;
    let mut created = None;
    let mut alg = None;
    for param in rest[close + 1..].split(';') {
        let param = param.trim();
        if param.is_empty() {
            continue;
        }
        let (key, raw) = param
            .split_once('=')
            .ok_or_else(|| malformed("bad signature parameter"))?;
        let raw = raw.trim();
        let unquoted = raw
            .strip_prefix('"')
            .and_then(|s| s.strip_suffix('"'))
            .unwrap_or(raw);
        match key.trim() {
            "keyid" => keyid = Some(unquoted.to_string()),
            "created" => {
                created = Some(
                    unquoted
                        .parse::<i64>()
                        .map_err(|_| malformed("created must be an integer timestamp"))?,
                )
            }
            "alg" => alg = Some(unquoted.to_string()),
            // Unknown parameters are preserved in `serialized` and
            // otherwise ignored.
            _ => {}
        }
    }

    Ok(SignatureInput {
        label,
        components,
        keyid: keyid.ok_or_else(|| malformed("keyid parameter is required"))?,
        created: created.ok_or_else(|| malformed("created parameter is required"))?,
        alg,
        serialized: rest.to_string(),
    })
}

/// Parse a `Signature` header (`label=:base64:`) for the given label.
pub fn parse_signature_header(value: &str, label: &str) -> Result<Vec<u8>, AuthError> {
    let (header_label, rest) = value
        .split_once('=')
        .ok_or_else(|| malformed("Signature has no label"))?;
    if header_label.trim() != label {
        return Err(malformed("Signature label does not match Signature-Input"));
    }
    let rest = rest.trim();
    let b64 = rest
        .strip_prefix(':')
        .and_then(|s| s.strip_suffix(':'))
        .ok_or_else(|| malformed("Signature value must be a byte sequence"))?;
    BASE64
        .decode(b64)
        .map_err(|_| malformed("Signature is not valid base64"))
}

/// `Content-Digest` value for a body.
pub fn content_digest(body: &[u8]) -> String {
    format!("sha-256=:{}:", BASE64.encode(Sha256::digest(body)))
}

/// Recompute the body digest and compare byte-for-byte with the header.
pub fn verify_content_digest(header_value: &str, body: &[u8]) -> Result<(), AuthError> {
    let expected: [u8; 32] = Sha256::digest(body).into();

    for entry in header_value.split(',') {
        let entry = entry.trim();
        if let Some(b64) = entry
            .strip_prefix("sha-256=:")
            .and_then(|s| s.strip_suffix(':'))
        {
            let claimed = BASE64
                .decode(b64)
                .map_err(|_| AuthError::DigestMismatch)?;
            if claimed == expected {
                return Ok(());
            }
            return Err(AuthError::DigestMismatch);
        }
    }
    Err(AuthError::DigestMismatch)
}

/// Reconstruct the signature base for verification.
pub fn build_signature_base(
    input: &SignatureInput,
    method: &str,
    path: &str,
    headers: &HeaderMap,
) -> Result<String, AuthError> {
    let mut lines = Vec::with_capacity(input.components.len() + 1);
    for component in &input.components {
        let value = match component.as_str() {
            "@method" => method.to_ascii_uppercase(),
            "@path" => path.to_string(),
            name if name.starts_with('@') => {
                return Err(malformed(&format!(
                    "unsupported derived component {}",
                    name
                )))
            }
            name => headers
                .get(name)
                .ok_or_else(|| malformed(&format!("covered header {} is absent", name)))?
                .to_str()
                .map_err(|_| malformed(&format!("covered header {} is not ascii", name)))?
                .trim()
                .to_string(),
        };
        lines.push(format!("\"{}\": {}", component, value));
    }
    lines.push(format!("\"@signature-params\": {}", input.serialized));
    Ok(lines.join("\n"))
}

pub fn algorithm_from_rfc9421(alg: &str) -> Option<KeyAlgorithm> {
    match alg {
        "ed25519" => Some(KeyAlgorithm::Ed25519),
        "ecdsa-p256-sha256" => Some(KeyAlgorithm::EcdsaP256),
        _ => None,
    }
}

pub fn rfc9421_name(algorithm: KeyAlgorithm) -> &'static str {
    match algorithm {
        KeyAlgorithm::Ed25519 => "ed25519",
        KeyAlgorithm::EcdsaP256 => "ecdsa-p256-sha256",
    }
}

/// Verify `signature` over `base` with a published key.
pub fn verify_with_published_key(
    key: &PublishedKey,
    base: &[u8],
    signature: &[u8],
) -> Result<(), AuthError> {
    let key_bytes = BASE64
        .decode(&key.public_key)
        .map_err(|_| AuthError::KeyUnavailable("key material is not base64".to_string()))?;
    verify_signature_bytes(key.algorithm, &key_bytes, base, signature)
}

pub fn verify_signature_bytes(
    algorithm: KeyAlgorithm,
    public_key: &[u8],
    base: &[u8],
    signature: &[u8],
) -> Result<(), AuthError> {
    match algorithm {
        KeyAlgorithm::Ed25519 => {
            let key_bytes: [u8; 32] = public_key
                .try_into()
                .map_err(|_| AuthError::KeyUnavailable("bad Ed25519 key length".to_string()))?;
            let verifying = ed25519_dalek::VerifyingKey::from_bytes(&key_bytes)
                .map_err(|_| AuthError::KeyUnavailable("bad Ed25519 key".to_string()))?;
            let sig = ed25519_dalek::Signature::from_slice(signature)
                .map_err(|_| AuthError::VerificationFailed)?;
            verifying
                .verify(base, &sig)
                .map_err(|_| AuthError::VerificationFailed)
        }
        KeyAlgorithm::EcdsaP256 => {
            use p256::ecdsa::signature::Verifier as _;
            let verifying = p256::ecdsa::VerifyingKey::from_sec1_bytes(public_key)
                .map_err(|_| AuthError::KeyUnavailable("bad P-256 key".to_string()))?;
            let sig = p256::ecdsa::Signature::from_slice(signature)
                .map_err(|_| AuthError::VerificationFailed)?;
            verifying
                .verify(base, &sig)
                .map_err(|_| AuthError::VerificationFailed)
        }
    }
}

/// Sign an outbound request with an Ed25519 key, returning the headers
/// to attach. Used for peer-authenticated sync pulls.
pub fn sign_request(
    signing_key: &ed25519_dalek::SigningKey,
    identity: &str,
    keyid: &str,
    method: &str,
    path: &str,
    body: Option<&[u8]>,
) -> Vec<(String, String)> {
    use ed25519_dalek::Signer;

    let mut components = vec!["@method".to_string(), "@path".to_string()];
    let mut headers = vec![("mrs-identity".to_string(), identity.to_string())];

    if let Some(body) = body {
        components.push("content-digest".to_string());
        headers.push(("content-digest".to_string(), content_digest(body)));
    }
    components.push("mrs-identity".to_string());

    let component_list = components
        .iter()
        .map(|c| format!("\"{}\"", c))
        .collect::<Vec<_>>()
        .join(" ");
    let serialized = format!(
        "({});created={};keyid=\"{}\";alg=\"ed25519\"",
        component_list,
        chrono::Utc::now().timestamp(),
        keyid
    );

    let mut lines = Vec::new();
    for component in &components {
        let value = match component.as_str() {
            "@method" => method.to_ascii_uppercase(),
            "@path" => path.to_string(),
            name => headers
                .iter()
                .find(|(h, _)| h == name)
                .map(|(_, v)| v.clone())
                .unwrap_or_default(),
        };
        lines.push(format!("\"{}\": {}", component, value));
    }
    lines.push(format!("\"@signature-params\": {}", serialized));
    let base = lines.join("\n");

    let signature = signing_key.sign(base.as_bytes());
    headers.push(("signature-input".to_string(), format!("sig1={}", serialized)));
    headers.push((
        "signature".to_string(),
        format!("sig1=:{}:", BASE64.encode(signature.to_bytes())),
    ));
    headers
}

fn malformed(msg: &str) -> AuthError {
    AuthError::MalformedSignature(msg.to_string())
}
