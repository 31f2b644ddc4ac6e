//! Validation of untrusted protocol inputs.
//!
//! Everything arriving over the wire passes through here before it
//! reaches the registry. The service_point policy is security-oriented
//! and stricter than generic URI syntax.

use thiserror::Error;
use url::Url;

use crate::types::{ErrorCode, Geometry, Location};

const MAX_URI_LEN: usize = 2048;
const MAX_SPHERE_RADIUS: f64 = 1_000_000.0;
const MAX_USERNAME_LEN: usize = 64;

/// Reserved identity user for a server's own signing key. Only valid
/// inside key URLs and peer-signed sync requests, never as an owner.
pub const SERVER_IDENTITY_USER: &str = "_server";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("Invalid service_point URI: {0}")]
    InvalidUri(String),

    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),
}

impl ValidationError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ValidationError::InvalidGeometry(_) => ErrorCode::InvalidGeometry,
            ValidationError::InvalidUri(_) => ErrorCode::InvalidUri,
            ValidationError::InvalidIdentity(_) => ErrorCode::Unauthorized,
        }
    }
}

/// Validate a service_point URI.
///
/// Policy, enforced byte-wise: scheme exactly `https`, non-empty host,
/// no userinfo, no fragment, no whitespace or control characters,
/// length ≤ 2048, and the string must parse as an absolute URI.
pub fn validate_service_point(value: &str) -> Result<String, ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::InvalidUri(
            "service_point must not be empty".to_string(),
        ));
    }
    if value.len() > MAX_URI_LEN {
        return Err(ValidationError::InvalidUri(
            "service_point is too long".to_string(),
        ));
    }
    if value.chars().any(|c| c.is_whitespace()) {
        return Err(ValidationError::InvalidUri(
            "service_point must not contain whitespace".to_string(),
        ));
    }
    if value.chars().any(|c| (c as u32) < 0x20 || c as u32 == 0x7f) {
        return Err(ValidationError::InvalidUri(
            "service_point contains control characters".to_string(),
        ));
    }
    // The '@' and '#' checks below are byte-wise on the raw input so a
    // parser quirk can never smuggle userinfo or fragments through.
    if value.contains('#') {
        return Err(ValidationError::InvalidUri(
            "service_point must not include fragments".to_string(),
        ));
    }

    let parsed = Url::parse(value)
        .map_err(|e| ValidationError::InvalidUri(format!("service_point does not parse: {}", e)))?;

    if parsed.scheme() != "https" {
        return Err(ValidationError::InvalidUri(
            "service_point scheme must be https".to_string(),
        ));
    }
    if parsed.host_str().map(str::is_empty).unwrap_or(true) {
        return Err(ValidationError::InvalidUri(
            "service_point must include a host".to_string(),
        ));
    }
    if !parsed.username().is_empty() || parsed.password().is_some() {
        return Err(ValidationError::InvalidUri(
            "service_point must not include user credentials".to_string(),
        ));
    }

    Ok(value.to_string())
}

/// Parse an identity string `user@domain`.
///
/// `user` matches `[A-Za-z0-9_.-]{1,64}` (which admits the reserved
/// `_server`); `domain` must be a valid host. Callers decide where
/// `_server` identities are acceptable.
pub fn parse_identity(identity: &str) -> Result<(String, String), ValidationError> {
    let (user, domain) = identity.split_once('@').ok_or_else(|| {
        ValidationError::InvalidIdentity("identity must be user@domain".to_string())
    })?;

    validate_username(user)?;

    if domain.is_empty() || url::Host::parse(domain).is_err() {
        return Err(ValidationError::InvalidIdentity(format!(
            "invalid identity domain: {}",
            domain
        )));
    }

    Ok((user.to_string(), domain.to_string()))
}

/// Validate a bare username (the part before `@`).
pub fn validate_username(user: &str) -> Result<(), ValidationError> {
    if user.is_empty() || user.len() > MAX_USERNAME_LEN {
        return Err(ValidationError::InvalidIdentity(
            "username must be 1-64 characters".to_string(),
        ));
    }
    if !user
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-')
    {
        return Err(ValidationError::InvalidIdentity(
            "username contains invalid characters".to_string(),
        ));
    }
    Ok(())
}

pub fn is_server_identity(identity: &str) -> bool {
    identity
        .split_once('@')
        .map(|(user, _)| user == SERVER_IDENTITY_USER)
        .unwrap_or(false)
}

/// Validate a coordinate.
pub fn validate_location(location: &Location) -> Result<(), ValidationError> {
    if !location.lat.is_finite() || !(-90.0..=90.0).contains(&location.lat) {
        return Err(ValidationError::InvalidGeometry(format!(
            "latitude out of range: {}",
            location.lat
        )));
    }
    if !location.lon.is_finite() || !(-180.0..=180.0).contains(&location.lon) {
        return Err(ValidationError::InvalidGeometry(format!(
            "longitude out of range: {}",
            location.lon
        )));
    }
    if !location.ele.is_finite() {
        return Err(ValidationError::InvalidGeometry(
            "elevation must be finite".to_string(),
        ));
    }
    Ok(())
}

/// Validate a geometry against the protocol limits.
pub fn validate_geometry(geometry: &Geometry) -> Result<(), ValidationError> {
    match geometry {
        Geometry::Sphere { center, radius } => {
            validate_location(center)?;
            if !radius.is_finite() || *radius <= 0.0 || *radius > MAX_SPHERE_RADIUS {
                return Err(ValidationError::InvalidGeometry(format!(
                    "sphere radius out of range: {}",
                    radius
                )));
            }
        }
        Geometry::Polygon { vertices, height } => {
            if vertices.len() < 3 {
                return Err(ValidationError::InvalidGeometry(
                    "polygon needs at least 3 vertices".to_string(),
                ));
            }
            for v in vertices {
                validate_location(v)?;
            }
            if !height.is_finite() || *height < 0.0 {
                return Err(ValidationError::InvalidGeometry(format!(
                    "polygon height out of range: {}",
                    height
                )));
            }
            if !crate::geo::polygon_is_simple(vertices) {
                return Err(ValidationError::InvalidGeometry(
                    "polygon is self-intersecting".to_string(),
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_service_point() {
        assert!(validate_service_point("https://ex.example/soh").is_ok());
        assert!(validate_service_point("https://ex.example/path?q=1").is_ok());
        assert!(validate_service_point("https://ex.example:8443/").is_ok());
    }

    #[test]
    fn test_service_point_rejects_scheme() {
        assert!(validate_service_point("http://ex.example/").is_err());
        assert!(validate_service_point("ftp://ex.example/").is_err());
        assert!(validate_service_point("javascript:alert(1)").is_err());
    }

    #[test]
    fn test_service_point_rejects_userinfo() {
        assert!(validate_service_point("https://user@ex.example/").is_err());
        assert!(validate_service_point("https://user:pw@ex.example/").is_err());
    }

    #[test]
    fn test_service_point_rejects_fragment() {
        assert!(validate_service_point("https://ex.example/p#frag").is_err());
    }

    #[test]
    fn test_service_point_rejects_whitespace_and_controls() {
        assert!(validate_service_point("https://ex.example/a b").is_err());
        assert!(validate_service_point("https://ex.example/\t").is_err());
        assert!(validate_service_point("https://ex.example/\u{0000}").is_err());
        assert!(validate_service_point("https://ex.example/\u{007f}").is_err());
        assert!(validate_service_point("https://ex.example/a\nb").is_err());
    }

    #[test]
    fn test_service_point_rejects_empty_and_long() {
        assert!(validate_service_point("").is_err());
        let long = format!("https://ex.example/{}", "a".repeat(3000));
        assert!(validate_service_point(&long).is_err());
    }

    #[test]
    fn test_service_point_requires_host() {
        assert!(validate_service_point("https:///path").is_err());
    }

    #[test]
    fn test_parse_identity() {
        let (user, domain) = parse_identity("alice@a.example").unwrap();
        assert_eq!(user, "alice");
        assert_eq!(domain, "a.example");

        assert!(parse_identity("no-at-sign").is_err());
        assert!(parse_identity("@a.example").is_err());
        assert!(parse_identity("alice@").is_err());
        assert!(parse_identity("al ice@a.example").is_err());
    }

    #[test]
    fn test_parse_identity_accepts_server_user_syntax() {
        // The reserved user parses; callers gate where it is allowed.
        let (user, _) = parse_identity("_server@a.example").unwrap();
        assert_eq!(user, SERVER_IDENTITY_USER);
        assert!(is_server_identity("_server@a.example"));
        assert!(!is_server_identity("alice@a.example"));
    }

    #[test]
    fn test_username_length_limit() {
        assert!(validate_username(&"a".repeat(64)).is_ok());
        assert!(validate_username(&"a".repeat(65)).is_err());
        assert!(validate_username("").is_err());
    }

    #[test]
    fn test_validate_location_bounds() {
        assert!(validate_location(&Location::new(90.0, 180.0, 0.0)).is_ok());
        assert!(validate_location(&Location::new(90.1, 0.0, 0.0)).is_err());
        assert!(validate_location(&Location::new(0.0, -180.1, 0.0)).is_err());
        assert!(validate_location(&Location::new(f64::NAN, 0.0, 0.0)).is_err());
    }

    #[test]
    fn test_validate_sphere_radius() {
        let ok = Geometry::Sphere {
            center: Location::new(0.0, 0.0, 0.0),
            radius: 50.0,
        };
        assert!(validate_geometry(&ok).is_ok());

        let zero = Geometry::Sphere {
            center: Location::new(0.0, 0.0, 0.0),
            radius: 0.0,
        };
        assert!(validate_geometry(&zero).is_err());

        let huge = Geometry::Sphere {
            center: Location::new(0.0, 0.0, 0.0),
            radius: 1_000_001.0,
        };
        assert!(validate_geometry(&huge).is_err());
    }

    #[test]
    fn test_validate_polygon() {
        let degenerate = Geometry::Polygon {
            vertices: vec![Location::new(0.0, 0.0, 0.0), Location::new(0.0, 1.0, 0.0)],
            height: 1.0,
        };
        assert!(validate_geometry(&degenerate).is_err());

        let bowtie = Geometry::Polygon {
            vertices: vec![
                Location::new(0.0, 0.0, 0.0),
                Location::new(1.0, 1.0, 0.0),
                Location::new(0.0, 1.0, 0.0),
                Location::new(1.0, 0.0, 0.0),
            ],
            height: 1.0,
        };
        assert!(validate_geometry(&bowtie).is_err());

        let square = Geometry::Polygon {
            vertices: vec![
                Location::new(0.0, 0.0, 0.0),
                Location::new(0.0, 1.0, 0.0),
                Location::new(1.0, 1.0, 0.0),
                Location::new(1.0, 0.0, 0.0),
            ],
            height: 1.0,
        };
        assert!(validate_geometry(&square).is_ok());
    }
}
