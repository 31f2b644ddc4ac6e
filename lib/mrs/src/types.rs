//! MRS wire model.
//!
//! Every struct here serializes with the canonical snake_case keys of the
//! protocol. Timestamps are UTC ISO-8601. The canonical identity of a
//! registration is the pair `(origin_server, origin_id)`, never `id`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ==================== Geometry ====================

/// A point in 3D space (WGS-84 degrees, meters).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lon: f64,
    #[serde(default)]
    pub ele: f64,
}

impl Location {
    pub fn new(lat: f64, lon: f64, ele: f64) -> Self {
        Self { lat, lon, ele }
    }
}

/// A bounded volume of space.
///
/// Tagged on `type`; servers advertise supported tags in their
/// well-known capabilities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Geometry {
    /// Sphere around `center`, radius in meters.
    Sphere { center: Location, radius: f64 },
    /// Footprint extruded vertically from the minimum vertex elevation.
    Polygon { vertices: Vec<Location>, height: f64 },
}

impl Geometry {
    pub fn type_name(&self) -> &'static str {
        match self {
            Geometry::Sphere { .. } => "sphere",
            Geometry::Polygon { .. } => "polygon",
        }
    }
}

/// Axis-aligned bounding box, precomputed per registration for the
/// coarse index lookup.
///
/// A box that straddles the antimeridian has `min_lon > max_lon` and
/// covers `[min_lon, 180] ∪ [-180, max_lon]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

impl BoundingBox {
    /// True if this box wraps across ±180 longitude.
    pub fn wraps(&self) -> bool {
        self.min_lon > self.max_lon
    }

    /// Split into non-wrapping rectangles (one, or two when wrapping).
    pub fn split(&self) -> Vec<BoundingBox> {
        if self.wraps() {
            vec![
                BoundingBox {
                    min_lat: self.min_lat,
                    max_lat: self.max_lat,
                    min_lon: self.min_lon,
                    max_lon: 180.0,
                },
                BoundingBox {
                    min_lat: self.min_lat,
                    max_lat: self.max_lat,
                    min_lon: -180.0,
                    max_lon: self.max_lon,
                },
            ]
        } else {
            vec![*self]
        }
    }

    pub fn contains(&self, point: &Location) -> bool {
        if point.lat < self.min_lat || point.lat > self.max_lat {
            return false;
        }
        if self.wraps() {
            point.lon >= self.min_lon || point.lon <= self.max_lon
        } else {
            point.lon >= self.min_lon && point.lon <= self.max_lon
        }
    }
}

// ==================== Registrations ====================

/// A registered space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registration {
    pub id: String,
    pub space: Geometry,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_point: Option<String>,
    #[serde(default)]
    pub foad: bool,
    pub owner: String,
    pub origin_server: String,
    pub origin_id: String,
    pub version: u64,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicated_from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl Registration {
    /// Canonical identity `(origin_server, origin_id)`.
    pub fn canonical_key(&self) -> (String, String) {
        (self.origin_server.clone(), self.origin_id.clone())
    }
}

/// Request body for `POST /register`.
///
/// With `id` present this is an owner-only update of an existing local
/// registration. A canonical-ID hint naming another origin is rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationRequest {
    pub space: Geometry,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_point: Option<String>,
    #[serde(default)]
    pub foad: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationResponse {
    pub status: String,
    pub registration: Registration,
}

impl RegistrationResponse {
    pub fn new(registration: Registration) -> Self {
        Self {
            status: "registered".to_string(),
            registration,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseRequest {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseResponse {
    pub status: String,
    pub id: String,
}

impl ReleaseResponse {
    pub fn new(id: String) -> Self {
        Self {
            status: "released".to_string(),
            id,
        }
    }
}

/// Delete marker, retained and replayed so replicas cannot resurrect a
/// released registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tombstone {
    pub origin_server: String,
    pub origin_id: String,
    pub version: u64,
    pub deleted_at: DateTime<Utc>,
}

// ==================== Search ====================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    pub location: Location,
    #[serde(default)]
    pub range: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub id: String,
    pub space: Geometry,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_point: Option<String>,
    pub foad: bool,
    /// 3-D distance in meters from the query point (sphere center, or
    /// nearest point of a polygon prism).
    pub distance: f64,
    pub owner: String,
    pub origin_server: String,
    pub origin_id: String,
    pub version: u64,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

/// A hint that another server may hold relevant registrations. The
/// client performs the fan-out, not the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Referral {
    pub server: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub status: String,
    pub results: Vec<SearchResult>,
    #[serde(default)]
    pub referrals: Vec<Referral>,
}

impl SearchResponse {
    pub fn new(results: Vec<SearchResult>, referrals: Vec<Referral>) -> Self {
        Self {
            status: "ok".to_string(),
            results,
            referrals,
        }
    }
}

// ==================== Sync ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

/// One entry of the `/sync/changes` event stream. `record` is present
/// for created/updated, `tombstone` for deleted. Cursors are opaque.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<Registration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tombstone: Option<Tombstone>,
    pub cursor: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSnapshotResponse {
    pub status: String,
    pub registrations: Vec<Registration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
    /// Change-log head when this page was generated. A puller adopts the
    /// first page's value as its delta start.
    pub as_of_cursor: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncChangesResponse {
    pub status: String,
    pub events: Vec<ChangeEvent>,
    pub next_cursor: String,
}

// ==================== Identity & keys ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyAlgorithm {
    Ed25519,
    #[serde(rename = "ECDSA-P256")]
    EcdsaP256,
}

impl KeyAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyAlgorithm::Ed25519 => "Ed25519",
            KeyAlgorithm::EcdsaP256 => "ECDSA-P256",
        }
    }
}

impl std::str::FromStr for KeyAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Ed25519" => Ok(KeyAlgorithm::Ed25519),
            "ECDSA-P256" => Ok(KeyAlgorithm::EcdsaP256),
            _ => Err(format!("Unknown key algorithm: {}", s)),
        }
    }
}

impl std::fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A public key as served at `/.well-known/mrs/keys/{identity}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishedKey {
    pub key_id: String,
    pub algorithm: KeyAlgorithm,
    /// Raw key bytes, base64.
    pub public_key: String,
    pub created: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deprecated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyResponse {
    /// Full identity (`user@domain`, or `_server@domain`).
    pub id: String,
    pub keys: Vec<PublishedKey>,
}

// ==================== Auth ====================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRegisterRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserLoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInfo {
    /// Full MRS identity (`user@domain`).
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub is_local: bool,
}

// ==================== Well-known ====================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerCapabilities {
    pub geometry_types: Vec<String>,
    pub max_radius: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    pub server: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WellKnownMrs {
    pub mrs_version: String,
    /// Must equal the configured public URL so reverse-proxy
    /// misconfiguration is detectable.
    pub server: String,
    pub operator: String,
    #[serde(default)]
    pub authoritative_regions: Vec<Geometry>,
    #[serde(default)]
    pub known_peers: Vec<PeerInfo>,
    pub capabilities: ServerCapabilities,
}

// ==================== Peers ====================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    pub server_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
    pub is_configured: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authoritative_regions: Option<Vec<Geometry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddPeerRequest {
    pub server_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

// ==================== Errors ====================

/// Stable error codes of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidGeometry,
    InvalidUri,
    MissingField,
    TypeMismatch,
    Unauthorized,
    Forbidden,
    NotAuthoritative,
    NotFound,
    Conflict,
    CursorExpired,
    RateLimited,
    PeerUnreachable,
    Internal,
}

/// User-visible error shape:
/// `{ "status": "error", "error": "<code>", "message": "...", "detail": {...} }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub status: String,
    pub error: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

impl ErrorResponse {
    pub fn new(error: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            error,
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry_tagged_serialization() {
        let sphere = Geometry::Sphere {
            center: Location::new(-33.8568, 151.2153, 0.0),
            radius: 50.0,
        };
        let json = serde_json::to_value(&sphere).unwrap();
        assert_eq!(json["type"], "sphere");
        assert_eq!(json["radius"], 50.0);
        assert_eq!(json["center"]["lat"], -33.8568);

        let parsed: Geometry = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, sphere);
    }

    #[test]
    fn test_polygon_geometry_roundtrip() {
        let poly = Geometry::Polygon {
            vertices: vec![
                Location::new(0.0, 0.0, 0.0),
                Location::new(0.0, 0.001, 0.0),
                Location::new(0.001, 0.001, 0.0),
            ],
            height: 10.0,
        };
        let json = serde_json::to_string(&poly).unwrap();
        assert!(json.contains("\"type\":\"polygon\""));
        let parsed: Geometry = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, poly);
    }

    #[test]
    fn test_bounding_box_wrap_split() {
        let plain = BoundingBox {
            min_lat: -1.0,
            max_lat: 1.0,
            min_lon: 10.0,
            max_lon: 20.0,
        };
        assert!(!plain.wraps());
        assert_eq!(plain.split().len(), 1);

        let wrapped = BoundingBox {
            min_lat: -1.0,
            max_lat: 1.0,
            min_lon: 179.5,
            max_lon: -179.5,
        };
        assert!(wrapped.wraps());
        let halves = wrapped.split();
        assert_eq!(halves.len(), 2);
        assert!(wrapped.contains(&Location::new(0.0, 179.9, 0.0)));
        assert!(wrapped.contains(&Location::new(0.0, -179.9, 0.0)));
        assert!(!wrapped.contains(&Location::new(0.0, 0.0, 0.0)));
    }

    #[test]
    fn test_registration_omits_absent_fields() {
        let reg = Registration {
            id: "reg_abc123def456".to_string(),
            space: Geometry::Sphere {
                center: Location::new(0.0, 0.0, 0.0),
                radius: 10.0,
            },
            service_point: None,
            foad: true,
            owner: "alice@a.example".to_string(),
            origin_server: "https://a.example".to_string(),
            origin_id: "reg_abc123def456".to_string(),
            version: 1,
            created: Utc::now(),
            updated: Utc::now(),
            replicated_from: None,
            last_synced_at: None,
        };
        let json = serde_json::to_string(&reg).unwrap();
        assert!(!json.contains("service_point"));
        assert!(!json.contains("replicated_from"));
    }

    #[test]
    fn test_error_code_wire_names() {
        assert_eq!(
            serde_json::to_string(&ErrorCode::NotAuthoritative).unwrap(),
            "\"not_authoritative\""
        );
        assert_eq!(
            serde_json::to_string(&ErrorCode::InvalidUri).unwrap(),
            "\"invalid_uri\""
        );
        assert_eq!(
            serde_json::to_string(&ErrorCode::CursorExpired).unwrap(),
            "\"cursor_expired\""
        );
    }

    #[test]
    fn test_key_algorithm_parse() {
        assert_eq!(
            "Ed25519".parse::<KeyAlgorithm>().unwrap(),
            KeyAlgorithm::Ed25519
        );
        assert_eq!(
            "ECDSA-P256".parse::<KeyAlgorithm>().unwrap(),
            KeyAlgorithm::EcdsaP256
        );
        assert!("RSA-PSS".parse::<KeyAlgorithm>().is_err());
    }
}
