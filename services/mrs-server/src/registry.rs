//! Registry service: register, release, and search orchestration.
//!
//! Canonical metadata is assigned here. Locally-created records get
//! `origin_server = this server`, `origin_id = id`, `version = 1`;
//! updates are permitted only to the owner, only on the origin, and
//! bump the version monotonically. Search performs the coarse-then-
//! precise filter, canonical dedupe, tombstone shadowing, and the
//! deterministic inside-out ordering.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;

use mrs::geo;
use mrs::types::{
    ChangeKind, ErrorCode, Geometry, Location, Registration, RegistrationRequest, SearchResult,
    Tombstone,
};
use mrs::validation::{self, ValidationError};

use crate::ids;
use crate::store::{SqliteStore, StoreError};

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("service_point is required unless foad is true")]
    MissingServicePoint,

    #[error("foad registrations must not carry a service_point")]
    ServicePointWithFoad,

    #[error("radius exceeds this server's maximum of {0} meters")]
    RadiusTooLarge(f64),

    #[error("range exceeds this server's maximum of {0} meters")]
    RangeTooLarge(f64),

    #[error("range must be a non-negative number")]
    InvalidRange,

    #[error("Registration not found: {0}")]
    NotFound(String),

    #[error("Not authorized for this registration")]
    Forbidden,

    #[error("This server is not authoritative for the registration")]
    NotAuthoritative { origin_server: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RegistryError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RegistryError::Validation(e) => e.code(),
            RegistryError::MissingServicePoint => ErrorCode::MissingField,
            RegistryError::ServicePointWithFoad => ErrorCode::TypeMismatch,
            RegistryError::RadiusTooLarge(_)
            | RegistryError::RangeTooLarge(_)
            | RegistryError::InvalidRange => ErrorCode::InvalidGeometry,
            RegistryError::NotFound(_) => ErrorCode::NotFound,
            RegistryError::Forbidden => ErrorCode::Forbidden,
            RegistryError::NotAuthoritative { .. } => ErrorCode::NotAuthoritative,
            RegistryError::Store(_) => ErrorCode::Internal,
        }
    }

    /// Extra payload for the error response, if any.
    pub fn detail(&self) -> Option<serde_json::Value> {
        match self {
            RegistryError::NotAuthoritative { origin_server } => {
                Some(serde_json::json!({ "origin_server": origin_server }))
            }
            _ => None,
        }
    }
}

pub struct RegistryService {
    store: Arc<SqliteStore>,
    server_url: String,
    max_radius: f64,
    max_results: usize,
}

impl RegistryService {
    pub fn new(
        store: Arc<SqliteStore>,
        server_url: String,
        max_radius: f64,
        max_results: usize,
    ) -> Self {
        Self {
            store,
            server_url,
            max_radius,
            max_results,
        }
    }

    // ==================== Register ====================

    /// Create or update a registration on behalf of `caller`.
    pub async fn register(
        &self,
        request: RegistrationRequest,
        caller: &str,
    ) -> Result<Registration, RegistryError> {
        validation::validate_geometry(&request.space)?;
        if let Geometry::Sphere { radius, .. } = &request.space {
            if *radius > self.max_radius {
                return Err(RegistryError::RadiusTooLarge(self.max_radius));
            }
        }

        // service_point iff not foad.
        let service_point = match (&request.service_point, request.foad) {
            (None, false) => return Err(RegistryError::MissingServicePoint),
            (Some(_), true) => return Err(RegistryError::ServicePointWithFoad),
            (None, true) => None,
            (Some(uri), false) => Some(validation::validate_service_point(uri)?),
        };

        // A canonical-ID hint naming another origin is a replica write.
        if let Some(origin_server) = &request.origin_server {
            if origin_server != &self.server_url {
                return Err(RegistryError::NotAuthoritative {
                    origin_server: origin_server.clone(),
                });
            }
        }

        let update_id = request
            .id
            .clone()
            .or_else(|| request.origin_id.clone());

        match update_id {
            Some(id) => {
                self.update_registration(&id, request.space, service_point, request.foad, caller)
                    .await
            }
            None => {
                self.create_registration(request.space, service_point, request.foad, caller)
                    .await
            }
        }
    }

    async fn create_registration(
        &self,
        space: Geometry,
        service_point: Option<String>,
        foad: bool,
        caller: &str,
    ) -> Result<Registration, RegistryError> {
        let id = ids::registration_id();
        let now = Utc::now();
        let registration = Registration {
            id: id.clone(),
            space,
            service_point,
            foad,
            owner: caller.to_string(),
            origin_server: self.server_url.clone(),
            origin_id: id,
            version: 1,
            created: now,
            updated: now,
            replicated_from: None,
            last_synced_at: None,
        };
        self.store
            .put_registration(registration.clone(), ChangeKind::Created)
            .await?;
        Ok(registration)
    }

    async fn update_registration(
        &self,
        id: &str,
        space: Geometry,
        service_point: Option<String>,
        foad: bool,
        caller: &str,
    ) -> Result<Registration, RegistryError> {
        let existing = self
            .store
            .get_registration(id)
            .await?
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        if existing.origin_server != self.server_url {
            return Err(RegistryError::NotAuthoritative {
                origin_server: existing.origin_server,
            });
        }
        if existing.owner != caller {
            return Err(RegistryError::Forbidden);
        }

        let updated = Registration {
            space,
            service_point,
            foad,
            version: existing.version + 1,
            updated: Utc::now(),
            // owner, created, and canonical identity are immutable.
            ..existing
        };
        self.store
            .put_registration(updated.clone(), ChangeKind::Updated)
            .await?;
        Ok(updated)
    }

    // ==================== Release ====================

    pub async fn release(&self, id: &str, caller: &str) -> Result<(), RegistryError> {
        let existing = self
            .store
            .get_registration(id)
            .await?
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        if existing.origin_server != self.server_url {
            return Err(RegistryError::NotAuthoritative {
                origin_server: existing.origin_server,
            });
        }
        if existing.owner != caller {
            return Err(RegistryError::Forbidden);
        }

        let tombstone = Tombstone {
            origin_server: existing.origin_server,
            origin_id: existing.origin_id,
            version: existing.version,
            deleted_at: Utc::now(),
        };
        self.store.release_registration(id, tombstone).await?;
        Ok(())
    }

    // ==================== Search ====================

    pub async fn search(
        &self,
        location: &Location,
        range: f64,
    ) -> Result<Vec<SearchResult>, RegistryError> {
        validation::validate_location(location)?;
        if !range.is_finite() || range < 0.0 {
            return Err(RegistryError::InvalidRange);
        }
        if range > self.max_radius {
            return Err(RegistryError::RangeTooLarge(self.max_radius));
        }

        let query_bbox = geo::bounding_box_for_search(location, range);
        let candidates = self.store.query_bbox(query_bbox).await?;

        // Precise filter, then exact distances.
        let mut matched: Vec<(Registration, f64)> = candidates
            .into_iter()
            .filter(|reg| geo::intersects(&reg.space, location, range))
            .map(|reg| {
                let distance = geo::distance_to_geometry(&reg.space, location);
                (reg, distance)
            })
            .collect();

        matched = dedupe_candidates(matched);

        // Tombstone shadow: a matching tombstone at or above the
        // candidate's version drops it.
        let mut surviving = Vec::with_capacity(matched.len());
        for (reg, distance) in matched {
            let shadowed = self
                .store
                .get_tombstone(&reg.origin_server, &reg.origin_id)
                .await?
                .map(|t| t.version >= reg.version)
                .unwrap_or(false);
            if !shadowed {
                surviving.push((reg, distance));
            }
        }

        // Inside-out: smallest volume first, then distance, then id.
        surviving.sort_by(|(a, da), (b, db)| {
            geo::volume(&a.space)
                .partial_cmp(&geo::volume(&b.space))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| da.partial_cmp(db).unwrap_or(std::cmp::Ordering::Equal))
                .then_with(|| a.id.cmp(&b.id))
        });
        surviving.truncate(self.max_results);

        Ok(surviving
            .into_iter()
            .map(|(reg, distance)| to_search_result(reg, distance))
            .collect())
    }

    pub async fn registrations_by_owner(
        &self,
        owner: &str,
    ) -> Result<Vec<Registration>, RegistryError> {
        Ok(self.store.registrations_by_owner(owner).await?)
    }
}

fn to_search_result(reg: Registration, distance: f64) -> SearchResult {
    SearchResult {
        id: reg.id,
        space: reg.space,
        // FOAD results carry no service_point (it is absent by I1).
        service_point: if reg.foad { None } else { reg.service_point },
        foad: reg.foad,
        distance,
        owner: reg.owner,
        origin_server: reg.origin_server,
        origin_id: reg.origin_id,
        version: reg.version,
        created: reg.created,
        updated: reg.updated,
    }
}

#[derive(PartialEq, Eq, Hash)]
enum GroupKey {
    Canonical(String, String),
    Legacy(usize),
}

/// Collapse copies of the same canonical record to a single winner.
///
/// Records with canonical metadata group on `(origin_server, origin_id)`.
/// Legacy records (no canonical metadata, possible in ingested foreign
/// data) group by normalized service_point plus near-identical geometry.
/// The winner is the highest version, then the latest update, then the
/// origin-held copy.
pub(crate) fn dedupe_candidates(
    candidates: Vec<(Registration, f64)>,
) -> Vec<(Registration, f64)> {
    let mut legacy_reps: Vec<Registration> = Vec::new();
    let mut groups: HashMap<GroupKey, (Registration, f64)> = HashMap::new();

    for (reg, distance) in candidates {
        let key = if !reg.origin_server.is_empty() && !reg.origin_id.is_empty() {
            GroupKey::Canonical(reg.origin_server.clone(), reg.origin_id.clone())
        } else {
            let slot = match legacy_reps.iter().position(|rep| legacy_match(rep, &reg)) {
                Some(found) => found,
                None => {
                    legacy_reps.push(reg.clone());
                    legacy_reps.len() - 1
                }
            };
            GroupKey::Legacy(slot)
        };

        match groups.get(&key) {
            Some((winner, _)) if !beats(&reg, winner) => {}
            _ => {
                groups.insert(key, (reg, distance));
            }
        }
    }

    groups.into_values().collect()
}

/// Dedupe winner ordering: version, then updated, then prefer the copy
/// held by its origin (not a replica).
fn beats(challenger: &Registration, incumbent: &Registration) -> bool {
    let challenger_rank = (
        challenger.version,
        challenger.updated,
        challenger.replicated_from.is_none(),
    );
    let incumbent_rank = (
        incumbent.version,
        incumbent.updated,
        incumbent.replicated_from.is_none(),
    );
    challenger_rank > incumbent_rank
}

fn legacy_match(a: &Registration, b: &Registration) -> bool {
    if normalize_service_point(a.service_point.as_deref())
        != normalize_service_point(b.service_point.as_deref())
    {
        return false;
    }
    match (&a.space, &b.space) {
        (
            Geometry::Sphere {
                center: ca,
                radius: ra,
            },
            Geometry::Sphere {
                center: cb,
                radius: rb,
            },
        ) => geo::distance_3d(ca, cb) <= 1.0 && (ra - rb).abs() <= 1.0,
        (ga, gb) => ga == gb,
    }
}

fn normalize_service_point(uri: Option<&str>) -> Option<String> {
    uri.map(|u| u.trim_end_matches('/').to_ascii_lowercase())
}
