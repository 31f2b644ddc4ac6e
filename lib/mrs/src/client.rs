//! MRS HTTP client.
//!
//! `MrsClient` talks to a single server; `search_federated` follows the
//! referrals a server returns, depth-first with a visited set so
//! referral cycles terminate. Referral fan-out is a client concern by
//! design: servers only hand out hints.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crate::error::MrsError;
use crate::geo;
use crate::types::{
    ErrorResponse, Location, SearchRequest, SearchResponse, SearchResult, WellKnownMrs,
};

const DEFAULT_MAX_DEPTH: usize = 3;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

pub struct MrsClient {
    http: reqwest::Client,
    max_depth: usize,
}

impl Default for MrsClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MrsClient {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Search a single server.
    pub async fn search(
        &self,
        server: &str,
        location: &Location,
        range: f64,
    ) -> Result<SearchResponse, MrsError> {
        let url = format!("{}/search", server.trim_end_matches('/'));
        let request = SearchRequest {
            location: *location,
            range,
        };
        let response = self
            .http
            .post(&url)
            .timeout(REQUEST_TIMEOUT)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let err: ErrorResponse = response.json().await?;
            return Err(MrsError::ServerError(err.message, err.error));
        }

        Ok(response.json().await?)
    }

    /// Fetch a server's well-known metadata.
    pub async fn well_known(&self, server: &str) -> Result<WellKnownMrs, MrsError> {
        let url = format!("{}/.well-known/mrs", server.trim_end_matches('/'));
        let response = self
            .http
            .get(&url)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    /// Federated search: query `root`, then follow referrals depth-first.
    ///
    /// Cycles are broken by a visited set, depth is bounded, results are
    /// deduplicated by canonical identity, and the merged set is ordered
    /// the same way a single server orders its own results (ascending
    /// volume, then distance, then id). Unreachable referral targets are
    /// skipped, not fatal.
    pub async fn search_federated(
        &self,
        root: &str,
        location: &Location,
        range: f64,
    ) -> Result<Vec<SearchResult>, MrsError> {
        let mut visited: HashSet<String> = HashSet::new();
        let mut stack: Vec<(String, usize)> = vec![(normalize_server(root), 0)];
        let mut merged: HashMap<(String, String), SearchResult> = HashMap::new();

        while let Some((server, depth)) = stack.pop() {
            if !visited.insert(server.clone()) {
                continue;
            }

            let response = match self.search(&server, location, range).await {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!("Federated search skipping {}: {}", server, e);
                    continue;
                }
            };

            for result in response.results {
                let key = (result.origin_server.clone(), result.origin_id.clone());
                match merged.get(&key) {
                    Some(existing)
                        if (existing.version, existing.updated)
                            >= (result.version, result.updated) => {}
                    _ => {
                        merged.insert(key, result);
                    }
                }
            }

            if depth + 1 > self.max_depth {
                continue;
            }
            for referral in response.referrals {
                let target = normalize_server(&referral.server);
                if !visited.contains(&target) {
                    stack.push((target, depth + 1));
                }
            }
        }

        let mut results: Vec<SearchResult> = merged.into_values().collect();
        results.sort_by(|a, b| {
            geo::volume(&a.space)
                .partial_cmp(&geo::volume(&b.space))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    a.distance
                        .partial_cmp(&b.distance)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(results)
    }
}

fn normalize_server(server: &str) -> String {
    server.trim_end_matches('/').to_string()
}
