//! Remote identity key fetch-and-cache.
//!
//! Cache key is the key URL (fragment stripped). Entries expire after a
//! TTL; verification failures invalidate explicitly. Concurrent misses
//! on the same URL coalesce behind a per-key mutex, so one fetch serves
//! all waiters.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, RwLock};

use mrs::types::{KeyResponse, PublishedKey};

use super::AuthError;

const FETCH_TIMEOUT: Duration = Duration::from_secs(5);

#[async_trait]
pub trait KeyFetcher: Send + Sync {
    async fn fetch(&self, key_url: &str) -> Result<KeyResponse, AuthError>;
}

/// Fetches published keys over HTTP(S).
pub struct HttpKeyFetcher {
    http: reqwest::Client,
}

impl HttpKeyFetcher {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl KeyFetcher for HttpKeyFetcher {
    async fn fetch(&self, key_url: &str) -> Result<KeyResponse, AuthError> {
        let response = self
            .http
            .get(key_url)
            .timeout(FETCH_TIMEOUT)
            .send()
            .await
            .map_err(|e| AuthError::KeyFetch(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AuthError::KeyFetch(format!(
                "{} returned {}",
                key_url,
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| AuthError::KeyFetch(e.to_string()))
    }
}

struct CachedEntry {
    keys: Vec<PublishedKey>,
    fetched_at: Instant,
}

pub struct KeyCache {
    fetcher: Arc<dyn KeyFetcher>,
    ttl: Duration,
    entries: RwLock<HashMap<String, CachedEntry>>,
    inflight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyCache {
    pub fn new(fetcher: Arc<dyn KeyFetcher>, ttl: Duration) -> Self {
        Self {
            fetcher,
            ttl,
            entries: RwLock::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Get the published keys at `key_url`, fetching on miss or expiry.
    pub async fn get(&self, key_url: &str) -> Result<Vec<PublishedKey>, AuthError> {
        if let Some(keys) = self.lookup(key_url).await {
            return Ok(keys);
        }

        // Single-flight: one mutex per key URL. The first waiter fetches,
        // later waiters find the cache populated on re-check.
        let gate = {
            let mut inflight = self.inflight.lock().await;
            Arc::clone(
                inflight
                    .entry(key_url.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };
        let _held = gate.lock().await;

        if let Some(keys) = self.lookup(key_url).await {
            return Ok(keys);
        }

        let result = self.fetcher.fetch(key_url).await;
        {
            let mut inflight = self.inflight.lock().await;
            inflight.remove(key_url);
        }
        let response = result?;

        let keys = response.keys;
        self.entries.write().await.insert(
            key_url.to_string(),
            CachedEntry {
                keys: keys.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(keys)
    }

    pub async fn invalidate(&self, key_url: &str) {
        self.entries.write().await.remove(key_url);
    }

    async fn lookup(&self, key_url: &str) -> Option<Vec<PublishedKey>> {
        let entries = self.entries.read().await;
        let entry = entries.get(key_url)?;
        if entry.fetched_at.elapsed() > self.ttl {
            return None;
        }
        Some(entry.keys.clone())
    }
}

/// Pick the usable key from a published set.
///
/// With a `#key_id` fragment the named key is selected; otherwise the
/// first non-deprecated, non-expired key wins. Rotated and expired keys
/// are never returned.
pub fn select_key(keys: &[PublishedKey], fragment: Option<&str>) -> Option<PublishedKey> {
    let now = Utc::now();
    let usable = |k: &&PublishedKey| {
        !k.deprecated && k.expires.map(|exp| exp > now).unwrap_or(true)
    };

    match fragment {
        Some(key_id) => keys.iter().filter(usable).find(|k| k.key_id == key_id),
        None => keys.iter().find(usable),
    }
    .cloned()
}
