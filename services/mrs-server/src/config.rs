//! Server configuration, loaded from `MRS_`-prefixed environment
//! variables with defaults suitable for local development.

use mrs::types::Geometry;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

#[derive(Debug, Clone)]
pub struct Settings {
    /// Public base URL of this server; also the `origin_server` stamped
    /// on every locally-created registration.
    pub server_url: String,
    /// Domain portion of identities managed by this server.
    pub server_domain: String,
    pub admin_email: String,

    pub host: String,
    pub port: u16,
    pub database_path: String,

    /// Manually configured peers, loaded at startup as permanent.
    pub bootstrap_peers: Vec<String>,
    /// Regions this server advertises as authoritative.
    pub authoritative_regions: Vec<Geometry>,

    pub max_radius: f64,
    pub max_results: usize,

    pub token_expiry_hours: i64,
    pub key_cache_ttl_seconds: u64,
    pub tombstone_retention_days: i64,

    pub sync_interval_seconds: u64,
    pub peer_refresh_interval_seconds: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8000".to_string(),
            server_domain: "localhost".to_string(),
            admin_email: "admin@localhost".to_string(),
            host: "0.0.0.0".to_string(),
            port: 8000,
            database_path: "./mrs.db".to_string(),
            bootstrap_peers: Vec::new(),
            authoritative_regions: Vec::new(),
            max_radius: 1_000_000.0,
            max_results: 100,
            token_expiry_hours: 24 * 7,
            key_cache_ttl_seconds: 3600,
            tombstone_retention_days: 30,
            sync_interval_seconds: 30,
            peer_refresh_interval_seconds: 300,
        }
    }
}

impl Settings {
    /// Load configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Settings::default();

        Ok(Settings {
            server_url: env_string("MRS_SERVER_URL", &defaults.server_url)
                .trim_end_matches('/')
                .to_string(),
            server_domain: env_string("MRS_SERVER_DOMAIN", &defaults.server_domain),
            admin_email: env_string("MRS_ADMIN_EMAIL", &defaults.admin_email),
            host: env_string("MRS_HOST", &defaults.host),
            port: env_parse("MRS_PORT", defaults.port)?,
            database_path: env_string("MRS_DATABASE_PATH", &defaults.database_path),
            bootstrap_peers: env_json("MRS_BOOTSTRAP_PEERS", Vec::new())?,
            authoritative_regions: env_json("MRS_AUTHORITATIVE_REGIONS", Vec::new())?,
            max_radius: env_parse("MRS_MAX_RADIUS", defaults.max_radius)?,
            max_results: env_parse("MRS_MAX_RESULTS", defaults.max_results)?,
            token_expiry_hours: env_parse("MRS_TOKEN_EXPIRY_HOURS", defaults.token_expiry_hours)?,
            key_cache_ttl_seconds: env_parse(
                "MRS_KEY_CACHE_TTL_SECONDS",
                defaults.key_cache_ttl_seconds,
            )?,
            tombstone_retention_days: env_parse(
                "MRS_TOMBSTONE_RETENTION_DAYS",
                defaults.tombstone_retention_days,
            )?,
            sync_interval_seconds: env_parse(
                "MRS_SYNC_INTERVAL_SECONDS",
                defaults.sync_interval_seconds,
            )?,
            peer_refresh_interval_seconds: env_parse(
                "MRS_PEER_REFRESH_INTERVAL_SECONDS",
                defaults.peer_refresh_interval_seconds,
            )?,
        })
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue(key.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}

fn env_json<T: serde::de::DeserializeOwned>(key: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => serde_json::from_str(&raw)
            .map_err(|e| ConfigError::InvalidValue(key.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert_eq!(s.port, 8000);
        assert_eq!(s.max_radius, 1_000_000.0);
        assert_eq!(s.tombstone_retention_days, 30);
        assert!(s.bootstrap_peers.is_empty());
    }
}
