//! Peer metadata refresh.
//!
//! On an interval, fetch each known peer's `/.well-known/mrs` and
//! update its hint, authoritative regions, and `last_seen`. Fetch
//! failures are logged and never remove a peer; `last_seen` simply
//! stops advancing. New peers listed by a peer are learned, bounded.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::interval;
use tracing::{debug, warn};

use mrs::types::{Peer, WellKnownMrs};

use crate::peer_store::Peers;

const FETCH_TIMEOUT: Duration = Duration::from_secs(5);
/// Upper bound on peers learned from other peers' metadata.
const MAX_KNOWN_PEERS: usize = 64;

pub async fn run_peer_refresh_loop(
    peers: Arc<Peers>,
    http: reqwest::Client,
    self_url: String,
    period: Duration,
) {
    tracing::info!("Starting peer refresh loop (interval: {:?})", period);
    let mut ticker = interval(period);

    loop {
        ticker.tick().await;
        let snapshot = peers.snapshot().await;
        for peer in snapshot.iter() {
            if let Err(e) = refresh_peer(&peers, &http, &self_url, peer).await {
                warn!("Peer refresh failed for {}: {}", peer.server_url, e);
            }
        }
    }
}

pub async fn refresh_peer(
    peers: &Peers,
    http: &reqwest::Client,
    self_url: &str,
    peer: &Peer,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let url = format!("{}/.well-known/mrs", peer.server_url.trim_end_matches('/'));
    let metadata: WellKnownMrs = http
        .get(&url)
        .timeout(FETCH_TIMEOUT)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    peers
        .update_metadata(
            &peer.server_url,
            None,
            Some(metadata.authoritative_regions),
            Utc::now(),
        )
        .await?;
    debug!("Refreshed peer metadata for {}", peer.server_url);

    // Learn peers the peer knows about, without marking them configured.
    let known = peers.snapshot().await;
    if known.len() >= MAX_KNOWN_PEERS {
        return Ok(());
    }
    for info in metadata.known_peers {
        let server = info.server.trim_end_matches('/').to_string();
        if server == self_url || known.iter().any(|p| p.server_url == server) {
            continue;
        }
        peers
            .upsert(Peer {
                server_url: server,
                hint: info.hint,
                last_seen: None,
                is_configured: false,
                authoritative_regions: None,
                sync_cursor: None,
            })
            .await?;
    }

    Ok(())
}
