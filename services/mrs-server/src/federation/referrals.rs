//! Referral generation for federated search.
//!
//! Configured peers are always referred; learned peers only when one of
//! their advertised authoritative regions intersects the query. The
//! ordering is stable so identical searches return identical referral
//! lists, and the hard cap bounds client fan-out.

use mrs::geo;
use mrs::types::{Location, Peer, Referral};

/// Hard cap on referrals per search.
pub const REFERRAL_CAP: usize = 16;

pub fn generate_referrals(
    peers: &[Peer],
    self_url: &str,
    location: &Location,
    range: f64,
) -> Vec<Referral> {
    let mut relevant: Vec<&Peer> = peers
        .iter()
        .filter(|peer| peer.server_url != self_url)
        .filter(|peer| peer.is_configured || peer_covers_area(peer, location, range))
        .collect();

    // Configured before learned, then freshest first, then URL for
    // determinism.
    relevant.sort_by(|a, b| {
        b.is_configured
            .cmp(&a.is_configured)
            .then_with(|| b.last_seen.cmp(&a.last_seen))
            .then_with(|| a.server_url.cmp(&b.server_url))
    });
    relevant.truncate(REFERRAL_CAP);

    relevant
        .into_iter()
        .map(|peer| Referral {
            server: peer.server_url.clone(),
            hint: peer.hint.clone(),
        })
        .collect()
}

fn peer_covers_area(peer: &Peer, location: &Location, range: f64) -> bool {
    peer.authoritative_regions
        .as_ref()
        .map(|regions| {
            regions
                .iter()
                .any(|region| geo::intersects(region, location, range))
        })
        .unwrap_or(false)
}
