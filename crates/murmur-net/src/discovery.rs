//! Bootstrap peer parsing.

use libp2p::{multiaddr::Protocol, Multiaddr, PeerId};
use tracing::{debug, warn};

/// Parse a comma- or whitespace-separated list of multiaddrs.
///
/// Malformed entries are logged and skipped.
pub fn parse_bootstrap_list(raw: &str) -> Vec<Multiaddr> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| match s.parse::<Multiaddr>() {
            Ok(addr) => {
                debug!(addr = %addr, "Loaded bootstrap peer");
                Some(addr)
            }
            Err(e) => {
                warn!(addr = %s, error = %e, "Skipping invalid multiaddr");
                None
            }
        })
        .collect()
}

/// Extract the `/p2p/<peer id>` component of a multiaddr, if present.
pub fn peer_id_of(addr: &Multiaddr) -> Option<PeerId> {
    addr.iter().find_map(|p| match p {
        Protocol::P2p(peer_id) => Some(peer_id),
        _ => None,
    })
}
