//! In-memory table of announced peers with liveness expiry

use crate::error::Result;
use crate::protocol::{now_millis, required, PeerInfo};
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// A peer known to the rendezvous service
#[derive(Debug, Clone, PartialEq)]
pub struct Peer {
    /// Opaque identity chosen by the client
    pub peer_id: String,
    /// Human readable name
    pub display_name: String,
    /// Monotonic time of the last announce (drives expiry)
    pub last_seen: Instant,
    /// Wall-clock time of the last announce, epoch milliseconds
    pub last_seen_ms: u64,
}

impl Peer {
    /// Wire representation
    pub fn to_info(&self) -> PeerInfo {
        PeerInfo {
            peer_id: self.peer_id.clone(),
            name: self.display_name.clone(),
            last_seen: self.last_seen_ms,
        }
    }
}

/// Registry of announced peers
///
/// Entries are upserted on announce and removed by [`PeerRegistry::sweep`]
/// once they have been silent for longer than the liveness timeout.
pub struct PeerRegistry {
    peers: DashMap<String, Peer>,
    liveness_timeout: Duration,
}

impl PeerRegistry {
    pub fn new(liveness_timeout: Duration) -> Self {
        Self {
            peers: DashMap::new(),
            liveness_timeout,
        }
    }

    /// Announce a peer, refreshing its liveness
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if the id or display name is missing or blank.
    pub fn announce(
        &self,
        peer_id: Option<String>,
        display_name: Option<String>,
    ) -> Result<Peer> {
        self.announce_at(peer_id, display_name, Instant::now())
    }

    /// Announce with an explicit clock reading
    pub fn announce_at(
        &self,
        peer_id: Option<String>,
        display_name: Option<String>,
        now: Instant,
    ) -> Result<Peer> {
        let peer_id = required("peerId", peer_id)?;
        let display_name = required("name", display_name)?;

        let peer = Peer {
            peer_id: peer_id.clone(),
            display_name,
            last_seen: now,
            last_seen_ms: now_millis(),
        };

        if self.peers.insert(peer_id, peer.clone()).is_none() {
            info!(peer_id = %peer.peer_id, name = %peer.display_name, "Peer registered");
        } else {
            debug!(peer_id = %peer.peer_id, "Peer refreshed");
        }

        Ok(peer)
    }

    /// Snapshot of all live peers (order irrelevant)
    pub fn list(&self) -> Vec<Peer> {
        self.peers.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Look up a single peer
    pub fn get(&self, peer_id: &str) -> Option<Peer> {
        self.peers.get(peer_id).map(|entry| entry.value().clone())
    }

    /// Remove peers silent for longer than the liveness timeout
    ///
    /// Returns the number of removed entries.
    pub fn sweep(&self, now: Instant) -> usize {
        let timeout = self.liveness_timeout;
        let before = self.peers.len();

        self.peers.retain(|peer_id, peer| {
            let alive = now.saturating_duration_since(peer.last_seen) <= timeout;
            if !alive {
                info!(peer_id = %peer_id, "Removing inactive peer");
            }
            alive
        });

        before.saturating_sub(self.peers.len())
    }

    /// Number of registered peers
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Configured liveness timeout
    pub fn liveness_timeout(&self) -> Duration {
        self.liveness_timeout
    }
}
