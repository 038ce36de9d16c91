//! Announced peer store
//!
//! Peers that announced themselves for an infohash, kept for a limited time.

use crate::dht::id::NodeId;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// How long an announcement stays valid
pub const PEER_ANNOUNCE_LIFETIME: Duration = Duration::from_secs(30 * 60);

/// Cap on stored peers per infohash
pub const MAX_PEERS_PER_INFOHASH: usize = 1000;

#[derive(Debug, Clone)]
struct AnnouncedPeer {
    addr: SocketAddr,
    announced_at: Instant,
}

/// Peers keyed by infohash
#[derive(Debug, Default)]
pub struct PeerStore {
    peers: HashMap<NodeId, Vec<AnnouncedPeer>>,
}

impl PeerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an announcement; re-announcing refreshes the entry
    pub fn add(&mut self, info_hash: NodeId, addr: SocketAddr) {
        self.add_at(info_hash, addr, Instant::now());
    }

    fn add_at(&mut self, info_hash: NodeId, addr: SocketAddr, now: Instant) {
        let peers = self.peers.entry(info_hash).or_default();
        peers.retain(|p| is_live(p, now) && p.addr != addr);
        if peers.len() < MAX_PEERS_PER_INFOHASH {
            peers.push(AnnouncedPeer {
                addr,
                announced_at: now,
            });
        }
    }

    /// Live peers for an infohash
    pub fn get(&mut self, info_hash: &NodeId) -> Vec<SocketAddr> {
        self.get_at(info_hash, Instant::now())
    }

    fn get_at(&mut self, info_hash: &NodeId, now: Instant) -> Vec<SocketAddr> {
        let Some(peers) = self.peers.get_mut(info_hash) else {
            return Vec::new();
        };
        peers.retain(|p| is_live(p, now));
        let live: Vec<SocketAddr> = peers.iter().map(|p| p.addr).collect();
        if live.is_empty() {
            self.peers.remove(info_hash);
        }
        live
    }

    /// Drop expired announcements and the infohashes left without any.
    /// Returns how many infohashes were removed.
    pub fn purge_expired(&mut self) -> usize {
        self.purge_at(Instant::now())
    }

    fn purge_at(&mut self, now: Instant) -> usize {
        let before = self.peers.len();
        self.peers.retain(|_, peers| {
            peers.retain(|p| is_live(p, now));
            !peers.is_empty()
        });
        before - self.peers.len()
    }

    /// Number of infohashes with at least one entry
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

fn is_live(peer: &AnnouncedPeer, now: Instant) -> bool {
    now.saturating_duration_since(peer.announced_at) < PEER_ANNOUNCE_LIFETIME
}
