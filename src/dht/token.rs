//! Announce tokens
//!
//! A get_peers responder hands out `SHA1(secret ‖ querier ip)` truncated to
//! eight bytes and accepts it back in announce_peer for as long as the
//! secret is current or one rotation old. Tokens handed to us by remote
//! responders are cached for about as long as the remote keeps accepting them.

use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

/// Length of issued tokens
pub const TOKEN_LEN: usize = 8;

/// Current and previous token secret
#[derive(Debug, Clone)]
pub struct TokenSecrets {
    current: [u8; 16],
    previous: [u8; 16],
}

impl TokenSecrets {
    pub fn new() -> Self {
        Self {
            current: rand::random(),
            previous: rand::random(),
        }
    }

    /// Retire the current secret; tokens issued under it stay valid for one more period
    pub fn rotate(&mut self) {
        self.previous = self.current;
        self.current = rand::random();
    }

    /// Token for a querier address
    pub fn issue(&self, ip: IpAddr) -> Vec<u8> {
        token_with_secret(&self.current, ip)
    }

    /// Whether `token` was issued to `ip` under the current or previous secret
    pub fn verify(&self, ip: IpAddr, token: &[u8]) -> bool {
        token == token_with_secret(&self.current, ip).as_slice()
            || token == token_with_secret(&self.previous, ip).as_slice()
    }
}

impl Default for TokenSecrets {
    fn default() -> Self {
        Self::new()
    }
}

fn token_with_secret(secret: &[u8; 16], ip: IpAddr) -> Vec<u8> {
    let mut hasher = Sha1::new();
    hasher.update(secret);
    match ip {
        IpAddr::V4(v4) => hasher.update(v4.octets()),
        IpAddr::V6(v6) => hasher.update(v6.octets()),
    }
    hasher.finalize()[..TOKEN_LEN].to_vec()
}

/// Tokens received from get_peers responders, keyed by responder address
#[derive(Debug)]
pub struct TokenCache {
    entries: HashMap<SocketAddr, (Vec<u8>, Instant)>,
    lifetime: Duration,
}

impl TokenCache {
    pub fn new(lifetime: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            lifetime,
        }
    }

    /// Remember the token `remote` issued us, dropping expired ones
    pub fn insert(&mut self, remote: SocketAddr, token: Vec<u8>, now: Instant) {
        self.prune(now);
        self.entries.insert(remote, (token, now));
    }

    /// The token `remote` issued us, if it is still fresh
    pub fn get(&self, remote: &SocketAddr, now: Instant) -> Option<Vec<u8>> {
        self.entries
            .get(remote)
            .filter(|(_, received)| now.saturating_duration_since(*received) < self.lifetime)
            .map(|(token, _)| token.clone())
    }

    /// Drop expired tokens; returns how many were removed
    pub fn prune(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        let lifetime = self.lifetime;
        self.entries
            .retain(|_, (_, received)| now.saturating_duration_since(*received) < lifetime);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
