//! Node identity module
//!
//! 160-bit identifiers and the XOR distance used to rank them.

use crate::error::{DhtError, Result};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Length in bytes of node ids and infohashes
pub const ID_LEN: usize = 20;

/// Length in bytes of generated transaction ids
pub const TRANSACTION_ID_LEN: usize = 2;

/// Fill a buffer of `len` bytes from the OS-seeded CSPRNG
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

/// DHT node identifier (20 bytes)
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub [u8; ID_LEN]);

impl NodeId {
    /// Create a new NodeId from bytes
    pub fn new(id: [u8; ID_LEN]) -> Self {
        Self(id)
    }

    /// Generate a random NodeId
    pub fn random() -> Self {
        let mut id = [0u8; ID_LEN];
        rand::thread_rng().fill_bytes(&mut id);
        Self(id)
    }

    /// Parse a NodeId from a byte slice, which must be exactly 20 bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let id: [u8; ID_LEN] = bytes.try_into().map_err(|_| {
            DhtError::validation_error_with_field(
                format!("identifier must be {} bytes, got {}", ID_LEN, bytes.len()),
                "id",
            )
        })?;
        Ok(Self(id))
    }

    /// Get the NodeId as bytes
    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    /// Get the NodeId as a hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a NodeId from a hex string
    pub fn from_hex(hex_str: &str) -> Option<Self> {
        hex::decode(hex_str).ok().and_then(|bytes| Self::from_bytes(&bytes).ok())
    }

    /// XOR distance to another id
    pub fn distance(&self, other: &NodeId) -> Distance {
        let mut d = [0u8; ID_LEN];
        for (i, byte) in d.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Distance(d)
    }

    /// An id sharing the first `prefix` bytes with `target` and the rest with `self`
    pub fn neighbor(&self, target: &NodeId, prefix: usize) -> NodeId {
        let prefix = prefix.min(ID_LEN);
        let mut id = self.0;
        id[..prefix].copy_from_slice(&target.0[..prefix]);
        NodeId(id)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.to_hex())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// XOR distance between two identifiers.
///
/// Compared as a 160-bit big-endian integer, so the derived `Ord` is a
/// total order in which identical ids rank closest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Distance(pub [u8; ID_LEN]);

/// Distance between two ids
pub fn distance(a: &NodeId, b: &NodeId) -> Distance {
    a.distance(b)
}
