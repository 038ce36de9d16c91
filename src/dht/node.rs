//! DHT node module
//!
//! Represents a remote node in the DHT network and its compact encoding.

use crate::dht::id::{Distance, NodeId, ID_LEN};
use crate::error::{DhtError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::{Duration, Instant};

/// Size of one compact node record: 20-byte id + 4-byte IPv4 + 2-byte port
pub const COMPACT_NODE_LEN: usize = ID_LEN + 6;

/// Liveness classification of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Good,
    Dubious,
    Bad,
}

impl NodeStatus {
    /// The status one step further down after a stale period
    pub fn degraded(self) -> Self {
        match self {
            NodeStatus::Good => NodeStatus::Dubious,
            NodeStatus::Dubious | NodeStatus::Bad => NodeStatus::Bad,
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeStatus::Good => write!(f, "good"),
            NodeStatus::Dubious => write!(f, "dubious"),
            NodeStatus::Bad => write!(f, "bad"),
        }
    }
}

/// Represents a DHT node
#[derive(Debug, Clone)]
pub struct Node {
    /// Node identifier
    pub id: NodeId,
    /// Node address
    pub addr: SocketAddr,
    /// Liveness status
    pub status: NodeStatus,
    /// Last confirmed activity
    pub last_change: Instant,
}

impl Node {
    /// Create a new node in the good state
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            status: NodeStatus::Good,
            last_change: Instant::now(),
        }
    }

    /// A node may enter the routing table only if it has a routable IPv4
    /// address and a port strictly between 0 and 65535.
    pub fn is_valid(&self) -> bool {
        match self.addr.ip() {
            IpAddr::V4(ip) => !ip.is_unspecified() && self.addr.port() > 0 && self.addr.port() < u16::MAX,
            IpAddr::V6(_) => false,
        }
    }

    /// Calculate XOR distance to an id
    pub fn distance_to(&self, other: &NodeId) -> Distance {
        self.id.distance(other)
    }

    /// True iff this node carries the given id
    pub fn identifies(&self, id: &NodeId) -> bool {
        self.id == *id
    }

    /// Whether the node has been silent longer than `threshold` at `now`
    pub fn is_stale(&self, now: Instant, threshold: Duration) -> bool {
        now.saturating_duration_since(self.last_change) > threshold
    }

    /// Record traffic from the node's address without touching its status
    pub fn touch(&mut self, now: Instant) {
        self.last_change = now;
    }

    /// Record confirmed activity: fresh timestamp, back to good
    pub fn mark_active(&mut self, now: Instant) {
        self.last_change = now;
        self.status = NodeStatus::Good;
    }

    /// Step the status down one level and return the new status
    pub fn degrade(&mut self) -> NodeStatus {
        self.status = self.status.degraded();
        self.status
    }

    /// Serializable view of the node for diagnostics
    pub fn snapshot(&self) -> NodeSnapshot {
        NodeSnapshot {
            id: self.id.to_hex(),
            address: self.addr.ip().to_string(),
            port: self.addr.port(),
            status: self.status,
            seconds_since_change: self.last_change.elapsed().as_secs(),
        }
    }

    /// Compact encoding: id ‖ IPv4 ‖ big-endian port
    pub fn encode(&self) -> Result<[u8; COMPACT_NODE_LEN]> {
        let v4 = match self.addr {
            SocketAddr::V4(v4) => v4,
            SocketAddr::V6(_) => {
                return Err(DhtError::validation_error_with_field(
                    "IPv6 addresses not supported in compact format",
                    "address",
                ))
            }
        };
        let mut buf = [0u8; COMPACT_NODE_LEN];
        buf[..ID_LEN].copy_from_slice(self.id.as_bytes());
        buf[ID_LEN..ID_LEN + 4].copy_from_slice(&v4.ip().octets());
        buf[ID_LEN + 4..].copy_from_slice(&v4.port().to_be_bytes());
        Ok(buf)
    }

    /// Decode one compact record
    pub fn decode(chunk: &[u8; COMPACT_NODE_LEN]) -> Self {
        let mut id = [0u8; ID_LEN];
        id.copy_from_slice(&chunk[..ID_LEN]);
        let ip = Ipv4Addr::new(chunk[20], chunk[21], chunk[22], chunk[23]);
        let port = u16::from_be_bytes([chunk[24], chunk[25]]);
        Node::new(NodeId(id), SocketAddr::V4(SocketAddrV4::new(ip, port)))
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Node {}

impl std::hash::Hash for Node {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} [{}, {}s ago]",
            self.id,
            self.addr,
            self.status,
            self.last_change.elapsed().as_secs()
        )
    }
}

/// Point-in-time description of a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub id: String,
    pub address: String,
    pub port: u16,
    pub status: NodeStatus,
    pub seconds_since_change: u64,
}

/// Loosely typed node description, as handed over by a bootstrap list or
/// a surrounding process before it has been checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    pub id: Vec<u8>,
    pub address: String,
    pub port: u32,
}

impl TryFrom<NodeRecord> for Node {
    type Error = DhtError;

    fn try_from(record: NodeRecord) -> Result<Self> {
        let id = NodeId::from_bytes(&record.id)?;
        if record.address.is_empty() {
            return Err(DhtError::validation_error_with_field("address is empty", "address"));
        }
        let ip: IpAddr = record.address.parse()?;
        let port = u16::try_from(record.port)
            .map_err(|_| DhtError::validation_error_with_field(format!("port {} out of range", record.port), "port"))?;
        Ok(Node::new(id, SocketAddr::new(ip, port)))
    }
}

/// Concatenate the compact records of every IPv4 node
pub fn encode_nodes<'a>(nodes: impl IntoIterator<Item = &'a Node>) -> Vec<u8> {
    let mut buffer = Vec::new();
    for node in nodes {
        match node.encode() {
            Ok(record) => buffer.extend_from_slice(&record),
            Err(e) => tracing::debug!("Skipping node {} in compact list: {}", node.id, e),
        }
    }
    buffer
}

/// Decode a compact node list in 26-byte strides; a short trailing
/// fragment is dropped.
pub fn decode_nodes(data: &[u8]) -> Vec<Node> {
    data.chunks_exact(COMPACT_NODE_LEN)
        .filter_map(|chunk| <&[u8; COMPACT_NODE_LEN]>::try_from(chunk).ok())
        .map(Node::decode)
        .collect()
}
