//! DHT routing table module
//!
//! A flat table of known nodes. Closest-k lookups sort a copy of the
//! node list by XOR distance; liveness is tracked per node and aged by a
//! periodic sweep.

use crate::dht::id::NodeId;
use crate::dht::message::KrpcMessage;
use crate::dht::node::{Node, NodeRecord, NodeStatus};
use crate::dht::rpc::ResponseObserver;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, trace};

/// Routing table shared between the receive loop, the handlers and the check task
pub type SharedTable = Arc<RwLock<RoutingTable>>;

/// A status transition made by a sweep
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub id: NodeId,
    pub addr: SocketAddr,
    pub status: NodeStatus,
}

/// Flat routing table
#[derive(Debug)]
pub struct RoutingTable {
    /// Our node ID
    pub our_id: NodeId,
    /// Silence after which a node is degraded
    pub stale_after: Duration,
    nodes: Vec<Node>,
}

impl RoutingTable {
    /// Create a new routing table
    pub fn new(our_id: NodeId, stale_after: Duration) -> Self {
        Self {
            our_id,
            stale_after,
            nodes: Vec::new(),
        }
    }

    /// Get the number of nodes in the routing table
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Add a node if it is valid and its id is not present yet
    pub fn add(&mut self, node: Node) -> bool {
        if !node.is_valid() {
            trace!("Rejecting invalid node {} at {}", node.id, node.addr);
            return false;
        }
        if self.has(&node.id) {
            return false;
        }
        self.nodes.push(node);
        true
    }

    /// Add every node of a list; returns how many were admitted
    pub fn add_all(&mut self, nodes: impl IntoIterator<Item = Node>) -> usize {
        nodes.into_iter().filter(|n| self.add(n.clone())).count()
    }

    /// Coerce a loosely typed record and add it
    pub fn add_record(&mut self, record: NodeRecord) -> bool {
        match Node::try_from(record) {
            Ok(node) => self.add(node),
            Err(e) => {
                trace!("Rejecting node record: {}", e);
                false
            }
        }
    }

    /// True iff some stored node carries this id
    pub fn has(&self, id: &NodeId) -> bool {
        self.nodes.iter().any(|n| n.identifies(id))
    }

    /// Find a node by ID
    pub fn find(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.iter().find(|n| n.identifies(id))
    }

    /// Remove a node from the routing table
    pub fn remove(&mut self, id: &NodeId) -> Option<Node> {
        let pos = self.nodes.iter().position(|n| n.identifies(id))?;
        Some(self.nodes.remove(pos))
    }

    /// All nodes, in insertion order
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// The `k` nodes closest to `target`, nearest first. The sort is stable,
    /// so equally distant nodes keep their insertion order.
    pub fn get(&self, target: &NodeId, k: usize) -> Vec<Node> {
        let mut nodes = self.nodes.clone();
        nodes.sort_by_key(|n| n.distance_to(target));
        nodes.truncate(k);
        nodes
    }

    /// Stamp activity on every node at `from`; returns how many matched.
    /// Status is left alone: only [`RoutingTable::confirm`] restores good.
    pub fn refresh(&mut self, from: SocketAddr, now: Instant) -> usize {
        let mut matched = 0;
        for node in self.nodes.iter_mut().filter(|n| n.addr == from) {
            node.touch(now);
            matched += 1;
        }
        matched
    }

    /// Reset a node to good after it proved alive
    pub fn confirm(&mut self, id: &NodeId, now: Instant) -> bool {
        match self.nodes.iter_mut().find(|n| n.identifies(id)) {
            Some(node) => {
                node.mark_active(now);
                true
            }
            None => false,
        }
    }

    /// One pass of the liveness state machine at `now`.
    ///
    /// Bad nodes are pruned first; every remaining node silent for longer
    /// than `stale_after` then steps down exactly one level. The returned
    /// changes are the nodes that should be pinged.
    pub fn sweep(&mut self, now: Instant) -> Vec<StatusChange> {
        let before = self.nodes.len();
        self.nodes.retain(|n| n.status != NodeStatus::Bad);
        let pruned = before - self.nodes.len();

        let stale_after = self.stale_after;
        let changes: Vec<StatusChange> = self
            .nodes
            .iter_mut()
            .filter(|n| n.is_stale(now, stale_after))
            .map(|n| StatusChange {
                id: n.id,
                addr: n.addr,
                status: n.degrade(),
            })
            .collect();

        if pruned > 0 || !changes.is_empty() {
            debug!(
                "Routing table sweep: pruned {} bad node(s), degraded {}, {} remaining",
                pruned,
                changes.len(),
                self.nodes.len()
            );
        }
        changes
    }
}

/// Keeps responsive nodes fresh: every observed response stamps the nodes
/// registered at the sender's address.
pub struct TableRefresher(pub SharedTable);

#[async_trait]
impl ResponseObserver for TableRefresher {
    async fn on_response(&self, _message: &KrpcMessage, from: SocketAddr) {
        let matched = self.0.write().await.refresh(from, Instant::now());
        if matched > 0 {
            trace!("Refreshed {} node(s) at {}", matched, from);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIFTEEN_MINUTES: Duration = Duration::from_secs(15 * 60);

    fn table() -> RoutingTable {
        RoutingTable::new(NodeId::new([1u8; 20]), FIFTEEN_MINUTES)
    }

    fn node(id: [u8; 20], port: u16) -> Node {
        Node::new(NodeId::new(id), format!("127.0.0.1:{}", port).parse().unwrap())
    }

    #[test]
    fn test_routing_table_new() {
        let table = table();
        assert_eq!(table.our_id, NodeId::new([1u8; 20]));
        assert!(table.is_empty());
    }

    #[test]
    fn test_add_node() {
        let mut table = table();
        assert!(table.add(node([2u8; 20], 6881)));
        assert_eq!(table.len(), 1);
        assert!(table.has(&NodeId::new([2u8; 20])));
    }

    #[test]
    fn test_add_is_idempotent_by_id() {
        let mut table = table();
        assert!(table.add(node([2u8; 20], 6881)));
        assert!(!table.add(node([2u8; 20], 7000)));
        assert_eq!(table.len(), 1);
        assert_eq!(table.find(&NodeId::new([2u8; 20])).unwrap().addr.port(), 6881);
    }

    #[test]
    fn test_add_rejects_invalid_nodes() {
        let mut table = table();
        assert!(!table.add(node([2u8; 20], 0)));
        assert!(!table.add(node([3u8; 20], 65535)));
        assert!(!table.add_record(NodeRecord { id: vec![4u8; 20], address: "127.0.0.1".into(), port: 65536 }));
        assert!(!table.add_record(NodeRecord { id: vec![5u8; 20], address: String::new(), port: 6881 }));
        assert!(!table.add_record(NodeRecord { id: vec![6u8; 19], address: "127.0.0.1".into(), port: 6881 }));
        assert!(table.is_empty());
        assert!(table.add_record(NodeRecord { id: vec![7u8; 20], address: "127.0.0.1".into(), port: 6881 }));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_add_all_counts_admitted() {
        let mut table = table();
        let nodes = vec![node([2u8; 20], 1), node([2u8; 20], 2), node([3u8; 20], 0), node([4u8; 20], 4)];
        assert_eq!(table.add_all(nodes), 2);
    }

    #[test]
    fn test_remove_node() {
        let mut table = table();
        table.add(node([2u8; 20], 6881));
        assert!(table.remove(&NodeId::new([2u8; 20])).is_some());
        assert!(table.remove(&NodeId::new([2u8; 20])).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_get_returns_at_most_k_sorted() {
        let mut table = table();
        for i in 0..20u8 {
            let mut id = [0u8; 20];
            id[0] = i.wrapping_mul(37);
            id[19] = i;
            table.add(node(id, 6000 + i as u16));
        }
        let target = NodeId::random();
        let closest = table.get(&target, 8);
        assert_eq!(closest.len(), 8);
        for pair in closest.windows(2) {
            assert!(pair[0].distance_to(&target) <= pair[1].distance_to(&target));
        }
    }

    #[test]
    fn test_get_returns_all_when_fewer_than_k() {
        let mut table = table();
        table.add(node([2u8; 20], 1));
        table.add(node([3u8; 20], 2));
        assert_eq!(table.get(&NodeId::new([0u8; 20]), 8).len(), 2);
    }

    #[test]
    fn test_get_sorted_by_distance() {
        let mut table = table();
        table.add(node([0xF0u8; 20], 6881));
        table.add(node([0x0Fu8; 20], 6882));
        table.add(node([0xFFu8; 20], 6883));

        let closest = table.get(&NodeId::new([0xFFu8; 20]), 8);
        assert_eq!(closest[0].id, NodeId::new([0xFFu8; 20]));
        assert_eq!(closest[1].id, NodeId::new([0xF0u8; 20]));
        assert_eq!(closest[2].id, NodeId::new([0x0Fu8; 20]));
    }

    #[test]
    fn test_refresh_matches_address() {
        let mut table = table();
        table.add(node([2u8; 20], 6881));
        table.add(node([3u8; 20], 6882));
        let later = Instant::now() + Duration::from_secs(60);
        assert_eq!(table.refresh("127.0.0.1:6882".parse().unwrap(), later), 1);
        assert_eq!(table.find(&NodeId::new([3u8; 20])).unwrap().last_change, later);
        assert_ne!(table.find(&NodeId::new([2u8; 20])).unwrap().last_change, later);
    }

    #[test]
    fn test_refresh_does_not_restore_status() {
        let mut table = table();
        table.add(node([2u8; 20], 6881));
        let start = table.nodes()[0].last_change;
        table.sweep(start + Duration::from_secs(16 * 60));

        let later = start + Duration::from_secs(17 * 60);
        assert_eq!(table.refresh("127.0.0.1:6881".parse().unwrap(), later), 1);
        assert_eq!(table.nodes()[0].status, NodeStatus::Dubious);
        assert_eq!(table.nodes()[0].last_change, later);
    }

    #[test]
    fn test_sweep_steps_down_one_level_per_pass() {
        let mut table = table();
        table.add(node([2u8; 20], 6881));
        let start = table.nodes()[0].last_change;

        let first = table.sweep(start + Duration::from_secs(16 * 60));
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].status, NodeStatus::Dubious);

        let second = table.sweep(start + Duration::from_secs(31 * 60));
        assert_eq!(second[0].status, NodeStatus::Bad);
        assert_eq!(table.len(), 1);

        let third = table.sweep(start + Duration::from_secs(46 * 60));
        assert!(third.is_empty());
        assert!(table.is_empty());
    }

    #[test]
    fn test_sweep_leaves_fresh_nodes_alone() {
        let mut table = table();
        table.add(node([2u8; 20], 6881));
        let now = table.nodes()[0].last_change + Duration::from_secs(60);
        assert!(table.sweep(now).is_empty());
        assert_eq!(table.nodes()[0].status, NodeStatus::Good);
    }

    #[test]
    fn test_confirm_restores_good() {
        let mut table = table();
        table.add(node([2u8; 20], 6881));
        let start = table.nodes()[0].last_change;
        table.sweep(start + Duration::from_secs(16 * 60));
        assert!(table.confirm(&NodeId::new([2u8; 20]), start + Duration::from_secs(17 * 60)));
        assert_eq!(table.nodes()[0].status, NodeStatus::Good);
        assert!(table.sweep(start + Duration::from_secs(20 * 60)).is_empty());
    }

    #[tokio::test]
    async fn test_table_refresher_observer() {
        let shared: SharedTable = Arc::new(RwLock::new(table()));
        shared.write().await.add(node([2u8; 20], 6881));
        let start = shared.read().await.nodes()[0].last_change;

        let refresher = TableRefresher(Arc::clone(&shared));
        let msg = KrpcMessage::response(crate::dht::message::TransactionId::random(), Default::default());
        tokio::time::sleep(Duration::from_millis(5)).await;
        refresher.on_response(&msg, "127.0.0.1:6881".parse().unwrap()).await;

        assert!(shared.read().await.nodes()[0].last_change > start);
    }
}
