//! BEP-5 query handlers
//!
//! Server side of ping, find_node, get_peers and announce_peer, built on
//! the routing table and the KRPC engine.

use crate::dht::id::NodeId;
use crate::dht::message::{encode_peers, Dict, DictExt, QueryMethod, ERROR_PROTOCOL};
use crate::dht::node::encode_nodes;
use crate::dht::peers::PeerStore;
use crate::dht::routing::SharedTable;
use crate::dht::rpc::{InboundQuery, QueryHandler, Responder, RpcEngine};
use crate::dht::token::TokenSecrets;
use crate::error::{DhtError, Result};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Decides which id we report and whom we answer
pub trait IdentityPolicy: Send + Sync {
    /// Id placed in the `id` field of our responses
    fn reported_id(&self, own: &NodeId, querier: Option<&NodeId>) -> NodeId;

    /// Whether to answer a querier, given whether its id is in our table
    fn accepts(&self, querier_known: bool) -> bool;
}

/// Report our true id and only answer nodes we already know
#[derive(Debug, Clone, Copy, Default)]
pub struct StrictIdentity;

impl IdentityPolicy for StrictIdentity {
    fn reported_id(&self, own: &NodeId, _querier: Option<&NodeId>) -> NodeId {
        *own
    }

    fn accepts(&self, querier_known: bool) -> bool {
        querier_known
    }
}

/// Crawler behaviour: answer everyone with an id that shares the querier's
/// first `prefix` bytes, so the querier files us next to itself.
#[derive(Debug, Clone, Copy)]
pub struct NeighborIdentity {
    pub prefix: usize,
}

impl Default for NeighborIdentity {
    fn default() -> Self {
        Self { prefix: 18 }
    }
}

impl IdentityPolicy for NeighborIdentity {
    fn reported_id(&self, own: &NodeId, querier: Option<&NodeId>) -> NodeId {
        match querier {
            Some(q) => own.neighbor(q, self.prefix),
            None => *own,
        }
    }

    fn accepts(&self, _querier_known: bool) -> bool {
        true
    }
}

/// State shared by all handlers of one DHT instance
pub struct HandlerContext {
    pub id: NodeId,
    pub k: usize,
    pub table: SharedTable,
    pub tokens: RwLock<TokenSecrets>,
    pub peers: RwLock<PeerStore>,
    pub policy: Arc<dyn IdentityPolicy>,
}

impl HandlerContext {
    pub fn new(id: NodeId, k: usize, table: SharedTable, policy: Arc<dyn IdentityPolicy>) -> Self {
        Self {
            id,
            k,
            table,
            tokens: RwLock::new(TokenSecrets::new()),
            peers: RwLock::new(PeerStore::new()),
            policy,
        }
    }

    /// Check the querier against the policy; returns its claimed id
    async fn authorize(&self, query: &InboundQuery) -> Result<Option<NodeId>> {
        let querier = query.args.get_id("id");
        let known = match &querier {
            Some(id) => self.table.read().await.has(id),
            None => false,
        };
        if self.policy.accepts(known) {
            Ok(querier)
        } else {
            let claimed = query.args.get_bytes("id").map(hex::encode);
            Err(DhtError::node_not_found(query.method.clone(), claimed, query.from.to_string()))
        }
    }

    /// Compact list of the k nodes closest to `target`, leaving out the querier
    async fn closest_nodes(&self, target: &NodeId, querier: Option<&NodeId>) -> Vec<u8> {
        let table = self.table.read().await;
        let nodes = table.get(target, self.k + 1);
        encode_nodes(
            nodes
                .iter()
                .filter(|n| querier.map_or(true, |q| !n.identifies(q)))
                .take(self.k),
        )
    }

    fn reply_base(&self, querier: Option<&NodeId>) -> Dict {
        let id = self.policy.reported_id(&self.id, querier);
        Dict::new().with_bytes("id", id.as_bytes().to_vec())
    }
}

/// Reject a malformed query with KRPC 203 and surface it as an error
async fn reject_malformed(responder: &Responder, method: &str, what: &str) -> DhtError {
    let message = format!("{}: {}", method, what);
    if let Err(e) = responder.reject(ERROR_PROTOCOL, &message).await {
        debug!("Failed to send protocol error to {}: {}", responder.remote(), e);
    }
    DhtError::validation_error_with_field(message, what.to_string()).with_node(responder.remote().to_string())
}

/// `ping`: answer with our id
pub struct PingHandler(pub Arc<HandlerContext>);

#[async_trait]
impl QueryHandler for PingHandler {
    async fn handle(&self, query: InboundQuery, responder: Responder) -> Result<()> {
        let querier = self.0.authorize(&query).await?;
        responder.respond(self.0.reply_base(querier.as_ref())).await?;
        Ok(())
    }
}

/// `find_node`: answer with the k closest nodes to `target`
pub struct FindNodeHandler(pub Arc<HandlerContext>);

#[async_trait]
impl QueryHandler for FindNodeHandler {
    async fn handle(&self, query: InboundQuery, responder: Responder) -> Result<()> {
        let querier = self.0.authorize(&query).await?;
        let Some(target) = query.args.get_id("target") else {
            return Err(reject_malformed(&responder, &query.method, "target").await);
        };
        let nodes = self.0.closest_nodes(&target, querier.as_ref()).await;
        let values = self.0.reply_base(querier.as_ref()).with_bytes("nodes", nodes);
        responder.respond(values).await?;
        Ok(())
    }
}

/// `get_peers`: stored peers if any, otherwise the closest nodes, plus a token
pub struct GetPeersHandler(pub Arc<HandlerContext>);

#[async_trait]
impl QueryHandler for GetPeersHandler {
    async fn handle(&self, query: InboundQuery, responder: Responder) -> Result<()> {
        let querier = self.0.authorize(&query).await?;
        let Some(info_hash) = query.args.get_id("info_hash") else {
            return Err(reject_malformed(&responder, &query.method, "info_hash").await);
        };
        let token = self.0.tokens.read().await.issue(query.from.ip());
        let peers = self.0.peers.write().await.get(&info_hash);

        let values = self.0.reply_base(querier.as_ref()).with_bytes("token", token);
        let values = if peers.is_empty() {
            let nodes = self.0.closest_nodes(&info_hash, querier.as_ref()).await;
            values.with_bytes("nodes", nodes)
        } else {
            debug!("Returning {} peer(s) for {} to {}", peers.len(), info_hash, query.from);
            values.with_list("values", encode_peers(&peers))
        };
        responder.respond(values).await?;
        Ok(())
    }
}

/// `announce_peer`: verify the token, store the peer, acknowledge
pub struct AnnouncePeerHandler(pub Arc<HandlerContext>);

#[async_trait]
impl QueryHandler for AnnouncePeerHandler {
    async fn handle(&self, query: InboundQuery, responder: Responder) -> Result<()> {
        let querier = query.args.get_id("id");
        let Some(info_hash) = query.args.get_id("info_hash") else {
            return Err(reject_malformed(&responder, &query.method, "info_hash").await);
        };
        let token = query.args.get_bytes("token").unwrap_or_default();
        if !self.0.tokens.read().await.verify(query.from.ip(), token) {
            responder.reject(ERROR_PROTOCOL, "Bad token").await?;
            return Err(DhtError::protocol_error_with_node(ERROR_PROTOCOL, "Bad token", query.from.to_string()));
        }

        let implied = query.args.get_int("implied_port").unwrap_or(0) != 0;
        let port = if implied {
            query.from.port()
        } else {
            match query.args.get_int("port").and_then(|p| u16::try_from(p).ok()) {
                Some(p) if p > 0 => p,
                _ => return Err(reject_malformed(&responder, &query.method, "port").await),
            }
        };
        let peer = SocketAddr::new(query.from.ip(), port);
        self.0.peers.write().await.add(info_hash, peer);
        debug!("Stored announced peer {} for {}", peer, info_hash);

        responder.respond(self.0.reply_base(querier.as_ref())).await?;
        Ok(())
    }
}

/// Register the four BEP-5 handlers on an engine
pub async fn register_all(engine: &RpcEngine, context: Arc<HandlerContext>) {
    for method in QueryMethod::ALL {
        let handler: Arc<dyn QueryHandler> = match method {
            QueryMethod::Ping => Arc::new(PingHandler(Arc::clone(&context))),
            QueryMethod::FindNode => Arc::new(FindNodeHandler(Arc::clone(&context))),
            QueryMethod::GetPeers => Arc::new(GetPeersHandler(Arc::clone(&context))),
            QueryMethod::AnnouncePeer => Arc::new(AnnouncePeerHandler(Arc::clone(&context))),
        };
        engine.register(method.as_str(), handler).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strict_identity() {
        let own = NodeId::new([1u8; 20]);
        let q = NodeId::new([2u8; 20]);
        assert_eq!(StrictIdentity.reported_id(&own, Some(&q)), own);
        assert!(StrictIdentity.accepts(true));
        assert!(!StrictIdentity.accepts(false));
    }

    #[test]
    fn test_neighbor_identity() {
        let own = NodeId::new([1u8; 20]);
        let q = NodeId::new([2u8; 20]);
        let policy = NeighborIdentity::default();
        let reported = policy.reported_id(&own, Some(&q));
        assert_eq!(&reported.0[..18], &[2u8; 18]);
        assert_eq!(&reported.0[18..], &[1u8; 2]);
        assert_eq!(policy.reported_id(&own, None), own);
        assert!(policy.accepts(false));
    }
}
