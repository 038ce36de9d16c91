//! Diagnostic events
//!
//! Observable hooks for a surrounding process (logging, metrics). Nothing
//! in the DHT depends on anyone listening.

use crate::dht::id::NodeId;
use crate::dht::message::TransactionId;
use crate::dht::node::NodeStatus;
use crate::error::DhtError;
use std::net::SocketAddr;
use tokio::sync::broadcast;

/// Capacity of the event channel; slow subscribers miss the oldest events
pub const EVENT_CAPACITY: usize = 256;

/// Something observable happened inside the DHT
#[derive(Debug, Clone)]
pub enum DhtEvent {
    /// A query arrived; `info_hash` is set for get_peers and announce_peer
    Query {
        method: String,
        transaction_id: TransactionId,
        from: SocketAddr,
        info_hash: Option<NodeId>,
    },
    /// A response arrived, whether or not it matched a transaction
    Response {
        transaction_id: TransactionId,
        from: SocketAddr,
    },
    /// Recoverable engine or handler error
    Error(DhtError),
    /// Expected steady-state failure, e.g. a health-check ping timing out
    Warning(DhtError),
    /// The health check changed a node's status
    Status {
        id: NodeId,
        addr: SocketAddr,
        status: NodeStatus,
    },
}

/// Sending half shared by the engine, the table check and the handlers
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<DhtEvent>,
}

impl EventSink {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DhtEvent> {
        self.tx.subscribe()
    }

    /// Publish an event; having no subscriber is fine
    pub fn emit(&self, event: DhtEvent) {
        let _ = self.tx.send(event);
    }

    pub fn error(&self, err: DhtError) {
        tracing::debug!("DHT error: {}", err);
        self.emit(DhtEvent::Error(err));
    }

    pub fn warning(&self, err: DhtError) {
        tracing::debug!("DHT warning: {}", err);
        self.emit(DhtEvent::Warning(err));
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new()
    }
}
