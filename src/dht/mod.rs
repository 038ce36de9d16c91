//! DHT (Distributed Hash Table) module
//!
//! Implements the BitTorrent Mainline DHT (BEP-5) over KRPC.

pub mod config;
pub mod dht;
pub mod events;
pub mod handlers;
pub mod id;
pub mod message;
pub mod node;
pub mod peers;
pub mod routing;
pub mod rpc;
pub mod token;

// Re-exports for convenience
pub use config::DhtConfig;
pub use dht::{Dht, PeerLookup, PingReply};
pub use events::{DhtEvent, EventSink};
pub use handlers::{IdentityPolicy, NeighborIdentity, StrictIdentity};
pub use id::{distance, Distance, NodeId};
pub use message::{KrpcMessage, MessageBody, QueryMethod, TransactionId};
pub use node::{decode_nodes, encode_nodes, Node, NodeRecord, NodeSnapshot, NodeStatus};
pub use routing::{RoutingTable, SharedTable, StatusChange};
pub use rpc::{InboundQuery, QueryHandler, Responder, Response, ResponseObserver, RpcEngine};
