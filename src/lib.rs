//! krpc-dht
//!
//! A Mainline (BEP-5) DHT node: a transaction-tracked KRPC engine over UDP,
//! a liveness-aware routing table and the four protocol queries.

pub mod cli;
pub mod dht;
pub mod error;

pub use error::{DhtError, Result};

pub use cli::{CliArgs, Config};
pub use dht::{
    distance, decode_nodes, encode_nodes, Dht, DhtConfig, DhtEvent, Distance, EventSink, IdentityPolicy,
    KrpcMessage, MessageBody, NeighborIdentity, Node, NodeId, NodeRecord, NodeSnapshot, NodeStatus, PeerLookup,
    PingReply, QueryMethod, RoutingTable, RpcEngine, StrictIdentity, TransactionId,
};
