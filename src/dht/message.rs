//! DHT message module
//!
//! KRPC messages (BEP-5) on top of the bencode dictionary codec, plus the
//! compact peer format used in `values` lists.

use crate::dht::id::{random_bytes, NodeId, TRANSACTION_ID_LEN};
use crate::error::{DhtError, Result};
use bytes::Bytes;
use serde_bencode::value::Value;
use std::collections::HashMap;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

/// Bencode dictionary as carried in `a` and `r`
pub type Dict = HashMap<Vec<u8>, Value>;

/// KRPC error codes we send
pub const ERROR_PROTOCOL: i64 = 203;
pub const ERROR_METHOD_UNKNOWN: i64 = 204;

/// Size of one compact peer record: 4-byte IPv4 + 2-byte port
pub const COMPACT_PEER_LEN: usize = 6;

/// The four BEP-5 query methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryMethod {
    Ping,
    FindNode,
    GetPeers,
    AnnouncePeer,
}

impl QueryMethod {
    pub const ALL: [QueryMethod; 4] = [
        QueryMethod::Ping,
        QueryMethod::FindNode,
        QueryMethod::GetPeers,
        QueryMethod::AnnouncePeer,
    ];

    /// Wire name of the method
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryMethod::Ping => "ping",
            QueryMethod::FindNode => "find_node",
            QueryMethod::GetPeers => "get_peers",
            QueryMethod::AnnouncePeer => "announce_peer",
        }
    }

    /// Look a method up by its wire name
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.as_str() == name)
    }
}

impl fmt::Display for QueryMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque transaction id (`t`), two random bytes for our own queries
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct TransactionId(pub Bytes);

impl TransactionId {
    /// Generate a random two-byte transaction id
    pub fn random() -> Self {
        Self(Bytes::from(random_bytes(TRANSACTION_ID_LEN)))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl From<&[u8]> for TransactionId {
    fn from(bytes: &[u8]) -> Self {
        Self(Bytes::copy_from_slice(bytes))
    }
}

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransactionId({})", self.to_hex())
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Type-specific part of a KRPC message
#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    /// `y = "q"`: method name and argument dictionary
    Query { method: String, args: Dict },
    /// `y = "r"`: return values
    Response { values: Dict },
    /// `y = "e"`: `[code, message]`
    Error { code: i64, message: String },
}

/// One KRPC datagram
#[derive(Debug, Clone, PartialEq)]
pub struct KrpcMessage {
    pub transaction_id: TransactionId,
    pub body: MessageBody,
    /// Client version string (`v`), if the sender included one
    pub version: Option<Bytes>,
}

impl KrpcMessage {
    /// Create a query message
    pub fn query(transaction_id: TransactionId, method: &str, args: Dict) -> Self {
        Self {
            transaction_id,
            body: MessageBody::Query {
                method: method.to_string(),
                args,
            },
            version: None,
        }
    }

    /// Create a response message
    pub fn response(transaction_id: TransactionId, values: Dict) -> Self {
        Self {
            transaction_id,
            body: MessageBody::Response { values },
            version: None,
        }
    }

    /// Create an error message
    pub fn error(transaction_id: TransactionId, code: i64, message: impl Into<String>) -> Self {
        Self {
            transaction_id,
            body: MessageBody::Error {
                code,
                message: message.into(),
            },
            version: None,
        }
    }

    /// Get the message type tag
    pub fn message_type(&self) -> &'static str {
        match self.body {
            MessageBody::Query { .. } => "q",
            MessageBody::Response { .. } => "r",
            MessageBody::Error { .. } => "e",
        }
    }

    pub fn is_response(&self) -> bool {
        matches!(self.body, MessageBody::Response { .. })
    }

    /// Query arguments or response values
    pub fn payload(&self) -> Option<&Dict> {
        match &self.body {
            MessageBody::Query { args, .. } => Some(args),
            MessageBody::Response { values } => Some(values),
            MessageBody::Error { .. } => None,
        }
    }

    /// The `id` the sender claims for itself, if well formed
    pub fn sender_id(&self) -> Option<NodeId> {
        self.payload().and_then(|d| d.get_id("id"))
    }

    /// Serialize to bencode; dictionary keys are emitted in sorted order
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut root = Dict::new();
        root.insert(b"t".to_vec(), Value::Bytes(self.transaction_id.as_bytes().to_vec()));
        root.insert(b"y".to_vec(), Value::Bytes(self.message_type().as_bytes().to_vec()));
        match &self.body {
            MessageBody::Query { method, args } => {
                root.insert(b"q".to_vec(), Value::Bytes(method.as_bytes().to_vec()));
                root.insert(b"a".to_vec(), Value::Dict(args.clone()));
            }
            MessageBody::Response { values } => {
                root.insert(b"r".to_vec(), Value::Dict(values.clone()));
            }
            MessageBody::Error { code, message } => {
                root.insert(
                    b"e".to_vec(),
                    Value::List(vec![Value::Int(*code), Value::Bytes(message.as_bytes().to_vec())]),
                );
            }
        }
        if let Some(v) = &self.version {
            root.insert(b"v".to_vec(), Value::Bytes(v.to_vec()));
        }
        Ok(serde_bencode::to_bytes(&Value::Dict(root))?)
    }

    /// Parse a datagram.
    ///
    /// Malformed input yields `DecodeError`; a well-formed dictionary with
    /// an unrecognised `y` yields `UnknownMessageType`.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let value: Value = serde_bencode::from_bytes(data)?;
        let mut root = match value {
            Value::Dict(d) => d,
            _ => return Err(DhtError::decode_error("KRPC message is not a dictionary")),
        };

        let transaction_id = match root.get(b"t".as_slice()) {
            Some(Value::Bytes(t)) => TransactionId::from(t.as_slice()),
            _ => return Err(DhtError::decode_error("missing transaction id")),
        };
        let version = match root.get(b"v".as_slice()) {
            Some(Value::Bytes(v)) => Some(Bytes::copy_from_slice(v)),
            _ => None,
        };
        let kind = match root.get(b"y".as_slice()) {
            Some(Value::Bytes(y)) => y.clone(),
            _ => return Err(DhtError::decode_error("missing message type")),
        };

        let body = match kind.as_slice() {
            b"q" => {
                let method = match root.get(b"q".as_slice()) {
                    Some(Value::Bytes(q)) => String::from_utf8_lossy(q).into_owned(),
                    _ => return Err(DhtError::decode_error("query without method name")),
                };
                let args = match root.remove(b"a".as_slice()) {
                    Some(Value::Dict(a)) => a,
                    _ => return Err(DhtError::decode_error("query without argument dictionary")),
                };
                MessageBody::Query { method, args }
            }
            b"r" => match root.remove(b"r".as_slice()) {
                Some(Value::Dict(values)) => MessageBody::Response { values },
                _ => return Err(DhtError::decode_error("response without return values")),
            },
            b"e" => match root.get(b"e".as_slice()) {
                Some(Value::List(items)) => match items.as_slice() {
                    [Value::Int(code), Value::Bytes(message), ..] => MessageBody::Error {
                        code: *code,
                        message: String::from_utf8_lossy(message).into_owned(),
                    },
                    _ => return Err(DhtError::decode_error("malformed error list")),
                },
                _ => return Err(DhtError::decode_error("error without code and message")),
            },
            other => {
                return Err(DhtError::unknown_message_type(
                    String::from_utf8_lossy(other),
                    version.map(|v| String::from_utf8_lossy(&v).into_owned()),
                ))
            }
        };

        Ok(Self {
            transaction_id,
            body,
            version,
        })
    }
}

/// Typed access to and construction of bencode dictionaries
pub trait DictExt {
    fn get_bytes(&self, key: &str) -> Option<&[u8]>;
    fn get_int(&self, key: &str) -> Option<i64>;
    fn get_list(&self, key: &str) -> Option<&[Value]>;
    fn get_id(&self, key: &str) -> Option<NodeId>;
    fn with_bytes(self, key: &str, value: impl Into<Vec<u8>>) -> Self;
    fn with_int(self, key: &str, value: i64) -> Self;
    fn with_list(self, key: &str, value: Vec<Value>) -> Self;
}

impl DictExt for Dict {
    fn get_bytes(&self, key: &str) -> Option<&[u8]> {
        match self.get(key.as_bytes()) {
            Some(Value::Bytes(b)) => Some(b),
            _ => None,
        }
    }

    fn get_int(&self, key: &str) -> Option<i64> {
        match self.get(key.as_bytes()) {
            Some(Value::Int(i)) => Some(*i),
            _ => None,
        }
    }

    fn get_list(&self, key: &str) -> Option<&[Value]> {
        match self.get(key.as_bytes()) {
            Some(Value::List(l)) => Some(l),
            _ => None,
        }
    }

    fn get_id(&self, key: &str) -> Option<NodeId> {
        self.get_bytes(key).and_then(|b| NodeId::from_bytes(b).ok())
    }

    fn with_bytes(mut self, key: &str, value: impl Into<Vec<u8>>) -> Self {
        self.insert(key.as_bytes().to_vec(), Value::Bytes(value.into()));
        self
    }

    fn with_int(mut self, key: &str, value: i64) -> Self {
        self.insert(key.as_bytes().to_vec(), Value::Int(value));
        self
    }

    fn with_list(mut self, key: &str, value: Vec<Value>) -> Self {
        self.insert(key.as_bytes().to_vec(), Value::List(value));
        self
    }
}

/// Encode peers as a `values` list of 6-byte strings; IPv6 peers are skipped
pub fn encode_peers(peers: &[SocketAddr]) -> Vec<Value> {
    peers
        .iter()
        .filter_map(|addr| match addr {
            SocketAddr::V4(v4) => {
                let mut record = Vec::with_capacity(COMPACT_PEER_LEN);
                record.extend_from_slice(&v4.ip().octets());
                record.extend_from_slice(&v4.port().to_be_bytes());
                Some(Value::Bytes(record))
            }
            SocketAddr::V6(_) => None,
        })
        .collect()
}

/// Decode a `values` list; entries that are not 6-byte strings are ignored
pub fn decode_peers(values: &[Value]) -> Vec<SocketAddr> {
    values
        .iter()
        .filter_map(|v| match v {
            Value::Bytes(b) if b.len() == COMPACT_PEER_LEN => {
                let ip = Ipv4Addr::new(b[0], b[1], b[2], b[3]);
                let port = u16::from_be_bytes([b[4], b[5]]);
                Some(SocketAddr::V4(SocketAddrV4::new(ip, port)))
            }
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tid(t: &[u8]) -> TransactionId {
        TransactionId::from(t)
    }

    #[test]
    fn test_query_method_names() {
        for m in QueryMethod::ALL {
            assert_eq!(QueryMethod::from_name(m.as_str()), Some(m));
        }
        assert_eq!(QueryMethod::from_name("vote"), None);
        assert_eq!(QueryMethod::FindNode.to_string(), "find_node");
    }

    #[test]
    fn test_transaction_id_random() {
        let id = TransactionId::random();
        assert_eq!(id.as_bytes().len(), 2);
        assert_eq!(id.to_hex().len(), 4);
    }

    #[test]
    fn test_encode_ping_query_matches_bep5() {
        let args = Dict::new().with_bytes("id", b"abcdefghij0123456789".to_vec());
        let msg = KrpcMessage::query(tid(b"aa"), "ping", args);
        let encoded = msg.encode().unwrap();
        assert_eq!(
            encoded,
            b"d1:ad2:id20:abcdefghij0123456789e1:q4:ping1:t2:aa1:y1:qe".to_vec()
        );
    }

    #[test]
    fn test_encode_error_matches_bep5() {
        let msg = KrpcMessage::error(tid(b"aa"), 201, "A Generic Error Ocurred");
        let encoded = msg.encode().unwrap();
        assert_eq!(encoded, b"d1:eli201e23:A Generic Error Ocurrede1:t2:aa1:y1:ee".to_vec());
    }

    #[test]
    fn test_decode_response() {
        let data = b"d1:rd2:id20:mnopqrstuvwxyz123456e1:t2:aa1:y1:re";
        let msg = KrpcMessage::decode(data).unwrap();
        assert_eq!(msg.transaction_id, tid(b"aa"));
        assert!(msg.is_response());
        assert_eq!(msg.sender_id(), NodeId::from_bytes(b"mnopqrstuvwxyz123456").ok());
    }

    #[test]
    fn test_decode_query() {
        let data = b"d1:ad2:id20:abcdefghij01234567896:target20:mnopqrstuvwxyz123456e1:q9:find_node1:t2:aa1:y1:qe";
        let msg = KrpcMessage::decode(data).unwrap();
        match &msg.body {
            MessageBody::Query { method, args } => {
                assert_eq!(method, "find_node");
                assert_eq!(args.get_bytes("target"), Some(b"mnopqrstuvwxyz123456".as_slice()));
            }
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_decode_error_message() {
        let data = b"d1:eli203e9:Bad tokene1:t2:bb1:v4:LT011:y1:ee";
        let msg = KrpcMessage::decode(data).unwrap();
        assert_eq!(
            msg.body,
            MessageBody::Error { code: 203, message: "Bad token".into() }
        );
        assert_eq!(msg.version.as_deref(), Some(b"LT01".as_slice()));
    }

    #[test]
    fn test_decode_garbage_is_decode_error() {
        assert!(matches!(KrpcMessage::decode(b"not bencode"), Err(DhtError::DecodeError { .. })));
        assert!(matches!(KrpcMessage::decode(b"li1ee"), Err(DhtError::DecodeError { .. })));
        assert!(matches!(KrpcMessage::decode(b"d1:y1:qe"), Err(DhtError::DecodeError { .. })));
    }

    #[test]
    fn test_decode_unknown_type() {
        let err = KrpcMessage::decode(b"d1:t2:aa1:y1:xe").unwrap_err();
        assert!(matches!(err, DhtError::UnknownMessageType { ref message_type, .. } if message_type == "x"));
    }

    #[test]
    fn test_message_round_trip() {
        let values = Dict::new()
            .with_bytes("id", vec![3u8; 20])
            .with_bytes("token", b"tk".to_vec())
            .with_list("values", encode_peers(&["1.2.3.4:80".parse().unwrap()]));
        let msg = KrpcMessage::response(tid(b"zz"), values);
        let decoded = KrpcMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_compact_peers() {
        let peers: Vec<SocketAddr> = vec!["127.0.0.1:6881".parse().unwrap(), "[::1]:1".parse().unwrap()];
        let encoded = encode_peers(&peers);
        assert_eq!(encoded.len(), 1);
        assert_eq!(encoded[0], Value::Bytes(vec![127, 0, 0, 1, 26, 225]));
        assert_eq!(decode_peers(&encoded), vec![peers[0]]);
        assert!(decode_peers(&[Value::Int(1), Value::Bytes(vec![1, 2])]).is_empty());
    }
}
