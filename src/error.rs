//! Error types for the DHT node
//!
//! This module defines the error kinds surfaced by the KRPC engine,
//! the routing table and the protocol handlers. None of them are fatal
//! to the receive loop.

use std::fmt;

/// Result alias used throughout the library
pub type Result<T> = std::result::Result<T, DhtError>;

/// Comprehensive error type for DHT operations
#[derive(Debug, Clone, PartialEq)]
pub enum DhtError {
    /// Malformed datagram or bencode payload
    DecodeError {
        message: String,
        source: Option<String>,
    },

    /// Response or error referencing a transaction we do not track
    UnknownTransaction {
        transaction_id: String,
        /// Message type (`r` or `e`) and the raw datagram, hex encoded
        message_type: String,
        raw: String,
        node: Option<String>,
    },

    /// KRPC error reply (`y = "e"`) from a remote node
    ProtocolError {
        code: i64,
        message: String,
        node: Option<String>,
    },

    /// Message whose `y` key is neither `q`, `r` nor `e`
    UnknownMessageType {
        message_type: String,
        version: Option<String>,
        node: Option<String>,
    },

    /// Query from a node that is not in the routing table, or for a
    /// method nobody registered a handler for
    NodeNotFound {
        method: String,
        node_id: Option<String>,
        node: Option<String>,
    },

    /// A remote did not answer before the transaction deadline
    Timeout {
        transaction_id: String,
        node: Option<String>,
    },

    /// A query in which no remote answered successfully
    QueryFailed {
        transaction_id: String,
        errors: Vec<DhtError>,
    },

    /// Socket errors
    NetworkError {
        message: String,
        address: Option<String>,
        source: Option<String>,
    },

    /// Configuration errors
    ConfigError {
        message: String,
        field: Option<String>,
    },

    /// Validation errors
    ValidationError {
        message: String,
        field: Option<String>,
    },
}

impl DhtError {
    /// Create a new DecodeError
    pub fn decode_error(message: impl Into<String>) -> Self {
        DhtError::DecodeError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new DecodeError with source
    pub fn decode_error_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        DhtError::DecodeError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new UnknownTransaction error
    pub fn unknown_transaction(
        transaction_id: impl Into<String>,
        message_type: impl Into<String>,
        raw: &[u8],
        node: impl Into<String>,
    ) -> Self {
        DhtError::UnknownTransaction {
            transaction_id: transaction_id.into(),
            message_type: message_type.into(),
            raw: hex::encode(raw),
            node: Some(node.into()),
        }
    }

    /// Create a new ProtocolError from a KRPC error reply
    pub fn protocol_error(code: i64, message: impl Into<String>) -> Self {
        DhtError::ProtocolError {
            code,
            message: message.into(),
            node: None,
        }
    }

    /// Create a new ProtocolError with the replying node
    pub fn protocol_error_with_node(code: i64, message: impl Into<String>, node: impl Into<String>) -> Self {
        DhtError::ProtocolError {
            code,
            message: message.into(),
            node: Some(node.into()),
        }
    }

    /// Create a new UnknownMessageType error
    pub fn unknown_message_type(message_type: impl Into<String>, version: Option<String>) -> Self {
        DhtError::UnknownMessageType {
            message_type: message_type.into(),
            version,
            node: None,
        }
    }

    /// Create a new NodeNotFound error
    pub fn node_not_found(method: impl Into<String>, node_id: Option<String>, node: impl Into<String>) -> Self {
        DhtError::NodeNotFound {
            method: method.into(),
            node_id,
            node: Some(node.into()),
        }
    }

    /// Create a new Timeout error
    pub fn timeout(transaction_id: impl Into<String>, node: impl Into<String>) -> Self {
        DhtError::Timeout {
            transaction_id: transaction_id.into(),
            node: Some(node.into()),
        }
    }

    /// Create a new QueryFailed error
    pub fn query_failed(transaction_id: impl Into<String>, errors: Vec<DhtError>) -> Self {
        DhtError::QueryFailed {
            transaction_id: transaction_id.into(),
            errors,
        }
    }

    /// Create a new NetworkError
    pub fn network_error(message: impl Into<String>) -> Self {
        DhtError::NetworkError {
            message: message.into(),
            address: None,
            source: None,
        }
    }

    /// Create a new NetworkError with address and source
    pub fn network_error_full(message: impl Into<String>, address: impl Into<String>, source: impl Into<String>) -> Self {
        DhtError::NetworkError {
            message: message.into(),
            address: Some(address.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new ConfigError with field
    pub fn config_error_with_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        DhtError::ConfigError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a new ValidationError with field
    pub fn validation_error_with_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        DhtError::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Attach the remote address an error relates to
    pub fn with_node(mut self, addr: impl Into<String>) -> Self {
        let addr = addr.into();
        match &mut self {
            DhtError::UnknownTransaction { node, .. }
            | DhtError::ProtocolError { node, .. }
            | DhtError::UnknownMessageType { node, .. }
            | DhtError::NodeNotFound { node, .. }
            | DhtError::Timeout { node, .. } => *node = Some(addr),
            DhtError::NetworkError { address, .. } => *address = Some(addr),
            DhtError::DecodeError { source, .. } => {
                *source = Some(source.as_ref().map_or_else(|| addr.clone(), |s| format!("{}: {}", s, addr)));
            }
            _ => {}
        }
        self
    }

    /// True for the per-remote timeout classification
    pub fn is_timeout(&self) -> bool {
        matches!(self, DhtError::Timeout { .. })
    }

    /// Errors accumulated by a failed query; empty for every other kind
    pub fn errors(&self) -> &[DhtError] {
        match self {
            DhtError::QueryFailed { errors, .. } => errors,
            _ => &[],
        }
    }
}

impl fmt::Display for DhtError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DhtError::DecodeError { message, source } => {
                if let Some(src) = source {
                    write!(f, "Decode error: {} (source: {})", message, src)
                } else {
                    write!(f, "Decode error: {}", message)
                }
            }
            DhtError::UnknownTransaction {
                transaction_id,
                message_type,
                raw,
                node,
            } => {
                write!(f, "Unknown transaction: #{} not found (y={}, raw: {})", transaction_id, message_type, raw)?;
                if let Some(n) = node {
                    write!(f, " (node: {})", n)?;
                }
                Ok(())
            }
            DhtError::ProtocolError { code, message, node } => {
                if let Some(n) = node {
                    write!(f, "Protocol error {}: {} (node: {})", code, message, n)
                } else {
                    write!(f, "Protocol error {}: {}", code, message)
                }
            }
            DhtError::UnknownMessageType { message_type, version, node } => {
                let version = version.as_deref().unwrap_or("-");
                match node {
                    Some(n) => write!(f, "Unknown message type: {}, {} (node: {})", message_type, version, n),
                    None => write!(f, "Unknown message type: {}, {}", message_type, version),
                }
            }
            DhtError::NodeNotFound { method, node_id, node } => {
                match (node_id, node) {
                    (Some(id), Some(n)) => write!(f, "{}, not found id {} (node: {})", method, id, n),
                    (Some(id), None) => write!(f, "{}, not found id {}", method, id),
                    (None, Some(n)) => write!(f, "{}, not found (node: {})", method, n),
                    (None, None) => write!(f, "{}, not found", method),
                }
            }
            DhtError::Timeout { transaction_id, node } => {
                if let Some(n) = node {
                    write!(f, "Timeout #{} (node: {})", transaction_id, n)
                } else {
                    write!(f, "Timeout #{}", transaction_id)
                }
            }
            DhtError::QueryFailed { transaction_id, errors } => {
                write!(f, "Query #{} failed with {} error(s)", transaction_id, errors.len())?;
                if let Some(first) = errors.first() {
                    write!(f, ": {}", first)?;
                }
                Ok(())
            }
            DhtError::NetworkError { message, address, source } => {
                match (address, source) {
                    (Some(a), Some(s)) => write!(f, "Network error: {} (address: {}, source: {})", message, a, s),
                    (Some(a), None) => write!(f, "Network error: {} (address: {})", message, a),
                    (None, Some(s)) => write!(f, "Network error: {} (source: {})", message, s),
                    (None, None) => write!(f, "Network error: {}", message),
                }
            }
            DhtError::ConfigError { message, field } => {
                if let Some(field_val) = field {
                    write!(f, "Config error: {} (field: {})", message, field_val)
                } else {
                    write!(f, "Config error: {}", message)
                }
            }
            DhtError::ValidationError { message, field } => {
                if let Some(field_val) = field {
                    write!(f, "Validation error: {} (field: {})", message, field_val)
                } else {
                    write!(f, "Validation error: {}", message)
                }
            }
        }
    }
}

impl std::error::Error for DhtError {}

impl From<std::io::Error> for DhtError {
    fn from(err: std::io::Error) -> Self {
        DhtError::NetworkError {
            message: err.to_string(),
            address: None,
            source: Some(err.kind().to_string()),
        }
    }
}

impl From<serde_bencode::Error> for DhtError {
    fn from(err: serde_bencode::Error) -> Self {
        DhtError::decode_error_with_source("Failed to parse bencode data", err.to_string())
    }
}

impl From<std::net::AddrParseError> for DhtError {
    fn from(err: std::net::AddrParseError) -> Self {
        DhtError::validation_error_with_field(err.to_string(), "address")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_error() {
        let err = DhtError::decode_error("truncated dictionary");
        assert_eq!(err.to_string(), "Decode error: truncated dictionary");
    }

    #[test]
    fn test_protocol_error_with_node() {
        let err = DhtError::protocol_error_with_node(203, "Bad token", "127.0.0.1:6881");
        assert!(err.to_string().contains("203"));
        assert!(err.to_string().contains("Bad token"));
        assert!(err.to_string().contains("127.0.0.1:6881"));
    }

    #[test]
    fn test_with_node() {
        let err = DhtError::protocol_error(201, "Generic Error").with_node("10.0.0.1:6881");
        assert!(matches!(err, DhtError::ProtocolError { node: Some(ref n), .. } if n == "10.0.0.1:6881"));
    }

    #[test]
    fn test_unknown_transaction_carries_message() {
        let err = DhtError::unknown_transaction("7a7a", "r", b"d1:t2:zze", "10.0.0.1:6881");
        assert!(matches!(err, DhtError::UnknownTransaction { ref message_type, ref raw, .. }
            if message_type == "r" && raw == "64313a74323a7a7a65"));
        assert_eq!(
            err.to_string(),
            "Unknown transaction: #7a7a not found (y=r, raw: 64313a74323a7a7a65) (node: 10.0.0.1:6881)"
        );
    }

    #[test]
    fn test_query_failed_lists_errors() {
        let err = DhtError::query_failed(
            "abcd",
            vec![DhtError::timeout("abcd", "10.0.0.1:1"), DhtError::timeout("abcd", "10.0.0.2:1")],
        );
        assert_eq!(err.errors().len(), 2);
        assert!(err.errors().iter().all(DhtError::is_timeout));
        assert!(err.to_string().contains("2 error(s)"));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use");
        let err: DhtError = io_err.into();
        assert!(matches!(err, DhtError::NetworkError { .. }));
    }

    #[test]
    fn test_from_addr_parse_error() {
        let addr_err = "invalid:address".parse::<std::net::SocketAddr>().unwrap_err();
        let err: DhtError = addr_err.into();
        assert!(matches!(err, DhtError::ValidationError { .. }));
    }

    #[test]
    fn test_config_error_with_field() {
        let err = DhtError::config_error_with_field("must be positive", "timeout");
        assert!(err.to_string().contains("Config error"));
        assert!(err.to_string().contains("timeout"));
    }
}
