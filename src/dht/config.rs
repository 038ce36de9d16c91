//! DHT configuration module
//!
//! Tunables of a DHT instance, passed explicitly at construction.

use crate::dht::id::NodeId;
use crate::error::{DhtError, Result};
use std::net::SocketAddr;
use std::time::Duration;

/// Default DHT port
pub const DEFAULT_PORT: u16 = 6881;

/// Configuration for one DHT instance
#[derive(Debug, Clone)]
pub struct DhtConfig {
    /// Our node id
    pub id: NodeId,
    /// Local UDP address to bind
    pub bind_addr: SocketAddr,
    /// Deadline for an outstanding transaction
    pub timeout: Duration,
    /// Number of closest nodes returned by lookups
    pub k: usize,
    /// Period of the routing table health check
    pub check_interval: Duration,
    /// Silence after which a node is degraded one level
    pub stale_after: Duration,
    /// Upper bound on get_peers rounds
    pub max_lookup_hops: usize,
    /// Period of announce-token secret rotation
    pub token_rotation: Duration,
    /// Remotes used while the table is still small
    pub bootstrap_nodes: Vec<SocketAddr>,
    /// Receive buffer size
    pub max_datagram: usize,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            id: NodeId::random(),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            timeout: Duration::from_millis(5000),
            k: 8,
            check_interval: Duration::from_secs(10),
            stale_after: Duration::from_secs(15 * 60),
            max_lookup_hops: 8,
            token_rotation: Duration::from_secs(5 * 60),
            bootstrap_nodes: Vec::new(),
            max_datagram: 4096,
        }
    }
}

impl DhtConfig {
    /// Default configuration bound to an ephemeral port on localhost
    pub fn local() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..Self::default()
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.timeout.is_zero() {
            return Err(DhtError::config_error_with_field("timeout must be positive", "timeout"));
        }
        if self.k == 0 {
            return Err(DhtError::config_error_with_field("k must be at least 1", "k"));
        }
        if self.check_interval.is_zero() {
            return Err(DhtError::config_error_with_field(
                "check_interval must be positive",
                "check_interval",
            ));
        }
        if self.stale_after.is_zero() {
            return Err(DhtError::config_error_with_field("stale_after must be positive", "stale_after"));
        }
        if self.max_lookup_hops == 0 {
            return Err(DhtError::config_error_with_field(
                "max_lookup_hops must be at least 1",
                "max_lookup_hops",
            ));
        }
        if self.token_rotation.is_zero() {
            return Err(DhtError::config_error_with_field(
                "token_rotation must be positive",
                "token_rotation",
            ));
        }
        if self.max_datagram < 64 {
            return Err(DhtError::config_error_with_field(
                "max_datagram must hold a KRPC message",
                "max_datagram",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DhtConfig::default();
        assert_eq!(config.timeout, Duration::from_millis(5000));
        assert_eq!(config.k, 8);
        assert_eq!(config.check_interval, Duration::from_secs(10));
        assert_eq!(config.stale_after, Duration::from_secs(900));
        assert_eq!(config.bind_addr.port(), DEFAULT_PORT);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let config = DhtConfig { k: 0, ..DhtConfig::default() };
        assert!(matches!(config.validate(), Err(DhtError::ConfigError { .. })));

        let config = DhtConfig { timeout: Duration::ZERO, ..DhtConfig::default() };
        assert!(config.validate().is_err());

        let config = DhtConfig { max_lookup_hops: 0, ..DhtConfig::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_local_binds_ephemeral() {
        let config = DhtConfig::local();
        assert_eq!(config.bind_addr.port(), 0);
        assert!(config.bind_addr.ip().is_loopback());
    }
}
