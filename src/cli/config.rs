//! CLI configuration module
//!
//! Turns CLI arguments into a validated application config and a `DhtConfig`.

use crate::cli::args::CliArgs;
use crate::dht::config::DhtConfig;
use crate::dht::id::NodeId;
use anyhow::Result;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::lookup_host;
use tracing::{debug, warn};

/// Public routers used when no bootstrap node is given
pub const DEFAULT_BOOTSTRAP: &[&str] = &["router.bittorrent.com:6881", "dht.transmissionbt.com:6881"];

/// Configuration for the DHT node binary
#[derive(Debug, Clone)]
pub struct Config {
    /// Listening port
    pub port: u16,
    /// Bootstrap nodes, unresolved
    pub bootstrap: Vec<String>,
    /// Query timeout
    pub timeout: Duration,
    /// Lookup width
    pub k: usize,
    /// Crawler mode
    pub crawl: bool,
    /// Infohash to look up after joining, hex
    pub lookup: Option<String>,
    /// Period of table reports
    pub report_interval: Duration,
    /// JSON reports
    pub json: bool,
    /// Verbose output
    pub verbose: bool,
    /// Quiet mode
    pub quiet: bool,
}

impl Config {
    /// Create configuration from CLI arguments
    pub fn from_args(args: &CliArgs) -> Self {
        let bootstrap = if args.bootstrap.is_empty() {
            DEFAULT_BOOTSTRAP.iter().map(|s| s.to_string()).collect()
        } else {
            args.bootstrap.clone()
        };

        Self {
            port: args.port,
            bootstrap,
            timeout: Duration::from_millis(args.timeout_ms),
            k: args.k,
            crawl: args.crawl,
            lookup: args.lookup.clone(),
            report_interval: Duration::from_secs(args.report_secs),
            json: args.json,
            verbose: args.is_verbose(),
            quiet: args.is_quiet(),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(anyhow::anyhow!("Port cannot be 0"));
        }
        if self.k == 0 {
            return Err(anyhow::anyhow!("k must be at least 1"));
        }
        if self.timeout.is_zero() {
            return Err(anyhow::anyhow!("timeout must be positive"));
        }
        if self.report_interval.is_zero() {
            return Err(anyhow::anyhow!("report interval must be positive"));
        }
        if let Some(hash) = &self.lookup {
            if NodeId::from_hex(hash).is_none() {
                return Err(anyhow::anyhow!("lookup infohash must be 40 hex characters, got '{}'", hash));
            }
        }
        Ok(())
    }

    /// Get the listen address
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.port))
    }

    /// Parsed lookup target, if any
    pub fn lookup_target(&self) -> Option<NodeId> {
        self.lookup.as_deref().and_then(NodeId::from_hex)
    }

    /// Resolve bootstrap hosts to IPv4 socket addresses. Hosts that fail to
    /// resolve are skipped with a warning.
    pub async fn resolve_bootstrap(&self) -> Vec<SocketAddr> {
        let mut resolved = Vec::new();
        for host in &self.bootstrap {
            match lookup_host(host.as_str()).await {
                Ok(addrs) => {
                    let before = resolved.len();
                    for addr in addrs.filter(SocketAddr::is_ipv4) {
                        if !resolved.contains(&addr) {
                            resolved.push(addr);
                        }
                    }
                    debug!("Bootstrap {} resolved to {} new address(es)", host, resolved.len() - before);
                }
                Err(e) => warn!("Failed to resolve bootstrap node {}: {}", host, e),
            }
        }
        resolved
    }

    /// DHT configuration for the given bootstrap addresses
    pub fn dht_config(&self, bootstrap_nodes: Vec<SocketAddr>) -> DhtConfig {
        DhtConfig {
            bind_addr: self.listen_addr(),
            timeout: self.timeout,
            k: self.k,
            bootstrap_nodes,
            ..DhtConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn args(extra: &[&str]) -> CliArgs {
        let mut argv = vec!["krpc-dht"];
        argv.extend_from_slice(extra);
        CliArgs::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_config_from_args() {
        let config = Config::from_args(&args(&["-p", "6882", "--timeout-ms", "250", "-k", "4", "--json"]));
        assert_eq!(config.port, 6882);
        assert_eq!(config.timeout, Duration::from_millis(250));
        assert_eq!(config.k, 4);
        assert!(config.json);
        assert_eq!(config.bootstrap.len(), DEFAULT_BOOTSTRAP.len());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_output_flags_carry_over() {
        let config = Config::from_args(&args(&["-q"]));
        assert!(config.quiet);
        assert!(!config.verbose);
        let config = Config::from_args(&args(&["-v", "--crawl"]));
        assert!(config.verbose);
        assert!(config.crawl);
    }

    #[test]
    fn test_explicit_bootstrap_replaces_defaults() {
        let config = Config::from_args(&args(&["-b", "127.0.0.1:7000"]));
        assert_eq!(config.bootstrap, vec!["127.0.0.1:7000".to_string()]);
    }

    #[test]
    fn test_config_validate_invalid_values() {
        assert!(Config::from_args(&args(&["-p", "0"])).validate().is_err());
        assert!(Config::from_args(&args(&["-k", "0"])).validate().is_err());
        assert!(Config::from_args(&args(&["--report-secs", "0"])).validate().is_err());
        assert!(Config::from_args(&args(&["--lookup", "abc"])).validate().is_err());
    }

    #[test]
    fn test_lookup_target() {
        let hash = "0123456789abcdef0123456789abcdef01234567";
        let config = Config::from_args(&args(&["--lookup", hash]));
        assert!(config.validate().is_ok());
        assert_eq!(config.lookup_target().unwrap().to_hex(), hash);
    }

    #[test]
    fn test_dht_config() {
        let config = Config::from_args(&args(&["-p", "7001", "-k", "16"]));
        let bootstrap: Vec<SocketAddr> = vec!["10.0.0.1:6881".parse().unwrap()];
        let dht = config.dht_config(bootstrap.clone());
        assert_eq!(dht.bind_addr.port(), 7001);
        assert_eq!(dht.k, 16);
        assert_eq!(dht.bootstrap_nodes, bootstrap);
        assert!(dht.validate().is_ok());
    }

    #[tokio::test]
    async fn test_resolve_literal_bootstrap() {
        let config = Config::from_args(&args(&["-b", "127.0.0.1:7000", "-b", "127.0.0.1:7000"]));
        let resolved = config.resolve_bootstrap().await;
        assert_eq!(resolved, vec!["127.0.0.1:7000".parse::<SocketAddr>().unwrap()]);
    }
}
