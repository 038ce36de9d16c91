//! CLI arguments module
//!
//! Defines command-line argument parsing using clap.

use clap::Parser;

/// CLI arguments for the DHT node
#[derive(Debug, Parser)]
#[command(name = "krpc-dht")]
#[command(about = "A Mainline DHT node that joins the network and reports its routing table", long_about = None)]
pub struct CliArgs {
    /// UDP port to listen on
    #[arg(short, long, default_value_t = 6881)]
    pub port: u16,

    /// Bootstrap node as HOST:PORT (repeatable; defaults to the public routers)
    #[arg(short, long, value_name = "HOST:PORT")]
    pub bootstrap: Vec<String>,

    /// Query timeout in milliseconds
    #[arg(long, default_value_t = 5000)]
    pub timeout_ms: u64,

    /// Number of closest nodes returned by lookups
    #[arg(short, long, default_value_t = 8)]
    pub k: usize,

    /// Crawl: answer every querier with a neighbouring id and keep joining
    #[arg(long)]
    pub crawl: bool,

    /// Look up peers for this infohash (40 hex characters) after joining
    #[arg(long, value_name = "INFOHASH")]
    pub lookup: Option<String>,

    /// Seconds between routing table reports
    #[arg(long, default_value_t = 30)]
    pub report_secs: u64,

    /// Print reports as JSON
    #[arg(long)]
    pub json: bool,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Quiet mode (no output except errors)
    #[arg(short, long)]
    pub quiet: bool,
}

impl CliArgs {
    /// Parse CLI arguments from command line
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Check if quiet mode is enabled
    pub fn is_quiet(&self) -> bool {
        self.quiet
    }

    /// Get the log level based on verbosity settings
    pub fn log_level(&self) -> tracing::Level {
        if self.verbose {
            tracing::Level::DEBUG
        } else if self.quiet {
            tracing::Level::ERROR
        } else {
            tracing::Level::INFO
        }
    }
}
