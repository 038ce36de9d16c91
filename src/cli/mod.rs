//! CLI module
//!
//! Command-line interface for the DHT node binary.

pub mod args;
pub mod config;

pub use args::CliArgs;
pub use config::Config;
