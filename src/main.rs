//! krpc-dht - Main entry point
//!
//! Joins the Mainline DHT, answers queries and periodically reports the
//! routing table. In crawl mode it introduces itself to known nodes as their
//! neighbour and logs every infohash it is asked about.

use anyhow::{Context, Result};
use krpc_dht::{CliArgs, Config, Dht, DhtEvent, IdentityPolicy, NeighborIdentity, NodeSnapshot, StrictIdentity};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, error, info, trace, warn};

/// Set up panic handler for unexpected errors
fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();
        if let Some(location) = panic_info.location() {
            error!(
                "PANIC occurred at {}:{}:{}",
                location.file(),
                location.line(),
                location.column()
            );
        }
        let payload = panic_info.payload();
        if let Some(s) = payload.downcast_ref::<&str>() {
            error!("Panic message: {}", s);
        } else if let Some(s) = payload.downcast_ref::<String>() {
            error!("Panic message: {}", s);
        } else {
            error!("Panic message: unknown");
        }
        error!("Backtrace:\n{:?}", backtrace);
    }));
}

/// One periodic report of the node's state
#[derive(Debug, Serialize)]
struct Report {
    id: String,
    address: String,
    stored_infohashes: usize,
    nodes: Vec<NodeSnapshot>,
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_panic_handler();

    let args = CliArgs::parse_args();
    init_logging(&args);
    info!("krpc-dht starting");
    debug!("CLI arguments: {:?}", args);

    let config = Config::from_args(&args);
    config.validate().context("Invalid configuration")?;

    let bootstrap = config.resolve_bootstrap().await;
    if bootstrap.is_empty() {
        warn!("No bootstrap node resolved; waiting to be contacted");
    }

    let policy: Arc<dyn IdentityPolicy> = if config.crawl {
        Arc::new(NeighborIdentity::default())
    } else {
        Arc::new(StrictIdentity)
    };
    let dht = Dht::with_policy(config.dht_config(bootstrap), policy)
        .await
        .context("Failed to start DHT")?;
    dht.listen().await;
    tokio::spawn(log_events(dht.subscribe(), config.crawl));

    dht.join().await;

    if let Some(target) = config.lookup_target() {
        match dht.get_peers(&target, None).await {
            Ok(lookup) => {
                println!("Lookup {}: {} peer(s) after {} hop(s)", target, lookup.peers.len(), lookup.hops);
                for peer in &lookup.peers {
                    println!("  {}", peer);
                }
            }
            Err(e) => warn!("Lookup for {} failed: {}", target, e),
        }
    }

    let mut report_interval = interval(config.report_interval);
    loop {
        tokio::select! {
            _ = report_interval.tick() => {
                if config.crawl {
                    dht.make_neighbors().await;
                }
                report(&dht, &config).await?;
            }
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for shutdown signal")?;
                info!("Shutdown requested");
                break;
            }
        }
    }

    dht.stop().await;
    info!("krpc-dht finished");
    Ok(())
}

/// Initialize logging based on verbosity settings
fn init_logging(args: &CliArgs) {
    let level = args.log_level();

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if args.is_verbose() {
        subscriber.pretty().init();
    } else {
        subscriber.compact().init();
    }

    debug!("Logging initialized with level: {:?}", level);
}

/// Print the routing table, as text or JSON
async fn report(dht: &Dht, config: &Config) -> Result<()> {
    let report = Report {
        id: dht.id().to_hex(),
        address: dht.local_addr().to_string(),
        stored_infohashes: dht.stored_infohashes().await,
        nodes: dht.snapshot().await,
    };

    if config.json {
        println!("{}", serde_json::to_string(&report).context("Failed to serialize report")?);
        return Ok(());
    }
    if config.quiet {
        return Ok(());
    }

    println!("Node {} on {}", report.id, report.address);
    println!("  Known nodes: {}", report.nodes.len());
    println!("  Stored infohashes: {}", report.stored_infohashes);
    if config.verbose {
        for node in &report.nodes {
            println!(
                "  {} {}:{} {} ({}s)",
                node.id, node.address, node.port, node.status, node.seconds_since_change
            );
        }
    }
    Ok(())
}

/// Forward diagnostic events to the log
async fn log_events(mut events: broadcast::Receiver<DhtEvent>, crawl: bool) {
    loop {
        match events.recv().await {
            Ok(DhtEvent::Query { method, from, info_hash, .. }) => {
                trace!("{} query from {}", method, from);
                if let (true, Some(hash)) = (crawl, info_hash) {
                    info!("magnet:?xt=urn:btih:{} ({} from {})", hash, method, from);
                }
            }
            Ok(DhtEvent::Response { transaction_id, from }) => trace!("Response #{} from {}", transaction_id, from),
            Ok(DhtEvent::Error(e)) => debug!("DHT error: {}", e),
            Ok(DhtEvent::Warning(e)) => trace!("DHT warning: {}", e),
            Ok(DhtEvent::Status { id, addr, status }) => debug!("Node {} at {} is {}", id, addr, status),
            Err(broadcast::error::RecvError::Lagged(missed)) => debug!("Event log lagged, {} event(s) missed", missed),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
