//! bacip-scan - discover BACnet/IP candidates on the local networks

use anyhow::Result;
use bacip_discovery::scan_budget;
use bacip_driver::{load_config, Driver};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "bacip-scan")]
#[command(about = "Discover BACnet/IP device candidates on local networks")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "bacip.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Interface to scan (repeatable; default: all)
    #[arg(short, long = "interface")]
    interfaces: Vec<String>,

    /// Skip ARP probing and report every subnet address
    #[arg(long)]
    no_arp: bool,

    /// Stop the scan after this many seconds
    #[arg(long)]
    timeout_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("bacip-scan v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args.config)?;
    let mut filter = config.to_discovery_filter();
    if !args.interfaces.is_empty() {
        filter.interfaces = args.interfaces.clone();
    }
    if args.no_arp {
        filter.use_arp = Some(false);
    }

    let timeout = args
        .timeout_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| scan_budget(&config.to_scanner_config()));

    let driver = Driver::new(config);
    let cancel = CancellationToken::new();

    // Ctrl-C and the timeout both end the scan early
    let stopper = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Interrupted, stopping scan"),
                _ = tokio::time::sleep(timeout) => info!(?timeout, "Scan time limit reached"),
                _ = cancel.cancelled() => {}
            }
            cancel.cancel();
        })
    };

    let summary = driver
        .discover(
            &cancel,
            |item| {
                println!(
                    "{}\t{}\t{:?}",
                    item.transport_url, item.interface, item.method
                );
            },
            &filter,
        )
        .await?;
    cancel.cancel();
    let _ = stopper.await;

    println!(
        "Discovered {} candidate addresses ({} probe failures)",
        summary.hosts, summary.failures
    );

    if let Err(e) = driver.close() {
        warn!(error = %e, "Driver did not close cleanly");
    }

    Ok(())
}
