//! Example: wait for one or more bundles to be confirmed without promoting them.
//!
//! Every bundle hash gets exactly one poller no matter how often it is listed. Prints one
//! JSON line per confirmed bundle and exits when all of them are confirmed.
//!
//! Usage:
//!
//!   cargo run -p tangle-confirmer --example watch_bundle -- --node <URL> <BUNDLE_HASH>...
//!
//! Options:
//!   --push <WS_URL>   Push feed for confirmation notices; polling slows down while connected.
//!   --interval <SECS> Poll interval without push. Default: 30.

use std::sync::Arc;
use tangle_confirmer::{
    ConfirmationMonitor, EndpointConfig, EndpointHealth, EndpointSet, Hash, MonitorConfig,
    MultiEndpointClient, Stopwatch,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    let args: Vec<String> = std::env::args().collect();
    let mut nodes = Vec::new();
    let mut bundles = Vec::new();
    let mut config = MonitorConfig::default();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--node" => {
                i += 1;
                if let Some(url) = args.get(i) {
                    nodes.push(EndpointConfig::new(url.clone(), 10));
                }
            }
            "--push" => {
                i += 1;
                config.push_url = args.get(i).cloned();
            }
            "--interval" => {
                i += 1;
                if let Some(s) = args.get(i) {
                    config.poll_interval_secs = s.parse().unwrap_or(30);
                }
            }
            "--help" | "-h" => {
                eprintln!("Usage: watch_bundle --node <URL> [--push <WS_URL>] [--interval SECS] <BUNDLE_HASH>...");
                std::process::exit(0);
            }
            other => match other.parse::<Hash>() {
                Ok(h) => bundles.push(h),
                Err(e) => {
                    eprintln!("{other}: {e}");
                    std::process::exit(1);
                }
            },
        }
        i += 1;
    }
    if nodes.is_empty() || bundles.is_empty() {
        eprintln!("Usage: watch_bundle --node <URL> [--push <WS_URL>] [--interval SECS] <BUNDLE_HASH>...");
        std::process::exit(1);
    }

    let health = Arc::new(EndpointHealth::new());
    let api = Arc::new(MultiEndpointClient::new(
        EndpointSet::from_config("general", &nodes)?,
        health,
    ));
    let stopwatch = Arc::new(Stopwatch::new());
    let monitor = ConfirmationMonitor::new(api, Arc::clone(&stopwatch), config);
    let _push = monitor.spawn_push_feed();

    let mut waiters = Vec::new();
    for bundle in bundles {
        stopwatch.start(bundle.as_str());
        let monitor = monitor.clone();
        waiters.push(tokio::spawn(async move {
            let res = monitor.wait_for_confirmation(bundle.clone()).await;
            (bundle, res)
        }));
    }
    eprintln!("{} pollers for {} waiters", monitor.active_pollers(), waiters.len());

    for waiter in waiters {
        let (bundle, res) = waiter.await?;
        let elapsed_ms = stopwatch
            .get(bundle.as_str())
            .map(|(start, stop)| stop.saturating_sub(start))
            .unwrap_or(0);
        let line = serde_json::json!({
            "bundle": bundle.as_str(),
            "confirmed": res.is_ok(),
            "elapsed_ms": elapsed_ms,
        });
        println!("{line}");
    }
    Ok(())
}
