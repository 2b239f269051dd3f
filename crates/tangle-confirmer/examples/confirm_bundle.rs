//! Example: promote and reattach a bundle until the tangle confirms it.
//!
//! Reads the bundle's transaction trytes from a file (one transaction per line, any order),
//! starts a confirmation task and prints one-line JSON per update. Ctrl-C cancels the task.
//!
//! Usage:
//!
//!   cargo run -p tangle-confirmer --example confirm_bundle -- --node <URL> --trytes <FILE>
//!
//! Options:
//!   --node <URL>      Node endpoint; repeat for redundancy. Reads race all nodes.
//!   --pow <URL>       Node used for attachToTangle. Default: first --node.
//!   --push <WS_URL>   Push feed for confirmation notices. Optional.
//!   --chain           Chain promotions instead of referencing the bundle tail each time.
//!   --every <SECS>    Promotion interval. Default: 10.

use std::sync::Arc;
use tangle_confirmer::{
    ConfirmationMonitor, Confirmer, ConfirmerConfig, EndpointConfig, EndpointHealth, EndpointSet,
    LedgerApis, LoadGauge, MonitorConfig, MultiEndpointClient, Stopwatch,
};

const USAGE: &str = "Usage: confirm_bundle --node <URL> [--node <URL>...] --trytes <FILE> [--pow <URL>] [--push <WS_URL>] [--chain] [--every SECS]";

fn read_trytes(path: &str) -> Result<Vec<String>, std::io::Error> {
    Ok(std::fs::read_to_string(path)?
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let args: Vec<String> = std::env::args().collect();
    let mut nodes = Vec::new();
    let mut pow = None;
    let mut push_url = None;
    let mut trytes_path = String::new();
    let mut config = ConfirmerConfig::default();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--node" => {
                i += 1;
                if let Some(url) = args.get(i) {
                    nodes.push(EndpointConfig::new(url.clone(), 10));
                }
            }
            "--pow" => {
                i += 1;
                pow = args.get(i).map(|url| EndpointConfig::new(url.clone(), 120));
            }
            "--push" => {
                i += 1;
                push_url = args.get(i).cloned();
            }
            "--trytes" => {
                i += 1;
                trytes_path = args.get(i).cloned().unwrap_or_default();
            }
            "--chain" => config.promote_chain = true,
            "--every" => {
                i += 1;
                if let Some(s) = args.get(i) {
                    config.promote_every_sec = s.parse().unwrap_or(10);
                }
            }
            "--help" | "-h" => {
                eprintln!("{USAGE}");
                std::process::exit(0);
            }
            _ => {}
        }
        i += 1;
    }
    if nodes.is_empty() || trytes_path.is_empty() {
        eprintln!("{USAGE}");
        std::process::exit(1);
    }
    let trytes = read_trytes(&trytes_path)?;

    let health = Arc::new(EndpointHealth::new());
    let general = Arc::new(MultiEndpointClient::new(
        EndpointSet::from_config("general", &nodes)?,
        Arc::clone(&health),
    ));
    let pow_nodes = match pow {
        Some(p) => vec![p],
        None => vec![EndpointConfig::new(nodes[0].url.clone(), 120)],
    };
    let apis = LedgerApis {
        general: Arc::clone(&general),
        tipsel: Arc::new(MultiEndpointClient::new(
            EndpointSet::from_config("tipsel", &nodes)?,
            Arc::clone(&health),
        )),
        pow: Arc::new(MultiEndpointClient::new(
            EndpointSet::from_config("pow", &pow_nodes)?,
            Arc::clone(&health),
        )),
    };

    let stopwatch = Arc::new(Stopwatch::new());
    let monitor = ConfirmationMonitor::new(
        general,
        Arc::clone(&stopwatch),
        MonitorConfig {
            push_url,
            ..Default::default()
        },
    );
    let _push = monitor.spawn_push_feed();
    let confirmer = Confirmer::new(
        config,
        apis,
        monitor,
        Arc::clone(&stopwatch),
        Arc::new(LoadGauge::new()),
    )?;

    let (mut updates, cancel) = confirmer.start_task(trytes)?;
    let bundle = confirmer.bundle_hash();
    eprintln!("confirming bundle {}", bundle.as_ref().map(|h| h.as_str()).unwrap_or("?"));

    tokio::select! {
        _ = async {
            while let Some(update) = updates.recv().await {
                println!("{}", serde_json::to_string(&update).unwrap_or_default());
            }
        } => {
            if let Some((start, stop)) = bundle.and_then(|b| stopwatch.get_and_remove(b.as_str())) {
                eprintln!("confirmed after {} s", (stop - start) / 1000);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            eprintln!("cancelling...");
            cancel.cancel().await;
        }
    }
    for (label, stats) in health.snapshot() {
        eprintln!("{label}: {} calls, {} errors", stats.calls, stats.errors);
    }
    Ok(())
}
