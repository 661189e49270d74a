use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use andna::{
    AndnaConfig, AndnaNode, MeshView, PeerAddress, PeerRegistry, Protocol, RecordTarget,
    ServiceSelector, StaticTopology, load_hostnames, parse_service,
};

#[derive(Parser, Debug)]
#[command(name = "andna")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory holding the keypair and cache files.
    #[arg(short, long, default_value = "./andna-state")]
    state_dir: PathBuf,

    /// Mesh address of this node.
    #[arg(short, long, default_value = "10.0.0.1")]
    address: PeerAddress,

    /// Hostnames to register (one per line, optional service records).
    #[arg(short = 'H', long)]
    hostnames: Option<PathBuf>,

    /// Seconds between maintenance sweeps.
    #[arg(long, default_value = "60")]
    sweep_interval: u64,

    /// Resolve a hostname once and exit.
    #[arg(short, long, value_name = "HOSTNAME")]
    resolve: Option<String>,

    /// Service to resolve, by name or number.
    #[arg(long, default_value = "0")]
    service: String,

    #[arg(long, default_value = "tcp")]
    protocol: Protocol,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let config = AndnaConfig {
        sweep_interval: Duration::from_secs(args.sweep_interval.max(1)),
        ..AndnaConfig::default()
    };

    let mesh = MeshView::new();
    let registry = PeerRegistry::new();
    let topology = Arc::new(StaticTopology::new(args.address, mesh));
    let network = registry.network(args.address);
    let node = AndnaNode::open(config.clone(), &args.state_dir, topology, network)
        .context("failed to open node state")?;
    registry.register(args.address, node.clone());
    info!("Node public key: {}", node.public_key());

    if let Some(path) = &args.hostnames {
        for spec in load_hostnames(path, config.max_records)? {
            if let Err(e) = node.add_hostname(&spec.hostname, spec.records).await {
                warn!(hostname = %spec.hostname, error = %e, "hostname not added");
            }
        }
    }

    if let Some(hostname) = &args.resolve {
        let Some(service) = parse_service(&args.service) else {
            bail!("unknown service '{}'", args.service);
        };
        let selector = ServiceSelector::new(service, args.protocol);
        let outcome = node.resolve(hostname, selector).await;
        node.flush().await?;
        match outcome {
            Ok(records) => {
                for record in records {
                    let target = match record.target {
                        RecordTarget::Address(addr) => addr.to_string(),
                        RecordTarget::Hostname(hash) => hash.to_hex(),
                    };
                    println!(
                        "{hostname} {} {} {} {} {target}",
                        record.service, record.protocol, record.priority, record.weight
                    );
                }
                return Ok(());
            }
            Err(e) => bail!("cannot resolve {hostname}: {e}"),
        }
    }

    node.start().await?;

    let mut interval = time::interval(config.sweep_interval * 5);

    // Graceful shutdown on Ctrl+C
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            _ = interval.tick() => {
                let stats = node.stats().await;
                info!(
                    local = stats.local,
                    andna = stats.andna,
                    counter = stats.counter,
                    resolved = stats.resolved,
                    uptime_s = node.uptime_ms() / 1000,
                    "cache snapshot"
                );
            }
        }
    }

    node.shutdown().await
}
