use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, bail};
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use kadmesh::{DhtConfig, DhtEvent, DhtManager, StaticHost, StaticOracle, UdpBinder};

#[derive(Parser, Debug)]
#[command(name = "kadmesh")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0:0")]
    bind: SocketAddr,

    /// Known DHT node to bootstrap from (repeatable).
    #[arg(short = 'B', long = "bootstrap", value_name = "ADDR")]
    bootstrap: Vec<SocketAddr>,

    /// Fallback host, tried when no other bootstrap source works (repeatable).
    #[arg(long = "fallback", value_name = "ADDR")]
    fallback: Vec<SocketAddr>,

    /// Run as a firewalled passive node.
    #[arg(long)]
    passive: bool,

    /// Directory for persisted routing state.
    #[arg(long, value_name = "DIR")]
    persist_dir: Option<PathBuf>,

    /// Seconds between status lines.
    #[arg(short, long, default_value = "60")]
    status_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    if args.status_interval == 0 {
        bail!("status interval must be at least one second");
    }

    let config = DhtConfig {
        bind_addr: args.bind,
        fallback_hosts: args.fallback,
        persist_dir: args.persist_dir,
        force_connect: true,
        ..DhtConfig::default()
    };
    let dht = DhtManager::new(
        config,
        Arc::new(StaticHost::default()),
        Arc::new(StaticOracle::all_rare()),
        UdpBinder,
    );
    let mut events = dht.subscribe();

    dht.start(!args.passive).await;
    let status = dht.status().await;
    let Some(local) = status.local else {
        bail!("DHT failed to start on {}", args.bind);
    };
    info!(id = %local.identity, addr = %local.addr, mode = ?status.mode, "node running");

    for addr in &args.bootstrap {
        dht.add_active_dht_node(*addr).await;
    }

    let mut interval = time::interval(Duration::from_secs(args.status_interval));

    // Graceful shutdown on Ctrl+C
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            event = events.recv() => match event {
                Ok(DhtEvent::Connected { mode }) => info!(%mode, "bootstrapped"),
                Ok(DhtEvent::Waiting { mode }) => warn!(%mode, "no bootstrap host reachable, waiting"),
                Ok(event) => info!(?event, "DHT event"),
                Err(_) => {}
            },
            _ = interval.tick() => {
                let status = dht.status().await;
                info!(
                    bootstrapped = status.bootstrapped,
                    contacts = status.stats.contacts,
                    buckets = status.stats.buckets,
                    keys = status.stats.keys,
                    values = status.stats.values,
                    "status"
                );
            }
        }
    }

    dht.quit().await;
    Ok(())
}
