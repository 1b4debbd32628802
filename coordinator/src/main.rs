use clap::Parser;
use coordinator::coordinator::Coordinator;
use coordinator::network::CoordinatorServer;
use coordinator::store::{CoordinatorId, MemoryStore};
use log::{error, info};
use shared::transport::drain_channel;
use shared::ZoneConfig;
use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Identity of the first instance; the lowest live id is primary
    #[arg(long, default_value = "1")]
    id: u64,

    /// Address of the first instance
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    bind: SocketAddr,

    /// Extra standby instances sharing the same store, on consecutive ports
    #[arg(long, default_value = "0")]
    replicas: u16,

    #[arg(long, default_value = "64")]
    max_hosts: usize,

    #[arg(long, default_value = "8")]
    overpopulation: usize,

    #[arg(long, default_value = "2")]
    underpopulation: usize,

    /// Authorities per partition
    #[arg(short, long, default_value = "2")]
    quota: usize,

    #[arg(long, default_value = "5000")]
    commit_timeout_ms: u64,

    #[arg(long, default_value = "3000")]
    balance_interval_ms: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let config = ZoneConfig {
        overpopulation_threshold: args.overpopulation,
        underpopulation_threshold: args.underpopulation,
        authority_quota: args.quota,
        commit_timeout_ms: args.commit_timeout_ms,
        balance_interval_ms: args.balance_interval_ms,
        ..ZoneConfig::default()
    };

    let store = Arc::new(MemoryStore::new());
    let (trigger, drain) = drain_channel();
    let mut handles = Vec::new();

    for offset in 0..=args.replicas {
        let mut addr = args.bind;
        addr.set_port(args.bind.port() + offset);
        let id = CoordinatorId(args.id + offset as u64);

        let coordinator = Coordinator::new(id, Arc::clone(&store), config.clone(), args.max_hosts);
        let mut server = CoordinatorServer::new(&addr.to_string(), coordinator).await?;
        let drain = drain.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = server.run(drain).await {
                error!("{} stopped: {}", id, e);
            }
        }));
    }

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down");
    trigger.trigger();

    for handle in handles {
        handle.await?;
    }
    Ok(())
}
