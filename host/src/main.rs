use clap::Parser;
use host::network::Host;
use log::{error, info};
use shared::transport::drain_channel;
use shared::ZoneConfig;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Coordinator addresses to log in with, comma-separated in failover order
    #[arg(short = 'c', long, default_value = "127.0.0.1:8080")]
    coordinator: String,

    /// Local address to bind
    #[arg(short = 'b', long, default_value = "0.0.0.0:0")]
    bind: String,

    /// Number of subjects this host simulates
    #[arg(short = 's', long, default_value = "4")]
    subjects: u32,

    /// Grace period before registrations with a silent host are dropped
    #[arg(long, default_value = "3000")]
    handoff_grace_ms: u64,

    /// Time allowed for handoffs to settle on shutdown
    #[arg(long, default_value = "3000")]
    drain_timeout_ms: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    info!("Starting host...");
    info!("Coordinator: {}", args.coordinator);
    info!("Simulating {} subjects", args.subjects);

    let config = ZoneConfig {
        handoff_grace_ms: args.handoff_grace_ms,
        drain_timeout_ms: args.drain_timeout_ms,
        ..ZoneConfig::default()
    };
    let mut host = Host::new(&args.bind, &args.coordinator, config, args.subjects).await?;

    let (trigger, drain) = drain_channel();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
        }
        trigger.trigger();
    });

    host.run(drain).await?;
    info!("Host stopped");

    Ok(())
}
