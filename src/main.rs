//! peerchat node launcher.
//!
//! Logs a user in on the given address, optionally joining an existing
//! network through a bootstrap peer, and keeps the node serving until Ctrl-C.
//! Telemetry is logged periodically.
//!
//! # Usage
//!
//! ```bash
//! # First node
//! peerchat --name alice --addr 127.0.0.1:4444
//!
//! # Join through the first node
//! peerchat --name bob --addr 127.0.0.1:5555 --bootstrap 127.0.0.1:4444
//! ```

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::info;
use tracing_subscriber::EnvFilter;

use peerchat::{Config, User};

#[derive(Parser, Debug)]
#[command(name = "peerchat")]
#[command(about = "Peer-to-peer chat node over a Kademlia-style DHT")]
struct Args {
    /// Username to log in as.
    #[arg(short, long)]
    name: String,

    /// Address to listen on (ip:port). Also determines the node identifier.
    #[arg(short, long, default_value = "127.0.0.1:4444")]
    addr: String,

    /// Address of a node already in the network.
    #[arg(short = 'B', long)]
    bootstrap: Option<String>,

    /// Directory holding per-user state files.
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Bucket capacity and lookup width.
    #[arg(short = 'k', long, default_value_t = peerchat::K)]
    k: usize,

    /// Concurrent lookup queries.
    #[arg(long, default_value_t = peerchat::ALPHA)]
    alpha: usize,

    /// Seconds between telemetry lines.
    #[arg(long, default_value = "300")]
    telemetry_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut config = Config::default().with_k(args.k).with_alpha(args.alpha);
    if let Some(dir) = args.state_dir {
        config = config.with_state_dir(dir);
    }

    let user = User::register_and_login(&args.name, &args.addr, args.bootstrap.as_deref(), config).await?;
    let node_hex = format!("{:016x}", user.node().id);
    info!(user = %args.name, addr = %args.addr, node = %node_hex, "node started");

    let telemetry_user = user.clone();
    let telemetry_every = Duration::from_secs(args.telemetry_secs.max(1));
    let telemetry = tokio::spawn(async move {
        let mut interval = time::interval(telemetry_every);
        loop {
            interval.tick().await;
            telemetry_user.log_telemetry().await;
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    telemetry.abort();
    user.logoff().await?;
    Ok(())
}
