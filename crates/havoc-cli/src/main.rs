//! Havoc CLI - chaos-testing harness for federated chat clusters.

use anyhow::Result;
use clap::Parser;
use havoc_core::{bootstrap, orchestrate, BusServer, Registry};
use havoc_proto::ChaosConfig;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "havoc")]
#[command(version = "0.1.0")]
#[command(about = "Drive a federated chat cluster through faults and assert convergence", long_about = None)]
struct Cli {
    /// Path to the config YAML
    #[arg(long, env = "HAVOC_CONFIG")]
    config: PathBuf,

    /// Number of seconds to run before terminating cleanly (0 = forever)
    #[arg(long = "timeout_secs", default_value = "0")]
    timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let cli = Cli::parse();
    let cfg = ChaosConfig::load(&cli.config)?;

    if cli.timeout_secs > 0 {
        info!("Terminating in {}s", cli.timeout_secs);
        let timeout = cli.timeout_secs;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(timeout)).await;
            std::process::exit(0);
        });
    }

    let (bus, requests) = BusServer::new(cfg.clone());
    bootstrap(cfg.clone(), bus, requests, Registry::default()).await?;

    // Use the test config to automate fault injection. Blocks until the
    // control-bus connection drops.
    orchestrate(cfg.ws_port, cfg.verbose, cfg.test).await?;
    Ok(())
}
