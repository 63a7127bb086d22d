//! Relay Fleet - 中继节点舰队编排守护进程
//!
//! Usage:
//! - Daemon mode: `relay-fleet` (health loop + drift loop until Ctrl+C)
//! - Single pass: `relay-fleet --once`
//! - Drift only: `relay-fleet --no-health`

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use relay_fleet::config::env::constants::VERSION;
use relay_fleet::{DaemonOptions, Fleet, FleetConfig};

/// 命令行参数
#[derive(Debug, Default)]
struct Args {
    once: bool,
    no_drift: bool,
    no_health: bool,
}

/// 解析命令行参数
fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = Args::default();

    for arg in args.iter().skip(1) {
        match arg.as_str() {
            "--once" => parsed.once = true,
            "--no-drift" => parsed.no_drift = true,
            "--no-health" => parsed.no_health = true,
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other => {
                eprintln!("Unknown argument: {}", other);
                print_help();
                std::process::exit(2);
            }
        }
    }

    parsed
}

fn print_help() {
    println!("Relay Fleet - 中继节点舰队编排");
    println!();
    println!("USAGE:");
    println!("    relay-fleet [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    --once           Run one health pass and one drift pass, then exit");
    println!("    --no-drift       Disable the drift detection loop");
    println!("    --no-health      Disable the health check loop");
    println!("    -h, --help       Print help information");
    println!();
    println!("Configuration is read from environment variables (PANEL_URL, PANEL_PASSWORD,");
    println!("FLEET_DATA_DIR, ...). Log level follows RUST_LOG.");
}

fn setup_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("relay_fleet=info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args();
    setup_logging();

    let options = DaemonOptions {
        health: !args.no_health,
        drift: !args.no_drift,
    };
    let config = FleetConfig::from_env();
    info!(
        version = VERSION,
        data_dir = %config.data_dir.display(),
        concurrency = config.concurrency,
        health = options.health,
        drift = options.drift,
        "Starting relay fleet orchestrator"
    );

    let fleet = Fleet::from_config(config)
        .await
        .context("Failed to initialize fleet engine")?;
    info!(nodes = fleet.registry().len().await, "Node registry loaded");

    let cancel = CancellationToken::new();

    if args.once {
        fleet
            .run_once(options, &cancel)
            .await
            .context("Single pass failed")?;
        return Ok(());
    }

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received Ctrl+C, shutting down...");
                    cancel.cancel();
                }
                Err(e) => error!(error = %e, "Failed to listen for Ctrl+C"),
            }
        });
    }

    fleet.run(options, cancel).await;
    info!("Relay fleet orchestrator stopped");
    Ok(())
}
