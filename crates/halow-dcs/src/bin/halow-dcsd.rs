//! The DCS daemon: load configuration, start the engine and the
//! controller, run until something halts the process.

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use halow_dcs::Dcs;
use halow_dcs_core::Config;
use halow_dcs_engine::{Engine, HaltSignal};

/// Dynamic channel selection daemon for Wi-Fi HaLow access points.
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Log filter when RUST_LOG is unset (e.g. `info`, `halow_dcs=debug`).
    #[arg(long, default_value = "info")]
    log_filter: String,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_filter)))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "daemon failed");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let contents = fs::read_to_string(&cli.config)
        .map_err(|e| format!("cannot read {}: {e}", cli.config.display()))?;
    let config: Config = serde_json::from_str(&contents)
        .map_err(|e| format!("cannot parse {}: {e}", cli.config.display()))?;
    config.validate()?;

    info!(version = halow_dcs::VERSION, interface = %config.interface_name, "starting");

    let halt = HaltSignal::new();
    let engine = Engine::new();
    let dcs = Dcs::create(&config, &engine, halt.clone())?;
    engine.start();

    halt.wait();
    info!("halt requested, shutting down");

    // Scheduler first, then the engine workers, then the backends drop
    // with the DCS instance.
    dcs.shutdown();
    engine.stop();
    Ok(())
}
