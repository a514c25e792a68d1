//! Cube generation service.
//!
//! Reads a YAML configuration describing datasets, stores, and grid
//! mappings, then generates every configured dataset into the output
//! store. Individual dataset failures are reported at the end; the
//! process exits non-zero when any dataset failed.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use pipeline::{Config, Generator, TransformRegistry};

#[derive(Parser, Debug)]
#[command(name = "generator")]
#[command(about = "Configuration-driven geodata cube generator")]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "GENERATOR_CONFIG", default_value = "/etc/generator/config.yaml")]
    config: PathBuf,

    /// Regenerate outputs that already exist
    #[arg(long)]
    force: bool,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!(config = %args.config.display(), "starting cube generator");

    let mut config = Config::from_path(&args.config)?;
    if args.force {
        config.general.force_regenerate = true;
    }
    info!(
        datasets = config.datasets.len(),
        stores = config.data_stores.len(),
        "loaded configuration"
    );

    let generator = Generator::new(config, TransformRegistry::with_builtins())?;
    let report = generator.run().await;

    print!("{}", report.summary());
    if report.has_failures() {
        std::process::exit(1);
    }
    Ok(())
}
