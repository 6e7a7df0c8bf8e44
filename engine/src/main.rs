use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use qprism_engine::config::{BaseConfig, ExperimentConfig};
use qprism_engine::experiment::{run_experiment, RunOptions};

/// Run one experiment YAML against the tile-delivery testbed.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to one experiment YAML, e.g. configs/experiments/qprism_full.yaml
    #[arg(long)]
    experiment: PathBuf,

    /// Base configuration file
    #[arg(long, default_value = "configs/base.yaml")]
    base_config: PathBuf,

    /// tc interface for netem
    #[arg(long, default_value = "lo")]
    interface: String,

    /// Server host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Server port for H3
    #[arg(long, default_value_t = 4433)]
    port: u16,

    /// Override MBTiles path (default: base config default_tile_source)
    #[arg(long)]
    mbtiles: Option<PathBuf>,

    /// Do not apply tc netem
    #[arg(long)]
    no_netem: bool,

    /// Log tc commands without running them
    #[arg(long)]
    dry_netem: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    qprism_common::init();
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let base = BaseConfig::load(&cli.base_config)?;
    let exp = ExperimentConfig::load(&cli.experiment)?;
    let opts = RunOptions {
        interface: cli.interface,
        host: cli.host,
        port: cli.port,
        mbtiles: cli.mbtiles,
        apply_netem: !cli.no_netem,
        dry_netem: cli.dry_netem,
    };
    run_experiment(&base, &exp, &opts).await
}
