use anyhow::Result;
use clap::Parser;
use log::info;

use vtondiffusion::distributed::{init_dist, Launcher, DEFAULT_RENDEZVOUS_PORT};
use vtondiffusion::trainers::train_from_config;
use vtondiffusion::{load_config, logging};

#[derive(Parser)]
#[command(name = "trainer", about = "Two-branch virtual try-on diffusion trainer")]
struct Args {
    /// Path to the YAML training configuration.
    #[arg(long)]
    config: std::path::PathBuf,

    /// Where rank and world size come from.
    #[arg(long, value_enum, default_value = "env")]
    launcher: Launcher,

    /// Enable experiment tracking on the main rank.
    #[arg(long)]
    tracker: bool,
}

fn main() -> Result<()> {
    logging::init_logger();
    let args = Args::parse();

    let config = load_config(&args.config)?;
    let ctx = init_dist(args.launcher, DEFAULT_RENDEZVOUS_PORT)?;
    info!(
        "process initialized: rank {}/{} on {:?}",
        ctx.rank, ctx.world_size, ctx.device
    );

    let run_dir = train_from_config(config, ctx, args.tracker)?;
    info!("run artifacts in {}", run_dir.display());
    Ok(())
}
