//! Distributed environment initialization.
//!
//! One OS process per accelerator. The launcher decides where rank and world
//! size come from: a direct multi-process launcher exports `RANK` /
//! `WORLD_SIZE` itself, while under Slurm they are derived from
//! `SLURM_PROCID` / `SLURM_NTASKS` and the rendezvous address is resolved
//! from the node list and re-exported for every peer. Initialization failure
//! aborts the job; a single missing participant stalls every collective, so
//! there is nothing useful to retry.

use anyhow::{bail, Context, Result};
use candle_core::{Device, Tensor};
use clap::ValueEnum;
use log::info;
use std::env;
use std::process::Command;

pub const DEFAULT_RENDEZVOUS_PORT: u16 = 28888;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Launcher {
    /// Rank/world size provided directly via RANK and WORLD_SIZE.
    Env,
    /// Rank/world size derived from the Slurm job environment.
    Slurm,
}

/// Per-process view of the job topology.
pub struct DistContext {
    pub rank: usize,
    pub local_rank: usize,
    pub world_size: usize,
    pub device: Device,
}

impl DistContext {
    pub fn is_main(&self) -> bool {
        self.rank == 0
    }

    /// Single-process context, used by tests and embedded callers.
    pub fn local(device: Device) -> Self {
        Self { rank: 0, local_rank: 0, world_size: 1, device }
    }
}

fn env_usize(key: &str) -> Result<usize> {
    env::var(key)
        .with_context(|| format!("required environment variable `{key}` is not set"))?
        .parse::<usize>()
        .with_context(|| format!("environment variable `{key}` is not an integer"))
}

/// Establish this process's rank and device binding.
///
/// Under Slurm this also advertises the rendezvous address by exporting
/// `MASTER_ADDR`, `MASTER_PORT`, `RANK` and `WORLD_SIZE` for the collective
/// backend. `PORT` overrides the default rendezvous port.
pub fn init_dist(launcher: Launcher, port: u16) -> Result<DistContext> {
    let (rank, local_rank, world_size) = match launcher {
        Launcher::Env => {
            let rank = env_usize("RANK")?;
            let world_size = env_usize("WORLD_SIZE")?;
            let local_rank = env_usize("LOCAL_RANK").unwrap_or(rank);
            (rank, local_rank, world_size)
        }
        Launcher::Slurm => {
            let proc_id = env_usize("SLURM_PROCID")?;
            let ntasks = env_usize("SLURM_NTASKS")?;
            let node_list = env::var("SLURM_NODELIST")
                .context("required environment variable `SLURM_NODELIST` is not set")?;
            let local_rank = env_usize("SLURM_LOCALID").unwrap_or(proc_id);

            let addr = first_hostname(&node_list)?;
            let port = env::var("PORT")
                .ok()
                .and_then(|p| p.parse::<u16>().ok())
                .unwrap_or(port);
            env::set_var("MASTER_ADDR", &addr);
            env::set_var("MASTER_PORT", port.to_string());
            env::set_var("RANK", proc_id.to_string());
            env::set_var("WORLD_SIZE", ntasks.to_string());
            info!(
                "slurm init: proc_id={proc_id} local_rank={local_rank} ntasks={ntasks} \
                 node_list={node_list} addr={addr} port={port}"
            );
            (proc_id, local_rank, ntasks)
        }
    };

    if world_size == 0 || rank >= world_size {
        bail!("invalid process topology: rank {rank} of world size {world_size}");
    }

    let device = Device::cuda_if_available(local_rank)
        .with_context(|| format!("failed to bind accelerator for local rank {local_rank}"))?;

    Ok(DistContext { rank, local_rank, world_size, device })
}

/// Resolve the first hostname of a Slurm node list via `scontrol`.
fn first_hostname(node_list: &str) -> Result<String> {
    let output = Command::new("scontrol")
        .args(["show", "hostname", node_list])
        .output()
        .context("failed to run `scontrol show hostname`")?;
    if !output.status.success() {
        bail!("`scontrol show hostname {node_list}` exited with {}", output.status);
    }
    let stdout = String::from_utf8(output.stdout).context("scontrol output is not utf-8")?;
    stdout
        .lines()
        .next()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .with_context(|| format!("empty hostname list for `{node_list}`"))
}

/// Narrow seam for cross-process gradient averaging.
///
/// Model replicas stay numerically consistent only because every process
/// applies the identical averaged gradient; the reduction itself is an
/// external collective service, not something this crate implements.
pub trait GradientSync: Send {
    fn world_size(&self) -> usize;

    /// Average a gradient across all participants. Blocks until every
    /// process reaches the matching call; there is no timeout.
    fn all_reduce_mean(&self, grad: &Tensor) -> Result<Tensor>;
}

/// Identity synchronizer for single-process jobs.
pub struct LocalSync;

impl GradientSync for LocalSync {
    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce_mean(&self, grad: &Tensor) -> Result<Tensor> {
        Ok(grad.clone())
    }
}

/// Pick the gradient synchronizer for this job.
pub fn gradient_sync(ctx: &DistContext) -> Result<Box<dyn GradientSync>> {
    if ctx.world_size == 1 {
        Ok(Box::new(LocalSync))
    } else {
        // Multi-process training needs a collective backend linked in; this
        // build only ships the single-process path.
        bail!(
            "world size {} requested but no collective communication backend is available",
            ctx.world_size
        )
    }
}
