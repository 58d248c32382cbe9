//! Two-branch try-on training loop.
//!
//! The trainer owns both UNet branches: the garment branch is loaded and
//! carried through every checkpoint record, while the try-on branch is the
//! one driven by the denoising objective and the only one the optimizer
//! touches. One process per accelerator; gradient averaging goes through the
//! `GradientSync` seam so the loop itself is topology-agnostic.

use anyhow::{bail, Context, Result};
use candle_core::{DType, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::distributed::{gradient_sync, DistContext, GradientSync};
use crate::loaders::{load_state_dict, save_checkpoint, GARM_PREFIX, VTON_PREFIX};
use crate::models::vae::VAE_DOWNSCALE;
use crate::models::{CondUNet2D, CondUNetConfig, ReferenceEncoder, VaeEncoder};

use super::data_loader::{ShardedSampler, VtonBatch, VtonDataset};
use super::ddpm_scheduler::{DdpmScheduler, PredictionType};
use super::grad_scaler::{clip_grad_norm, GradScaler};
use super::lr_scheduler::{create_scheduler, LrScheduler};
use super::tracker::ExperimentTracker;
use super::{AdamW, TrainingConfig};

/// Position within the training run; checkpoints restore it.
pub struct TrainState {
    pub epoch: usize,
    pub global_step: usize,
}

struct StepStats {
    loss: f64,
    grad_norm: f64,
    skipped: bool,
}

pub struct VtonTrainer {
    config: TrainingConfig,
    ctx: DistContext,
    run_dir: PathBuf,

    dataset: VtonDataset,
    sampler: ShardedSampler,
    scheduler: DdpmScheduler,

    unet_vton: CondUNet2D,
    garm_vars: VarMap,
    vton_vars: VarMap,
    vton_params: Vec<(String, Var)>,
    vae: Option<VaeEncoder>,
    clip: Option<ReferenceEncoder>,

    optimizer: AdamW,
    lr_schedule: Box<dyn LrScheduler>,
    scaler: GradScaler,
    sync: Box<dyn GradientSync>,
    tracker: ExperimentTracker,
    rng: StdRng,

    state: TrainState,
    max_train_steps: usize,
    checkpointing_steps: usize,
}

impl VtonTrainer {
    pub fn new(config: TrainingConfig, ctx: DistContext, tracker_enabled: bool) -> Result<Self> {
        config.validate()?;
        let device = ctx.device.clone();

        let run_name = if config.is_debug {
            "debug".to_string()
        } else {
            let stamp = chrono::Local::now().format("%Y-%m-%dT%H-%M-%S");
            match &config.description {
                Some(d) => format!("{d}-{stamp}"),
                None => format!("vton-{stamp}"),
            }
        };
        let run_dir = config.output_dir.join(&run_name);
        if config.is_debug && ctx.is_main() && run_dir.exists() {
            fs::remove_dir_all(&run_dir)
                .with_context(|| format!("failed to clear {}", run_dir.display()))?;
        }
        fs::create_dir_all(run_dir.join("checkpoints"))
            .with_context(|| format!("failed to create run directory {}", run_dir.display()))?;
        fs::create_dir_all(run_dir.join("samples"))?;
        fs::create_dir_all(run_dir.join("sanity_check"))?;
        if ctx.is_main() {
            // The resolved configuration travels with the run so it can be
            // resumed or reproduced later.
            fs::write(run_dir.join("config.yaml"), serde_yaml::to_string(&config)?)?;
        }

        let dataset = VtonDataset::new(
            &config.train_data.folder_path,
            config.train_data.resolution,
            config.cfg_dropout_ratio,
            config.global_seed,
        )?;
        let sampler = ShardedSampler::new(
            dataset.len(),
            ctx.world_size,
            ctx.rank,
            config.global_seed,
            config.train_batch_size,
        );
        let steps_per_epoch = sampler.batches_per_epoch();
        if steps_per_epoch == 0 {
            bail!(
                "dataset yields no complete batch: {} item(s) across {} rank(s) with batch size {}",
                dataset.len(),
                ctx.world_size,
                config.train_batch_size
            );
        }

        let scheduler = DdpmScheduler::new(&config.noise_scheduler, &device)?;

        let unet_config = CondUNetConfig::from_train_config(&config.unet);
        let garm_vars = VarMap::new();
        let _unet_garm = CondUNet2D::new(
            &unet_config,
            VarBuilder::from_varmap(&garm_vars, DType::F32, &device),
        )?;
        let vton_vars = VarMap::new();
        let unet_vton = CondUNet2D::new(
            &unet_config,
            VarBuilder::from_varmap(&vton_vars, DType::F32, &device),
        )?;

        // Base weights are optional so a fresh architecture can train from
        // random initialization; when a file is present, unknown tensor
        // names in it are fatal.
        load_optional_weights(
            &config.pretrained_model_path.join("unet_garm.safetensors"),
            &garm_vars,
            GARM_PREFIX,
            "garment unet",
        )?;
        load_optional_weights(
            &config.pretrained_model_path.join("unet_vton.safetensors"),
            &vton_vars,
            VTON_PREFIX,
            "try-on unet",
        )?;

        let mut global_step = 0;
        if let Some(path) = &config.unet_garm_checkpoint_path {
            load_state_dict(path, &garm_vars, GARM_PREFIX)?;
        }
        if let Some(path) = &config.unet_vton_checkpoint_path {
            let report = load_state_dict(path, &vton_vars, VTON_PREFIX)?;
            if let Some(step) = report.global_step {
                global_step = step;
                info!("resuming from global step {step}");
            }
        }

        let vae_path = config.pretrained_model_path.join("vae.safetensors");
        let vae = if vae_path.is_file() {
            Some(VaeEncoder::load(&vae_path, &device, DType::F32)?)
        } else {
            warn!(
                "no VAE weights at {}, training with random latents",
                vae_path.display()
            );
            None
        };

        let clip_path = config
            .clip_model_path
            .clone()
            .unwrap_or_else(|| config.pretrained_model_path.join("clip_vision.safetensors"));
        let clip = if clip_path.is_file() {
            let encoder = ReferenceEncoder::load(&clip_path, &device, DType::F32)?;
            if encoder.embed_dim() != config.unet.context_dim {
                bail!(
                    "CLIP embedding dim {} does not match unet context_dim {}",
                    encoder.embed_dim(),
                    config.unet.context_dim
                );
            }
            Some(encoder)
        } else {
            warn!(
                "no CLIP vision weights at {}, conditioning on zero embeddings",
                clip_path.display()
            );
            None
        };

        let mut learning_rate = config.learning_rate;
        if config.scale_lr {
            learning_rate *= (ctx.world_size * config.train_batch_size) as f64;
        }

        let max_train_steps = if let Some(steps) = config.max_train_steps {
            steps
        } else if let Some(epochs) = config.max_train_epoch {
            epochs * steps_per_epoch
        } else {
            bail!("no training length configured");
        };
        let checkpointing_steps = if let Some(steps) = config.checkpointing_steps {
            steps
        } else if let Some(epochs) = config.checkpointing_epochs {
            epochs * steps_per_epoch
        } else {
            bail!("no checkpoint cadence configured");
        };

        let lr_schedule = create_scheduler(
            &config.lr_scheduler,
            learning_rate,
            config.lr_warmup_steps,
            max_train_steps,
        )?;
        let optimizer = AdamW::new(
            learning_rate,
            config.adam_beta1,
            config.adam_beta2,
            config.adam_epsilon,
            config.adam_weight_decay,
        );
        let scaler = GradScaler::new(config.mixed_precision_training);
        let sync = gradient_sync(&ctx)?;

        // Only the try-on branch is optimized; the garment branch rides
        // along in checkpoints unchanged.
        let mut vton_params: Vec<(String, Var)> = vton_vars
            .data()
            .lock()
            .unwrap()
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        vton_params.sort_by(|a, b| a.0.cmp(&b.0));
        let trainable: usize = vton_params
            .iter()
            .map(|(_, v)| v.as_tensor().elem_count())
            .sum();

        let tracker = if ctx.is_main() && tracker_enabled {
            ExperimentTracker::init(
                &run_dir,
                "vtondiffusion",
                &run_name,
                serde_json::to_value(&config)?,
                config.tracking_url.as_deref(),
            )
        } else {
            ExperimentTracker::disabled()
        };

        let rng = StdRng::seed_from_u64(config.global_seed.wrapping_add(ctx.rank as u64));

        info!("run directory: {}", run_dir.display());
        info!(
            "dataset: {} pair(s), {} step(s)/epoch on rank {}/{}",
            dataset.len(),
            steps_per_epoch,
            ctx.rank,
            ctx.world_size
        );
        info!(
            "trainable parameters: {trainable} | lr: {learning_rate} | batch: {} | \
             max steps: {max_train_steps} | checkpoint every {checkpointing_steps} step(s)",
            config.train_batch_size
        );

        Ok(Self {
            state: TrainState {
                epoch: global_step / steps_per_epoch,
                global_step,
            },
            config,
            ctx,
            run_dir,
            dataset,
            sampler,
            scheduler,
            unet_vton,
            garm_vars,
            vton_vars,
            vton_params,
            vae,
            clip,
            optimizer,
            lr_schedule,
            scaler,
            sync,
            tracker,
            rng,
            max_train_steps,
            checkpointing_steps,
        })
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Run the training loop to completion; returns the run directory.
    pub fn train(&mut self) -> Result<PathBuf> {
        if self.state.global_step >= self.max_train_steps {
            info!(
                "nothing to do: resumed at step {} with a budget of {}",
                self.state.global_step, self.max_train_steps
            );
            return Ok(self.run_dir.clone());
        }

        let progress = if self.ctx.is_main() {
            let pb = ProgressBar::new(self.max_train_steps as u64);
            pb.set_style(
                ProgressStyle::with_template(
                    "{bar:40.cyan/blue} {pos}/{len} [{elapsed_precise}] {msg}",
                )?
                .progress_chars("=>-"),
            );
            pb.set_position(self.state.global_step as u64);
            Some(pb)
        } else {
            None
        };

        let mut sanity_pending = self.state.global_step == 0 && self.ctx.is_main();

        'training: loop {
            let epoch = self.state.epoch;
            let indices = self.sampler.epoch_indices(epoch);
            let num_batches = indices.len() / self.config.train_batch_size;

            for (batch_idx, chunk) in indices.chunks(self.config.train_batch_size).enumerate() {
                let batch = self.dataset.get_batch(chunk, epoch, &self.ctx.device)?;
                if sanity_pending {
                    self.save_sanity_samples(&batch)?;
                    sanity_pending = false;
                }

                let stats = self.train_step(&batch)?;
                self.state.global_step += 1;

                if let Some(pb) = &progress {
                    pb.inc(1);
                    pb.set_message(format!("epoch {epoch} loss {:.4}", stats.loss));
                }
                if stats.skipped {
                    info!(
                        "step {}: skipped (non-finite gradients), loss scale now {}",
                        self.state.global_step,
                        self.scaler.scale()
                    );
                }
                self.tracker.log(
                    &[
                        ("train_loss", stats.loss),
                        ("lr", self.optimizer.lr()),
                        ("grad_norm", stats.grad_norm),
                        ("loss_scale", self.scaler.scale()),
                    ],
                    self.state.global_step,
                );

                let epoch_end = batch_idx + 1 == num_batches;
                if self.ctx.is_main()
                    && should_checkpoint(self.state.global_step, self.checkpointing_steps)
                {
                    let name = checkpoint_filename(epoch, self.state.global_step, epoch_end);
                    let path = self.run_dir.join("checkpoints").join(&name);
                    save_checkpoint(
                        &path,
                        epoch,
                        self.state.global_step,
                        &self.garm_vars,
                        &self.vton_vars,
                    )?;
                    info!("saved checkpoint {}", path.display());
                }

                if self.state.global_step >= self.max_train_steps {
                    break 'training;
                }
            }
            self.state.epoch += 1;
        }

        if let Some(pb) = progress {
            pb.finish_with_message("training complete");
        }
        info!(
            "training finished at epoch {} global step {}",
            self.state.epoch, self.state.global_step
        );
        Ok(self.run_dir.clone())
    }

    fn train_step(&mut self, batch: &VtonBatch) -> Result<StepStats> {
        let device = &self.ctx.device;
        let batch_size = batch.pixel_values.dims()[0];

        let latents = match &self.vae {
            Some(vae) => vae.encode(&batch.pixel_values)?,
            None => {
                let [h, w] = self.config.train_data.resolution;
                Tensor::randn(
                    0f32,
                    1f32,
                    &[batch_size, 4, h / VAE_DOWNSCALE, w / VAE_DOWNSCALE],
                    device,
                )?
            }
        };

        let noise = latents.randn_like(0.0, 1.0)?;
        let timesteps = self.scheduler.sample_timesteps(batch_size, &mut self.rng, device)?;
        let noisy_latents = self.scheduler.add_noise(&latents, &noise, &timesteps)?;

        let context = match &self.clip {
            Some(clip) => clip.encode(&batch.clip_ref_image)?,
            None => Tensor::zeros(
                &[batch_size, 1, self.config.unet.context_dim],
                DType::F32,
                device,
            )?,
        };
        let context = apply_cfg_dropout(&context, &batch.drop_image_embeds)?;

        let target = match self.scheduler.prediction_type() {
            PredictionType::Epsilon => &noise,
        };
        let prediction = self.unet_vton.forward(&noisy_latents, &timesteps, &context)?;
        let loss = (prediction.to_dtype(DType::F32)? - target.to_dtype(DType::F32)?)?
            .sqr()?
            .mean_all()?;
        let loss_value = loss.to_scalar::<f32>()? as f64;

        let scaled_loss = self.scaler.scale_loss(&loss)?;
        let grad_store = scaled_loss.backward()?;

        let mut named_grads = Vec::with_capacity(self.vton_params.len());
        for (name, var) in &self.vton_params {
            if let Some(grad) = grad_store.get(var.as_tensor()) {
                named_grads.push((name.clone(), grad.clone()));
            }
        }

        let finite = self.scaler.unscale(&mut named_grads)?;
        let mut grad_norm = 0.0;
        if finite {
            grad_norm = clip_grad_norm(&mut named_grads, self.config.max_grad_norm)?;
            for (_, grad) in named_grads.iter_mut() {
                *grad = self.sync.all_reduce_mean(grad)?;
            }

            self.optimizer.set_lr(self.lr_schedule.get_lr(self.state.global_step));
            self.optimizer.step();
            let grads_by_name: HashMap<&str, &Tensor> = named_grads
                .iter()
                .map(|(name, grad)| (name.as_str(), grad))
                .collect();
            for (name, var) in &self.vton_params {
                if let Some(&grad) = grads_by_name.get(name.as_str()) {
                    self.optimizer.update(name, var, grad)?;
                }
            }
        }
        self.scaler.update(!finite);

        Ok(StepStats {
            loss: loss_value,
            grad_norm,
            skipped: !finite,
        })
    }

    /// Dump the first training pair so a bad preprocessing pipeline is
    /// visible before any compute has been spent.
    fn save_sanity_samples(&self, batch: &VtonBatch) -> Result<()> {
        let dir = self.run_dir.join("sanity_check");
        save_image(&batch.pixel_values.get(0)?, &dir.join("person.png"))?;
        save_image(&batch.pixel_values_ref.get(0)?, &dir.join("cloth.png"))?;
        Ok(())
    }
}

pub fn train_from_config(
    config: TrainingConfig,
    ctx: DistContext,
    tracker_enabled: bool,
) -> Result<PathBuf> {
    let mut trainer = VtonTrainer::new(config, ctx, tracker_enabled)?;
    trainer.train()
}

/// Zero out the conditioning sequence for every flagged sample.
///
/// Flags are 1.0 to drop, 0.0 to keep; kept rows pass through multiplied by
/// exactly 1.0 and are therefore bit-identical.
pub(crate) fn apply_cfg_dropout(context: &Tensor, drop_flags: &Tensor) -> Result<Tensor> {
    let batch_size = drop_flags.dims()[0];
    let keep = drop_flags
        .to_dtype(context.dtype())?
        .affine(-1.0, 1.0)?
        .reshape(&[batch_size, 1, 1])?;
    Ok(context.broadcast_mul(&keep)?)
}

fn should_checkpoint(global_step: usize, interval: usize) -> bool {
    interval > 0 && global_step % interval == 0
}

/// Epoch-boundary checkpoints are named after the completed epoch; all
/// others after the global step that produced them.
fn checkpoint_filename(epoch: usize, global_step: usize, epoch_end: bool) -> String {
    if epoch_end {
        format!("checkpoint-epoch-{}.safetensors", epoch + 1)
    } else {
        format!("checkpoint-global_step-{global_step}.safetensors")
    }
}

fn load_optional_weights(path: &Path, vars: &VarMap, prefix: &str, what: &str) -> Result<()> {
    if path.is_file() {
        let report = load_state_dict(path, vars, prefix)?;
        info!(
            "{what}: loaded {} tensor(s) from {} ({} missing)",
            report.loaded,
            path.display(),
            report.missing
        );
    } else {
        warn!(
            "{what}: no base weights at {}, starting from random initialization",
            path.display()
        );
    }
    Ok(())
}

/// Write a `[3, h, w]` tensor in [-1, 1] as a PNG.
fn save_image(tensor: &Tensor, path: &Path) -> Result<()> {
    let (_, height, width) = tensor.dims3()?;
    let data = tensor
        .to_dtype(DType::F32)?
        .affine(127.5, 127.5)?
        .clamp(0f32, 255f32)?
        .flatten_all()?
        .to_vec1::<f32>()?;

    let mut img = image::RgbImage::new(width as u32, height as u32);
    for y in 0..height {
        for x in 0..width {
            let pixel = [0, 1, 2].map(|c| data[c * height * width + y * width + x] as u8);
            img.put_pixel(x as u32, y as u32, image::Rgb(pixel));
        }
    }
    img.save(path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}
