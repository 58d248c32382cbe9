pub mod adamw;
pub mod data_loader;
pub mod ddpm_scheduler;
pub mod grad_scaler;
pub mod lr_scheduler;
pub mod tracker;
pub mod vton_trainer;

// Re-export key types
pub use adamw::AdamW;
pub use ddpm_scheduler::{DdpmScheduler, PredictionType};
pub use vton_trainer::{train_from_config, VtonTrainer};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Immutable training configuration, loaded once at startup.
///
/// Unknown keys are a hard parse error rather than being silently dropped:
/// a typoed hyperparameter must not turn into a default-valued run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrainingConfig {
    pub output_dir: PathBuf,
    /// Base model directory holding `vae.safetensors`,
    /// `clip_vision.safetensors`, `unet_garm.safetensors` and
    /// `unet_vton.safetensors`.
    pub pretrained_model_path: PathBuf,
    /// Overrides the CLIP vision weights from the base directory.
    #[serde(default)]
    pub clip_model_path: Option<PathBuf>,
    #[serde(default)]
    pub description: Option<String>,

    /// Resume checkpoints for incremental fine-tuning; empty means "start
    /// from the pretrained base".
    #[serde(default)]
    pub unet_garm_checkpoint_path: Option<PathBuf>,
    #[serde(default)]
    pub unet_vton_checkpoint_path: Option<PathBuf>,

    pub train_data: DatasetConfig,
    #[serde(default)]
    pub validation_data: Option<ValidationDataConfig>,

    #[serde(default)]
    pub unet: UnetConfig,
    #[serde(default)]
    pub noise_scheduler: NoiseSchedulerConfig,

    /// Probability of dropping a sample's garment conditioning for
    /// classifier-free guidance.
    #[serde(default = "default_cfg_dropout_ratio")]
    pub cfg_dropout_ratio: f32,

    /// Exactly one of `max_train_steps` / `max_train_epoch` must be set.
    #[serde(default)]
    pub max_train_steps: Option<usize>,
    #[serde(default)]
    pub max_train_epoch: Option<usize>,
    /// Exactly one of `checkpointing_steps` / `checkpointing_epochs` must be
    /// set.
    #[serde(default)]
    pub checkpointing_steps: Option<usize>,
    #[serde(default)]
    pub checkpointing_epochs: Option<usize>,

    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default)]
    pub scale_lr: bool,
    #[serde(default)]
    pub lr_warmup_steps: usize,
    #[serde(default = "default_lr_scheduler")]
    pub lr_scheduler: String,

    #[serde(default = "default_batch_size")]
    pub train_batch_size: usize,
    #[serde(default = "default_adam_beta1")]
    pub adam_beta1: f64,
    #[serde(default = "default_adam_beta2")]
    pub adam_beta2: f64,
    #[serde(default = "default_adam_weight_decay")]
    pub adam_weight_decay: f64,
    #[serde(default = "default_adam_epsilon")]
    pub adam_epsilon: f64,
    #[serde(default = "default_max_grad_norm")]
    pub max_grad_norm: f64,

    #[serde(default = "default_true")]
    pub mixed_precision_training: bool,

    #[serde(default = "default_global_seed")]
    pub global_seed: u64,
    #[serde(default)]
    pub is_debug: bool,

    /// Remote endpoint for the optional experiment tracker.
    #[serde(default)]
    pub tracking_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatasetConfig {
    /// Root directory with `image/` (person targets) and `cloth/` (garments)
    /// sharing file stems.
    pub folder_path: PathBuf,
    /// Training resolution as `[height, width]`; both must be divisible by
    /// the VAE downsampling factor of 8.
    pub resolution: [usize; 2],
}

/// Validation sampling is not wired up in this trainer; the block is parsed
/// and echoed into the resolved config so resumed jobs keep it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValidationDataConfig {
    pub resolution: [usize; 2],
    #[serde(default = "default_guidance_scale")]
    pub guidance_scale: f32,
    #[serde(default = "default_inference_steps")]
    pub num_inference_steps: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UnetConfig {
    pub model_channels: usize,
    pub channel_mult: Vec<usize>,
    pub context_dim: usize,
}

impl Default for UnetConfig {
    fn default() -> Self {
        Self {
            model_channels: 128,
            channel_mult: vec![1, 2],
            context_dim: 768,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NoiseSchedulerConfig {
    pub num_train_timesteps: usize,
    pub beta_start: f64,
    pub beta_end: f64,
    pub beta_schedule: String,
    pub prediction_type: String,
}

impl Default for NoiseSchedulerConfig {
    fn default() -> Self {
        Self {
            num_train_timesteps: 1000,
            beta_start: 0.00085,
            beta_end: 0.012,
            beta_schedule: "scaled_linear".to_string(),
            prediction_type: "epsilon".to_string(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_cfg_dropout_ratio() -> f32 {
    0.1
}
fn default_learning_rate() -> f64 {
    3e-5
}
fn default_lr_scheduler() -> String {
    "constant".to_string()
}
fn default_batch_size() -> usize {
    1
}
fn default_adam_beta1() -> f64 {
    0.9
}
fn default_adam_beta2() -> f64 {
    0.999
}
fn default_adam_weight_decay() -> f64 {
    1e-2
}
fn default_adam_epsilon() -> f64 {
    1e-8
}
fn default_max_grad_norm() -> f64 {
    1.0
}
fn default_global_seed() -> u64 {
    42
}
fn default_guidance_scale() -> f32 {
    2.0
}
fn default_inference_steps() -> usize {
    20
}

impl TrainingConfig {
    /// Cross-field checks that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.max_train_steps.is_none() && self.max_train_epoch.is_none() {
            bail!("one of `max_train_steps` / `max_train_epoch` must be set");
        }
        if self.checkpointing_steps.is_none() && self.checkpointing_epochs.is_none() {
            bail!("one of `checkpointing_steps` / `checkpointing_epochs` must be set");
        }
        if self.train_batch_size == 0 {
            bail!("`train_batch_size` must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.cfg_dropout_ratio) {
            bail!("`cfg_dropout_ratio` must be in [0, 1]");
        }
        let [h, w] = self.train_data.resolution;
        if h % 8 != 0 || w % 8 != 0 {
            bail!("training resolution {h}x{w} must be divisible by 8");
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<TrainingConfig> {
    let config_str = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: TrainingConfig =
        serde_yaml::from_str(&config_str).with_context(|| "Failed to parse YAML config")?;
    config.validate()?;

    Ok(config)
}
