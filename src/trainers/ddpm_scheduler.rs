//! DDPM forward-process scheduler.
//!
//! Only what training needs: the beta schedule, the cumulative alpha terms
//! and `add_noise`. Sampling/inference math is out of scope for this crate.

use anyhow::{bail, Result};
use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::Rng;
use std::str::FromStr;

use super::NoiseSchedulerConfig;

/// Quantity the denoiser is trained to regress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictionType {
    /// Predict the sampled noise itself.
    Epsilon,
}

impl FromStr for PredictionType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "epsilon" => Ok(Self::Epsilon),
            other => bail!(
                "unsupported prediction type `{other}`; this trainer only supports `epsilon`"
            ),
        }
    }
}

#[derive(Debug)]
pub struct DdpmScheduler {
    num_train_timesteps: usize,
    prediction_type: PredictionType,
    sqrt_alphas_cumprod: Tensor,
    sqrt_one_minus_alphas_cumprod: Tensor,
}

impl DdpmScheduler {
    pub fn new(config: &NoiseSchedulerConfig, device: &Device) -> Result<Self> {
        let n = config.num_train_timesteps;
        if n == 0 {
            bail!("`num_train_timesteps` must be at least 1");
        }
        // Validated here so a bad config dies at setup, before any forward
        // pass has run.
        let prediction_type: PredictionType = config.prediction_type.parse()?;

        let betas = match config.beta_schedule.as_str() {
            "linear" => linear_betas(n, config.beta_start, config.beta_end),
            "scaled_linear" => scaled_linear_betas(n, config.beta_start, config.beta_end),
            "squaredcos_cap_v2" => cosine_betas(n),
            other => bail!("unknown beta schedule `{other}`"),
        };

        let mut cumprod = 1.0f64;
        let mut sqrt_ac = Vec::with_capacity(n);
        let mut sqrt_omac = Vec::with_capacity(n);
        for beta in betas {
            cumprod *= 1.0 - beta;
            sqrt_ac.push(cumprod.sqrt() as f32);
            sqrt_omac.push((1.0 - cumprod).sqrt() as f32);
        }

        Ok(Self {
            num_train_timesteps: n,
            prediction_type,
            sqrt_alphas_cumprod: Tensor::from_vec(sqrt_ac, &[n], device)?,
            sqrt_one_minus_alphas_cumprod: Tensor::from_vec(sqrt_omac, &[n], device)?,
        })
    }

    pub fn num_train_timesteps(&self) -> usize {
        self.num_train_timesteps
    }

    pub fn prediction_type(&self) -> PredictionType {
        self.prediction_type
    }

    /// Forward-process mix for the sampled timesteps:
    /// `noisy = sqrt(alpha_bar_t) * clean + sqrt(1 - alpha_bar_t) * noise`.
    pub fn add_noise(
        &self,
        original_samples: &Tensor,
        noise: &Tensor,
        timesteps: &Tensor,
    ) -> Result<Tensor> {
        let batch_size = timesteps.dims()[0];
        let timesteps = timesteps.to_dtype(DType::I64)?;

        let sqrt_alpha = self
            .sqrt_alphas_cumprod
            .index_select(&timesteps, 0)?
            .reshape(&[batch_size, 1, 1, 1])?
            .to_dtype(original_samples.dtype())?;
        let sqrt_one_minus_alpha = self
            .sqrt_one_minus_alphas_cumprod
            .index_select(&timesteps, 0)?
            .reshape(&[batch_size, 1, 1, 1])?
            .to_dtype(original_samples.dtype())?;

        let noisy = (sqrt_alpha.broadcast_mul(original_samples)?
            + sqrt_one_minus_alpha.broadcast_mul(noise)?)?;
        Ok(noisy)
    }

    /// One uniform timestep per batch element.
    pub fn sample_timesteps(
        &self,
        batch_size: usize,
        rng: &mut StdRng,
        device: &Device,
    ) -> Result<Tensor> {
        let timesteps: Vec<i64> = (0..batch_size)
            .map(|_| rng.gen_range(0..self.num_train_timesteps) as i64)
            .collect();
        Ok(Tensor::from_vec(timesteps, &[batch_size], device)?)
    }
}

fn linear_betas(n: usize, start: f64, end: f64) -> Vec<f64> {
    (0..n)
        .map(|i| start + (end - start) * i as f64 / (n as f64 - 1.0).max(1.0))
        .collect()
}

fn scaled_linear_betas(n: usize, start: f64, end: f64) -> Vec<f64> {
    let (s, e) = (start.sqrt(), end.sqrt());
    (0..n)
        .map(|i| {
            let b = s + (e - s) * i as f64 / (n as f64 - 1.0).max(1.0);
            b * b
        })
        .collect()
}

fn cosine_betas(n: usize) -> Vec<f64> {
    let s = 0.008;
    let alpha_bar = |t: f64| ((t + s) / (1.0 + s) * std::f64::consts::PI / 2.0).cos().powi(2);
    (0..n)
        .map(|i| {
            let t0 = i as f64 / n as f64;
            let t1 = (i + 1) as f64 / n as f64;
            (1.0 - alpha_bar(t1) / alpha_bar(t0)).min(0.999)
        })
        .collect()
}
