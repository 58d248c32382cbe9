//! Frozen VAE encoder wrapper.
//!
//! The diffusion process runs in the autoencoder's latent space; the
//! encoder itself is never trained here, so its weights stay plain tensors
//! and every latent is detached from the autograd graph.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::stable_diffusion::vae::{AutoEncoderKL, AutoEncoderKLConfig};
use std::path::Path;

/// Normalization constant the autoencoder was trained with; latents are
/// multiplied by this before entering the diffusion process.
pub const LATENT_SCALE: f64 = 0.18215;

/// Spatial downsampling factor of the encoder.
pub const VAE_DOWNSCALE: usize = 8;

pub struct VaeEncoder {
    vae: AutoEncoderKL,
}

impl VaeEncoder {
    pub fn load(weights: &Path, device: &Device, dtype: DType) -> Result<Self> {
        let tensors = candle_core::safetensors::load(weights, device)
            .with_context(|| format!("failed to load VAE weights from {}", weights.display()))?;
        let vb = VarBuilder::from_tensors(tensors, dtype, device);

        let config = AutoEncoderKLConfig {
            block_out_channels: vec![128, 256, 512, 512],
            layers_per_block: 2,
            latent_channels: 4,
            norm_num_groups: 32,
            ..Default::default()
        };
        let vae = AutoEncoderKL::new(vb, 3, 3, config)
            .context("failed to build VAE from loaded weights")?;
        Ok(Self { vae })
    }

    /// Encode pixels in [-1, 1] to scaled latents, `[b, 4, h/8, w/8]`.
    /// The result is detached; no gradient flows back into the encoder or
    /// the pixels.
    pub fn encode(&self, pixel_values: &Tensor) -> Result<Tensor> {
        let dist = self.vae.encode(pixel_values)?;
        let latents = dist.sample()?;
        Ok((latents * LATENT_SCALE)?.detach())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_weights_are_a_hard_error() {
        let err = VaeEncoder::load(
            Path::new("/nonexistent/vae.safetensors"),
            &Device::Cpu,
            DType::F32,
        );
        assert!(err.is_err());
    }
}
