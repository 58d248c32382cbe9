//! Frozen CLIP vision tower producing the garment conditioning embedding.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::clip::vision_model::{ClipVisionConfig, ClipVisionTransformer};
use std::path::Path;

pub struct ReferenceEncoder {
    model: ClipVisionTransformer,
}

impl ReferenceEncoder {
    pub fn load(weights: &Path, device: &Device, dtype: DType) -> Result<Self> {
        let tensors = candle_core::safetensors::load(weights, device).with_context(|| {
            format!("failed to load CLIP vision weights from {}", weights.display())
        })?;
        let vb = VarBuilder::from_tensors(tensors, dtype, device);

        let config = ClipVisionConfig::vit_base_patch32();
        let model = ClipVisionTransformer::new(vb, &config)
            .context("failed to build CLIP vision tower from loaded weights")?;
        Ok(Self { model })
    }

    /// Embedding dimension of the conditioning vectors.
    pub fn embed_dim(&self) -> usize {
        ClipVisionConfig::vit_base_patch32().embed_dim
    }

    /// One conditioning vector per sample, `[b, 3, 224, 224] -> [b, 1, d]`,
    /// detached from the autograd graph.
    pub fn encode(&self, clip_pixel_values: &Tensor) -> Result<Tensor> {
        let pooled = self.model.forward(clip_pixel_values)?;
        Ok(pooled.unsqueeze(1)?.detach())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_weights_are_a_hard_error() {
        let err = ReferenceEncoder::load(
            Path::new("/nonexistent/clip_vision.safetensors"),
            &Device::Cpu,
            DType::F32,
        );
        assert!(err.is_err());
    }
}
