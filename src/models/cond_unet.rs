//! Conditional UNet used for both the garment and try-on branches.
//!
//! The parameters are created through a `VarBuilder` backed by a `VarMap`,
//! so every weight is a named, gradient-tracked `Var`; the same names are
//! used for checkpoint state dicts. The architecture is a compact
//! UNet2DCondition: sinusoidal timestep embedding, residual blocks with a
//! time projection, and cross-attention over a per-sample conditioning
//! sequence.

use anyhow::Result;
use candle_core::{DType, Module, Tensor};
use candle_nn::{conv2d, group_norm, linear, Conv2d, Conv2dConfig, GroupNorm, Linear, VarBuilder};

use crate::trainers::UnetConfig;

#[derive(Debug, Clone)]
pub struct CondUNetConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    pub model_channels: usize,
    pub channel_mult: Vec<usize>,
    pub context_dim: usize,
}

impl CondUNetConfig {
    /// Latent-space UNet (4 channels in/out) from the user-facing config.
    pub fn from_train_config(config: &UnetConfig) -> Self {
        Self {
            in_channels: 4,
            out_channels: 4,
            model_channels: config.model_channels,
            channel_mult: config.channel_mult.clone(),
            context_dim: config.context_dim,
        }
    }
}

fn norm_groups(channels: usize) -> usize {
    [32, 16, 8, 4, 2, 1]
        .into_iter()
        .find(|g| channels % g == 0)
        .unwrap_or(1)
}

/// Sinusoidal timestep embedding, `[b] -> [b, dim]`.
pub fn timestep_embedding(timesteps: &Tensor, dim: usize) -> Result<Tensor> {
    let half_dim = dim / 2;
    let max_period = 10000f32;
    let freqs: Vec<f32> = (0..half_dim)
        .map(|i| (-(i as f32) * max_period.ln() / half_dim as f32).exp())
        .collect();
    let freqs = Tensor::from_vec(freqs, &[half_dim], timesteps.device())?;

    let args = timesteps
        .to_dtype(DType::F32)?
        .unsqueeze(1)?
        .broadcast_mul(&freqs.unsqueeze(0)?)?;
    Ok(Tensor::cat(&[args.cos()?, args.sin()?], 1)?)
}

struct ResBlock {
    norm1: GroupNorm,
    conv1: Conv2d,
    time_proj: Linear,
    norm2: GroupNorm,
    conv2: Conv2d,
    shortcut: Option<Conv2d>,
}

impl ResBlock {
    fn new(in_ch: usize, out_ch: usize, time_dim: usize, vb: VarBuilder) -> Result<Self> {
        let conv_cfg = Conv2dConfig { padding: 1, ..Default::default() };
        let shortcut = if in_ch != out_ch {
            Some(conv2d(in_ch, out_ch, 1, Default::default(), vb.pp("conv_shortcut"))?)
        } else {
            None
        };
        Ok(Self {
            norm1: group_norm(norm_groups(in_ch), in_ch, 1e-5, vb.pp("norm1"))?,
            conv1: conv2d(in_ch, out_ch, 3, conv_cfg, vb.pp("conv1"))?,
            time_proj: linear(time_dim, out_ch, vb.pp("time_emb_proj"))?,
            norm2: group_norm(norm_groups(out_ch), out_ch, 1e-5, vb.pp("norm2"))?,
            conv2: conv2d(out_ch, out_ch, 3, conv_cfg, vb.pp("conv2"))?,
            shortcut,
        })
    }

    fn forward(&self, x: &Tensor, time_emb: &Tensor) -> Result<Tensor> {
        let h = self.conv1.forward(&self.norm1.forward(x)?.silu()?)?;

        let t = self
            .time_proj
            .forward(&time_emb.silu()?)?
            .unsqueeze(2)?
            .unsqueeze(3)?;
        let h = h.broadcast_add(&t)?;

        let h = self.conv2.forward(&self.norm2.forward(&h)?.silu()?)?;

        let skip = match &self.shortcut {
            Some(conv) => conv.forward(x)?,
            None => x.clone(),
        };
        Ok((h + skip)?)
    }
}

/// Single-head cross-attention over the conditioning sequence.
struct CrossAttnBlock {
    norm: GroupNorm,
    to_q: Linear,
    to_k: Linear,
    to_v: Linear,
    to_out: Linear,
    channels: usize,
}

impl CrossAttnBlock {
    fn new(channels: usize, context_dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            norm: group_norm(norm_groups(channels), channels, 1e-5, vb.pp("norm"))?,
            to_q: linear(channels, channels, vb.pp("to_q"))?,
            to_k: linear(context_dim, channels, vb.pp("to_k"))?,
            to_v: linear(context_dim, channels, vb.pp("to_v"))?,
            to_out: linear(channels, channels, vb.pp("to_out"))?,
            channels,
        })
    }

    fn forward(&self, x: &Tensor, context: &Tensor) -> Result<Tensor> {
        let (b, c, h, w) = x.dims4()?;
        let normed = self.norm.forward(x)?;
        // [b, c, h, w] -> [b, h*w, c]
        let seq = normed.reshape(&[b, c, h * w])?.transpose(1, 2)?.contiguous()?;

        let q = self.to_q.forward(&seq)?;
        let k = self.to_k.forward(context)?;
        let v = self.to_v.forward(context)?;

        let scale = 1.0 / (self.channels as f64).sqrt();
        let scores = (q.matmul(&k.t()?.contiguous()?)? * scale)?;
        let attn = candle_nn::ops::softmax_last_dim(&scores)?;
        let out = self.to_out.forward(&attn.matmul(&v)?)?;

        let out = out.transpose(1, 2)?.contiguous()?.reshape(&[b, c, h, w])?;
        Ok((out + x)?)
    }
}

struct DownLevel {
    res: ResBlock,
    attn: CrossAttnBlock,
    downsample: Option<Conv2d>,
}

struct UpLevel {
    res: ResBlock,
    attn: CrossAttnBlock,
    upsample: Option<Conv2d>,
}

pub struct CondUNet2D {
    conv_in: Conv2d,
    time_fc1: Linear,
    time_fc2: Linear,
    downs: Vec<DownLevel>,
    mid_res1: ResBlock,
    mid_attn: CrossAttnBlock,
    mid_res2: ResBlock,
    ups: Vec<UpLevel>,
    norm_out: GroupNorm,
    conv_out: Conv2d,
    model_channels: usize,
}

impl CondUNet2D {
    pub fn new(config: &CondUNetConfig, vb: VarBuilder) -> Result<Self> {
        let mc = config.model_channels;
        let time_dim = mc * 4;
        let chs: Vec<usize> = config.channel_mult.iter().map(|m| m * mc).collect();
        let levels = chs.len();
        let conv_cfg = Conv2dConfig { padding: 1, ..Default::default() };
        let down_cfg = Conv2dConfig { padding: 1, stride: 2, ..Default::default() };

        let conv_in = conv2d(config.in_channels, chs[0], 3, conv_cfg, vb.pp("conv_in"))?;
        let time_fc1 = linear(mc, time_dim, vb.pp("time_embedding.linear_1"))?;
        let time_fc2 = linear(time_dim, time_dim, vb.pp("time_embedding.linear_2"))?;

        let mut downs = Vec::with_capacity(levels);
        let mut in_ch = chs[0];
        for (i, &ch) in chs.iter().enumerate() {
            let vb_level = vb.pp(format!("down_blocks.{i}"));
            let downsample = if i + 1 < levels {
                Some(conv2d(ch, ch, 3, down_cfg, vb_level.pp("downsample"))?)
            } else {
                None
            };
            downs.push(DownLevel {
                res: ResBlock::new(in_ch, ch, time_dim, vb_level.pp("resnet"))?,
                attn: CrossAttnBlock::new(ch, config.context_dim, vb_level.pp("attn"))?,
                downsample,
            });
            in_ch = ch;
        }

        let top = *chs.last().expect("channel_mult must not be empty");
        let mid_res1 = ResBlock::new(top, top, time_dim, vb.pp("mid_block.resnet_1"))?;
        let mid_attn = CrossAttnBlock::new(top, config.context_dim, vb.pp("mid_block.attn"))?;
        let mid_res2 = ResBlock::new(top, top, time_dim, vb.pp("mid_block.resnet_2"))?;

        let mut ups = Vec::with_capacity(levels);
        let mut cur = top;
        for (i, &ch) in chs.iter().enumerate().rev() {
            let vb_level = vb.pp(format!("up_blocks.{i}"));
            let upsample = if i > 0 {
                Some(conv2d(ch, ch, 3, conv_cfg, vb_level.pp("upsample"))?)
            } else {
                None
            };
            ups.push(UpLevel {
                res: ResBlock::new(cur + ch, ch, time_dim, vb_level.pp("resnet"))?,
                attn: CrossAttnBlock::new(ch, config.context_dim, vb_level.pp("attn"))?,
                upsample,
            });
            cur = ch;
        }

        let norm_out = group_norm(norm_groups(chs[0]), chs[0], 1e-5, vb.pp("norm_out"))?;
        let conv_out = conv2d(chs[0], config.out_channels, 3, conv_cfg, vb.pp("conv_out"))?;

        Ok(Self {
            conv_in,
            time_fc1,
            time_fc2,
            downs,
            mid_res1,
            mid_attn,
            mid_res2,
            ups,
            norm_out,
            conv_out,
            model_channels: mc,
        })
    }

    /// Predict the target quantity for a batch of noisy latents.
    ///
    /// `encoder_hidden_states` is the conditioning sequence `[b, s, ctx]`;
    /// spatial dims must be divisible by `2^(levels - 1)`.
    pub fn forward(
        &self,
        latents: &Tensor,
        timesteps: &Tensor,
        encoder_hidden_states: &Tensor,
    ) -> Result<Tensor> {
        let t_emb = timestep_embedding(timesteps, self.model_channels)?;
        let t_emb = self.time_fc2.forward(&self.time_fc1.forward(&t_emb)?.silu()?)?;

        let mut h = self.conv_in.forward(latents)?;
        let mut skips = Vec::with_capacity(self.downs.len());
        for level in &self.downs {
            h = level.res.forward(&h, &t_emb)?;
            h = level.attn.forward(&h, encoder_hidden_states)?;
            skips.push(h.clone());
            if let Some(down) = &level.downsample {
                h = down.forward(&h)?;
            }
        }

        h = self.mid_res1.forward(&h, &t_emb)?;
        h = self.mid_attn.forward(&h, encoder_hidden_states)?;
        h = self.mid_res2.forward(&h, &t_emb)?;

        for level in &self.ups {
            let skip = skips.pop().expect("one skip per level");
            h = Tensor::cat(&[&h, &skip], 1)?;
            h = level.res.forward(&h, &t_emb)?;
            h = level.attn.forward(&h, encoder_hidden_states)?;
            if let Some(up) = &level.upsample {
                let (_, _, hh, ww) = h.dims4()?;
                h = up.forward(&h.upsample_nearest2d(hh * 2, ww * 2)?)?;
            }
        }

        let h = self.norm_out.forward(&h)?.silu()?;
        Ok(self.conv_out.forward(&h)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Var};
    use candle_nn::VarMap;

    fn tiny_config() -> CondUNetConfig {
        CondUNetConfig {
            in_channels: 4,
            out_channels: 4,
            model_channels: 8,
            channel_mult: vec![1, 2],
            context_dim: 16,
        }
    }

    #[test]
    fn test_forward_preserves_latent_shape() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let unet = CondUNet2D::new(&tiny_config(), vb).unwrap();

        let latents = Tensor::randn(0f32, 1f32, &[2, 4, 8, 8], &device).unwrap();
        let timesteps = Tensor::from_vec(vec![3i64, 7], &[2], &device).unwrap();
        let context = Tensor::randn(0f32, 1f32, &[2, 1, 16], &device).unwrap();

        let out = unet.forward(&latents, &timesteps, &context).unwrap();
        assert_eq!(out.dims(), &[2, 4, 8, 8]);
    }

    #[test]
    fn test_gradients_reach_the_parameters() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let unet = CondUNet2D::new(&tiny_config(), vb).unwrap();

        let latents = Tensor::randn(0f32, 1f32, &[1, 4, 8, 8], &device).unwrap();
        let timesteps = Tensor::from_vec(vec![1i64], &[1], &device).unwrap();
        let context = Tensor::randn(0f32, 1f32, &[1, 1, 16], &device).unwrap();

        let out = unet.forward(&latents, &timesteps, &context).unwrap();
        let loss = out.sqr().unwrap().mean_all().unwrap();
        let grads = loss.backward().unwrap();

        let vars: Vec<Var> = varmap.all_vars();
        assert!(!vars.is_empty());
        let with_grad = vars
            .iter()
            .filter(|v| grads.get(v.as_tensor()).is_some())
            .count();
        // conv_out must always receive a gradient; most others should too.
        assert!(with_grad > vars.len() / 2, "{with_grad}/{}", vars.len());
    }

    #[test]
    fn test_timestep_embedding_shape_and_range() {
        let device = Device::Cpu;
        let t = Tensor::from_vec(vec![0i64, 500, 999], &[3], &device).unwrap();
        let emb = timestep_embedding(&t, 16).unwrap();
        assert_eq!(emb.dims(), &[3, 16]);
        let values = emb.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| (-1.0..=1.0).contains(v)));
    }
}
