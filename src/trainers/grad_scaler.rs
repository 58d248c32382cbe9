//! Loss scaling for reduced-precision training, plus global-norm gradient
//! clipping. The loss is multiplied by the scale before backprop; gradients
//! are divided by it again before clipping and the optimizer step. On a
//! non-finite gradient the step is skipped and the scale backs off.

use anyhow::Result;
use candle_core::{DType, Tensor};
use log::warn;

const GROWTH_FACTOR: f64 = 2.0;
const BACKOFF_FACTOR: f64 = 0.5;
const GROWTH_INTERVAL: usize = 2000;
const INITIAL_SCALE: f64 = 65536.0;
const MIN_SCALE: f64 = 1.0;

pub struct GradScaler {
    enabled: bool,
    scale: f64,
    good_steps: usize,
}

impl GradScaler {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            scale: if enabled { INITIAL_SCALE } else { 1.0 },
            good_steps: 0,
        }
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn scale_loss(&self, loss: &Tensor) -> Result<Tensor> {
        if !self.enabled {
            return Ok(loss.clone());
        }
        Ok((loss * self.scale)?)
    }

    /// Divide gradients back by the current scale. Returns `false` when any
    /// gradient is non-finite, in which case the caller must skip this step.
    pub fn unscale(&self, grads: &mut [(String, Tensor)]) -> Result<bool> {
        let mut finite = true;
        for (name, grad) in grads.iter_mut() {
            let unscaled = if self.enabled {
                (grad.to_dtype(DType::F32)? / self.scale)?
            } else {
                grad.to_dtype(DType::F32)?
            };
            let sum = unscaled.sqr()?.sum_all()?.to_scalar::<f32>()?;
            if !sum.is_finite() {
                warn!("non-finite gradient in `{name}`, skipping optimizer step");
                finite = false;
            }
            *grad = unscaled;
        }
        Ok(finite)
    }

    /// Adjust the scale after a step: back off on overflow, grow after a
    /// stable stretch.
    pub fn update(&mut self, found_inf: bool) {
        if !self.enabled {
            return;
        }
        if found_inf {
            self.scale = (self.scale * BACKOFF_FACTOR).max(MIN_SCALE);
            self.good_steps = 0;
        } else {
            self.good_steps += 1;
            if self.good_steps >= GROWTH_INTERVAL {
                self.scale *= GROWTH_FACTOR;
                self.good_steps = 0;
            }
        }
    }
}

/// Clip the global L2 norm of the gradients in place. Returns the norm
/// observed before clipping.
pub fn clip_grad_norm(grads: &mut [(String, Tensor)], max_norm: f64) -> Result<f64> {
    let mut sq_sum = 0.0f64;
    for (_, grad) in grads.iter() {
        sq_sum += grad.to_dtype(DType::F32)?.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
    }
    let total_norm = sq_sum.sqrt();

    if total_norm > max_norm {
        let coef = max_norm / (total_norm + 1e-6);
        for (_, grad) in grads.iter_mut() {
            *grad = (&*grad * coef)?;
        }
    }
    Ok(total_norm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn grad(values: Vec<f32>) -> (String, Tensor) {
        let n = values.len();
        (
            "g".to_string(),
            Tensor::from_vec(values, &[n], &Device::Cpu).unwrap(),
        )
    }

    #[test]
    fn test_scale_then_unscale_is_identity() {
        let scaler = GradScaler::new(true);
        let loss = Tensor::from_vec(vec![0.25f32], &[1], &Device::Cpu).unwrap();
        let scaled = scaler.scale_loss(&loss).unwrap();
        assert_eq!(
            scaled.to_vec1::<f32>().unwrap()[0],
            0.25 * INITIAL_SCALE as f32
        );

        let mut grads = vec![grad(vec![2.0 * INITIAL_SCALE as f32])];
        assert!(scaler.unscale(&mut grads).unwrap());
        assert_eq!(grads[0].1.to_vec1::<f32>().unwrap()[0], 2.0);
    }

    #[test]
    fn test_overflow_backs_off_scale() {
        let mut scaler = GradScaler::new(true);
        let mut grads = vec![grad(vec![f32::INFINITY])];
        assert!(!scaler.unscale(&mut grads).unwrap());
        let before = scaler.scale();
        scaler.update(true);
        assert_eq!(scaler.scale(), before * BACKOFF_FACTOR);
    }

    #[test]
    fn test_disabled_scaler_passes_through() {
        let scaler = GradScaler::new(false);
        let loss = Tensor::from_vec(vec![1.5f32], &[1], &Device::Cpu).unwrap();
        assert_eq!(
            scaler.scale_loss(&loss).unwrap().to_vec1::<f32>().unwrap()[0],
            1.5
        );
    }

    #[test]
    fn test_clip_reduces_large_norm() {
        let mut grads = vec![grad(vec![3.0, 4.0])];
        let norm = clip_grad_norm(&mut grads, 1.0).unwrap();
        assert!((norm - 5.0).abs() < 1e-5);

        let clipped = grads[0].1.to_vec1::<f32>().unwrap();
        let new_norm = (clipped[0] * clipped[0] + clipped[1] * clipped[1]).sqrt();
        assert!((new_norm - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_clip_leaves_small_gradients_untouched() {
        let mut grads = vec![grad(vec![0.3, 0.4])];
        clip_grad_norm(&mut grads, 1.0).unwrap();
        assert_eq!(grads[0].1.to_vec1::<f32>().unwrap(), vec![0.3, 0.4]);
    }
}
